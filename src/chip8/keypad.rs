use std::sync::atomic::{AtomicBool, Ordering};

/// 16 atomic key cells. The UI thread writes; the CPU thread reads. Relaxed
/// ordering is enough because the emulator only needs *eventual* visibility
/// of a keypress — it polls on every relevant instruction anyway.
pub struct Keypad {
    keys: [AtomicBool; 16],
}

impl Keypad {
    pub fn new() -> Self {
        Keypad { keys: Default::default() }
    }

    /// Sets key `key` (0x0..=0xF) down or up. Out-of-range indices are ignored.
    pub fn set(&self, key: usize, state: bool) {
        if let Some(cell) = self.keys.get(key) {
            cell.store(state, Ordering::Relaxed);
        }
    }

    /// Whether `key` (0x0..=0xF) is currently down. Out-of-range keys read as up.
    pub fn is_down(&self, key: usize) -> bool {
        self.keys.get(key).map_or(false, |cell| cell.load(Ordering::Relaxed))
    }

    /// The lowest-numbered key currently down, if any.
    pub fn any_pressed(&self) -> Option<usize> {
        self.keys.iter().position(|cell| cell.load(Ordering::Relaxed))
    }
}

impl Default for Keypad {
    fn default() -> Self {
        Keypad::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_is_down_round_trip() {
        let keypad = Keypad::new();
        assert!(!keypad.is_down(0x5));

        keypad.set(0x5, true);
        assert!(keypad.is_down(0x5));

        keypad.set(0x5, false);
        assert!(!keypad.is_down(0x5));
    }

    #[test]
    fn any_pressed_returns_lowest_numbered_key() {
        let keypad = Keypad::new();
        assert_eq!(keypad.any_pressed(), None);

        keypad.set(0xA, true);
        keypad.set(0x3, true);
        assert_eq!(keypad.any_pressed(), Some(0x3));
    }

    #[test]
    fn out_of_range_keys_are_ignored() {
        let keypad = Keypad::new();
        keypad.set(0x20, true);
        assert!(!keypad.is_down(0x20));
    }
}
