use std::time::{Duration, Instant};

/// One CHIP-8 timer tick, as a duration: 1/60 s.
const TICK: Duration = Duration::from_nanos(16_666_667);

/// A monotonic 8-bit down-counter, expressed against a wall clock instead of
/// being ticked by a background thread.
///
/// `set` records the value and "now"; `read` derives the current value from
/// how much wall-clock time has elapsed since, so there is nothing to lock
/// and nothing that can race between threads reading it.
#[derive(Debug, Clone)]
pub struct DelayTimer {
    value: u8,
    epoch: Instant,
}

impl DelayTimer {
    pub fn new() -> Self {
        DelayTimer { value: 0, epoch: Instant::now() }
    }

    /// Resets the counter to `value` and restarts the clock.
    pub fn set(&mut self, value: u8) {
        self.value = value;
        self.epoch = Instant::now();
    }

    /// Returns `max(0, value - elapsed_ticks)`.
    pub fn read(&self) -> u8 {
        let elapsed = self.epoch.elapsed();
        let ticks_elapsed = (elapsed.as_secs_f64() / TICK.as_secs_f64()) as u32;
        self.value.saturating_sub(ticks_elapsed.min(u8::MAX as u32) as u8)
    }
}

impl Default for DelayTimer {
    fn default() -> Self {
        DelayTimer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn reads_back_the_set_value_immediately() {
        let mut timer = DelayTimer::new();
        timer.set(42);
        assert_eq!(timer.read(), 42);
    }

    #[test]
    fn never_underflows_past_zero() {
        let mut timer = DelayTimer::new();
        timer.set(1);
        thread::sleep(TICK * 5);
        assert_eq!(timer.read(), 0);
    }

    #[test]
    fn decrements_roughly_one_tick_per_60hz_period() {
        let mut timer = DelayTimer::new();
        timer.set(10);
        thread::sleep(TICK * 3 + Duration::from_millis(5));
        let value = timer.read();
        assert!(value <= 7, "expected timer to have ticked down at least 3 times, got {}", value);
        assert!(value >= 5, "expected timer not to have ticked down more than 5 times, got {}", value);
    }
}
