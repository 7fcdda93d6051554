use sdl2::event::Event;
use sdl2::keyboard::Keycode;

use chip8_vm::chip8::Keypad;

/// Physical -> logical key map: numpad 0..9 map to CHIP-8 keys 0x0..0x9,
/// letters A..F map to 0xA..0xF. This is the one concrete key mapper the
/// core depends on only through `Keypad`'s atomic cells.
const KEY_MAP: [(Keycode, usize); 16] = [
    (Keycode::Kp0, 0x0),
    (Keycode::Kp1, 0x1),
    (Keycode::Kp2, 0x2),
    (Keycode::Kp3, 0x3),
    (Keycode::Kp4, 0x4),
    (Keycode::Kp5, 0x5),
    (Keycode::Kp6, 0x6),
    (Keycode::Kp7, 0x7),
    (Keycode::Kp8, 0x8),
    (Keycode::Kp9, 0x9),
    (Keycode::A, 0xA),
    (Keycode::B, 0xB),
    (Keycode::C, 0xC),
    (Keycode::D, 0xD),
    (Keycode::E, 0xE),
    (Keycode::F, 0xF),
];

/// Drives the keypad from SDL2 keyboard state and the window's quit event.
pub struct Input {
    event_pump: sdl2::EventPump,
}

impl Input {
    pub fn new(sdl_context: &sdl2::Sdl) -> Self {
        Input { event_pump: sdl_context.event_pump().unwrap() }
    }

    /// Consumes pending SDL events and publishes the current key state into
    /// `keypad`. Returns true if the user closed the window or hit Escape.
    pub fn poll(&mut self, keypad: &Keypad) -> bool {
        let mut quit = false;

        for event in self.event_pump.poll_iter() {
            if let Event::Quit { .. } = event {
                quit = true;
            }
        }

        let pressed: Vec<Keycode> = self
            .event_pump
            .keyboard_state()
            .pressed_scancodes()
            .filter_map(Keycode::from_scancode)
            .collect();

        if pressed.contains(&Keycode::Escape) {
            quit = true;
        }

        for &(code, key) in KEY_MAP.iter() {
            keypad.set(key, pressed.contains(&code));
        }

        quit
    }
}
