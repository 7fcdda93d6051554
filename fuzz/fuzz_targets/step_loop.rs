#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;

use chip8_vm::chip8::{Cpu, Framebuffer, Keypad};

/// Upper bound on steps per run, so a self-loop-free ROM that runs forever
/// doesn't turn one fuzzer input into a hang.
const MAX_STEPS: usize = 10_000;

fuzz_target!(|rom: &[u8]| {
    let framebuffer = Arc::new(Framebuffer::new());
    let keypad = Arc::new(Keypad::new());

    let mut cpu = match Cpu::with_seed(rom, framebuffer, keypad, false, 0) {
        Ok(cpu) => cpu,
        // Empty or oversize input: `InvalidRom`, an expected outcome.
        Err(_) => return,
    };

    for _ in 0..MAX_STEPS {
        match cpu.step() {
            Ok(true) => continue,
            Ok(false) => break,  // self-loop: guaranteed termination
            Err(_) => break,     // classified structural failure, not a panic
        }
    }
});
