/// This is pretty much based on https://github.com/starrhorne/chip8-rust and
/// https://en.wikipedia.org/wiki/CHIP-8#Opcode_table, with a couple renamings
/// and a few instruction rewrites.
use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::trace;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::chip8::error::Error;
use crate::chip8::framebuffer::Framebuffer;
use crate::chip8::instruction::Instruction;
use crate::chip8::keypad::Keypad;
use crate::chip8::timer::DelayTimer;

/// Size of the addressable memory space.
const MEMORY_SIZE: usize = 4096;

/// First address available to a loaded ROM; 0x000..0x200 is the
/// interpreter-reserved region, and the font lives in its low bytes.
const ROM_START: usize = 0x200;

/// Largest ROM this core will load. Anything at or past this is rejected
/// as `Error::InvalidRom` rather than silently truncated.
const MAX_ROM_SIZE: usize = 0xDFF;

/// Highest legal value for the program counter (memory[pc+1] must still
/// be addressable).
const PC_MAX: u16 = 0xFFE;

/// Maximum call-stack depth.
const STACK_CAPACITY: usize = 12;

/// The standard CHIP-8 font: sixteen 5-byte glyphs for digits 0x0..0xF,
/// burned into memory[0x00..0x50]. `LD F, Vx` computes `V[x] * 5` to find
/// the glyph for `V[x]`.
const FONT: [u8; 80] = [
    0xF0, 0x90, 0x90, 0x90, 0xF0, // 0
    0x20, 0x60, 0x20, 0x20, 0x70, // 1
    0xF0, 0x10, 0xF0, 0x80, 0xF0, // 2
    0xF0, 0x10, 0xF0, 0x10, 0xF0, // 3
    0x90, 0x90, 0xF0, 0x10, 0x10, // 4
    0xF0, 0x80, 0xF0, 0x10, 0xF0, // 5
    0xF0, 0x80, 0xF0, 0x90, 0xF0, // 6
    0xF0, 0x10, 0x20, 0x40, 0x40, // 7
    0xF0, 0x90, 0xF0, 0x90, 0xF0, // 8
    0xF0, 0x90, 0xF0, 0x10, 0xF0, // 9
    0xF0, 0x90, 0xF0, 0x90, 0x90, // A
    0xE0, 0x90, 0xE0, 0x90, 0xE0, // B
    0xF0, 0x80, 0x80, 0x80, 0xF0, // C
    0xE0, 0x90, 0x90, 0x90, 0xE0, // D
    0xF0, 0x80, 0xF0, 0x80, 0xF0, // E
    0xF0, 0x80, 0xF0, 0x80, 0x80, // F
];

/// What a decoded instruction wants done to the program counter, once its
/// side effects (register writes, stack pushes, ...) have already happened.
enum PcEffect {
    /// Ordinary instruction: advance by one word (2 bytes).
    Next,
    /// Skip instruction: advance by two words (4 bytes).
    Skip,
    /// Jump/call/return: set PC to this absolute address.
    Jump(u16),
    /// `JP`/`JP V0,nnn` whose target is the instruction's own address — a
    /// self-loop the interpreter recognizes as guaranteed termination.
    SelfLoop,
    /// `LD Vx, K` with no key down yet: re-execute this same instruction
    /// next step instead of advancing.
    Repeat,
}

/// Memory, registers, stack, VI, PC, RNG and pacing state for one running
/// CHIP-8 program. Owns everything private to the interpreter; holds `Arc`
/// handles to the framebuffer and keypad, which are shared with whatever UI
/// thread is driving rendering and input and must outlive neither side.
pub struct Cpu {
    memory: [u8; MEMORY_SIZE],
    v: [u8; 16],
    i: u16,
    pc: u16,
    stack: Vec<u16>,
    instr: Instruction,
    delay_timer: DelayTimer,
    rng: StdRng,

    framebuffer: Arc<Framebuffer>,
    keypad: Arc<Keypad>,

    /// Selects 8xy6/8xyE semantics: `false` shifts `V[y]` into `V[x]`
    /// (legacy COSMAC VIP behavior), `true` shifts `V[x]` in place.
    modern_shift: bool,
}

impl Cpu {
    /// Builds a CPU with the font preloaded, `rom` copied to 0x200, PC set
    /// to 0x200, and the RNG seeded from a nondeterministic source.
    pub fn new(
        rom: &[u8],
        framebuffer: Arc<Framebuffer>,
        keypad: Arc<Keypad>,
        modern_shift: bool,
    ) -> Result<Self, Error> {
        Self::with_rng(rom, framebuffer, keypad, modern_shift, StdRng::from_entropy())
    }

    /// Same as [`Cpu::new`], but seeds the RNG deterministically. Intended
    /// for fuzzing and reproducible property tests, not production runs.
    pub fn with_seed(
        rom: &[u8],
        framebuffer: Arc<Framebuffer>,
        keypad: Arc<Keypad>,
        modern_shift: bool,
        seed: u64,
    ) -> Result<Self, Error> {
        Self::with_rng(rom, framebuffer, keypad, modern_shift, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        rom: &[u8],
        framebuffer: Arc<Framebuffer>,
        keypad: Arc<Keypad>,
        modern_shift: bool,
        rng: StdRng,
    ) -> Result<Self, Error> {
        if rom.is_empty() || rom.len() >= MAX_ROM_SIZE {
            return Err(Error::InvalidRom);
        }

        let mut memory = [0u8; MEMORY_SIZE];
        memory[..FONT.len()].copy_from_slice(&FONT);
        memory[ROM_START..ROM_START + rom.len()].copy_from_slice(rom);

        let instr = Instruction::from_bytes(memory[ROM_START], memory[ROM_START + 1]);

        Ok(Cpu {
            memory,
            v: [0; 16],
            i: 0,
            pc: ROM_START as u16,
            stack: Vec::with_capacity(STACK_CAPACITY),
            instr,
            delay_timer: DelayTimer::new(),
            rng,
            framebuffer,
            keypad,
            modern_shift,
        })
    }

    /// Executes exactly one instruction.
    ///
    /// Returns `Ok(true)` to keep running, `Ok(false)` if the instruction
    /// was a self-loop (guaranteed termination — see [`PcEffect::SelfLoop`]),
    /// or `Err` on a structural violation.
    pub fn step(&mut self) -> Result<bool, Error> {
        self.instr = Instruction::from_bytes(
            self.memory[self.pc as usize],
            self.memory[self.pc as usize + 1],
        );
        let instr = self.instr;

        let effect = self.execute(instr)?;

        match effect {
            PcEffect::Next => {
                self.set_pc(self.pc + 2)?;
                Ok(true)
            }
            PcEffect::Skip => {
                self.set_pc(self.pc + 4)?;
                Ok(true)
            }
            PcEffect::Jump(addr) => {
                self.set_pc(addr)?;
                Ok(true)
            }
            PcEffect::SelfLoop => Ok(false),
            PcEffect::Repeat => Ok(true),
        }
    }

    /// The pacing loop: runs `step()` at roughly `target_hz` instructions
    /// per second until `stop` fires (or its sender is dropped) or `step`
    /// signals termination or failure.
    ///
    /// `stop` is polled with a 50ms timeout, which both bounds cancellation
    /// latency and is the sole point at which the loop can observe the stop
    /// signal — no instruction executes between one wait and the next.
    pub fn run_at(&mut self, stop: &Receiver<()>, target_hz: u32) -> Result<(), Error> {
        let target_hz = target_hz.max(1);
        let mut instruction_cost = Duration::from_secs_f64(1.0 / target_hz as f64);
        let step_adjust = Duration::from_nanos(500);

        let mut budget = Duration::ZERO;
        let mut last_wake = Instant::now();
        let ring_capacity = (4 * target_hz as usize).max(1);
        let mut timestamps: VecDeque<Instant> = VecDeque::with_capacity(ring_capacity);
        let mut last_log = Instant::now();

        loop {
            match stop.recv_timeout(Duration::from_millis(50)) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return Ok(()),
                Err(RecvTimeoutError::Timeout) => {}
            }

            let now = Instant::now();
            budget += now.duration_since(last_wake);
            last_wake = now;

            while budget >= instruction_cost {
                budget -= instruction_cost;

                if !self.step()? {
                    return Ok(());
                }

                timestamps.push_back(Instant::now());
                if timestamps.len() > ring_capacity {
                    timestamps.pop_front();
                }
            }

            if let (Some(&oldest), Some(&newest)) = (timestamps.front(), timestamps.back()) {
                let elapsed = newest.duration_since(oldest);
                if elapsed > Duration::ZERO {
                    let achieved_hz = timestamps.len() as f64 / elapsed.as_secs_f64();

                    if last_log.elapsed() >= Duration::from_secs(1) {
                        trace!("pacing loop: achieved ~{achieved_hz:.1} Hz (target {target_hz} Hz)");
                        last_log = Instant::now();
                    }

                    if achieved_hz > target_hz as f64 {
                        instruction_cost += step_adjust;
                    } else if achieved_hz < target_hz as f64 && instruction_cost > step_adjust {
                        instruction_cost -= step_adjust;
                    }
                }
            }
        }
    }

    /// Sets PC, rejecting targets at or past 0xFFF (PC+1 would not be a
    /// valid byte, violating the fetch-boundary invariant).
    fn set_pc(&mut self, addr: u16) -> Result<(), Error> {
        if addr > PC_MAX {
            return Err(Error::PcOutOfRange { addr });
        }
        self.pc = addr;
        Ok(())
    }

    fn execute(&mut self, instr: Instruction) -> Result<PcEffect, Error> {
        let x = instr.x();
        let y = instr.y();
        let n = instr.n();
        let kk = instr.kk();
        let nnn = instr.nnn();

        match (instr.group(), x, y, n) {
            (0x0, 0x0, 0xE, 0x0) => self.op_cls(),
            (0x0, 0x0, 0xE, 0xE) => self.op_ret(),
            (0x1, _, _, _) => self.op_jp(nnn),
            (0x2, _, _, _) => self.op_call(nnn),
            (0x3, _, _, _) => self.op_se_vx_kk(x, kk),
            (0x4, _, _, _) => self.op_sne_vx_kk(x, kk),
            (0x5, _, _, 0x0) => self.op_se_vx_vy(x, y),
            (0x6, _, _, _) => self.op_ld_vx_kk(x, kk),
            (0x7, _, _, _) => self.op_add_vx_kk(x, kk),
            (0x8, _, _, 0x0) => self.op_ld_vx_vy(x, y),
            (0x8, _, _, 0x1) => self.op_or(x, y),
            (0x8, _, _, 0x2) => self.op_and(x, y),
            (0x8, _, _, 0x3) => self.op_xor(x, y),
            (0x8, _, _, 0x4) => self.op_add_vx_vy(x, y),
            (0x8, _, _, 0x5) => self.op_sub(x, y),
            (0x8, _, _, 0x6) => self.op_shr(x, y),
            (0x8, _, _, 0x7) => self.op_subn(x, y),
            (0x8, _, _, 0xE) => self.op_shl(x, y),
            (0x9, _, _, 0x0) => self.op_sne_vx_vy(x, y),
            (0xA, _, _, _) => self.op_ld_i_nnn(nnn),
            (0xB, _, _, _) => self.op_jp_v0(nnn),
            (0xC, _, _, _) => self.op_rnd(x, kk),
            (0xD, _, _, _) => self.op_drw(x, y, n),
            (0xE, _, 0x9, 0xE) => self.op_skp(x),
            (0xE, _, 0xA, 0x1) => self.op_sknp(x),
            (0xF, _, 0x0, 0x7) => self.op_ld_vx_dt(x),
            (0xF, _, 0x0, 0xA) => self.op_ld_vx_k(x),
            (0xF, _, 0x1, 0x5) => self.op_ld_dt_vx(x),
            (0xF, _, 0x1, 0x8) => self.op_ld_st_vx(x),
            (0xF, _, 0x1, 0xE) => self.op_add_i_vx(x),
            (0xF, _, 0x2, 0x9) => self.op_ld_f_vx(x),
            (0xF, _, 0x3, 0x3) => self.op_ld_b_vx(x),
            (0xF, _, 0x5, 0x5) => self.op_ld_i_vx(x),
            (0xF, _, 0x6, 0x5) => self.op_ld_vx_i(x),
            _ => Err(Error::IllegalOpcode { raw: instr.raw(), pc: self.pc }),
        }
    }

    /// 00E0 — clears the framebuffer.
    fn op_cls(&mut self) -> Result<PcEffect, Error> {
        self.framebuffer.clear();
        Ok(PcEffect::Next)
    }

    /// 00EE — pops the stack into PC.
    fn op_ret(&mut self) -> Result<PcEffect, Error> {
        let addr = self.stack.pop().ok_or(Error::StackUnderflow)?;
        Ok(PcEffect::Jump(addr))
    }

    /// 1nnn — jumps to nnn, unless nnn is this instruction's own address
    /// (a self-loop, which halts the run loop instead).
    fn op_jp(&mut self, nnn: u16) -> Result<PcEffect, Error> {
        if nnn == self.pc {
            return Ok(PcEffect::SelfLoop);
        }
        Ok(PcEffect::Jump(nnn))
    }

    /// 2nnn — pushes the return address and jumps to nnn.
    fn op_call(&mut self, nnn: u16) -> Result<PcEffect, Error> {
        if self.stack.len() >= STACK_CAPACITY {
            return Err(Error::StackOverflow);
        }
        self.stack.push(self.pc + 2);
        Ok(PcEffect::Jump(nnn))
    }

    /// 3xkk — skips if V[x] == kk.
    fn op_se_vx_kk(&mut self, x: usize, kk: u8) -> Result<PcEffect, Error> {
        Ok(if self.v[x] == kk { PcEffect::Skip } else { PcEffect::Next })
    }

    /// 4xkk — skips if V[x] != kk.
    fn op_sne_vx_kk(&mut self, x: usize, kk: u8) -> Result<PcEffect, Error> {
        Ok(if self.v[x] != kk { PcEffect::Skip } else { PcEffect::Next })
    }

    /// 5xy0 — skips if V[x] == V[y].
    fn op_se_vx_vy(&mut self, x: usize, y: usize) -> Result<PcEffect, Error> {
        Ok(if self.v[x] == self.v[y] { PcEffect::Skip } else { PcEffect::Next })
    }

    /// 6xkk — V[x] <- kk.
    fn op_ld_vx_kk(&mut self, x: usize, kk: u8) -> Result<PcEffect, Error> {
        self.v[x] = kk;
        Ok(PcEffect::Next)
    }

    /// 7xkk — V[x] <- V[x] + kk, wrapping. VF is never touched.
    fn op_add_vx_kk(&mut self, x: usize, kk: u8) -> Result<PcEffect, Error> {
        self.v[x] = self.v[x].wrapping_add(kk);
        Ok(PcEffect::Next)
    }

    /// 8xy0 — V[x] <- V[y].
    fn op_ld_vx_vy(&mut self, x: usize, y: usize) -> Result<PcEffect, Error> {
        self.v[x] = self.v[y];
        Ok(PcEffect::Next)
    }

    /// 8xy1 — V[x] <- V[x] | V[y].
    fn op_or(&mut self, x: usize, y: usize) -> Result<PcEffect, Error> {
        self.v[x] |= self.v[y];
        Ok(PcEffect::Next)
    }

    /// 8xy2 — V[x] <- V[x] & V[y].
    fn op_and(&mut self, x: usize, y: usize) -> Result<PcEffect, Error> {
        self.v[x] &= self.v[y];
        Ok(PcEffect::Next)
    }

    /// 8xy3 — V[x] <- V[x] ^ V[y].
    fn op_xor(&mut self, x: usize, y: usize) -> Result<PcEffect, Error> {
        self.v[x] ^= self.v[y];
        Ok(PcEffect::Next)
    }

    /// 8xy4 — V[x] <- V[x] + V[y], VF <- carry. The value is written before
    /// the flag, so this is correct even when x == 0xF (VF, the flag, wins).
    fn op_add_vx_vy(&mut self, x: usize, y: usize) -> Result<PcEffect, Error> {
        let (result, carry) = self.v[x].overflowing_add(self.v[y]);
        self.v[x] = result;
        self.v[0xF] = carry as u8;
        Ok(PcEffect::Next)
    }

    /// 8xy5 — V[x] <- V[x] - V[y], VF <- 1 if no borrow else 0.
    fn op_sub(&mut self, x: usize, y: usize) -> Result<PcEffect, Error> {
        let (result, borrow) = self.v[x].overflowing_sub(self.v[y]);
        self.v[x] = result;
        self.v[0xF] = !borrow as u8;
        Ok(PcEffect::Next)
    }

    /// 8xy6 — shift right by one bit. Legacy: V[x] <- V[y] >> 1, VF <- the
    /// shifted-out bit of V[y]. Modern: V[x] <- V[x] >> 1 in place.
    fn op_shr(&mut self, x: usize, y: usize) -> Result<PcEffect, Error> {
        let source = if self.modern_shift { self.v[x] } else { self.v[y] };
        let dropped = source & 0b1;
        self.v[x] = source >> 1;
        self.v[0xF] = dropped;
        Ok(PcEffect::Next)
    }

    /// 8xy7 — V[x] <- V[y] - V[x], VF <- 1 if no borrow else 0.
    fn op_subn(&mut self, x: usize, y: usize) -> Result<PcEffect, Error> {
        let (result, borrow) = self.v[y].overflowing_sub(self.v[x]);
        self.v[x] = result;
        self.v[0xF] = !borrow as u8;
        Ok(PcEffect::Next)
    }

    /// 8xyE — shift left by one bit, symmetric to [`Cpu::op_shr`].
    fn op_shl(&mut self, x: usize, y: usize) -> Result<PcEffect, Error> {
        let source = if self.modern_shift { self.v[x] } else { self.v[y] };
        let dropped = (source & 0b1000_0000) >> 7;
        self.v[x] = source << 1;
        self.v[0xF] = dropped;
        Ok(PcEffect::Next)
    }

    /// 9xy0 — skips if V[x] != V[y].
    fn op_sne_vx_vy(&mut self, x: usize, y: usize) -> Result<PcEffect, Error> {
        Ok(if self.v[x] != self.v[y] { PcEffect::Skip } else { PcEffect::Next })
    }

    /// Annn — VI <- nnn.
    fn op_ld_i_nnn(&mut self, nnn: u16) -> Result<PcEffect, Error> {
        self.i = nnn;
        Ok(PcEffect::Next)
    }

    /// Bnnn — jumps to nnn + V0, subject to the same self-loop check as
    /// plain `JP`.
    fn op_jp_v0(&mut self, nnn: u16) -> Result<PcEffect, Error> {
        let target = nnn + self.v[0] as u16;
        if target == self.pc {
            return Ok(PcEffect::SelfLoop);
        }
        Ok(PcEffect::Jump(target))
    }

    /// Cxkk — V[x] <- (random byte) & kk.
    fn op_rnd(&mut self, x: usize, kk: u8) -> Result<PcEffect, Error> {
        let byte: u8 = self.rng.gen();
        self.v[x] = byte & kk;
        Ok(PcEffect::Next)
    }

    /// Dxyn — draws an n-byte sprite from memory[I..] at (V[x], V[y]).
    fn op_drw(&mut self, x: usize, y: usize, n: u8) -> Result<PcEffect, Error> {
        let start = self.i as usize;
        let end = start + n as usize;
        if end >= MEMORY_SIZE {
            return Err(Error::MemoryOutOfRange { addr: end });
        }

        let collision = self.framebuffer.draw_sprite(
            &self.memory[start..end],
            self.v[x] as usize,
            self.v[y] as usize,
        );
        self.v[0xF] = collision as u8;
        Ok(PcEffect::Next)
    }

    /// Ex9E — skips if the key named by V[x] is down.
    fn op_skp(&mut self, x: usize) -> Result<PcEffect, Error> {
        Ok(if self.keypad.is_down(self.v[x] as usize) { PcEffect::Skip } else { PcEffect::Next })
    }

    /// ExA1 — skips if the key named by V[x] is up.
    fn op_sknp(&mut self, x: usize) -> Result<PcEffect, Error> {
        Ok(if !self.keypad.is_down(self.v[x] as usize) { PcEffect::Skip } else { PcEffect::Next })
    }

    /// Fx07 — V[x] <- delay timer.
    fn op_ld_vx_dt(&mut self, x: usize) -> Result<PcEffect, Error> {
        self.v[x] = self.delay_timer.read();
        Ok(PcEffect::Next)
    }

    /// Fx0A — blocks until a key is down, storing its index in V[x].
    /// "Blocks" without stalling the worker thread: PC simply does not
    /// advance, so the pacing loop keeps spending budget and can still
    /// observe the stop signal between steps.
    fn op_ld_vx_k(&mut self, x: usize) -> Result<PcEffect, Error> {
        match self.keypad.any_pressed() {
            Some(key) => {
                self.v[x] = key as u8;
                Ok(PcEffect::Next)
            }
            None => Ok(PcEffect::Repeat),
        }
    }

    /// Fx15 — delay timer <- V[x].
    fn op_ld_dt_vx(&mut self, x: usize) -> Result<PcEffect, Error> {
        self.delay_timer.set(self.v[x]);
        Ok(PcEffect::Next)
    }

    /// Fx18 — sound timer <- V[x]. No-op: this core never opens an audio
    /// device (see the non-goals), so the write has no observable effect.
    fn op_ld_st_vx(&mut self, _x: usize) -> Result<PcEffect, Error> {
        Ok(PcEffect::Next)
    }

    /// Fx1E — VI <- VI + V[x].
    fn op_add_i_vx(&mut self, x: usize) -> Result<PcEffect, Error> {
        self.i = self.i.wrapping_add(self.v[x] as u16);
        Ok(PcEffect::Next)
    }

    /// Fx29 — VI <- address of the font glyph for V[x].
    fn op_ld_f_vx(&mut self, x: usize) -> Result<PcEffect, Error> {
        self.i = self.v[x] as u16 * 5;
        Ok(PcEffect::Next)
    }

    /// Fx33 — stores the 3-digit BCD representation of V[x] at [I..I+3].
    fn op_ld_b_vx(&mut self, x: usize) -> Result<PcEffect, Error> {
        let start = self.i as usize;
        if start + 2 >= MEMORY_SIZE {
            return Err(Error::MemoryOutOfRange { addr: start + 2 });
        }

        let value = self.v[x];
        self.memory[start] = value / 100;
        self.memory[start + 1] = (value / 10) % 10;
        self.memory[start + 2] = value % 10;
        Ok(PcEffect::Next)
    }

    /// Fx55 — copies V0..=Vx to memory[I..], then VI <- VI + x + 1.
    fn op_ld_i_vx(&mut self, x: usize) -> Result<PcEffect, Error> {
        let start = self.i as usize;
        if start + x >= MEMORY_SIZE {
            return Err(Error::MemoryOutOfRange { addr: start + x });
        }

        for offset in 0..=x {
            self.memory[start + offset] = self.v[offset];
        }
        self.i += x as u16 + 1;
        Ok(PcEffect::Next)
    }

    /// Fx65 — inverse of [`Cpu::op_ld_i_vx`]: fills V0..=Vx from memory[I..],
    /// with the same VI post-increment.
    fn op_ld_vx_i(&mut self, x: usize) -> Result<PcEffect, Error> {
        let start = self.i as usize;
        if start + x >= MEMORY_SIZE {
            return Err(Error::MemoryOutOfRange { addr: start + x });
        }

        for offset in 0..=x {
            self.v[offset] = self.memory[start + offset];
        }
        self.i += x as u16 + 1;
        Ok(PcEffect::Next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn cpu_with(rom: &[u8]) -> Cpu {
        Cpu::with_seed(rom, Arc::new(Framebuffer::new()), Arc::new(Keypad::new()), false, 0)
            .unwrap()
    }

    #[test]
    fn font_and_rom_are_loaded_and_pc_starts_at_0x200() {
        let cpu = cpu_with(&[0x60, 0x2A]);
        assert_eq!(&cpu.memory[0..5], &[0xF0, 0x90, 0x90, 0x90, 0xF0]);
        assert_eq!(cpu.memory[0x200], 0x60);
        assert_eq!(cpu.pc, 0x200);
    }

    #[test]
    fn empty_or_oversize_rom_is_rejected() {
        assert!(matches!(
            Cpu::with_seed(&[], Arc::new(Framebuffer::new()), Arc::new(Keypad::new()), false, 0),
            Err(Error::InvalidRom)
        ));

        let big = vec![0u8; 0xDFF];
        assert!(matches!(
            Cpu::with_seed(&big, Arc::new(Framebuffer::new()), Arc::new(Keypad::new()), false, 0),
            Err(Error::InvalidRom)
        ));
    }

    // Scenario 1: 6A 2A 7A 05 -> V[A] = 0x2F, VF unchanged, PC = 0x204.
    #[test]
    fn ld_then_add_accumulates_and_leaves_vf_untouched() {
        let mut cpu = cpu_with(&[0x6A, 0x2A, 0x7A, 0x05]);
        cpu.v[0xF] = 0x42;

        assert!(cpu.step().unwrap());
        assert!(cpu.step().unwrap());

        assert_eq!(cpu.v[0xA], 0x2F);
        assert_eq!(cpu.v[0xF], 0x42);
        assert_eq!(cpu.pc, 0x204);
    }

    // Scenario 2: ADD Vx,Vy carry flag, with the VF-after-value contract
    // exercised directly via x == 0xF.
    #[test]
    fn add_vx_vy_sets_carry_after_writing_the_sum() {
        let mut cpu = cpu_with(&[0x60, 0xFF, 0x61, 0x01, 0x80, 0x14]);
        cpu.step().unwrap(); // V0 = 0xFF
        cpu.step().unwrap(); // V1 = 0x01
        cpu.step().unwrap(); // ADD V0, V1

        assert_eq!(cpu.v[0], 0x00);
        assert_eq!(cpu.v[0xF], 1);
    }

    #[test]
    fn add_vx_vy_writes_flag_last_even_when_x_is_vf() {
        let mut cpu = cpu_with(&[0x6F, 0xFF, 0x61, 0x01, 0x8F, 0x14]);
        cpu.step().unwrap(); // VF = 0xFF
        cpu.step().unwrap(); // V1 = 0x01
        cpu.step().unwrap(); // ADD VF, V1 -> sum wraps to 0x00, then flag overwrites it with 1

        assert_eq!(cpu.v[0xF], 1);
    }

    #[test]
    fn sub_sets_vf_to_one_when_there_is_no_borrow() {
        let mut cpu = cpu_with(&[0x60, 0x05, 0x61, 0x02, 0x80, 0x15]);
        cpu.step().unwrap();
        cpu.step().unwrap();
        cpu.step().unwrap();

        assert_eq!(cpu.v[0], 3);
        assert_eq!(cpu.v[0xF], 1);
    }

    #[test]
    fn subn_sets_vf_to_zero_on_borrow() {
        let mut cpu = cpu_with(&[0x60, 0x02, 0x61, 0x05, 0x80, 0x17]);
        cpu.step().unwrap();
        cpu.step().unwrap();
        cpu.step().unwrap(); // V0 = V1 - V0 = 3, no borrow -> VF = 1

        assert_eq!(cpu.v[0], 3);
        assert_eq!(cpu.v[0xF], 1);
    }

    #[test]
    fn legacy_shr_reads_vy_and_writes_vx() {
        let mut cpu = cpu_with(&[0x61, 0x03, 0x80, 0x16]);
        cpu.step().unwrap(); // V1 = 0b011
        cpu.step().unwrap(); // V0 = V1 >> 1, VF = V1 & 1

        assert_eq!(cpu.v[0], 1);
        assert_eq!(cpu.v[0xF], 1);
    }

    #[test]
    fn modern_shr_shifts_vx_in_place() {
        let mut cpu = Cpu::with_seed(
            &[0x60, 0x03, 0x80, 0x06],
            Arc::new(Framebuffer::new()),
            Arc::new(Keypad::new()),
            true,
            0,
        )
        .unwrap();
        cpu.step().unwrap(); // V0 = 0b011
        cpu.step().unwrap(); // V0 = V0 >> 1, VF = old V0 & 1

        assert_eq!(cpu.v[0], 1);
        assert_eq!(cpu.v[0xF], 1);
    }

    #[test]
    fn add_vx_kk_never_touches_vf() {
        let mut cpu = cpu_with(&[0x6F, 0x01, 0x7F, 0xFF]);
        cpu.step().unwrap();
        cpu.step().unwrap();

        assert_eq!(cpu.v[0xF], 0);
    }

    // Scenario 3: CALL then RET restores PC and stack depth.
    #[test]
    fn call_then_ret_restores_pc_and_stack_depth() {
        let mut cpu = cpu_with(&[0x22, 0x04, 0x00, 0x00, 0x00, 0xEE]);

        assert!(cpu.step().unwrap()); // CALL 0x204
        assert_eq!(cpu.pc, 0x204);
        assert_eq!(cpu.stack, vec![0x202]);

        assert!(cpu.step().unwrap()); // RET
        assert_eq!(cpu.pc, 0x202);
        assert!(cpu.stack.is_empty());
    }

    #[test]
    fn call_past_capacity_overflows() {
        let mut rom = Vec::new();
        for _ in 0..13 {
            rom.extend_from_slice(&[0x22, 0x00]); // CALL 0x200 repeatedly
        }
        let mut cpu = cpu_with(&rom);

        for _ in 0..STACK_CAPACITY {
            cpu.step().unwrap();
        }
        assert!(matches!(cpu.step(), Err(Error::StackOverflow)));
    }

    #[test]
    fn ret_on_empty_stack_underflows() {
        let mut cpu = cpu_with(&[0x00, 0xEE]);
        assert!(matches!(cpu.step(), Err(Error::StackUnderflow)));
    }

    // Scenario 5: 12 00 is a self-loop -> step returns Ok(false), PC unchanged.
    #[test]
    fn jp_to_self_is_a_self_loop() {
        let mut cpu = cpu_with(&[0x12, 0x00]);
        assert_eq!(cpu.step().unwrap(), false);
        assert_eq!(cpu.pc, 0x200);
    }

    #[test]
    fn jp_v0_to_self_is_also_a_self_loop() {
        let mut cpu = cpu_with(&[0xB2, 0x00]);
        assert_eq!(cpu.step().unwrap(), false);
    }

    #[test]
    fn jp_elsewhere_is_not_a_self_loop() {
        let mut cpu = cpu_with(&[0x12, 0x04, 0x00, 0x00, 0x00, 0xE0]);
        assert_eq!(cpu.step().unwrap(), true);
        assert_eq!(cpu.pc, 0x204);
    }

    #[test]
    fn illegal_opcode_is_reported_with_raw_word_and_pc() {
        let mut cpu = cpu_with(&[0x51, 0x23]); // 5xy? with n != 0 is undefined
        match cpu.step() {
            Err(Error::IllegalOpcode { raw, pc }) => {
                assert_eq!(raw, 0x5123);
                assert_eq!(pc, 0x200);
            }
            other => panic!("expected IllegalOpcode, got {other:?}"),
        }
    }

    // Scenario 4: drawing a solid 5-row bar, then drawing it again clears it.
    #[test]
    fn drawing_a_bar_then_redrawing_clears_it_and_reports_collision() {
        let mut rom = vec![0xA2, 0x10, 0x62, 0x0A, 0x63, 0x0A, 0xD2, 0x35];
        rom.resize(0x10, 0);
        rom.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);

        let fb = Arc::new(Framebuffer::new());
        let mut cpu =
            Cpu::with_seed(&rom, Arc::clone(&fb), Arc::new(Keypad::new()), false, 0).unwrap();

        cpu.step().unwrap(); // LD I, 0x210
        cpu.step().unwrap(); // LD V2, 10
        cpu.step().unwrap(); // LD V3, 10
        cpu.step().unwrap(); // DRW V2, V3, 5

        assert_eq!(cpu.v[0xF], 0);
        for row in 10..15 {
            assert_ne!(fb.snapshot()[row], 0);
        }

        cpu.pc = 0x206; // redraw
        cpu.step().unwrap();
        assert_eq!(cpu.v[0xF], 1);
        for row in 10..15 {
            assert_eq!(fb.snapshot()[row], 0);
        }
    }

    // Scenario 6: BCD of 171 at VI=0x300 -> {1, 7, 1}.
    #[test]
    fn bcd_splits_value_into_hundreds_tens_ones() {
        let mut cpu = cpu_with(&[0x61, 0xAB, 0xA3, 0x00, 0xF1, 0x33]);
        cpu.step().unwrap(); // V1 = 0xAB (171)
        cpu.step().unwrap(); // I = 0x300
        cpu.step().unwrap(); // BCD V1

        assert_eq!(&cpu.memory[0x300..0x303], &[1, 7, 1]);
    }

    #[test]
    fn drw_past_memory_end_is_out_of_range() {
        let mut cpu = cpu_with(&[0xD0, 0x0F]); // DRW V0, V0, 15
        cpu.i = (MEMORY_SIZE - 1) as u16;
        assert!(matches!(cpu.step(), Err(Error::MemoryOutOfRange { .. })));
    }

    #[test]
    fn drw_exactly_touching_the_last_byte_is_still_out_of_range() {
        // VI=4091, n=5 -> end=4096: the documented boundary is VI + n >= 4096,
        // not > 4096, so this must fail even though memory[4091..4096] is a
        // legal slice.
        let mut cpu = cpu_with(&[0xD0, 0x05]); // DRW V0, V0, 5
        cpu.i = 4091;
        assert!(matches!(
            cpu.step(),
            Err(Error::MemoryOutOfRange { addr: 4096 })
        ));
    }

    #[test]
    fn jp_to_0xfff_is_pc_out_of_range() {
        let mut cpu = cpu_with(&[0x1F, 0xFF]);
        assert!(matches!(cpu.step(), Err(Error::PcOutOfRange { addr: 0x0FFF })));
    }

    #[test]
    fn ordinary_advance_past_the_last_valid_pc_is_out_of_range_not_a_panic() {
        // A two-byte instruction at 0xFFE would advance PC to 0x1000, past
        // PC_MAX. Every PC write, not just explicit jumps, must be checked.
        let mut cpu = cpu_with(&[0x00, 0x00]);
        cpu.memory[0xFFE] = 0x00;
        cpu.memory[0xFFF] = 0xE0; // CLS
        cpu.pc = 0x0FFE;

        assert!(matches!(cpu.step(), Err(Error::PcOutOfRange { addr: 0x1000 })));
    }

    #[test]
    fn skip_past_the_last_valid_pc_is_out_of_range_not_a_panic() {
        // SE Vx,kk at 0xFFC that matches skips by 4, landing PC at 0x1000.
        let mut cpu = cpu_with(&[0x00, 0x00]);
        cpu.memory[0xFFC] = 0x30;
        cpu.memory[0xFFD] = 0x00; // SE V0, 0 (V0 starts at 0, always matches)
        cpu.pc = 0x0FFC;

        assert!(matches!(cpu.step(), Err(Error::PcOutOfRange { addr: 0x1000 })));
    }

    #[test]
    fn block_on_key_repeats_until_a_key_is_down() {
        let keypad = Arc::new(Keypad::new());
        let mut cpu =
            Cpu::with_seed(&[0xF0, 0x0A], Arc::new(Framebuffer::new()), Arc::clone(&keypad), false, 0)
                .unwrap();

        assert!(cpu.step().unwrap());
        assert_eq!(cpu.pc, 0x200); // no key pressed yet, instruction repeats

        keypad.set(0x7, true);
        assert!(cpu.step().unwrap());
        assert_eq!(cpu.v[0], 0x7);
        assert_eq!(cpu.pc, 0x202);
    }

    #[test]
    fn memory_block_store_then_load_round_trips_and_advances_i_identically() {
        let mut cpu = cpu_with(&[
            0x60, 0x11, 0x61, 0x22, 0x62, 0x33, 0xA3, 0x00, 0xF2, 0x55, 0x60, 0x00, 0x61, 0x00,
            0x62, 0x00, 0xF2, 0x65,
        ]);
        for _ in 0..5 {
            cpu.step().unwrap();
        }
        let i_after_store = cpu.i;
        assert_eq!(i_after_store, 0x303);

        for _ in 0..4 {
            cpu.step().unwrap();
        }

        assert_eq!(cpu.v[0], 0x11);
        assert_eq!(cpu.v[1], 0x22);
        assert_eq!(cpu.v[2], 0x33);
        assert_eq!(cpu.i, i_after_store + 3);
    }

    #[test]
    fn run_at_stops_promptly_when_the_stop_signal_fires() {
        let mut cpu = cpu_with(&[0x00, 0xE0, 0x12, 0x00]); // CLS then self-loop
        let (tx, rx) = mpsc::channel();
        tx.send(()).unwrap();

        let start = Instant::now();
        cpu.run_at(&rx, 600).unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn run_at_stops_on_self_loop_without_a_stop_signal() {
        let mut cpu = cpu_with(&[0x12, 0x00]);
        let (_tx, rx) = mpsc::channel();

        cpu.run_at(&rx, 1000).unwrap();
    }
}
