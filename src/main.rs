mod config;
mod input;
mod render;

use std::path::Path;
use std::process::ExitCode;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use structopt::StructOpt;

use chip8_vm::chip8::{Cpu, Error, Framebuffer, Keypad};
use config::Config;

/// Cadence of the UI thread's event-poll-and-render loop, matching the
/// 60 Hz the delay timer and renderer are specified against.
const FRAME_INTERVAL: Duration = Duration::from_nanos(16_666_667);

fn load_rom(path: &Path) -> Result<Vec<u8>, Error> {
    Ok(std::fs::read(path)?)
}

fn main() -> ExitCode {
    let config = Config::from_args();

    let default_filter = if config.verbose() { "chip8=trace" } else { "chip8=info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let rom = match load_rom(config.rom()) {
        Ok(rom) => rom,
        Err(err) => {
            log::error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let framebuffer = Arc::new(Framebuffer::new());
    let keypad = Arc::new(Keypad::new());

    let mut cpu = match Cpu::new(&rom, Arc::clone(&framebuffer), Arc::clone(&keypad), config.modern())
    {
        Ok(cpu) => cpu,
        Err(err) => {
            log::error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let (stop_tx, stop_rx) = mpsc::channel();
    let target_hz = config.frequency();

    let worker = thread::spawn(move || cpu.run_at(&stop_rx, target_hz));

    let sdl_context = sdl2::init().expect("failed to initialize SDL2");
    let mut display = render::Display::new(&sdl_context);
    let mut input = input::Input::new(&sdl_context);

    while !worker.is_finished() {
        if input.poll(&keypad) {
            let _ = stop_tx.send(());
            break;
        }

        display.draw(&framebuffer, false);
        thread::sleep(FRAME_INTERVAL);
    }

    drop(stop_tx);

    match worker.join().expect("CPU worker thread panicked") {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
