use std::path::PathBuf;

use structopt::StructOpt;

/// Lowest/highest instructions-per-second this core will pace toward.
const MIN_FREQUENCY: u32 = 1;
const MAX_FREQUENCY: u32 = 10_000;

fn parse_frequency(src: &str) -> Result<u32, String> {
    let value: u32 = src.parse().map_err(|_| format!("`{}` is not a valid frequency", src))?;
    if (MIN_FREQUENCY..=MAX_FREQUENCY).contains(&value) {
        Ok(value)
    } else {
        Err(format!(
            "frequency must be between {} and {}, got {}",
            MIN_FREQUENCY, MAX_FREQUENCY, value
        ))
    }
}

#[derive(StructOpt)]
#[structopt(name = "chip8-vm", about = "A CHIP-8 VM implementation. Pass `-h` to see all optional flags")]
pub struct Config {
    /// Path to the ROM file to load.
    #[structopt(parse(from_os_str))]
    rom: PathBuf,

    #[structopt(
        name = "modern",
        help = "Select modern shift semantics for 8xy6/8xyE (shift Vx in place instead of copying Vy into Vx)",
        short,
        long
    )]
    modern: bool,

    #[structopt(
        name = "frequency",
        help = "Target instructions per second",
        short,
        long,
        default_value = "600",
        parse(try_from_str = parse_frequency)
    )]
    frequency: u32,

    #[structopt(name = "verbose", help = "Raise the log verbosity to trace", short, long)]
    verbose: bool,
}

impl Config {
    pub fn rom(&self) -> &PathBuf {
        &self.rom
    }

    pub fn modern(&self) -> bool {
        self.modern
    }

    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }
}
