use thiserror::Error;

/// Every structural failure the core can surface, from ROM load through execution.
///
/// The run loop terminates on the first one of these and hands it back to whoever
/// joins the worker thread; nothing here is retried.
#[derive(Error, Debug)]
pub enum Error {
    #[error("illegal opcode {raw:#06x} at {pc:#05x}")]
    IllegalOpcode { raw: u16, pc: u16 },

    #[error("program counter set out of range: {addr:#05x}")]
    PcOutOfRange { addr: u16 },

    #[error("stack overflow: CALL with 12 frames already in use")]
    StackOverflow,

    #[error("stack underflow: RET with an empty call stack")]
    StackUnderflow,

    #[error("memory access out of range: {addr:#05x}")]
    MemoryOutOfRange { addr: usize },

    #[error("invalid ROM: must be non-empty and smaller than 0xDFF bytes")]
    InvalidRom,

    #[error("could not load ROM: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn illegal_opcode_formats_raw_and_pc() {
        let err = Error::IllegalOpcode { raw: 0x0FFF, pc: 0x0200 };
        assert_eq!(err.to_string(), "illegal opcode 0x0fff at 0x200");
    }

    #[test]
    fn io_error_wraps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        let err: Error = io.into();
        assert!(err.to_string().contains("could not load ROM"));
    }
}
