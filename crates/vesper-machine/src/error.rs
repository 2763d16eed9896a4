use thiserror::Error;

pub type MachineResult<T> = std::result::Result<T, MachineError>;

/// Recoverable machine-level failures.
///
/// Kernel bugs (a disk request while one is outstanding, scheduling an
/// interrupt zero ticks out) are not represented here: those are fatal
/// assertions, because the simulation cannot meaningfully continue.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("console output is busy")]
    ConsoleBusy,

    #[error("no console input is buffered")]
    NoInputBuffered,

    #[error("bad disk image magic {found:#010x} (expected {expected:#010x})")]
    BadDiskImage { found: u32, expected: u32 },

    #[error("disk image io: {0}")]
    Io(#[from] std::io::Error),
}
