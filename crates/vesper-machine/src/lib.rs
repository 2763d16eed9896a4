//! Deterministic discrete-event emulation of a uniprocessor machine.
//!
//! The machine advances a virtual clock tick-by-tick and fires device
//! interrupts in timestamp order. Everything a kernel built on top of it
//! needs lives here:
//!
//! - [`Machine`]: virtual clock, statistics, interrupt mask, and the priority
//!   queue of pending device interrupts
//! - [`Timer`]: periodic (optionally seeded-random) time-slice interrupts
//! - [`Disk`]: asynchronous single-sector reads and writes with a seek +
//!   rotation + transfer latency model, persisted via [`SectorStorage`]
//! - [`Console`]: polled keyboard input and asynchronous display output
//!
//! Simulated time only moves when the machine bills a tick or an idle
//! machine jumps to the next interrupt deadline, so runs are reproducible:
//! the same inputs produce the same interleavings, tick for tick.
#![forbid(unsafe_code)]

pub mod console;
pub mod disk;
pub mod error;
pub mod interrupt;
pub mod pending;
pub mod stats;
pub mod storage;
pub mod timer;

pub use console::{ByteSink, ByteSource, Console, ScriptedSource, SharedSink, StdinSource, StdoutSink};
pub use disk::{Disk, DiskConfig, DiskGeometry, DISK_MAGIC};
pub use error::{MachineError, MachineResult};
pub use interrupt::{HaltMode, HaltSignal, InterruptMask, Machine, MachineConfig, MachineMode};
pub use pending::{InterruptHandle, InterruptKind};
pub use stats::{Statistics, Tick, TickParams};
pub use storage::{FileBackend, MemBackend, SectorStorage};
pub use timer::Timer;
