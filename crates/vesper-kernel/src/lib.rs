//! Cooperative kernel threads and a multi-policy scheduler on top of the
//! [`vesper_machine`] emulation.
//!
//! A [`Kernel`] owns one simulated machine and schedules cooperative threads
//! over it. Dispatch is driven by explicit `yield`/`sleep` transitions, by
//! timer interrupts (under Round-Robin), and by device completions waking
//! blocked threads; which thread runs next is decided by the configured
//! [`Policy`].
//!
//! Mutual exclusion inside the simulation is interrupt masking: every
//! scheduler primitive that touches shared state requires interrupts off,
//! exactly as on a real uniprocessor. Each kernel thread is carried by a host
//! OS thread, with a rendezvous guaranteeing that only one of them makes
//! progress at a time, so runs are deterministic tick for tick.
#![forbid(unsafe_code)]

pub mod config;
pub mod kernel;
mod scheduler;
pub mod sync;
pub mod thread;
pub mod workload;

pub use config::{ConfigError, HaltMode, KernelConfig, Policy, TickParams};
pub use kernel::Kernel;
pub use sync::Semaphore;
pub use thread::{KThread, Priority, ThreadStatus, UserContext};
pub use workload::{run_arrivals, simulate_work, Arrival, WorkloadReport};

pub use vesper_machine::{Statistics, Tick};
