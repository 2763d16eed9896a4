use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub use vesper_machine::{HaltMode, TickParams};

/// How the scheduler picks and preempts threads. Fixed for the lifetime of a
/// kernel: the policy is chosen before the simulation starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Policy {
    /// First come, first served; no preemption.
    Fcfs,
    /// FIFO with timer-driven preemption every quantum.
    RoundRobin,
    /// Highest priority first; a running thread is never preempted.
    PrioNonPreemptive,
    /// Highest priority first; a strictly higher-priority arrival preempts.
    PrioPreemptive,
    /// Shortest remaining burst first; no preemption.
    SjfNonPreemptive,
    /// Shortest remaining burst first; a strictly shorter arrival preempts.
    SjfPreemptive,
}

impl Policy {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Fcfs => "fcfs",
            Self::RoundRobin => "rr",
            Self::PrioNonPreemptive => "prio_np",
            Self::PrioPreemptive => "prio_p",
            Self::SjfNonPreemptive => "sjf_np",
            Self::SjfPreemptive => "sjf_p",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Policy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: [Policy; 6] = [
            Policy::Fcfs,
            Policy::RoundRobin,
            Policy::PrioNonPreemptive,
            Policy::PrioPreemptive,
            Policy::SjfNonPreemptive,
            Policy::SjfPreemptive,
        ];
        ALL.into_iter()
            .find(|policy| s.eq_ignore_ascii_case(policy.name()))
            .ok_or_else(|| ConfigError::UnknownPolicy(s.to_owned()))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown scheduling policy `{0}`")]
    UnknownPolicy(String),
}

/// Everything the kernel consumes from the outside world, as values. Parsing
/// a command line or a config file into this is the embedder's business.
#[derive(Clone)]
pub struct KernelConfig {
    pub policy: Policy,
    /// Save and restore user CPU state across context switches.
    pub user_programs: bool,
    /// Seed for the random-interval timer mode.
    pub random_seed: u64,
    pub ticks: TickParams,
    pub halt: HaltMode,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            policy: Policy::Fcfs,
            user_programs: false,
            random_seed: 0,
            ticks: TickParams::default(),
            halt: HaltMode::ExitProcess,
        }
    }
}
