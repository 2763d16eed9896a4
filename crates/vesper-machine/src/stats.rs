use std::fmt;

/// Atomic unit of simulated time.
pub type Tick = u64;

/// Cost model for the virtual clock and the device latency simulations.
///
/// Every value is in ticks. The defaults are deliberately coarse: one user
/// instruction costs one tick, one kernel operation costs ten, and the
/// mechanical devices are slower by orders of magnitude, which is roughly the
/// ratio real hardware exhibits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickParams {
    /// Cost of one kernel operation.
    pub system_tick: Tick,
    /// Cost of one user instruction.
    pub user_tick: Tick,
    /// Period between hardware timer interrupts; also the Round-Robin quantum.
    pub timer_ticks: Tick,
    /// Disk head movement cost, per track crossed.
    pub seek_time: Tick,
    /// Time for one sector to rotate past the disk head.
    pub rotation_time: Tick,
    /// Time to transmit one console character.
    pub console_time: Tick,
}

impl Default for TickParams {
    fn default() -> Self {
        Self {
            system_tick: 10,
            user_tick: 1,
            timer_ticks: 100,
            seek_time: 500,
            rotation_time: 500,
            console_time: 100,
        }
    }
}

/// Monotonic performance counters for one simulation run.
///
/// Counters are only ever mutated with interrupts masked, so a snapshot taken
/// between operations observes a consistent state. The paging counters are
/// maintained on behalf of the virtual-memory layer and are not touched by
/// the machine itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
    pub total_ticks: Tick,
    pub system_ticks: Tick,
    pub user_ticks: Tick,
    pub idle_ticks: Tick,

    pub num_disk_reads: u64,
    pub num_disk_writes: u64,
    pub num_console_chars_read: u64,
    pub num_console_chars_written: u64,

    pub num_page_faults: u64,
    pub num_page_ins: u64,
    pub num_page_outs: u64,

    last_report: Tick,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ticks elapsed since the previous call, for per-burst progress reports.
    pub fn elapsed_since_last_report(&mut self) -> Tick {
        let elapsed = self.total_ticks - self.last_report;
        self.last_report = self.total_ticks;
        elapsed
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Ticks: total {}, idle {}, system {}, user {}",
            self.total_ticks, self.idle_ticks, self.system_ticks, self.user_ticks
        )?;
        writeln!(
            f,
            "Disk I/O: reads {}, writes {}",
            self.num_disk_reads, self.num_disk_writes
        )?;
        writeln!(
            f,
            "Console I/O: reads {}, writes {}",
            self.num_console_chars_read, self.num_console_chars_written
        )?;
        write!(
            f,
            "Paging: faults {}, ins {}, outs {}",
            self.num_page_faults, self.num_page_ins, self.num_page_outs
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_report_tracks_deltas() {
        let mut stats = Statistics::new();
        stats.total_ticks = 40;
        assert_eq!(stats.elapsed_since_last_report(), 40);
        stats.total_ticks = 70;
        assert_eq!(stats.elapsed_since_last_report(), 30);
        assert_eq!(stats.elapsed_since_last_report(), 0);
    }

    #[test]
    fn summary_lists_every_counter_group() {
        let stats = Statistics {
            total_ticks: 120,
            system_ticks: 100,
            user_ticks: 0,
            idle_ticks: 20,
            num_disk_reads: 1,
            num_disk_writes: 2,
            ..Statistics::default()
        };
        let text = stats.to_string();
        assert!(text.contains("total 120"));
        assert!(text.contains("idle 20"));
        assert!(text.contains("reads 1, writes 2"));
    }
}
