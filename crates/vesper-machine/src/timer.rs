use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::interrupt::Machine;
use crate::pending::{InterruptHandle, InterruptKind};
use crate::stats::Tick;

/// Hardware timer device: interrupts the CPU once per period.
///
/// The timer re-arms itself at the head of each firing, before the
/// subscriber's handler runs, so the next interrupt is already queued even if
/// the handler causes a context switch. With `random` set the period is drawn
/// uniformly from `[1, 2 * timer_ticks]`, which puts some jitter into
/// time-slicing while keeping runs reproducible for a fixed seed.
pub struct Timer {
    machine: Arc<Machine>,
    handler: Box<dyn Fn() + Send + Sync>,
    random: bool,
    rng: Mutex<StdRng>,
    pending: Mutex<Option<InterruptHandle>>,
}

impl Timer {
    /// Creates the device and schedules its first interrupt. `handler` is
    /// invoked with interrupts disabled every time the timer expires.
    pub fn new(
        machine: Arc<Machine>,
        random: bool,
        seed: u64,
        handler: impl Fn() + Send + Sync + 'static,
    ) -> Arc<Self> {
        machine.register_timer_device();
        let timer = Arc::new(Self {
            machine,
            handler: Box::new(handler),
            random,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            pending: Mutex::new(None),
        });
        timer.schedule_next();
        timer
    }

    fn next_delay(&self) -> Tick {
        let period = self.machine.params().timer_ticks;
        if self.random {
            self.rng.lock().unwrap().gen_range(1..=2 * period)
        } else {
            period
        }
    }

    fn schedule_next(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = self
            .machine
            .schedule(self.next_delay(), InterruptKind::Timer, move || {
                if let Some(timer) = weak.upgrade() {
                    timer.fire();
                }
            });
        *self.pending.lock().unwrap() = Some(handle);
    }

    fn fire(self: &Arc<Self>) {
        // Re-arm first: the subscriber may context switch.
        self.schedule_next();
        (self.handler)();
    }

    /// Cancels the pending timer interrupt.
    pub fn cancel(&self) {
        debug!("cancelling timer");
        if let Some(handle) = self.pending.lock().unwrap().take() {
            self.machine.cancel(handle);
        }
    }
}
