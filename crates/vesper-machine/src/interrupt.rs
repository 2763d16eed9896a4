use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use tracing::{debug, error, trace};

use crate::pending::{InterruptHandle, InterruptKind, PendingQueue};
use crate::stats::{Statistics, Tick, TickParams};

/// The global interrupt-enable flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterruptMask {
    Off,
    On,
}

/// What kind of code the simulated CPU is currently executing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineMode {
    /// No thread is ready; only a pending device interrupt can make progress.
    Idle,
    /// Kernel code.
    System,
    /// User-program code.
    User,
}

#[derive(Debug)]
struct IntrState {
    mask: InterruptMask,
    in_handler: bool,
    yield_on_return: bool,
    mode: MachineMode,
}

/// Observable end-of-simulation flag, for [`HaltMode::Signal`].
#[derive(Debug, Default)]
pub struct HaltSignal {
    halted: Mutex<bool>,
    cv: Condvar,
}

impl HaltSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_halted(&self) -> bool {
        *self.halted.lock().unwrap()
    }

    /// Blocks until the machine halts or the timeout expires; returns whether
    /// the halt was observed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.halted.lock().unwrap();
        let (guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |halted| !*halted)
            .unwrap();
        *guard
    }

    fn raise(&self) {
        *self.halted.lock().unwrap() = true;
        self.cv.notify_all();
    }
}

/// What [`Machine::halt`] does after printing the run summary.
#[derive(Clone)]
pub enum HaltMode {
    /// Exit the host process. The default outside tests.
    ExitProcess,
    /// Raise the signal and park the halting thread forever, so a test can
    /// observe natural termination without losing the process.
    Signal(Arc<HaltSignal>),
}

#[derive(Clone)]
pub struct MachineConfig {
    pub ticks: TickParams,
    pub halt: HaltMode,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ticks: TickParams::default(),
            halt: HaltMode::ExitProcess,
        }
    }
}

type PreemptHook = Arc<dyn Fn() + Send + Sync>;

/// The simulated uniprocessor: virtual clock, statistics, interrupt mask, and
/// the queue of pending device interrupts.
///
/// There are no globals; every component holds an `Arc<Machine>`, and a test
/// builds an isolated machine per case. The machine is logically
/// single-threaded: mutual exclusion between kernel threads is provided by
/// the interrupt mask, and the internal locks exist only to make sharing the
/// machine across host threads sound.
///
/// Interrupt handlers run with the mask forced [`InterruptMask::Off`], in
/// [`MachineMode::System`]. They may schedule new interrupts, mark threads
/// ready, and call [`yield_on_return`](Self::yield_on_return); they must not
/// enable interrupts or block.
pub struct Machine {
    params: TickParams,
    stats: Mutex<Statistics>,
    state: Mutex<IntrState>,
    pending: Mutex<PendingQueue>,
    timer_present: AtomicBool,
    preempt: RwLock<Option<PreemptHook>>,
    halt_mode: HaltMode,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Arc<Self> {
        Arc::new(Self {
            params: config.ticks,
            stats: Mutex::new(Statistics::new()),
            state: Mutex::new(IntrState {
                mask: InterruptMask::Off,
                in_handler: false,
                yield_on_return: false,
                mode: MachineMode::System,
            }),
            pending: Mutex::new(PendingQueue::new()),
            timer_present: AtomicBool::new(false),
            preempt: RwLock::new(None),
            halt_mode: config.halt,
        })
    }

    pub fn params(&self) -> &TickParams {
        &self.params
    }

    /// Snapshot of the performance counters.
    pub fn stats(&self) -> Statistics {
        *self.stats.lock().unwrap()
    }

    /// Current virtual time.
    pub fn now(&self) -> Tick {
        self.stats.lock().unwrap().total_ticks
    }

    pub(crate) fn with_stats(&self, f: impl FnOnce(&mut Statistics)) {
        f(&mut self.stats.lock().unwrap());
    }

    /// Installs the hook run when an interrupt handler requested a context
    /// switch. The kernel installs its yield routine here at boot.
    pub fn set_preempt_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.preempt.write().unwrap() = Some(Arc::new(hook));
    }

    /// Marks that a hardware timer device exists, which changes how an idle
    /// machine treats a queue holding nothing but the time-slice interrupt.
    pub(crate) fn register_timer_device(&self) {
        self.timer_present.store(true, Ordering::Relaxed);
    }

    pub fn mask(&self) -> InterruptMask {
        self.state.lock().unwrap().mask
    }

    pub fn in_handler(&self) -> bool {
        self.state.lock().unwrap().in_handler
    }

    pub fn mode(&self) -> MachineMode {
        self.state.lock().unwrap().mode
    }

    pub fn set_mode(&self, mode: MachineMode) {
        self.state.lock().unwrap().mode = mode;
    }

    /// Changes the mask without advancing time. Used internally around
    /// handler dispatch.
    fn change_mask(&self, new: InterruptMask) {
        let mut st = self.state.lock().unwrap();
        trace!(from = ?st.mask, to = ?new, "interrupt mask");
        st.mask = new;
    }

    /// Sets the interrupt mask and returns the previous one. Enabling
    /// interrupts advances simulated time by one tick.
    ///
    /// Handlers are prohibited from enabling interrupts: such a call is a
    /// logged no-op that still reports the old mask.
    pub fn set_mask(&self, new: InterruptMask) -> InterruptMask {
        let old = {
            let mut st = self.state.lock().unwrap();
            if new == InterruptMask::On && st.in_handler {
                error!("interrupt handler attempted to enable interrupts");
                return st.mask;
            }
            let old = st.mask;
            trace!(from = ?old, to = ?new, "interrupt mask");
            st.mask = new;
            old
        };
        if old == InterruptMask::Off && new == InterruptMask::On {
            self.one_tick();
        }
        old
    }

    /// Turns interrupts on unconditionally. Used when a freshly forked thread
    /// first starts running.
    pub fn enable(&self) {
        self.set_mask(InterruptMask::On);
    }

    /// Arranges for `handler` to be invoked when simulated time reaches
    /// `now + from_now`. Only device models should call this; the kernel
    /// reaches the clock through them.
    ///
    /// # Panics
    ///
    /// Panics if `from_now` is zero: an interrupt must be scheduled strictly
    /// in the future.
    pub fn schedule(
        &self,
        from_now: Tick,
        kind: InterruptKind,
        handler: impl FnOnce() + Send + 'static,
    ) -> InterruptHandle {
        assert!(from_now > 0, "interrupt scheduled zero ticks in the future");
        let when = self.now() + from_now;
        trace!(%kind, when, "scheduling interrupt");
        self.pending
            .lock()
            .unwrap()
            .schedule(when, kind, Box::new(handler))
    }

    /// Cancels a scheduled interrupt. The entry stays queued and is silently
    /// skipped when it reaches the head of the queue.
    pub fn cancel(&self, handle: InterruptHandle) {
        trace!(?handle, "cancelling interrupt");
        self.pending.lock().unwrap().cancel(handle);
    }

    /// Called from within an interrupt handler to request a context switch in
    /// the interrupted thread once the handler unwinds. The switch cannot
    /// happen here: that would switch out the handler itself.
    ///
    /// # Panics
    ///
    /// Panics when called outside a handler.
    pub fn yield_on_return(&self) {
        let mut st = self.state.lock().unwrap();
        assert!(st.in_handler, "yield_on_return outside an interrupt handler");
        st.yield_on_return = true;
    }

    /// Advances simulated time by one tick and fires any interrupts that
    /// became due. Called when interrupts are re-enabled and for every billed
    /// user instruction.
    pub fn one_tick(&self) {
        let old_mode = self.mode();

        {
            let mut stats = self.stats.lock().unwrap();
            match old_mode {
                MachineMode::User => {
                    stats.total_ticks += self.params.user_tick;
                    stats.user_ticks += self.params.user_tick;
                }
                _ => {
                    stats.total_ticks += self.params.system_tick;
                    stats.system_ticks += self.params.system_tick;
                }
            }
            trace!(tick = stats.total_ticks, "clock");
        }

        // Handlers run with interrupts disabled.
        self.change_mask(InterruptMask::Off);
        while self.check_if_due(false) {}
        self.change_mask(InterruptMask::On);

        // If a handler asked for a time slice, it is safe to take it now that
        // the handler has unwound.
        let wants_yield = {
            let mut st = self.state.lock().unwrap();
            if st.yield_on_return {
                st.yield_on_return = false;
                st.mode = MachineMode::System;
                true
            } else {
                false
            }
        };
        if wants_yield {
            let hook = self.preempt.read().unwrap().clone();
            if let Some(hook) = hook {
                hook();
            }
            self.state.lock().unwrap().mode = old_mode;
        }
    }

    /// Fires the earliest pending interrupt if it is due, returning whether a
    /// queue entry was consumed.
    ///
    /// With `advance_clock` set there is nothing runnable, so the clock jumps
    /// forward to the next deadline, billing the gap as idle time. Without
    /// it, an entry that is not yet due stays queued.
    fn check_if_due(&self, advance_clock: bool) -> bool {
        debug_assert_eq!(
            self.mask(),
            InterruptMask::Off,
            "interrupt dispatch requires the mask off"
        );
        let mode = self.mode();

        let entry = {
            let mut stats = self.stats.lock().unwrap();
            let mut pending = self.pending.lock().unwrap();
            let Some(deadline) = pending.next_deadline() else {
                return false;
            };
            if deadline > stats.total_ticks {
                if !advance_clock {
                    return false;
                }
                stats.idle_ticks += deadline - stats.total_ticks;
                stats.total_ticks = deadline;
            }
            let entry = pending
                .pop_due(stats.total_ticks)
                .expect("head deadline was due");

            // An idle machine whose only remaining interrupt is the
            // time-slice timer has nothing left to do: firing it would just
            // re-arm it forever. Leave it queued and report nothing due.
            if mode == MachineMode::Idle
                && self.timer_present.load(Ordering::Relaxed)
                && pending.is_empty()
            {
                pending.reinsert(entry);
                return false;
            }
            entry
        };

        let prior_mode = {
            let mut st = self.state.lock().unwrap();
            let prior = st.mode;
            st.in_handler = true;
            st.mode = MachineMode::System;
            prior
        };
        trace!(kind = %entry.kind, when = entry.when, "invoking interrupt handler");
        (entry.handler)();
        {
            let mut st = self.state.lock().unwrap();
            st.mode = prior_mode;
            st.in_handler = false;
        }
        true
    }

    /// Entered when the ready queue is empty and the current thread cannot
    /// continue. Advances simulated time to the next pending interrupt; if
    /// there is none, the simulation is over.
    pub fn idle(&self) {
        debug!("machine idling; checking for interrupts");
        self.set_mode(MachineMode::Idle);
        if self.check_if_due(true) {
            while self.check_if_due(false) {}
            let mut st = self.state.lock().unwrap();
            // Nothing is runnable, so a requested time slice is automatic.
            st.yield_on_return = false;
            st.mode = MachineMode::System;
            return;
        }

        debug!("machine idle; no interrupts to do");
        println!("No threads ready or runnable, and no pending interrupts.");
        println!("Assuming the program completed.");
        self.halt();
    }

    /// Shuts the machine down cleanly, printing the run statistics. Never
    /// returns.
    pub fn halt(&self) -> ! {
        println!("Machine halting.\n");
        println!("{}", self.stats());
        match &self.halt_mode {
            HaltMode::ExitProcess => std::process::exit(0),
            HaltMode::Signal(signal) => {
                signal.raise();
                loop {
                    std::thread::park();
                }
            }
        }
    }

    /// Diagnostic listing of every interrupt still scheduled to occur.
    pub fn pending_dump(&self) -> String {
        format!(
            "Time: {}, interrupts {:?}\n{}",
            self.now(),
            self.mask(),
            self.pending.lock().unwrap().dump()
        )
    }
}
