use std::sync::{Arc, Mutex};

use tracing::{debug, trace};
use vesper_machine::{
    InterruptKind, InterruptMask, Machine, MachineConfig, Statistics, Tick,
};

use crate::config::{KernelConfig, Policy};
use crate::scheduler::{should_preempt, ReadyQueue};
use crate::thread::{bind_current, exit_host_thread, KThread, Priority, ThreadStatus};

struct SchedState {
    ready: ReadyQueue,
    /// A finished thread whose host still needs to be joined; reaped by the
    /// next thread to complete a context switch.
    to_reap: Option<Arc<KThread>>,
}

/// One simulated kernel: the machine it runs on plus the thread scheduler.
///
/// Everything is owned here; tests build an isolated kernel per case. All
/// scheduler entry points assume the simulation's mutual-exclusion rule:
/// shared state is only touched with interrupts masked.
pub struct Kernel {
    machine: Arc<Machine>,
    policy: Policy,
    user_programs: bool,
    random_seed: u64,
    sched: Mutex<SchedState>,
}

impl Kernel {
    /// Builds the machine and wires the scheduler into it.
    pub fn new(config: KernelConfig) -> Arc<Self> {
        let machine = Machine::new(MachineConfig {
            ticks: config.ticks,
            halt: config.halt,
        });
        let kernel = Arc::new(Self {
            machine,
            policy: config.policy,
            user_programs: config.user_programs,
            random_seed: config.random_seed,
            sched: Mutex::new(SchedState {
                ready: ReadyQueue::new(),
                to_reap: None,
            }),
        });

        // Interrupt handlers request context switches through the machine;
        // the machine hands them back to us here once the handler unwinds.
        let weak = Arc::downgrade(&kernel);
        kernel.machine.set_preempt_hook(move || {
            if let Some(kernel) = weak.upgrade() {
                kernel.yield_now();
            }
        });
        kernel
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn user_programs(&self) -> bool {
        self.user_programs
    }

    /// Seed for the random-interval timer mode.
    pub fn random_seed(&self) -> u64 {
        self.random_seed
    }

    pub fn stats(&self) -> Statistics {
        self.machine.stats()
    }

    /// Turns the calling host thread into the running `main` kernel thread
    /// and enables interrupts. Must be called once, before any forking.
    pub fn adopt_main(self: &Arc<Self>) -> Arc<KThread> {
        let main = KThread::new(
            Arc::downgrade(self),
            "main".to_owned(),
            Priority::Norm,
            0,
            true,
        );
        bind_current(Arc::clone(&main));
        self.machine.enable();
        main
    }

    /// Allocates a thread in the `JustCreated` state. `priority` defaults to
    /// the forking thread's own (or `Norm` on the bootstrap path); `burst` is
    /// the estimated run time the SJF policies dispatch on.
    pub fn new_thread(
        self: &Arc<Self>,
        name: impl Into<String>,
        priority: Option<Priority>,
        burst: Tick,
    ) -> Arc<KThread> {
        let priority = priority
            .or_else(|| KThread::try_current().map(|t| t.priority()))
            .unwrap_or(Priority::Norm);
        KThread::new(Arc::downgrade(self), name.into(), priority, burst, false)
    }

    /// Puts `thread` on the ready queue. Interrupts must be masked; handlers
    /// use this to wake threads blocked on their device.
    pub fn ready_to_run(&self, thread: Arc<KThread>) {
        debug_assert_eq!(
            self.machine.mask(),
            InterruptMask::Off,
            "ready queue mutation requires interrupts off"
        );
        trace!(thread = %thread.name(), "ready to run");
        thread.set_status(ThreadStatus::Ready);
        self.sched.lock().unwrap().ready.push(thread);
    }

    pub(crate) fn find_next_to_run(&self) -> Option<Arc<KThread>> {
        self.sched.lock().unwrap().ready.take_next(self.policy)
    }

    pub(crate) fn should_switch(&self, current: &KThread, candidate: &KThread) -> bool {
        should_preempt(self.policy, current, candidate)
    }

    /// Context switch: hand the CPU to `next` and park until dispatched
    /// again. The caller has already moved the outgoing thread to `Ready` or
    /// `Blocked`, and interrupts are masked.
    pub(crate) fn switch_to(&self, next: Arc<KThread>) {
        let old = KThread::current();
        debug_assert_eq!(
            self.machine.mask(),
            InterruptMask::Off,
            "context switch requires interrupts off"
        );

        if self.user_programs {
            old.save_user_state();
        }

        // Round-Robin preemption is timer-driven: arm one quantum for the
        // incoming thread. A stale quantum from an earlier dispatch may still
        // fire, costing at most an extra yield.
        if self.policy == Policy::RoundRobin {
            let machine = Arc::downgrade(&self.machine);
            self.machine.schedule(
                self.machine.params().timer_ticks,
                InterruptKind::Timer,
                move || {
                    if let Some(machine) = machine.upgrade() {
                        machine.yield_on_return();
                    }
                },
            );
        }

        debug!(from = %old.name(), to = %next.name(), "context switch");
        next.dispatch();
        if old.is_zombie() {
            // The finishing thread's host unwinds instead of waiting for a
            // dispatch that will never come.
            return;
        }
        old.wait_until_running();

        debug!(thread = %old.name(), "back on the cpu");
        self.reap_finished();
        if self.user_programs {
            old.restore_user_state();
        }
    }

    /// Joins the host thread of a kernel thread that finished while we were
    /// switched out.
    pub(crate) fn reap_finished(&self) {
        let dead = self.sched.lock().unwrap().to_reap.take();
        if let Some(dead) = dead {
            debug!(thread = %dead.name(), "reaping finished thread");
            if let Some(host) = dead.take_host_handle() {
                let _ = host.join();
            }
        }
    }

    /// Relinquishes the CPU to the next ready thread, if there is one, and
    /// requeues the caller.
    pub fn yield_now(&self) {
        let old = self.machine.set_mask(InterruptMask::Off);
        let current = KThread::current();
        trace!(thread = %current.name(), "yielding");
        if let Some(next) = self.find_next_to_run() {
            self.ready_to_run(Arc::clone(&current));
            self.switch_to(next);
        }
        self.machine.set_mask(old);
    }

    /// Blocks the calling thread until something puts it back on the ready
    /// queue. Interrupts must already be masked: the decision to sleep and
    /// the switch away have to be atomic.
    ///
    /// With no ready thread, the machine idles forward to its next interrupt,
    /// which is the only thing that can produce one.
    pub fn sleep_current(&self) {
        let current = KThread::current();
        assert_eq!(
            self.machine.mask(),
            InterruptMask::Off,
            "sleep requires interrupts off"
        );
        debug!(thread = %current.name(), "sleeping");
        current.set_status(ThreadStatus::Blocked);
        let next = loop {
            if let Some(next) = self.find_next_to_run() {
                break next;
            }
            self.machine.idle();
        };
        self.switch_to(next);
    }

    /// Ends the calling thread. Its host is joined by the next thread to
    /// complete a context switch. Never returns.
    ///
    /// # Panics
    ///
    /// Panics when called on the bootstrap thread; that one leaves the
    /// simulation by halting the machine or simply returning.
    pub fn finish(&self) -> ! {
        self.finish_current();
        exit_host_thread()
    }

    /// The work of [`finish`](Self::finish). Returns only in the dead
    /// thread's host, which has nothing left to do but unwind off its root.
    pub(crate) fn finish_current(&self) {
        self.machine.set_mask(InterruptMask::Off);
        let current = KThread::current();
        assert!(
            !current.is_main(),
            "the bootstrap thread cannot finish(); halt the machine instead"
        );
        debug!(thread = %current.name(), "finishing");
        current.mark_zombie();
        self.sched.lock().unwrap().to_reap = Some(Arc::clone(&current));
        self.sleep_current();
    }
}
