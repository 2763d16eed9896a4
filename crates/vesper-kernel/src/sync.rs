use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::trace;
use vesper_machine::InterruptMask;

use crate::kernel::Kernel;
use crate::thread::KThread;

struct SemInner {
    value: u64,
    waiters: VecDeque<Arc<KThread>>,
}

/// Counting semaphore built directly on thread sleep and wake.
///
/// Atomicity comes from interrupt masking, not from host locks: both
/// operations disable interrupts for their critical section, which on this
/// uniprocessor is sufficient mutual exclusion. `v` never enables interrupts
/// itself, so it is safe to call from an interrupt handler; the device
/// round-trip pattern is a request whose completion handler `v`s a semaphore
/// the requesting thread is `p`ing.
pub struct Semaphore {
    name: String,
    kernel: Arc<Kernel>,
    inner: Mutex<SemInner>,
}

impl Semaphore {
    pub fn new(name: impl Into<String>, kernel: &Arc<Kernel>, initial: u64) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            kernel: Arc::clone(kernel),
            inner: Mutex::new(SemInner {
                value: initial,
                waiters: VecDeque::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the count to become positive, then decrements it.
    pub fn p(&self) {
        let machine = self.kernel.machine();
        let old = machine.set_mask(InterruptMask::Off);
        loop {
            let mut inner = self.inner.lock().unwrap();
            if inner.value > 0 {
                inner.value -= 1;
                break;
            }
            trace!(semaphore = %self.name, "blocking on P");
            inner.waiters.push_back(KThread::current());
            drop(inner);
            self.kernel.sleep_current();
        }
        machine.set_mask(old);
    }

    /// Increments the count, waking one waiter if any.
    pub fn v(&self) {
        let machine = self.kernel.machine();
        let old = machine.set_mask(InterruptMask::Off);
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(waiter) = inner.waiters.pop_front() {
                trace!(semaphore = %self.name, waiter = %waiter.name(), "waking on V");
                self.kernel.ready_to_run(waiter);
            }
            inner.value += 1;
        }
        machine.set_mask(old);
    }
}
