use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;

use tracing::{debug, error};
use vesper_machine::{InterruptMask, Tick};

use crate::kernel::Kernel;

/// Where a thread is in its lifecycle.
///
/// `JustCreated → Ready → Running ↔ {Ready, Blocked}`; a finished thread is
/// reaped and never observed again. At most one thread is `Running` at any
/// instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadStatus {
    JustCreated,
    Running,
    Ready,
    Blocked,
}

/// Scheduling priority. Smaller is more urgent: `Max` beats `Norm` beats
/// `Min`, and the derived ordering encodes exactly that.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Max,
    Norm,
    Min,
}

/// Per-thread user CPU state (registers plus address space), owned by the
/// user-program layer. When user programs are enabled the kernel calls `save`
/// on the outgoing thread and `restore` on the way back in.
pub trait UserContext: Send {
    fn save(&mut self);
    fn restore(&mut self);
}

// Sentinel unwind payload a finishing thread uses to leave its host thread.
struct ThreadExit;

thread_local! {
    static CURRENT: RefCell<Option<Arc<KThread>>> = const { RefCell::new(None) };
}

pub(crate) fn bind_current(thread: Arc<KThread>) {
    CURRENT.with(|current| {
        let mut slot = current.borrow_mut();
        assert!(
            slot.is_none(),
            "host thread already runs a kernel thread"
        );
        *slot = Some(thread);
    });
}

struct ThreadInner {
    status: ThreadStatus,
    body: Option<Box<dyn FnOnce() + Send>>,
    host: Option<JoinHandle<()>>,
    /// Set by `finish`: the switch out of a zombie does not wait for a
    /// re-dispatch, it lets the host thread unwind.
    zombie: bool,
    user: Option<Box<dyn UserContext>>,
}

/// A cooperative kernel thread.
///
/// Each kernel thread is carried by one host OS thread, but the kernel is
/// logically single-threaded: a context switch hands the virtual CPU to the
/// next thread and parks the current one until it is dispatched again, so at
/// most one thread's code makes progress at any instant.
pub struct KThread {
    name: String,
    priority: Priority,
    /// Estimated remaining burst, maintained by the workload; the SJF
    /// policies dispatch on it.
    time_left: AtomicU64,
    is_main: bool,
    kernel: Weak<Kernel>,
    inner: Mutex<ThreadInner>,
    resumed: Condvar,
}

impl KThread {
    pub(crate) fn new(
        kernel: Weak<Kernel>,
        name: String,
        priority: Priority,
        burst: Tick,
        is_main: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            priority,
            time_left: AtomicU64::new(burst),
            is_main,
            kernel,
            inner: Mutex::new(ThreadInner {
                status: if is_main {
                    ThreadStatus::Running
                } else {
                    ThreadStatus::JustCreated
                },
                body: None,
                host: None,
                zombie: false,
                user: None,
            }),
            resumed: Condvar::new(),
        })
    }

    /// The kernel thread the calling host thread is carrying.
    ///
    /// # Panics
    ///
    /// Panics on a host thread that does not carry one.
    pub fn current() -> Arc<KThread> {
        Self::try_current().expect("no kernel thread is bound to this host thread")
    }

    pub fn try_current() -> Option<Arc<KThread>> {
        CURRENT.with(|current| current.borrow().clone())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn time_left(&self) -> Tick {
        self.time_left.load(Ordering::Relaxed)
    }

    pub fn set_time_left(&self, ticks: Tick) {
        self.time_left.store(ticks, Ordering::Relaxed);
    }

    pub fn status(&self) -> ThreadStatus {
        self.inner.lock().unwrap().status
    }

    /// Bookkeeping only; dispatching a thread goes through the scheduler.
    pub fn set_status(&self, status: ThreadStatus) {
        self.inner.lock().unwrap().status = status;
    }

    pub fn set_user_context(&self, context: Box<dyn UserContext>) {
        self.inner.lock().unwrap().user = Some(context);
    }

    /// Starts the thread executing `body` concurrently with the caller.
    /// Depending on the policy, the new thread may preempt the caller
    /// immediately.
    ///
    /// # Panics
    ///
    /// Panics if the thread has already been forked.
    pub fn fork(self: &Arc<Self>, body: impl FnOnce() + Send + 'static) {
        let kernel = self.kernel.upgrade().expect("kernel has been dropped");
        debug!(thread = %self.name, "forking");
        {
            let mut inner = self.inner.lock().unwrap();
            assert_eq!(
                inner.status,
                ThreadStatus::JustCreated,
                "attempt to fork a thread that has already been forked"
            );
            inner.body = Some(Box::new(body));
            let me = Arc::clone(self);
            let host_kernel = Arc::clone(&kernel);
            inner.host = Some(
                std::thread::Builder::new()
                    .name(self.name.clone())
                    .spawn(move || host_main(host_kernel, me))
                    .expect("failed to spawn host thread"),
            );
        }

        let machine = kernel.machine();
        let old = machine.set_mask(InterruptMask::Off);
        let current = KThread::current();
        if kernel.should_switch(&current, self) {
            if machine.in_handler() {
                // The switch has to wait for the handler to unwind.
                kernel.ready_to_run(Arc::clone(self));
                machine.yield_on_return();
            } else {
                kernel.ready_to_run(Arc::clone(&current));
                kernel.switch_to(Arc::clone(self));
            }
        } else {
            kernel.ready_to_run(Arc::clone(self));
        }
        machine.set_mask(old);
    }

    /// Hands the virtual CPU to this thread.
    pub(crate) fn dispatch(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.status = ThreadStatus::Running;
        self.resumed.notify_one();
    }

    /// Parks the calling host thread until this thread is dispatched again.
    pub(crate) fn wait_until_running(&self) {
        let mut inner = self.inner.lock().unwrap();
        while inner.status != ThreadStatus::Running {
            inner = self.resumed.wait(inner).unwrap();
        }
    }

    pub(crate) fn mark_zombie(&self) {
        self.inner.lock().unwrap().zombie = true;
    }

    pub(crate) fn is_zombie(&self) -> bool {
        self.inner.lock().unwrap().zombie
    }

    pub(crate) fn is_main(&self) -> bool {
        self.is_main
    }

    pub(crate) fn take_host_handle(&self) -> Option<JoinHandle<()>> {
        self.inner.lock().unwrap().host.take()
    }

    pub(crate) fn save_user_state(&self) {
        if let Some(user) = self.inner.lock().unwrap().user.as_mut() {
            user.save();
        }
    }

    pub(crate) fn restore_user_state(&self) {
        if let Some(user) = self.inner.lock().unwrap().user.as_mut() {
            user.restore();
        }
    }
}

/// Root routine of every forked thread's host: wait to be dispatched the
/// first time, enable interrupts, run the body, and finish.
fn host_main(kernel: Arc<Kernel>, me: Arc<KThread>) {
    bind_current(Arc::clone(&me));
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        me.wait_until_running();
        kernel.reap_finished();
        kernel.machine().enable();
        let body = me
            .inner
            .lock()
            .unwrap()
            .body
            .take()
            .expect("forked thread has no body");
        body();
        kernel.finish_current();
    }));
    match result {
        // Clean exit, or an explicit finish() unwinding off the body.
        Ok(()) => {}
        Err(payload) if payload.is::<ThreadExit>() => {}
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_owned());
            error!(
                thread = %me.name(),
                %message,
                "kernel thread panicked; aborting the simulation"
            );
            std::process::abort();
        }
    }
}

// resume_unwind skips the panic hook: this is a controlled exit, not a bug.
pub(crate) fn exit_host_thread() -> ! {
    panic::resume_unwind(Box::new(ThreadExit))
}
