use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use vesper_kernel::{
    simulate_work, Kernel, KernelConfig, KThread, Priority, Semaphore, ThreadStatus, UserContext,
};
use vesper_machine::{HaltMode, HaltSignal};

fn kernel_with_signal() -> (Arc<Kernel>, Arc<HaltSignal>) {
    let signal = HaltSignal::new();
    let kernel = Kernel::new(KernelConfig {
        halt: HaltMode::Signal(Arc::clone(&signal)),
        ..KernelConfig::default()
    });
    (kernel, signal)
}

fn kernel() -> Arc<Kernel> {
    kernel_with_signal().0
}

#[test]
fn forked_threads_run_their_bodies_and_finish() {
    let kernel = kernel();
    kernel.adopt_main();

    let done = Semaphore::new("done", &kernel, 0);
    let log = Arc::new(Mutex::new(Vec::new()));
    for name in ["one", "two"] {
        let thread = kernel.new_thread(name, None, 0);
        let log = Arc::clone(&log);
        let done = Arc::clone(&done);
        thread.fork(move || {
            log.lock().unwrap().push(KThread::current().name().to_owned());
            done.v();
        });
    }
    done.p();
    done.p();

    assert_eq!(*log.lock().unwrap(), ["one", "two"]);
    assert_eq!(KThread::current().status(), ThreadStatus::Running);
}

#[test]
fn simulated_work_bills_the_clock_and_drains_the_burst_estimate() {
    let kernel = kernel();
    kernel.adopt_main();

    let done = Semaphore::new("done", &kernel, 0);
    let worker = kernel.new_thread("worker", None, 8);
    let work_kernel = Arc::clone(&kernel);
    let work_done = Arc::clone(&done);
    worker.fork(move || {
        simulate_work(&work_kernel, 8);
        assert_eq!(KThread::current().time_left(), 0);
        work_done.v();
    });

    let before = kernel.machine().now();
    done.p();
    let system_tick = kernel.machine().params().system_tick;
    assert!(kernel.machine().now() >= before + 8 * system_tick);
}

#[test]
fn yield_with_an_empty_ready_queue_returns_immediately() {
    let kernel = kernel();
    let main = kernel.adopt_main();

    kernel.yield_now();
    assert_eq!(main.status(), ThreadStatus::Running);
}

#[test]
fn forked_threads_inherit_the_forker_priority_by_default() {
    let kernel = kernel();
    kernel.adopt_main();

    let done = Semaphore::new("done", &kernel, 0);
    let observed = Arc::new(Mutex::new(None));

    let parent = kernel.new_thread("parent", Some(Priority::Max), 0);
    let inner_kernel = Arc::clone(&kernel);
    let inner_done = Arc::clone(&done);
    let inner_observed = Arc::clone(&observed);
    parent.fork(move || {
        let child = inner_kernel.new_thread("child", None, 0);
        *inner_observed.lock().unwrap() = Some(child.priority());
        inner_done.v();
    });
    done.p();

    assert_eq!(*observed.lock().unwrap(), Some(Priority::Max));
}

#[test]
#[should_panic(expected = "already been forked")]
fn forking_twice_is_a_kernel_bug() {
    let kernel = kernel();
    kernel.adopt_main();

    let thread = kernel.new_thread("twice", None, 0);
    thread.fork(|| {});
    thread.fork(|| {});
}

#[test]
fn semaphore_with_initial_value_does_not_block() {
    let (kernel, signal) = kernel_with_signal();
    kernel.adopt_main();

    let sem = Semaphore::new("prearmed", &kernel, 2);
    sem.p();
    sem.p();
    // Had either P slept with nothing runnable, the machine would have idled
    // into a halt.
    assert!(!signal.is_halted());
}

#[test]
fn everything_blocked_with_no_interrupts_ends_the_run() {
    let (kernel, signal) = kernel_with_signal();
    std::thread::spawn(move || {
        kernel.adopt_main();
        let never = Semaphore::new("never-signalled", &kernel, 0);
        never.p();
    });
    assert!(signal.wait_timeout(Duration::from_secs(10)));
}

struct RecordingContext {
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl UserContext for RecordingContext {
    fn save(&mut self) {
        self.log.lock().unwrap().push("save");
    }

    fn restore(&mut self) {
        self.log.lock().unwrap().push("restore");
    }
}

#[test]
fn user_state_is_saved_and_restored_across_a_switch() {
    let kernel = Kernel::new(KernelConfig {
        user_programs: true,
        halt: HaltMode::Signal(HaltSignal::new()),
        ..KernelConfig::default()
    });
    let main = kernel.adopt_main();

    let log = Arc::new(Mutex::new(Vec::new()));
    main.set_user_context(Box::new(RecordingContext {
        log: Arc::clone(&log),
    }));

    let child = kernel.new_thread("child", None, 0);
    child.fork(|| {});
    kernel.yield_now();

    // Switched out to the child (save), switched back in when it finished
    // (restore).
    assert_eq!(*log.lock().unwrap(), ["save", "restore"]);
}
