//! Deterministic workload driver for exercising the scheduler.
//!
//! A workload is a set of threads, each arriving at a virtual time and
//! spinning for a burst of ticks. Arrivals at time zero are forked
//! immediately; later ones are forked from a timer-kind interrupt armed for
//! their start time, so they appear exactly when the clock says they should.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::debug;
use vesper_machine::{InterruptKind, Tick};

use crate::kernel::Kernel;
use crate::sync::Semaphore;
use crate::thread::{KThread, Priority, ThreadStatus};

/// One thread of a workload: fork at `start`, spin for `burst` ticks.
#[derive(Clone, Copy, Debug)]
pub struct Arrival {
    pub start: Tick,
    pub burst: Tick,
    pub priority: Priority,
}

impl Arrival {
    pub fn new(start: Tick, burst: Tick) -> Self {
        Self {
            start,
            burst,
            priority: Priority::Norm,
        }
    }

    pub fn with_priority(start: Tick, burst: Tick, priority: Priority) -> Self {
        Self {
            start,
            burst,
            priority,
        }
    }
}

/// What a workload run observed.
pub struct WorkloadReport {
    /// Thread names in the order they completed their bursts.
    pub completion_order: Vec<String>,
    /// One entry per executed work tick, naming the thread that ran it.
    /// Contiguous runs of one name are uninterrupted stretches on the CPU.
    pub tick_trace: Vec<String>,
}

/// Spins the calling thread for `burst` units of work, billing one clock tick
/// per unit and keeping its remaining-burst estimate current.
pub fn simulate_work(kernel: &Kernel, burst: Tick) {
    let current = KThread::current();
    current.set_time_left(burst);
    let mut remaining = burst;
    while remaining > 0 {
        debug_assert_eq!(current.status(), ThreadStatus::Running);
        kernel.machine().one_tick();
        remaining -= 1;
        current.set_time_left(remaining);
    }
}

/// Runs a workload to completion on the calling (bootstrap) thread and
/// reports the completion order and per-tick execution trace.
///
/// `arrivals` must be sorted by `start`. Threads are named `thread-a`,
/// `thread-b`, ... in arrival order.
pub fn run_arrivals(kernel: &Arc<Kernel>, arrivals: &[Arrival]) -> WorkloadReport {
    assert!(arrivals.len() <= 26, "workloads are limited to 26 arrivals");
    assert!(
        arrivals.windows(2).all(|pair| pair[0].start <= pair[1].start),
        "arrivals must be sorted by start time"
    );

    let done = Semaphore::new("workload-done", kernel, 0);
    let order = Arc::new(Mutex::new(Vec::new()));
    let trace = Arc::new(Mutex::new(Vec::new()));
    let pending: Arc<Mutex<VecDeque<(String, Arrival)>>> = Arc::new(Mutex::new(
        arrivals
            .iter()
            .enumerate()
            .map(|(index, arrival)| {
                let name = format!("thread-{}", (b'a' + index as u8) as char);
                (name, *arrival)
            })
            .collect(),
    ));

    pump(kernel, &pending, &done, &order, &trace);
    for _ in arrivals {
        done.p();
    }

    let completion_order = order.lock().unwrap().clone();
    let tick_trace = trace.lock().unwrap().clone();
    WorkloadReport {
        completion_order,
        tick_trace,
    }
}

enum PumpStep {
    Fork(String, Arrival),
    Rearm(Tick),
    Done,
}

/// Forks every arrival that is due and re-arms itself for the next one.
/// Called both from the bootstrap thread and from its own timer interrupt,
/// so it must never hold the pending lock across a fork: a fork can suspend
/// the caller.
fn pump(
    kernel: &Arc<Kernel>,
    pending: &Arc<Mutex<VecDeque<(String, Arrival)>>>,
    done: &Arc<Semaphore>,
    order: &Arc<Mutex<Vec<String>>>,
    trace: &Arc<Mutex<Vec<String>>>,
) {
    loop {
        let step = {
            let mut queue = pending.lock().unwrap();
            let now = kernel.machine().now();
            match queue.front() {
                None => PumpStep::Done,
                Some(&(_, arrival)) if arrival.start <= now => {
                    let (name, arrival) = queue.pop_front().unwrap();
                    PumpStep::Fork(name, arrival)
                }
                Some(&(_, arrival)) => PumpStep::Rearm(arrival.start - now),
            }
        };

        match step {
            PumpStep::Done => break,
            PumpStep::Fork(name, arrival) => {
                debug!(
                    thread = %name,
                    start = arrival.start,
                    burst = arrival.burst,
                    now = kernel.machine().now(),
                    "queuing workload thread"
                );
                let thread = kernel.new_thread(&name, Some(arrival.priority), arrival.burst);
                let body_kernel = Arc::clone(kernel);
                let body_done = Arc::clone(done);
                let body_order = Arc::clone(order);
                let body_trace = Arc::clone(trace);
                thread.fork(move || {
                    let current = KThread::current();
                    let mut remaining = arrival.burst;
                    while remaining > 0 {
                        debug_assert_eq!(current.status(), ThreadStatus::Running);
                        body_trace.lock().unwrap().push(current.name().to_owned());
                        body_kernel.machine().one_tick();
                        remaining -= 1;
                        current.set_time_left(remaining);
                    }
                    body_order.lock().unwrap().push(current.name().to_owned());
                    body_done.v();
                });
            }
            PumpStep::Rearm(delay) => {
                let kernel_weak = Arc::downgrade(kernel);
                let pending = Arc::clone(pending);
                let done = Arc::clone(done);
                let order = Arc::clone(order);
                let trace = Arc::clone(trace);
                kernel.machine().schedule(delay, InterruptKind::Timer, move || {
                    if let Some(kernel) = kernel_weak.upgrade() {
                        pump(&kernel, &pending, &done, &order, &trace);
                    }
                });
                break;
            }
        }
    }
}
