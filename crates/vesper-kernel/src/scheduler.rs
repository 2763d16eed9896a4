//! Ready-queue disciplines for the dispatch policies.
//!
//! The queue itself is a plain FIFO; each policy is a different way of
//! removing from it. Selection scans are stable, so threads with equal keys
//! leave in arrival order.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::Policy;
use crate::thread::KThread;

pub(crate) struct ReadyQueue {
    threads: VecDeque<Arc<KThread>>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            threads: VecDeque::new(),
        }
    }

    pub fn push(&mut self, thread: Arc<KThread>) {
        self.threads.push_back(thread);
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Removes the thread the policy would dispatch next.
    pub fn take_next(&mut self, policy: Policy) -> Option<Arc<KThread>> {
        if self.threads.is_empty() {
            return None;
        }
        let index = match policy {
            Policy::Fcfs | Policy::RoundRobin => 0,
            Policy::PrioNonPreemptive | Policy::PrioPreemptive => {
                self.index_of_min(|thread| thread.priority() as u64)
            }
            Policy::SjfNonPreemptive | Policy::SjfPreemptive => {
                self.index_of_min(|thread| thread.time_left())
            }
        };
        self.threads.remove(index)
    }

    /// First index with the minimal key; ties keep the earlier arrival.
    fn index_of_min(&self, key: impl Fn(&KThread) -> u64) -> usize {
        let mut best = 0;
        for (index, thread) in self.threads.iter().enumerate().skip(1) {
            if key(thread) < key(&self.threads[best]) {
                best = index;
            }
        }
        best
    }
}

/// Should `candidate`, which just became ready, take the CPU from `current`?
///
/// Only the preemptive priority and burst policies ever say yes, and never on
/// a tie: the running thread wins equality. Round-Robin preempts by timer
/// interrupt, not on arrival.
pub(crate) fn should_preempt(policy: Policy, current: &KThread, candidate: &KThread) -> bool {
    match policy {
        Policy::PrioPreemptive => candidate.priority() < current.priority(),
        Policy::SjfPreemptive => candidate.time_left() < current.time_left(),
        _ => false,
    }
}
