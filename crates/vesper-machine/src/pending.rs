use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::fmt;

use crate::stats::Tick;

/// Hardware device class that produced a scheduled interrupt.
///
/// Carried for diagnostics; dispatch order depends only on the timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InterruptKind {
    Timer,
    Disk,
    ConsoleWrite,
    ConsoleRead,
    NetworkSend,
    NetworkRecv,
}

impl fmt::Display for InterruptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Timer => "timer",
            Self::Disk => "disk",
            Self::ConsoleWrite => "console write",
            Self::ConsoleRead => "console read",
            Self::NetworkSend => "network send",
            Self::NetworkRecv => "network recv",
        };
        f.write_str(name)
    }
}

/// A stable identifier for a scheduled interrupt.
///
/// The only capability a handle grants is cancellation. Handles are never
/// reused within one machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InterruptHandle(u64);

impl InterruptHandle {
    fn next(next_id: &mut u64) -> Self {
        let id = *next_id;
        *next_id = next_id.wrapping_add(1);
        InterruptHandle(id)
    }
}

pub(crate) type Handler = Box<dyn FnOnce() + Send>;

/// A future handler invocation, owned by the pending queue once scheduled.
pub(crate) struct PendingInterrupt {
    pub id: InterruptHandle,
    pub when: Tick,
    pub kind: InterruptKind,
    pub handler: Handler,
}

impl PartialEq for PendingInterrupt {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.id == other.id
    }
}

impl Eq for PendingInterrupt {}

impl Ord for PendingInterrupt {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the BinaryHeap pops the earliest timestamp, with the
        // insertion id breaking ties FIFO.
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.id.0.cmp(&self.id.0))
    }
}

impl PartialOrd for PendingInterrupt {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of interrupts scheduled to occur in the future.
///
/// Ordered by timestamp ascending, FIFO among equal timestamps. Cancellation
/// is by flag: a cancelled entry stays queued and is silently pruned when it
/// reaches the head, consuming zero virtual time.
pub(crate) struct PendingQueue {
    next_id: u64,
    heap: BinaryHeap<PendingInterrupt>,
    cancelled: HashSet<InterruptHandle>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            heap: BinaryHeap::new(),
            cancelled: HashSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn schedule(&mut self, when: Tick, kind: InterruptKind, handler: Handler) -> InterruptHandle {
        let id = InterruptHandle::next(&mut self.next_id);
        self.heap.push(PendingInterrupt {
            id,
            when,
            kind,
            handler,
        });
        id
    }

    pub fn cancel(&mut self, handle: InterruptHandle) {
        self.cancelled.insert(handle);
    }

    /// Drops cancelled entries sitting at the head of the queue.
    pub fn prune_cancelled(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.cancelled.remove(&top.id) {
                self.heap.pop();
                continue;
            }
            break;
        }
    }

    /// Timestamp of the earliest live entry.
    pub fn next_deadline(&mut self) -> Option<Tick> {
        self.prune_cancelled();
        self.heap.peek().map(|e| e.when)
    }

    /// Removes and returns the earliest live entry if it is due at `now`.
    pub fn pop_due(&mut self, now: Tick) -> Option<PendingInterrupt> {
        self.prune_cancelled();
        if self.heap.peek()?.when > now {
            return None;
        }
        self.heap.pop()
    }

    /// Puts a popped entry back without disturbing its position: the original
    /// `(when, id)` key is preserved, so FIFO ordering among ties survives.
    pub fn reinsert(&mut self, entry: PendingInterrupt) {
        self.heap.push(entry);
    }

    /// Diagnostic listing of everything still queued, in no particular order.
    pub fn dump(&self) -> String {
        let mut lines: Vec<String> = self
            .heap
            .iter()
            .map(|e| {
                let state = if self.cancelled.contains(&e.id) {
                    ", cancelled"
                } else {
                    ""
                };
                format!("{} interrupt at {}{}", e.kind, e.when, state)
            })
            .collect();
        lines.sort();
        lines.join("\n")
    }
}
