//! Deadline queue for a single port's dispatcher loop.
//!
//! Models spec.md §9's "timers become `(deadline, callback_id)` entries in
//! a binary heap": every timer a `Port`/`Link` cares about (maintenance,
//! beacon, send-delay, per-neighbor watchdog/ring-retry/finish-delay) is a
//! `(Instant, TimerKind)` pair. The dispatcher asks for the earliest
//! deadline, sleeps until it, then pops every timer that has come due.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Maintenance,
    Beacon,
    SendDelay,
    ClosePortDelay,
    /// Per-neighbor timers, keyed by physical address.
    Watchdog(u16),
    RingRetry(u16),
    ReadyToFinished(u16),
    PauseFinished(u16),
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    deadline: Instant,
    kind: TimerKind,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

/// A min-heap of pending timers. Re-arming a `TimerKind` that's already
/// queued leaves both entries in the heap; `pop_due` only fires a kind
/// once it is still the *current* deadline for that kind, determined by
/// the caller holding the single source of truth for each kind's deadline
/// (the heap is a wakeup scheduler, not the deadline's owner).
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<DeadlineEntry>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeadlineEntry(Entry);

impl PartialOrd for DeadlineEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DeadlineEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl TimerQueue {
    pub fn new() -> Self {
        TimerQueue { heap: BinaryHeap::new() }
    }

    pub fn arm(&mut self, kind: TimerKind, deadline: Instant) {
        self.heap.push(Reverse(DeadlineEntry(Entry { deadline, kind })));
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(e)| e.0.deadline)
    }

    /// Pop every entry whose deadline is `<= now`.
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.0.deadline > now {
                break;
            }
            let Reverse(entry) = self.heap.pop().unwrap();
            due.push(entry.0.kind);
        }
        due
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
