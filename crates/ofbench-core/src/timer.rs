//! Timer events scheduled by test modules.
//!
//! The queue only answers two questions for the event loop: how long until
//! the next event is due, and which event runs next. Events with the same due
//! instant run in the order they were scheduled.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// A scheduled timer event. `kind` and `arg` are opaque to the harness and
/// handed back to the module's timer handler unchanged.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerEvent {
    // Field order matters: events sort by due instant, then by id.
    pub due: Instant,
    pub id: TimerId,
    pub kind: u32,
    pub arg: u64,
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<TimerEvent>>,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, due: Instant, kind: u32, arg: u64) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(Reverse(TimerEvent { due, id, kind, arg }));
        id
    }

    pub fn schedule_in(&mut self, delay: Duration, kind: u32, arg: u64) -> TimerId {
        self.schedule(Instant::now() + delay, kind, arg)
    }

    /// Due instant of the earliest event.
    pub fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(event)| event.due)
    }

    /// Time until the earliest event is due, `Duration::ZERO` if it already
    /// is, and `None` when nothing is scheduled.
    pub fn time_until_next(&self, now: Instant) -> Option<Duration> {
        self.next_due().map(|due| due.saturating_duration_since(now))
    }

    /// Remove the earliest event regardless of its due time.
    pub fn pop_next(&mut self) -> Option<TimerEvent> {
        self.heap.pop().map(|Reverse(event)| event)
    }

    /// Remove the earliest event if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerEvent> {
        match self.next_due() {
            Some(due) if due <= now => self.pop_next(),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}
