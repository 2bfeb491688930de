//! The event queue between a backend pump and the dispatcher.
//!
//! A bounded multi-producer single-consumer FIFO. Producers never block:
//! when a bounded queue is full the oldest event is discarded and the
//! consumer receives a single overflow marker before the next delivery, so
//! event loss is always visible to handlers. Closing the queue wakes the
//! consumer with a shutdown sentinel without draining pending slots.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::observer::WatchId;
use crate::{Error, Event};

/// A unit of work carried from a backend to the dispatcher.
#[derive(Debug)]
pub(crate) enum Slot {
    /// A normalized event, attributed to the watch that produced it.
    Event { event: Event, watch_id: WatchId },

    /// Events were lost between this slot and the previous delivery.
    Overflow,

    /// The backend hit a terminal kernel failure and stopped pumping.
    Fault(Error),
}

/// Outcome of a [`EventQueue::pop`] call.
#[derive(Debug)]
pub(crate) enum Pop {
    /// The next slot, in arrival order.
    Slot(Slot),

    /// Nothing arrived within the timeout; the consumer should re-check its
    /// shutdown condition and pop again.
    TimedOut,

    /// The queue was closed; no further slots will be delivered.
    Closed,
}

#[derive(Debug)]
struct QueueState {
    slots: VecDeque<Slot>,
    overflowed: bool,
    dropped: u64,
    closed: bool,
}

#[derive(Debug)]
pub(crate) struct EventQueue {
    capacity: Option<usize>,
    state: Mutex<QueueState>,
    available: Condvar,
}

impl EventQueue {
    pub(crate) fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState {
                slots: VecDeque::new(),
                overflowed: false,
                dropped: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Enqueues an event without blocking, discarding the oldest event
    /// when the queue is bounded and full.
    pub(crate) fn put(&self, event: Event, watch_id: WatchId) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        if let Some(capacity) = self.capacity {
            while state.slots.len() >= capacity {
                match state.slots.pop_front() {
                    Some(Slot::Event { .. }) => {
                        state.dropped += 1;
                        state.overflowed = true;
                    }
                    Some(other) => {
                        // Markers and faults are never discarded.
                        state.slots.push_front(other);
                        break;
                    }
                    None => break,
                }
            }
        }
        state.slots.push_back(Slot::Event { event, watch_id });
        self.available.notify_one();
    }

    /// Records that the kernel itself reported event loss.
    pub(crate) fn mark_overflow(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.overflowed = true;
        self.available.notify_one();
    }

    /// Enqueues a terminal backend fault. Faults bypass the capacity bound.
    pub(crate) fn fault(&self, error: Error) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.slots.push_back(Slot::Fault(error));
        self.available.notify_one();
    }

    /// Removes and returns the next slot, waiting up to `timeout`.
    ///
    /// An armed overflow flag is delivered first, exactly once, so the
    /// marker always precedes whatever follows the loss.
    pub(crate) fn pop(&self, timeout: Duration) -> Pop {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Pop::Closed;
            }
            if state.overflowed {
                state.overflowed = false;
                return Pop::Slot(Slot::Overflow);
            }
            if let Some(slot) = state.slots.pop_front() {
                return Pop::Slot(slot);
            }
            let (next, result) = self
                .available
                .wait_timeout(state, timeout)
                .unwrap_or_else(|poisoned| {
                    // A producer panicked mid-push; the queue content is
                    // still structurally sound.
                    let inner = poisoned.into_inner();
                    (inner.0, inner.1)
                });
            state = next;
            if result.timed_out()
                && state.slots.is_empty()
                && !state.overflowed
                && !state.closed
            {
                return Pop::TimedOut;
            }
        }
    }

    /// Closes the queue, waking any waiting consumer. Idempotent.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.available.notify_all();
    }

    /// Number of events discarded because of the capacity bound.
    pub(crate) fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventKind;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Instant;

    const SHORT: Duration = Duration::from_millis(10);

    fn created(n: usize) -> Event {
        Event::new(EventKind::Created, format!("/w/{n}"))
    }

    fn pop_event(queue: &EventQueue) -> Event {
        match queue.pop(SHORT) {
            Pop::Slot(Slot::Event { event, .. }) => event,
            other => panic!("expected an event slot, got {other:?}"),
        }
    }

    #[test]
    fn delivers_in_fifo_order() {
        let queue = EventQueue::new(None);
        for n in 0..4 {
            queue.put(created(n), WatchId::test(1));
        }
        for n in 0..4 {
            assert_eq!(pop_event(&queue).path(), Path::new(&format!("/w/{n}")));
        }
        assert!(matches!(queue.pop(SHORT), Pop::TimedOut));
    }

    #[test]
    fn overflow_drops_oldest_and_marks_before_next_delivery() {
        let capacity = 8;
        let queue = EventQueue::new(Some(capacity));
        for n in 0..capacity + 10 {
            queue.put(created(n), WatchId::test(1));
        }

        assert_eq!(queue.dropped(), 10);

        // The first delivered item is the overflow marker.
        assert!(matches!(queue.pop(SHORT), Pop::Slot(Slot::Overflow)));

        // Exactly the 10 oldest events were dropped.
        for n in 10..capacity + 10 {
            assert_eq!(pop_event(&queue).path(), Path::new(&format!("/w/{n}")));
        }
        assert!(matches!(queue.pop(SHORT), Pop::TimedOut));
    }

    #[test]
    fn overflow_marker_is_delivered_at_most_once() {
        let queue = EventQueue::new(Some(1));
        queue.put(created(0), WatchId::test(1));
        queue.put(created(1), WatchId::test(1));

        assert!(matches!(queue.pop(SHORT), Pop::Slot(Slot::Overflow)));
        assert_eq!(pop_event(&queue).path(), Path::new("/w/1"));

        // No further drops, no further markers.
        queue.put(created(2), WatchId::test(1));
        assert_eq!(pop_event(&queue).path(), Path::new("/w/2"));
        assert!(matches!(queue.pop(SHORT), Pop::TimedOut));
    }

    #[test]
    fn kernel_overflow_can_be_injected() {
        let queue = EventQueue::new(None);
        queue.put(created(0), WatchId::test(1));
        queue.mark_overflow();

        // Marker first, then the queued event.
        assert!(matches!(queue.pop(SHORT), Pop::Slot(Slot::Overflow)));
        assert_eq!(pop_event(&queue).path(), Path::new("/w/0"));
    }

    #[test]
    fn close_wakes_a_blocked_consumer() {
        let queue = Arc::new(EventQueue::new(None));
        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.pop(Duration::from_secs(10)))
        };
        // Give the consumer time to block.
        std::thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        queue.close();
        let popped = consumer.join().unwrap();

        assert!(matches!(popped, Pop::Closed));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn close_is_idempotent_and_sticky() {
        let queue = EventQueue::new(None);
        queue.put(created(0), WatchId::test(1));
        queue.close();
        queue.close();

        // Closed queues do not drain and refuse further puts.
        assert!(matches!(queue.pop(SHORT), Pop::Closed));
        queue.put(created(1), WatchId::test(1));
        assert!(matches!(queue.pop(SHORT), Pop::Closed));
    }

    #[test]
    fn faults_survive_a_full_queue() {
        let queue = EventQueue::new(Some(1));
        queue.fault(Error::generic("pump died"));
        queue.put(created(0), WatchId::test(1));

        // The fault is never discarded to make room for events.
        assert!(matches!(queue.pop(SHORT), Pop::Slot(Slot::Fault(_))));
        assert_eq!(pop_event(&queue).path(), Path::new("/w/0"));
    }
}
