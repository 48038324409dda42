//! Pending `sleep_until` waits, released by the pump thread.

use std::sync::Mutex;

use crossbeam_channel::{Receiver, Sender};
use framepump_common::clock::Deadline;

use crate::sync::lock;

pub(crate) type WaitCallback = Box<dyn FnOnce() + Send>;

/// One blocked caller: a deadline, an optional callback, and the signal the
/// caller is parked on.
pub(crate) struct BlockingTimeEvent {
    deadline: Deadline,
    callback: Option<WaitCallback>,
    signal: Sender<()>,
}

impl BlockingTimeEvent {
    fn due(&self, now: f64, rendering: bool) -> bool {
        !rendering || self.deadline.reached(now)
    }

    /// Run the callback, then wake the waiter.
    fn release(self) {
        if let Some(callback) = self.callback {
            callback();
        }
        let _ = self.signal.send(());
    }
}

/// Outcome of registering a wait.
pub(crate) enum Registration {
    /// Nothing to wait for; the caller runs the callback itself.
    Resolved(Option<WaitCallback>),
    /// Block on the receiver until the pump releases the event.
    Pending(Receiver<()>),
}

#[derive(Default)]
pub(crate) struct TimeEventQueue {
    events: Mutex<Vec<BlockingTimeEvent>>,
}

impl TimeEventQueue {
    /// Register a wait unless it is already satisfied.
    ///
    /// `rendering` is evaluated under the queue lock; a stop sweep that flips
    /// the flag first and then drains under the same lock therefore either
    /// sees this event or makes it resolve here.
    pub(crate) fn register(
        &self,
        deadline: Deadline,
        callback: Option<WaitCallback>,
        now: impl FnOnce() -> f64,
        rendering: impl FnOnce() -> bool,
    ) -> Registration {
        let mut events = lock(&self.events);
        if !rendering() || deadline.reached(now()) {
            return Registration::Resolved(callback);
        }
        let (signal, receiver) = crossbeam_channel::bounded(1);
        events.push(BlockingTimeEvent {
            deadline,
            callback,
            signal,
        });
        Registration::Pending(receiver)
    }

    /// Release every event that is due at `now`, or all of them when not rendering.
    /// Callbacks run outside the lock. Returns how many were released.
    pub(crate) fn drain(&self, now: f64, rendering: bool) -> usize {
        let due: Vec<BlockingTimeEvent> = {
            let mut events = lock(&self.events);
            if events.is_empty() {
                return 0;
            }
            let (due, waiting) = events.drain(..).partition(|e| e.due(now, rendering));
            *events = waiting;
            due
        };
        let released = due.len();
        for event in due {
            event.release();
        }
        released
    }

    pub(crate) fn release_all(&self) -> usize {
        self.drain(f64::NEG_INFINITY, false)
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.events).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn pending(queue: &TimeEventQueue, deadline: Deadline) -> Receiver<()> {
        match queue.register(deadline, None, || 0.0, || true) {
            Registration::Pending(rx) => rx,
            Registration::Resolved(_) => panic!("expected a pending wait"),
        }
    }

    #[test]
    fn test_past_deadline_resolves_immediately() {
        let queue = TimeEventQueue::default();
        let outcome = queue.register(Deadline::At(0.1), None, || 0.2, || true);
        assert!(matches!(outcome, Registration::Resolved(None)));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_not_rendering_resolves_immediately() {
        let queue = TimeEventQueue::default();
        let outcome = queue.register(Deadline::At(5.0), None, || 0.0, || false);
        assert!(matches!(outcome, Registration::Resolved(None)));
        let outcome = queue.register(Deadline::NotRendering, None, || 0.0, || false);
        assert!(matches!(outcome, Registration::Resolved(None)));
    }

    #[test]
    fn test_drain_releases_only_due_events() {
        let queue = TimeEventQueue::default();
        let early = pending(&queue, Deadline::At(0.5));
        let late = pending(&queue, Deadline::At(2.0));
        let stop = pending(&queue, Deadline::NotRendering);

        assert_eq!(queue.drain(1.0, true), 1);
        assert!(early.try_recv().is_ok());
        assert!(late.try_recv().is_err());
        assert!(stop.try_recv().is_err());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.release_all(), 2);
        assert!(late.try_recv().is_ok());
        assert!(stop.try_recv().is_ok());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_callback_runs_before_wakeup() {
        let queue = TimeEventQueue::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let rx = match queue.register(
            Deadline::At(1.0),
            Some(Box::new(move || {
                counted.fetch_add(1, Ordering::SeqCst);
            })),
            || 0.0,
            || true,
        ) {
            Registration::Pending(rx) => rx,
            Registration::Resolved(_) => panic!("expected a pending wait"),
        };

        queue.drain(1.0, true);
        rx.recv().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
