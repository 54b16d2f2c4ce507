//! Notification queue (C1) and the job-state notification variant.
//!
//! An unbounded FIFO with blocking-read, closable semantics, and
//! at-least-once delivery until close. One producer (the completion
//! dispatcher poller) and many consumers (per-container watcher threads)
//! is the expected shape, but the queue itself makes no assumption about
//! cardinality on either side.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::error::{Error, Result};

/// A single job-state transition delivered by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    AllProcessesExited,
    ActiveProcessLimit,
    ProcessMemoryLimit,
    JobMemoryLimit,
    NewProcess(u32),
    ExitProcess(u32),
    AbnormalExit(u32),
    NotificationLimit,
    /// A kernel message code this crate does not model individually.
    Unimplemented,
}

struct Inner {
    items: VecDeque<Notification>,
    closed: bool,
}

/// FIFO queue of [`Notification`]s with blocking `dequeue` and idempotent `close`.
pub struct NotificationQueue {
    state: Mutex<Inner>,
    cond: Condvar,
}

impl NotificationQueue {
    pub fn new() -> Self {
        NotificationQueue {
            state: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Push an item. A no-op once the queue is closed.
    pub fn enqueue(&self, item: Notification) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.items.push_back(item);
        self.cond.notify_all();
    }

    /// Block until an item is available or the queue closes.
    ///
    /// Drains remaining items even after `close()` has been called, only
    /// returning `Closed` once the backlog is empty.
    pub fn dequeue(&self) -> Result<Notification> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Ok(item);
            }
            if state.closed {
                return Err(Error::already_closed("notification queue"));
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Block until an item is available, the queue closes, or `timeout` elapses.
    pub fn dequeue_timeout(&self, timeout: std::time::Duration) -> Result<Notification> {
        let mut state = self.state.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(item) = state.items.pop_front() {
                return Ok(item);
            }
            if state.closed {
                return Err(Error::already_closed("notification queue"));
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Err(Error::timeout("dequeue timed out"));
            }
            let (guard, result) = self.cond.wait_timeout(state, remaining).unwrap();
            state = guard;
            if result.timed_out() && state.items.is_empty() && !state.closed {
                return Err(Error::timeout("dequeue timed out"));
            }
        }
    }

    /// Mark the queue closed. Idempotent; wakes every blocked consumer.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

impl Default for NotificationQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn fifo_order_preserved() {
        let q = NotificationQueue::new();
        q.enqueue(Notification::NewProcess(1));
        q.enqueue(Notification::NewProcess(2));
        assert_eq!(q.dequeue().unwrap(), Notification::NewProcess(1));
        assert_eq!(q.dequeue().unwrap(), Notification::NewProcess(2));
    }

    #[test]
    fn close_drains_then_fails() {
        let q = NotificationQueue::new();
        q.enqueue(Notification::AllProcessesExited);
        q.close();
        assert_eq!(q.dequeue().unwrap(), Notification::AllProcessesExited);
        assert!(q.dequeue().is_err());
    }

    #[test]
    fn enqueue_after_close_is_noop() {
        let q = NotificationQueue::new();
        q.close();
        q.enqueue(Notification::NewProcess(7));
        assert!(q.dequeue().is_err());
    }

    #[test]
    fn close_is_idempotent_and_wakes_blocked_consumer() {
        let q = Arc::new(NotificationQueue::new());
        let q2 = Arc::clone(&q);
        let handle = std::thread::spawn(move || q2.dequeue());
        std::thread::sleep(Duration::from_millis(50));
        q.close();
        q.close();
        let result = handle.join().unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn multiple_consumers_receive_disjoint_items() {
        let q = Arc::new(NotificationQueue::new());
        for i in 0..20u32 {
            q.enqueue(Notification::ExitProcess(i));
        }
        q.close();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = Arc::clone(&q);
            handles.push(std::thread::spawn(move || {
                let mut seen = Vec::new();
                while let Ok(n) = q.dequeue() {
                    seen.push(n);
                }
                seen
            }));
        }
        let mut total = 0;
        for h in handles {
            total += h.join().unwrap().len();
        }
        assert_eq!(total, 20);
    }
}
