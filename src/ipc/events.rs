//! Buffered debugger events.
//!
//! The receive loop appends every notification to an [`EventQueue`]. Any
//! number of consumers may take from it; each event goes to exactly one of
//! them, oldest first.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::info;

use crate::ipc::message::Notification;

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Notification>,
    closed: bool,
}

/// Unbounded FIFO of notifications shared between the receive loop and
/// foreground readers.
#[derive(Debug, Default)]
pub struct EventQueue {
    state: Mutex<QueueState>,
    available: Notify,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an event. Events pushed after [`close`](Self::close) are still
    /// kept so nothing the peer sent is lost.
    pub fn push(&self, event: Notification) {
        self.lock().items.push_back(event);
        self.available.notify_waiters();
    }

    /// Wait for the oldest event.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub async fn next(&self) -> Option<Notification> {
        loop {
            // Register interest before checking so a push between the check
            // and the await is not missed.
            let notified = self.available.notified();
            {
                let mut state = self.lock();
                if let Some(event) = state.items.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Take up to `max` of the oldest events without waiting.
    ///
    /// An empty queue yields an empty vector.
    pub fn drain(&self, max: usize) -> Vec<Notification> {
        let mut state = self.lock();
        let count = max.min(state.items.len());
        state.items.drain(..count).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the producer side finished and wake every waiter.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Spawn a task that logs every event it takes from the queue.
///
/// The task competes with other consumers: an event it logs is not seen by
/// [`EventQueue::drain`]. It ends when the queue closes.
pub fn spawn_event_logger(events: Arc<EventQueue>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            info!(method = %event.method, params = %event.params, "debug-event");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn event(n: u64) -> Notification {
        Notification::new("debug/output", json!({ "seq": n }))
    }

    #[test]
    fn test_drain_empty_returns_nothing() {
        let queue = EventQueue::new();
        assert!(queue.drain(50).is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_is_fifo_and_bounded() {
        let queue = EventQueue::new();
        for n in 0..5 {
            queue.push(event(n));
        }

        assert_eq!(queue.drain(2), vec![event(0), event(1)]);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.drain(10), vec![event(2), event(3), event(4)]);
        assert!(queue.drain(10).is_empty());
    }

    #[test]
    fn test_drain_zero_takes_nothing() {
        let queue = EventQueue::new();
        queue.push(event(1));
        assert!(queue.drain(0).is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_next_waits_for_push() {
        let queue = Arc::new(EventQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(event(9));

        let received = timeout(TEST_TIMEOUT, waiter)
            .await
            .expect("Test timed out")
            .expect("Waiter panicked");
        assert_eq!(received, Some(event(9)));
    }

    #[tokio::test]
    async fn test_close_wakes_waiters_but_keeps_queued_events() {
        let queue = Arc::new(EventQueue::new());
        queue.push(event(1));
        queue.close();

        assert_eq!(queue.next().await, Some(event(1)));
        assert_eq!(queue.next().await, None);

        let idle = Arc::new(EventQueue::new());
        let waiter = {
            let idle = Arc::clone(&idle);
            tokio::spawn(async move { idle.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        idle.close();
        let received = timeout(TEST_TIMEOUT, waiter).await.unwrap().unwrap();
        assert_eq!(received, None);
    }

    #[tokio::test]
    async fn test_each_event_delivered_to_exactly_one_consumer() {
        let queue = Arc::new(EventQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(event) = queue.next().await {
                    seen.push(event);
                }
                seen
            })
        };

        let mut drained = Vec::new();
        for n in 0..100 {
            queue.push(event(n));
            if n % 7 == 0 {
                drained.extend(queue.drain(3));
                tokio::task::yield_now().await;
            }
        }
        queue.close();

        let mut seen = timeout(TEST_TIMEOUT, consumer).await.unwrap().unwrap();
        seen.extend(drained);
        let mut seqs: Vec<u64> = seen
            .iter()
            .map(|e| e.params["seq"].as_u64().unwrap())
            .collect();
        seqs.sort_unstable();
        assert_eq!(seqs, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_event_logger_consumes_until_close() {
        let queue = Arc::new(EventQueue::new());
        let logger = spawn_event_logger(Arc::clone(&queue));

        queue.push(event(1));
        queue.push(event(2));
        queue.close();

        timeout(TEST_TIMEOUT, logger)
            .await
            .expect("Logger did not stop")
            .expect("Logger panicked");
        assert!(queue.is_empty());
    }
}
