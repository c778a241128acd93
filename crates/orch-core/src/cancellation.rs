//! Cooperative cancellation for the orchestrator run loop.
//!
//! A single signal, broadcast to every subscriber: the Scheduler's dispatch
//! loop, each in-flight Worker, the Review Adapter's poll loop. Receivers
//! are expected to finish their current unit of work (an agent turn, a git
//! call, a poll tick) and stop rather than abandon it mid-flight — nothing
//! here forcibly tears anything down. Shutdown completion is just every
//! spawned task returning; the caller `join`s them rather than counting
//! drain confirmations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

/// Shared handle for triggering and observing cancellation.
#[derive(Clone)]
pub struct CancellationToken {
    trigger: broadcast::Sender<()>,
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (trigger, _rx) = broadcast::channel(1);
        Self {
            trigger,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A fresh receiver for a new subscriber. Must be called before
    /// `trigger()` to observe it — broadcast channels only deliver to
    /// receivers that existed at send time.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    /// True once cancellation has been requested. Cheap enough to poll in a
    /// loop alongside `subscribe()`'s receiver.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Request cancellation. Idempotent; safe to call more than once.
    pub fn trigger(&self) {
        self.cancelled.store(true, Ordering::Release);
        let _ = self.trigger.send(());
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn not_cancelled_initially() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn subscribers_observe_trigger() {
        let token = CancellationToken::new();
        let mut rx1 = token.subscribe();
        let mut rx2 = token.subscribe();
        token.trigger();
        assert!(token.is_cancelled());
        rx1.recv().await.unwrap();
        rx2.recv().await.unwrap();
    }

    #[tokio::test]
    async fn subscriber_added_after_trigger_only_sees_flag() {
        let token = CancellationToken::new();
        token.trigger();
        let mut rx = token.subscribe();
        assert!(token.is_cancelled());
        let result = tokio::time::timeout(Duration::from_millis(20), rx.recv()).await;
        assert!(result.is_err(), "late subscriber should not receive the past trigger");
    }

    #[test]
    fn trigger_is_idempotent() {
        let token = CancellationToken::new();
        token.trigger();
        token.trigger();
        assert!(token.is_cancelled());
    }
}
