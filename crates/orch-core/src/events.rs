//! The in-process event bus.
//!
//! A single-writer-per-emitter, multi-subscriber channel carrying the closed
//! set of lifecycle events the rest of the engine produces. The bus never
//! blocks a producer: on overflow the event is dropped and a single warning
//! is logged per overflow burst, because a stuck subscriber (a UI, a
//! forwarder) must never be able to stall the orchestrator itself. State
//! correctness is defined by the on-disk frontmatter the State Writer
//! maintains, not by event delivery — dropping is always safe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The closed set of events the engine can emit.
///
/// Grouped by lifecycle: orchestrator, unit, task, PR, and git. Adding a
/// variant here is a deliberate protocol change — consumers (State Writer,
/// forwarder, log sink) match exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    // Orchestrator lifecycle
    EngineStarted,
    EngineShutdown,

    // Unit lifecycle
    UnitQueued,
    UnitStarted,
    UnitCompleted,
    UnitFailed,
    UnitBlocked,
    UnitDependencyMissing,

    // Task lifecycle
    TaskStarted,
    TaskAgentInvoked,
    TaskAgentDone,
    TaskBackpressureFail,
    TaskValidationOk,
    TaskValidationFail,
    TaskCommitted,
    TaskCompleted,
    TaskRetry,
    TaskFailed,

    // PR lifecycle
    PrCreated,
    PrReviewInProgress,
    PrReviewApproved,
    PrFeedbackReceived,
    PrFeedbackAddressed,
    PrMergeQueued,
    PrConflict,
    PrMerged,
    PrFailed,
    PrReviewTimeout,

    // Git operations
    WorktreeCreated,
    WorktreeRemoved,
    BranchPushed,
}

/// A single event on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub time: DateTime<Utc>,
    pub kind: EventKind,
    pub unit_id: Option<String>,
    pub task_number: Option<u32>,
    pub pr_number: Option<u64>,
    pub payload: Value,
    pub error: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            time: Utc::now(),
            kind,
            unit_id: None,
            task_number: None,
            pr_number: None,
            payload: Value::Null,
            error: None,
        }
    }

    pub fn for_unit(kind: EventKind, unit_id: impl Into<String>) -> Self {
        Self {
            unit_id: Some(unit_id.into()),
            ..Self::new(kind)
        }
    }

    pub fn for_task(kind: EventKind, unit_id: impl Into<String>, task_number: u32) -> Self {
        Self {
            task_number: Some(task_number),
            ..Self::for_unit(kind, unit_id)
        }
    }

    pub fn for_pr(kind: EventKind, unit_id: impl Into<String>, pr_number: u64) -> Self {
        Self {
            pr_number: Some(pr_number),
            ..Self::for_unit(kind, unit_id)
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// A handler registered on the bus. Handlers run in registration order on a
/// single consumer task and must not call `emit` synchronously — doing so
/// would deadlock the consumer against itself.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event);
}

impl<F> EventHandler for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn handle(&self, event: &Event) {
        self(event)
    }
}

/// Bounded, non-blocking, multi-subscriber event bus.
///
/// `emit` is a `try_send` against a bounded `crossbeam_channel`; on overflow
/// the event is dropped and a warning logged, but only once per overflow
/// burst (tracked by `dropping`) so a sustained flood doesn't itself spam the
/// log at the rate of the flood.
pub struct EventBus {
    tx: crossbeam_channel::Sender<Event>,
    dropping: Arc<AtomicBool>,
}

impl EventBus {
    /// Construct a bus with the given buffer size and spawn its consumer
    /// thread, dispatching to `handlers` in registration order.
    pub fn start(buffer_size: usize, handlers: Vec<Box<dyn EventHandler>>) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(buffer_size.max(1));
        std::thread::Builder::new()
            .name("event-bus-consumer".into())
            .spawn(move || {
                for event in rx.iter() {
                    for handler in &handlers {
                        handler.handle(&event);
                    }
                }
            })
            .expect("failed to spawn event bus consumer thread");

        Self {
            tx,
            dropping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Emit an event without blocking. Drops on overflow.
    pub fn emit(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.dropping.store(false, Ordering::Relaxed);
            }
            Err(crossbeam_channel::TrySendError::Full(event)) => {
                if !self.dropping.swap(true, Ordering::Relaxed) {
                    tracing::warn!(kind = ?event.kind, "event bus buffer full, dropping events");
                }
            }
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
                tracing::error!("event bus consumer thread is gone, event dropped");
            }
        }
    }

    /// A cloneable handle that can emit onto this bus without owning the
    /// consumer thread.
    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
            dropping: self.dropping.clone(),
        }
    }
}

/// A cheap-to-clone emitter handle, for handing to Workers/adapters that
/// don't need to own the bus itself.
#[derive(Clone)]
pub struct EventSender {
    tx: crossbeam_channel::Sender<Event>,
    dropping: Arc<AtomicBool>,
}

impl EventSender {
    pub fn emit(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.dropping.store(false, Ordering::Relaxed);
            }
            Err(crossbeam_channel::TrySendError::Full(event)) => {
                if !self.dropping.swap(true, Ordering::Relaxed) {
                    tracing::warn!(kind = ?event.kind, "event bus buffer full, dropping events");
                }
            }
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
                tracing::error!("event bus consumer thread is gone, event dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn recording_handler() -> (Box<dyn EventHandler>, Arc<Mutex<Vec<EventKind>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let handler = move |e: &Event| {
            seen_clone.lock().unwrap().push(e.kind);
        };
        (Box::new(handler), seen)
    }

    #[test]
    fn dispatches_to_handlers_in_registration_order() {
        let (h1, seen1) = recording_handler();
        let (h2, seen2) = recording_handler();
        let bus = EventBus::start(16, vec![h1, h2]);

        bus.emit(Event::for_unit(EventKind::UnitStarted, "a"));
        bus.emit(Event::for_unit(EventKind::UnitCompleted, "a"));

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(*seen1.lock().unwrap(), vec![EventKind::UnitStarted, EventKind::UnitCompleted]);
        assert_eq!(*seen2.lock().unwrap(), vec![EventKind::UnitStarted, EventKind::UnitCompleted]);
    }

    #[test]
    fn overflow_drops_without_blocking() {
        let (h, seen) = recording_handler();
        // A handler that sleeps, so the consumer backs up and the channel fills.
        let blocking = move |_: &Event| {
            std::thread::sleep(Duration::from_millis(50));
        };
        let bus = EventBus::start(2, vec![Box::new(blocking), h]);

        for _ in 0..20 {
            bus.emit(Event::new(EventKind::EngineStarted));
        }
        // emit() must never block regardless of buffer size; reaching here proves it.
        std::thread::sleep(Duration::from_millis(500));
        assert!(seen.lock().unwrap().len() <= 20);
    }

    #[test]
    fn sender_clones_share_the_same_bus() {
        let (h, seen) = recording_handler();
        let bus = EventBus::start(16, vec![h]);
        let sender = bus.sender();
        sender.emit(Event::new(EventKind::EngineStarted));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(*seen.lock().unwrap(), vec![EventKind::EngineStarted]);
    }
}
