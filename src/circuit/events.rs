//! Circuit breaker lifecycle events and their fan-out.
//!
//! Events are handed to each listener through its own bounded queue. Emitting
//! never waits: a listener that falls behind loses events rather than slowing
//! the protected call, and a listener that panics is logged and kept alive.

use std::panic::{catch_unwind, AssertUnwindSafe};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;
use uuid::Uuid;

use super::breaker::CircuitState;

/// Queue depth given to each listener unless overridden.
pub const DEFAULT_LISTENER_CAPACITY: usize = 256;

/// Something that happened to a circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CircuitEvent {
    StateChange {
        circuit_name: String,
        previous_state: CircuitState,
        new_state: CircuitState,
        timestamp: u64,
    },
    CallSuccess {
        circuit_name: String,
        duration_ms: u64,
        slow: bool,
        timestamp: u64,
    },
    CallFailure {
        circuit_name: String,
        duration_ms: u64,
        timed_out: bool,
        error: String,
        timestamp: u64,
    },
    CallRejected {
        circuit_name: String,
        remaining_ms: u64,
        timestamp: u64,
    },
}

impl CircuitEvent {
    /// The breaker this event came from.
    pub fn circuit_name(&self) -> &str {
        match self {
            CircuitEvent::StateChange { circuit_name, .. }
            | CircuitEvent::CallSuccess { circuit_name, .. }
            | CircuitEvent::CallFailure { circuit_name, .. }
            | CircuitEvent::CallRejected { circuit_name, .. } => circuit_name,
        }
    }

    /// Event name, e.g. `state_change`.
    pub fn kind(&self) -> &'static str {
        match self {
            CircuitEvent::StateChange { .. } => "state_change",
            CircuitEvent::CallSuccess { .. } => "call_success",
            CircuitEvent::CallFailure { .. } => "call_failure",
            CircuitEvent::CallRejected { .. } => "call_rejected",
        }
    }
}

/// Handle to a callback registered with [`EventBus::on_event`].
#[derive(Debug)]
pub struct ListenerHandle {
    id: Uuid,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether the listener task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[derive(Debug)]
struct Subscriber {
    id: Uuid,
    tx: mpsc::Sender<CircuitEvent>,
}

/// Fire-and-forget fan-out of [`CircuitEvent`]s.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every future event through a bounded queue.
    pub fn subscribe(&self) -> mpsc::Receiver<CircuitEvent> {
        self.subscribe_with_capacity(DEFAULT_LISTENER_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> mpsc::Receiver<CircuitEvent> {
        self.attach(capacity).1
    }

    /// Receive every future event as a stream.
    pub fn stream(&self) -> ReceiverStream<CircuitEvent> {
        ReceiverStream::new(self.subscribe())
    }

    /// Run `listener` for every future event on its own tokio task.
    ///
    /// Must be called from within a tokio runtime. Panics raised by the
    /// listener are caught and logged.
    pub fn on_event<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&CircuitEvent) + Send + Sync + 'static,
    {
        let (id, mut rx) = self.attach(DEFAULT_LISTENER_CAPACITY);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                    warn!(
                        listener = %id,
                        circuit = %event.circuit_name(),
                        event = event.kind(),
                        "Circuit event listener panicked"
                    );
                }
            }
        });
        ListenerHandle { id, task }
    }

    /// Detach a listener. Its task exits once its queue drains.
    pub fn remove_listener(&self, handle: &ListenerHandle) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != handle.id);
        subscribers.len() != before
    }

    /// Number of attached listeners and subscriptions.
    pub fn listener_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Offer `event` to every listener without waiting.
    pub fn emit(&self, event: &CircuitEvent) {
        let mut saw_closed = false;
        for subscriber in self.subscribers.read().iter() {
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        listener = %subscriber.id,
                        circuit = %event.circuit_name(),
                        event = event.kind(),
                        "Circuit event listener is lagging, dropping event"
                    );
                }
                Err(TrySendError::Closed(_)) => saw_closed = true,
            }
        }

        if saw_closed {
            self.subscribers.write().retain(|s| !s.tx.is_closed());
        }
    }

    fn attach(&self, capacity: usize) -> (Uuid, mpsc::Receiver<CircuitEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = Uuid::new_v4();
        self.subscribers.write().push(Subscriber { id, tx });
        (id, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn rejected(name: &str) -> CircuitEvent {
        CircuitEvent::CallRejected {
            circuit_name: name.to_string(),
            remaining_ms: 10,
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn test_subscribe_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(&rejected("db"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.circuit_name(), "db");
        assert_eq!(event.kind(), "call_rejected");
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_with_capacity(1);

        bus.emit(&rejected("first"));
        bus.emit(&rejected("second"));

        assert_eq!(rx.recv().await.unwrap().circuit_name(), "first");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        assert_eq!(bus.listener_count(), 1);

        drop(rx);
        bus.emit(&rejected("db"));
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_panicking_listener_survives() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();

        let handle = bus.on_event(move |event| {
            counter.fetch_add(1, Ordering::SeqCst);
            if event.circuit_name() == "boom" {
                panic!("listener failure");
            }
        });

        bus.emit(&rejected("boom"));
        bus.emit(&rejected("ok"));

        tokio::time::timeout(Duration::from_secs(1), async {
            while seen.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!handle.is_finished());

        assert!(bus.remove_listener(&handle));
        assert!(!bus.remove_listener(&handle));
    }

    #[tokio::test]
    async fn test_event_stream() {
        let bus = EventBus::new();
        let mut events = bus.stream();

        bus.emit(&rejected("stream"));
        let event = events.next().await.unwrap();
        assert_eq!(event.circuit_name(), "stream");
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = CircuitEvent::StateChange {
            circuit_name: "db".to_string(),
            previous_state: CircuitState::Closed,
            new_state: CircuitState::Open,
            timestamp: 42,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "state_change");
        assert_eq!(json["new_state"], "OPEN");
    }
}
