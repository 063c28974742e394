// Event bus - process-local publish/subscribe fabric
//
// Every message published here is delivered once per subscription, in
// publication order per publisher. Each subscriber owns an independent
// bounded queue so one stuck consumer can never stall a producer or starve
// the other consumers: when a queue is full the new message is dropped for
// that subscriber only, and a per-subscriber counter records the loss.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::events::{ActionResult, SignalEvent};

/// Default queue depth per subscriber
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// Everything that travels on the bus
#[derive(Debug, Clone)]
pub enum BusMessage {
    /// A normalized event from a signal source
    Signal(SignalEvent),
    /// An action result produced by the executor
    Action {
        result: ActionResult,
        pipeline_id: i64,
        node_id: String,
    },
    /// A pipeline status snapshot (emitted on load/unload/toggle)
    PipelineStatus { pipeline_id: i64, status: Value },
}

struct Subscriber {
    name: String,
    tx: mpsc::Sender<BusMessage>,
    dropped: Arc<AtomicU64>,
}

/// Process-local pub/sub hub. Cheap to clone; all clones share the same
/// subscriber table.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a subscriber with its own bounded delivery queue.
    /// Returns the receiving end; dropping it unsubscribes lazily.
    pub fn subscribe(&self, name: &str, capacity: usize) -> mpsc::Receiver<BusMessage> {
        let (tx, rx) = mpsc::channel(capacity);
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.push(Subscriber {
            name: name.to_string(),
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        });
        rx
    }

    /// Deliver `msg` to every live subscriber without blocking. Saturated
    /// queues drop the new message (drop-newest) and bump the counter.
    pub fn publish(&self, msg: BusMessage) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|sub| {
            match sub.tx.try_send(msg.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let total = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(
                        subscriber = %sub.name,
                        dropped_total = total,
                        "subscriber queue full, dropping message"
                    );
                    true
                }
                // Receiver is gone; unsubscribe
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Total messages dropped for a named subscriber (0 if unknown).
    pub fn dropped_for(&self, name: &str) -> u64 {
        let subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.iter()
            .find(|s| s.name == name)
            .map(|s| s.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
