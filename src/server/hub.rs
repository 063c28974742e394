// WebSocket hub - channel-based fan-out to UI clients
//
// The connection map and the subscription table live behind one mutex;
// everything long-running happens outside it. Each client owns a bounded
// outbound queue drained by its writer task, which serializes frames onto
// the socket one at a time. A dead client's queue closing disconnects only
// that client; a merely slow client loses frames (fan-out is best-effort,
// no replay).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bus::BusMessage;

pub const CHANNEL_EVENTS: &str = "events";
pub const CHANNEL_ACTIONS: &str = "actions";
pub const CHANNEL_PIPELINES: &str = "pipelines";
pub const CHANNEL_SYSTEM: &str = "system";

/// Outbound frames queued per client before the writer task flushes them
const CLIENT_QUEUE_CAPACITY: usize = 256;

struct HubState {
    /// client id -> outbound frame queue
    clients: HashMap<String, mpsc::Sender<String>>,
    /// channel -> subscribed client ids
    channels: HashMap<String, HashSet<String>>,
}

pub struct WsHub {
    state: Mutex<HubState>,
}

impl WsHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HubState {
                clients: HashMap::new(),
                channels: HashMap::new(),
            }),
        })
    }

    /// Register a connection: assigns a client id and hands back the
    /// receiving end of its outbound queue for the writer task.
    pub fn register(&self) -> (String, mpsc::Receiver<String>) {
        let client_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        self.lock().clients.insert(client_id.clone(), tx);
        tracing::info!(client = %client_id, "client connected");
        (client_id, rx)
    }

    /// Remove a connection and purge all its channel subscriptions.
    pub fn disconnect(&self, client_id: &str) {
        let mut state = self.lock();
        state.clients.remove(client_id);
        for subscribers in state.channels.values_mut() {
            subscribers.remove(client_id);
        }
        state.channels.retain(|_, subscribers| !subscribers.is_empty());
        tracing::info!(client = %client_id, "client disconnected");
    }

    pub fn subscribe(&self, client_id: &str, channel: &str) {
        let mut state = self.lock();
        if !state.clients.contains_key(client_id) {
            return;
        }
        state
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(client_id.to_string());
        tracing::debug!(client = %client_id, channel, "subscribed");
    }

    pub fn unsubscribe(&self, client_id: &str, channel: &str) {
        let mut state = self.lock();
        if let Some(subscribers) = state.channels.get_mut(channel) {
            subscribers.remove(client_id);
            if subscribers.is_empty() {
                state.channels.remove(channel);
            }
        }
    }

    /// Queue a frame for one client. Returns false when the client is gone
    /// (its writer task died), in which case it is removed.
    pub fn send_to(&self, client_id: &str, frame: &Value) -> bool {
        let tx = match self.lock().clients.get(client_id) {
            Some(tx) => tx.clone(),
            None => return false,
        };
        match tx.try_send(frame.to_string()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Best-effort fan-out: a slow client loses this frame
                tracing::warn!(client = %client_id, "client queue full, dropping frame");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.disconnect(client_id);
                false
            }
        }
    }

    /// Deliver a frame to every client subscribed to `channel`. Returns the
    /// number of clients that accepted it.
    pub fn broadcast(&self, channel: &str, frame: &Value) -> usize {
        let subscribers: Vec<String> = {
            let state = self.lock();
            state
                .channels
                .get(channel)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        };

        let mut sent = 0;
        for client_id in subscribers {
            if self.send_to(&client_id, frame) {
                sent += 1;
            }
        }
        sent
    }

    pub fn connection_count(&self) -> usize {
        self.lock().clients.len()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock()
            .channels
            .get(channel)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    /// Fan bus traffic out to the wire protocol until the bus closes.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<BusMessage>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                BusMessage::Signal(event) => {
                    self.broadcast(
                        CHANNEL_EVENTS,
                        &json!({
                            "type": "event",
                            "event": event,
                            "timestamp": Utc::now(),
                        }),
                    );
                }
                BusMessage::Action {
                    result,
                    pipeline_id,
                    node_id,
                } => {
                    self.broadcast(
                        CHANNEL_ACTIONS,
                        &json!({
                            "type": "action",
                            "result": result,
                            "pipeline_id": pipeline_id,
                            "node_id": node_id,
                            "timestamp": Utc::now(),
                        }),
                    );
                }
                BusMessage::PipelineStatus {
                    pipeline_id,
                    status,
                } => {
                    self.broadcast(
                        CHANNEL_PIPELINES,
                        &json!({
                            "type": "pipeline",
                            "pipeline_id": pipeline_id,
                            "status": status,
                            "timestamp": Utc::now(),
                        }),
                    );
                }
            }
        }
        tracing::info!("hub fan-out shutting down");
    }

    /// Broadcast a system status frame on the `system` channel.
    pub fn broadcast_system_status(&self, status: Value) {
        self.broadcast(
            CHANNEL_SYSTEM,
            &json!({
                "type": "status",
                "status": status,
                "timestamp": Utc::now(),
            }),
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::events::{EventDraft, EventType, SourceType};

    fn frame(text: &str) -> Value {
        serde_json::from_str(text).unwrap()
    }

    #[tokio::test]
    async fn test_fan_out_respects_channel_subscriptions() {
        let hub = WsHub::new();
        let (a, mut rx_a) = hub.register();
        let (b, mut rx_b) = hub.register();
        let (c, mut rx_c) = hub.register();

        hub.subscribe(&a, CHANNEL_EVENTS);
        hub.subscribe(&b, CHANNEL_EVENTS);
        hub.subscribe(&c, CHANNEL_ACTIONS);

        let sent = hub.broadcast(CHANNEL_EVENTS, &json!({"type": "event"}));
        assert_eq!(sent, 2);

        assert_eq!(frame(&rx_a.recv().await.unwrap())["type"], json!("event"));
        assert_eq!(frame(&rx_b.recv().await.unwrap())["type"], json!("event"));
        // The actions subscriber got nothing
        assert!(rx_c.try_recv().is_err());

        let sent = hub.broadcast(CHANNEL_ACTIONS, &json!({"type": "action"}));
        assert_eq!(sent, 1);
        assert_eq!(frame(&rx_c.recv().await.unwrap())["type"], json!("action"));
    }

    #[tokio::test]
    async fn test_disconnect_purges_subscriptions() {
        let hub = WsHub::new();
        let (a, _rx) = hub.register();
        hub.subscribe(&a, CHANNEL_EVENTS);
        hub.subscribe(&a, CHANNEL_SYSTEM);

        hub.disconnect(&a);
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.subscriber_count(CHANNEL_EVENTS), 0);
        assert_eq!(hub.broadcast(CHANNEL_EVENTS, &json!({})), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let hub = WsHub::new();
        let (a, mut rx) = hub.register();
        hub.subscribe(&a, CHANNEL_EVENTS);
        hub.unsubscribe(&a, CHANNEL_EVENTS);

        assert_eq!(hub.broadcast(CHANNEL_EVENTS, &json!({})), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_client_is_removed_and_others_unaffected() {
        let hub = WsHub::new();
        let (dead, rx_dead) = hub.register();
        let (live, mut rx_live) = hub.register();
        hub.subscribe(&dead, CHANNEL_EVENTS);
        hub.subscribe(&live, CHANNEL_EVENTS);

        // Writer task died: its queue receiver is gone
        drop(rx_dead);

        let sent = hub.broadcast(CHANNEL_EVENTS, &json!({"n": 1}));
        assert_eq!(sent, 1);
        assert_eq!(hub.connection_count(), 1);
        assert_eq!(frame(&rx_live.recv().await.unwrap())["n"], json!(1));
    }

    #[tokio::test]
    async fn test_subscribe_unknown_client_is_ignored() {
        let hub = WsHub::new();
        hub.subscribe("ghost", CHANNEL_EVENTS);
        assert_eq!(hub.subscriber_count(CHANNEL_EVENTS), 0);
    }

    #[tokio::test]
    async fn test_run_translates_bus_messages_to_frames() {
        let bus = EventBus::new();
        let bus_rx = bus.subscribe("hub", 16);
        let hub = WsHub::new();
        let (a, mut rx) = hub.register();
        hub.subscribe(&a, CHANNEL_EVENTS);
        tokio::spawn(hub.clone().run(bus_rx));

        let event = EventDraft::new(EventType::ValueChanged)
            .with_data("cpu_percent", json!(42))
            .stamp(SourceType::Cpu, "cpu_ram_monitor", Utc::now());
        bus.publish(BusMessage::Signal(event.clone()));

        let frame = frame(&rx.recv().await.unwrap());
        assert_eq!(frame["type"], json!("event"));
        assert_eq!(frame["event"]["id"], json!(event.id));
        assert_eq!(frame["event"]["source_type"], json!("cpu"));
        assert_eq!(frame["event"]["data"]["cpu_percent"], json!(42));
        assert!(frame["timestamp"].is_string());
    }
}
