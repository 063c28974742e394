// Signal source framework - the poll loop, subscriber list, and threshold
// machine shared by every concrete source
//
// A source implements change detection for one host subsystem; the
// SourceHandle owns its lifecycle: it runs the poll loop on a tokio task,
// stamps source identity and a per-source monotonic timestamp onto each
// draft, and fans the finished event out to subscribers. Stopping the
// handle aborts and awaits the task, so no subscriber callback can fire
// after stop() returns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::events::{EventDraft, SignalEvent, SourceType};

/// Subscriber callback. Must not block: long work belongs on the receiving
/// side of a channel, not in the sink.
pub type EventSink = Arc<dyn Fn(SignalEvent) + Send + Sync>;

/// Token returned by subscribe, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// One host subsystem monitor. Implementations hold their own
/// change-detection state and return a draft only when something salient
/// changed; returning `None` on a quiet poll is the normal case.
#[async_trait]
pub trait SignalSource: Send + 'static {
    fn source_type(&self) -> SourceType;

    fn name(&self) -> &str;

    fn poll_interval(&self) -> Duration;

    /// Sample the subsystem once. `None` means no salient change.
    /// Failures are handled inside: log and return `None`.
    async fn poll(&mut self) -> Option<EventDraft>;

    /// Snapshot of the last observed values, for status reporting.
    fn current_values(&self) -> Value {
        Value::Null
    }

    /// Schema describing this source's tunable parameters.
    fn config_schema(&self) -> Value {
        json!({})
    }
}

/// Status snapshot served by the API and the `system` channel
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub running: bool,
    pub subscribers: usize,
    pub last_value: Value,
}

struct Shared {
    running: AtomicBool,
    next_token: AtomicU64,
    subscribers: Mutex<Vec<(u64, EventSink)>>,
    last_value: Mutex<Value>,
}

/// Owns a source's lifecycle and producer task.
pub struct SourceHandle {
    name: String,
    source_type: SourceType,
    shared: Arc<Shared>,
    // Taken by the task on start; a handle whose source is gone is halted
    // for good and must be re-created to run again.
    source: Mutex<Option<Box<dyn SignalSource>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SourceHandle {
    pub fn new(source: Box<dyn SignalSource>) -> Self {
        let name = source.name().to_string();
        let source_type = source.source_type();
        Self {
            name,
            source_type,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                next_token: AtomicU64::new(0),
                subscribers: Mutex::new(Vec::new()),
                last_value: Mutex::new(Value::Null),
            }),
            source: Mutex::new(Some(source)),
            task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Register a sink for this source's events.
    pub fn subscribe(&self, sink: EventSink) -> SubscriptionId {
        let token = self.shared.next_token.fetch_add(1, Ordering::SeqCst);
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((token, sink));
        SubscriptionId(token)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(token, _)| *token != id.0);
    }

    /// Start the producer task. Idempotent: a second call while running is
    /// a no-op, and a call after stop() logs and does nothing (halted is
    /// terminal for a handle).
    pub async fn start(&self) {
        if self.is_running() {
            tracing::warn!(source = %self.name, "signal source already running");
            return;
        }
        let Some(source) = self
            .source
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            tracing::warn!(source = %self.name, "signal source was stopped; re-create to restart");
            return;
        };

        self.shared.running.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        let name = self.name.clone();
        let source_type = self.source_type;
        let handle = tokio::spawn(run_loop(source, shared, name, source_type));
        *self.task.lock().await = Some(handle);
    }

    /// Stop the producer task and wait until it can no longer emit.
    /// Idempotent.
    pub async fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            // The abort lands on the next await point; publication is
            // synchronous, so once this returns nothing more is emitted.
            let _ = handle.await;
        }
        tracing::info!(source = %self.name, "signal source stopped");
    }

    pub fn status(&self) -> SourceStatus {
        SourceStatus {
            name: self.name.clone(),
            source_type: self.source_type,
            running: self.is_running(),
            subscribers: self
                .shared
                .subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .len(),
            last_value: self
                .shared
                .last_value
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}

async fn run_loop(
    mut source: Box<dyn SignalSource>,
    shared: Arc<Shared>,
    name: String,
    source_type: SourceType,
) {
    tracing::info!(source = %name, "starting signal source");
    let mut last_ts: DateTime<Utc> = DateTime::<Utc>::MIN_UTC;

    while shared.running.load(Ordering::SeqCst) {
        if let Some(draft) = source.poll().await {
            // Wall clock can step backwards; per-source timestamps must not.
            let mut now = Utc::now();
            if now < last_ts {
                now = last_ts;
            }
            last_ts = now;

            let event = draft.stamp(source_type, &name, now);
            let sinks: Vec<EventSink> = shared
                .subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .map(|(_, sink)| sink.clone())
                .collect();
            for sink in sinks {
                sink(event.clone());
            }
        }

        *shared.last_value.lock().unwrap_or_else(|e| e.into_inner()) = source.current_values();

        tokio::time::sleep(source.poll_interval()).await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Threshold machine
// ─────────────────────────────────────────────────────────────────────────────

/// Zone of a tracked numeric metric
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdState {
    Low,
    Normal,
    High,
}

impl ThresholdState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdState::Low => "low",
            ThresholdState::Normal => "normal",
            ThresholdState::High => "high",
        }
    }
}

struct Band {
    low: f64,
    high: f64,
    state: ThresholdState,
}

/// Edge-triggered (low, high) band tracker for numeric sources.
/// Hysteresis-free: the zone flips exactly at the band boundaries.
#[derive(Default)]
pub struct ThresholdTracker {
    bands: HashMap<String, Band>,
}

impl ThresholdTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_threshold(&mut self, name: &str, low: f64, high: f64) {
        self.bands.insert(
            name.to_string(),
            Band {
                low,
                high,
                state: ThresholdState::Normal,
            },
        );
    }

    /// Feed a sample. Returns the new zone when a crossing occurred,
    /// `None` when the value stayed in its zone (or the metric is untracked).
    pub fn check(&mut self, name: &str, value: f64) -> Option<ThresholdState> {
        let band = self.bands.get_mut(name)?;
        let new_state = if value <= band.low {
            ThresholdState::Low
        } else if value >= band.high {
            ThresholdState::High
        } else {
            ThresholdState::Normal
        };

        if new_state != band.state {
            band.state = new_state;
            Some(new_state)
        } else {
            None
        }
    }
}
