// Events that flow from signal sources to the pipeline executor and the
// WebSocket hub
//
// A SignalEvent is the normalized unit of traffic on the bus: every source
// (CPU, battery, filesystem, ...) reduces its platform-specific observations
// into this one shape so filters and transformers can stay source-agnostic.
// An ActionResult is the unit flowing back out after an action node runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Closed vocabulary of host subsystems a source can monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Cpu,
    Battery,
    Network,
    WindowFocus,
    Filesystem,
    Clipboard,
    Microphone,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Cpu => "cpu",
            SourceType::Battery => "battery",
            SourceType::Network => "network",
            SourceType::WindowFocus => "window_focus",
            SourceType::Filesystem => "filesystem",
            SourceType::Clipboard => "clipboard",
            SourceType::Microphone => "microphone",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(SourceType::Cpu),
            "battery" => Ok(SourceType::Battery),
            "network" => Ok(SourceType::Network),
            "window_focus" => Ok(SourceType::WindowFocus),
            "filesystem" => Ok(SourceType::Filesystem),
            "clipboard" => Ok(SourceType::Clipboard),
            "microphone" => Ok(SourceType::Microphone),
            other => anyhow::bail!("unknown source type: {other}"),
        }
    }
}

/// What kind of change a source observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ValueChanged,
    ThresholdCrossed,
    StateChanged,
    Detected,
    Created,
    Modified,
    Deleted,
    Moved,
}

/// A normalized signal event, immutable once published to the bus.
///
/// `source_type` and `source_name` are stamped by the source handle before
/// delivery; sources themselves only produce an [`EventDraft`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub id: String,
    pub source_type: SourceType,
    pub source_name: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub data: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

impl SignalEvent {
    /// Serialize to the JSON object form the executor traverses with.
    /// Each branch of a pipeline gets its own copy of this value.
    pub fn payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// The part of an event a source is responsible for. The owning
/// [`SourceHandle`](crate::signals::SourceHandle) fills in identity and
/// timestamp when it publishes, which keeps per-source timestamps
/// monotonically non-decreasing.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub event_type: EventType,
    pub data: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

impl EventDraft {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            data: Map::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_data(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Finalize into a publishable event.
    pub fn stamp(
        self,
        source_type: SourceType,
        source_name: &str,
        timestamp: DateTime<Utc>,
    ) -> SignalEvent {
        SignalEvent {
            id: Uuid::new_v4().to_string(),
            source_type,
            source_name: source_name.to_string(),
            event_type: self.event_type,
            timestamp,
            data: self.data,
            metadata: self.metadata,
        }
    }
}

/// Outcome of one action invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Failure,
    Skipped,
    Pending,
    PermissionDenied,
}

/// Result of an action execution, published on the `actions` channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub id: String,
    pub status: ActionStatus,
    pub message: String,
    pub data: Map<String, Value>,
    pub error: Option<String>,
    pub execution_time_ms: f64,
    pub timestamp: DateTime<Utc>,
}

impl ActionResult {
    fn base(status: ActionStatus) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            status,
            message: String::new(),
            data: Map::new(),
            error: None,
            execution_time_ms: 0.0,
            timestamp: Utc::now(),
        }
    }

    pub fn success(message: impl Into<String>, data: Map<String, Value>) -> Self {
        let mut r = Self::base(ActionStatus::Success);
        r.message = message.into();
        r.data = data;
        r
    }

    pub fn failure(error: impl Into<String>, message: impl Into<String>) -> Self {
        let mut r = Self::base(ActionStatus::Failure);
        r.message = message.into();
        r.error = Some(error.into());
        r
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        let mut r = Self::base(ActionStatus::Skipped);
        r.message = reason.into();
        r
    }

    pub fn permission_denied(required: &str) -> Self {
        let mut r = Self::base(ActionStatus::PermissionDenied);
        r.message = format!("Permission required: {required}");
        r.error = Some(format!("Action requires '{required}' permission"));
        r
    }
}
