// Clipboard signal source
//
// Polls the system clipboard and emits when the content hash changes.
// Clipboard contents are sensitive: the source only reads while the
// clipboard permission is granted, and comparison happens on a SHA-256
// digest so the last content never needs to be kept around for diffing.

use std::time::Duration;

use arboard::Clipboard;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use super::source::SignalSource;
use crate::config::{Permissions, SignalsConfig, PERM_CLIPBOARD};
use crate::events::{EventDraft, EventType, SourceType};
use crate::util::truncate_utf8_safe;

const PREVIEW_BYTES: usize = 100;

pub struct ClipboardSource {
    name: String,
    poll_interval: Duration,
    permissions: Permissions,
    clipboard: Option<Clipboard>,
    last_hash: Option<[u8; 32]>,
    last_length: usize,
    last_value: Value,
}

impl ClipboardSource {
    pub fn new(config: &SignalsConfig, permissions: Permissions) -> Self {
        Self {
            name: "clipboard_monitor".to_string(),
            poll_interval: Duration::from_secs_f64(config.clipboard_poll_interval),
            permissions,
            clipboard: None,
            last_hash: None,
            last_length: 0,
            last_value: Value::Null,
        }
    }

    fn read_text(&mut self) -> Option<String> {
        if self.clipboard.is_none() {
            match Clipboard::new() {
                Ok(cb) => self.clipboard = Some(cb),
                Err(err) => {
                    tracing::debug!(error = %err, "clipboard unavailable");
                    return None;
                }
            }
        }
        match self.clipboard.as_mut()?.get_text() {
            Ok(text) => Some(text),
            // Empty or non-text clipboard is routine, not an error
            Err(_) => None,
        }
    }

    fn evaluate(&mut self, content: String) -> Option<EventDraft> {
        let hash: [u8; 32] = Sha256::digest(content.as_bytes()).into();
        if self.last_hash == Some(hash) {
            return None;
        }

        let previous_length = self.last_length;
        let first_observation = self.last_hash.is_none();
        self.last_hash = Some(hash);
        self.last_length = content.len();

        let preview = if content.len() > PREVIEW_BYTES {
            format!("{}...", truncate_utf8_safe(&content, PREVIEW_BYTES))
        } else {
            content.clone()
        };

        self.last_value = json!({
            "content_length": content.len(),
            "content_preview": preview,
        });

        // The baseline read right after start is not a user-visible change
        if first_observation {
            return None;
        }

        let mut data = Map::new();
        data.insert("content".to_string(), json!(content));
        data.insert("content_length".to_string(), json!(content.len()));
        data.insert("content_preview".to_string(), json!(preview));
        data.insert("previous_length".to_string(), json!(previous_length));

        Some(EventDraft {
            event_type: EventType::ValueChanged,
            data,
            metadata: Map::new(),
        })
    }
}

#[async_trait]
impl SignalSource for ClipboardSource {
    fn source_type(&self) -> SourceType {
        SourceType::Clipboard
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn poll(&mut self) -> Option<EventDraft> {
        if !self.permissions.granted(PERM_CLIPBOARD) {
            return None;
        }
        let content = self.read_text()?;
        self.evaluate(content)
    }

    fn current_values(&self) -> Value {
        self.last_value.clone()
    }

    fn config_schema(&self) -> Value {
        json!({
            "poll_interval": {"type": "number", "description": "Polling interval in seconds", "default": 1.0},
            "enabled": {"type": "boolean", "description": "Requires the clipboard permission", "default": false},
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> ClipboardSource {
        ClipboardSource::new(&SignalsConfig::default(), Permissions::default())
    }

    #[test]
    fn test_first_observation_is_baseline_only() {
        let mut src = source();
        assert!(src.evaluate("initial".to_string()).is_none());
        assert_eq!(src.current_values()["content_length"], json!(7));
    }

    #[test]
    fn test_changed_content_emits_with_previous_length() {
        let mut src = source();
        let _ = src.evaluate("aaaa".to_string());
        let e = src.evaluate("bb".to_string()).expect("change");
        assert_eq!(e.event_type, EventType::ValueChanged);
        assert_eq!(e.data["content"], json!("bb"));
        assert_eq!(e.data["previous_length"], json!(4));
    }

    #[test]
    fn test_identical_content_is_silent() {
        let mut src = source();
        let _ = src.evaluate("same".to_string());
        let _ = src.evaluate("other".to_string());
        assert!(src.evaluate("other".to_string()).is_none());
    }

    #[test]
    fn test_long_content_gets_truncated_preview() {
        let mut src = source();
        let _ = src.evaluate("x".to_string());
        let long = "y".repeat(500);
        let e = src.evaluate(long).expect("change");
        let preview = e.data["content_preview"].as_str().unwrap();
        assert!(preview.ends_with("..."));
        assert!(preview.len() <= PREVIEW_BYTES + 3);
        assert_eq!(e.data["content_length"], json!(500));
    }

    #[tokio::test]
    async fn test_permission_gate_blocks_polling() {
        let mut perms = Permissions::default();
        perms.clipboard = false;
        let mut src = ClipboardSource::new(&SignalsConfig::default(), perms);
        assert!(src.poll().await.is_none());
    }
}
