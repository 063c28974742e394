// Window focus signal source
//
// Emits when the active window title or its owning process name changes.
// The probe shells out to xprop on Linux; platforms without a usable
// probe stay running but silent and report that in their status.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::process::Command;

use super::source::SignalSource;
use crate::config::SignalsConfig;
use crate::events::{EventDraft, EventType, SourceType};

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Active window snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowInfo {
    pub title: Option<String>,
    pub process: Option<String>,
}

/// Narrow contract over the platform window system
#[async_trait]
pub trait WindowProbe: Send + Sync + 'static {
    /// `None` when no window system is reachable.
    async fn active_window(&self) -> Option<WindowInfo>;
}

/// Queries the X server through xprop. Wayland-only or headless hosts
/// simply never resolve a window.
pub struct XpropWindowProbe;

impl XpropWindowProbe {
    async fn xprop(args: &[&str]) -> Option<String> {
        let output = tokio::time::timeout(
            PROBE_TIMEOUT,
            Command::new("xprop").args(args).output(),
        )
        .await
        .ok()?
        .ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn parse_window_id(root_prop: &str) -> Option<String> {
        let id = root_prop.split("window id # ").nth(1)?;
        let id = id.split(',').next()?.trim();
        if id.is_empty() || id == "0x0" {
            return None;
        }
        Some(id.to_string())
    }

    fn parse_quoted_value(prop: &str) -> Option<String> {
        let value = prop.split_once('=')?.1.trim();
        Some(value.trim_matches('"').to_string())
    }

    fn parse_class(prop: &str) -> Option<String> {
        // WM_CLASS(STRING) = "instance", "Class" - the class name is last
        let value = prop.split_once('=')?.1;
        let last = value.rsplit(',').next()?.trim();
        Some(last.trim_matches('"').to_string())
    }
}

#[async_trait]
impl WindowProbe for XpropWindowProbe {
    async fn active_window(&self) -> Option<WindowInfo> {
        let root = Self::xprop(&["-root", "_NET_ACTIVE_WINDOW"]).await?;
        let window_id = Self::parse_window_id(&root)?;

        let title = Self::xprop(&["-id", &window_id, "WM_NAME"])
            .await
            .and_then(|p| Self::parse_quoted_value(&p));
        let process = Self::xprop(&["-id", &window_id, "WM_CLASS"])
            .await
            .and_then(|p| Self::parse_class(&p));

        Some(WindowInfo { title, process })
    }
}

pub struct WindowSource {
    name: String,
    probe: Box<dyn WindowProbe>,
    poll_interval: Duration,
    last: Option<WindowInfo>,
    last_value: Value,
}

impl WindowSource {
    pub fn new(config: &SignalsConfig, probe: Box<dyn WindowProbe>) -> Self {
        Self {
            name: "window_focus_monitor".to_string(),
            probe,
            poll_interval: Duration::from_secs_f64(config.window_poll_interval),
            last: None,
            last_value: Value::Null,
        }
    }

    pub fn with_default_probe(config: &SignalsConfig) -> Self {
        Self::new(config, Box::new(XpropWindowProbe))
    }

    fn evaluate(&mut self, info: WindowInfo) -> Option<EventDraft> {
        if self.last.as_ref() == Some(&info) {
            return None;
        }
        let previous = self.last.replace(info.clone());
        self.last_value = json!({
            "window_title": info.title,
            "process_name": info.process,
        });

        let mut data = Map::new();
        data.insert("window_title".to_string(), json!(info.title));
        data.insert("process_name".to_string(), json!(info.process));
        data.insert(
            "previous_title".to_string(),
            json!(previous.as_ref().and_then(|p| p.title.clone())),
        );
        data.insert(
            "previous_process".to_string(),
            json!(previous.as_ref().and_then(|p| p.process.clone())),
        );

        Some(EventDraft {
            event_type: EventType::StateChanged,
            data,
            metadata: Map::new(),
        })
    }
}

#[async_trait]
impl SignalSource for WindowSource {
    fn source_type(&self) -> SourceType {
        SourceType::WindowFocus
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn poll(&mut self) -> Option<EventDraft> {
        let info = self.probe.active_window().await?;
        self.evaluate(info)
    }

    fn current_values(&self) -> Value {
        self.last_value.clone()
    }

    fn config_schema(&self) -> Value {
        json!({
            "poll_interval": {"type": "number", "description": "Polling interval in seconds", "default": 0.5},
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(title: &str, process: &str) -> WindowInfo {
        WindowInfo {
            title: Some(title.to_string()),
            process: Some(process.to_string()),
        }
    }

    fn source() -> WindowSource {
        struct NullProbe;
        #[async_trait]
        impl WindowProbe for NullProbe {
            async fn active_window(&self) -> Option<WindowInfo> {
                None
            }
        }
        WindowSource::new(&SignalsConfig::default(), Box::new(NullProbe))
    }

    #[test]
    fn test_focus_change_carries_previous() {
        let mut src = source();
        let _ = src.evaluate(info("a.rs - editor", "editor"));
        let e = src.evaluate(info("inbox", "browser")).expect("change");
        assert_eq!(e.event_type, EventType::StateChanged);
        assert_eq!(e.data["window_title"], json!("inbox"));
        assert_eq!(e.data["previous_title"], json!("a.rs - editor"));
        assert_eq!(e.data["previous_process"], json!("editor"));
    }

    #[test]
    fn test_same_window_is_silent() {
        let mut src = source();
        let _ = src.evaluate(info("a", "p"));
        assert!(src.evaluate(info("a", "p")).is_none());
    }

    #[test]
    fn test_title_change_alone_emits() {
        let mut src = source();
        let _ = src.evaluate(info("tab 1", "browser"));
        assert!(src.evaluate(info("tab 2", "browser")).is_some());
    }

    #[test]
    fn test_parse_window_id() {
        let out = "_NET_ACTIVE_WINDOW(WINDOW): window id # 0x3400007, 0x0";
        assert_eq!(
            XpropWindowProbe::parse_window_id(out).as_deref(),
            Some("0x3400007")
        );
        assert_eq!(
            XpropWindowProbe::parse_window_id("_NET_ACTIVE_WINDOW(WINDOW): window id # 0x0"),
            None
        );
    }

    #[test]
    fn test_parse_class_takes_last_component() {
        let out = r#"WM_CLASS(STRING) = "navigator", "Firefox""#;
        assert_eq!(
            XpropWindowProbe::parse_class(out).as_deref(),
            Some("Firefox")
        );
    }

    #[test]
    fn test_parse_quoted_title() {
        let out = r#"WM_NAME(STRING) = "notes - editor""#;
        assert_eq!(
            XpropWindowProbe::parse_quoted_value(out).as_deref(),
            Some("notes - editor")
        );
    }
}
