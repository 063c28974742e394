// Desktop notification action
//
// Shells out to notify-send on Linux desktops. Title and message support
// {key} templates filled from the event data. Hosts without a notification
// daemon get a failure result, not a crash.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::process::Command;

use super::{Action, ActionContext};
use crate::events::ActionResult;
use crate::template;

const DEFAULT_TITLE: &str = "sigrelay alert";
const DEFAULT_TIMEOUT_SECS: u64 = 10;

pub struct NotificationAction;

impl NotificationAction {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NotificationAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for NotificationAction {
    fn action_type(&self) -> &'static str {
        "notification"
    }

    fn display_name(&self) -> &'static str {
        "Notification"
    }

    fn validate_params(&self, params: &Value) -> Result<(), String> {
        let title = params.get("title").and_then(Value::as_str).unwrap_or("");
        let message = params.get("message").and_then(Value::as_str).unwrap_or("");
        if title.is_empty() && message.is_empty() {
            return Err("At least one of 'title' or 'message' is required".to_string());
        }

        let timeout = params.get("timeout").and_then(Value::as_f64).unwrap_or(10.0);
        if timeout < 1.0 {
            return Err("Timeout must be a positive number".to_string());
        }
        Ok(())
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<ActionResult> {
        let params = &ctx.params;
        let event_data = ctx.event_data();

        let title = template::substitute(
            params
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_TITLE),
            &event_data,
        );
        let message = template::substitute(
            params.get("message").and_then(Value::as_str).unwrap_or(""),
            &event_data,
        );
        let timeout = params
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let output = Command::new("notify-send")
            .arg("--app-name=sigrelay")
            .arg(format!("--expire-time={}", timeout * 1000))
            .arg(&title)
            .arg(&message)
            .output()
            .await
            .context("failed to run notify-send (is a notification daemon installed?)")?;

        if output.status.success() {
            let mut data = Map::new();
            data.insert("title".to_string(), json!(title));
            data.insert("message".to_string(), json!(message));
            data.insert("timeout".to_string(), json!(timeout));
            Ok(ActionResult::success(
                format!("Notification shown: {title}"),
                data,
            ))
        } else {
            Ok(ActionResult::failure(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
                "notify-send failed",
            ))
        }
    }
}
