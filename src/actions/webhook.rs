// Webhook action
//
// POSTs a JSON body to a configured URL. String values in the payload
// template support {key} substitution from the event data, so a pipeline
// can ship a rendered summary plus raw fields to an external endpoint.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{Action, ActionContext};
use crate::events::ActionResult;
use crate::template;

const DEFAULT_TIMEOUT_SECS: u64 = 10;

pub struct WebhookAction {
    client: reqwest::Client,
}

impl WebhookAction {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Render {key} templates inside every string leaf of the body.
    fn render_body(body: &Value, event_data: &Value) -> Value {
        match body {
            Value::String(s) => Value::String(template::substitute(s, event_data)),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| Self::render_body(item, event_data))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::render_body(v, event_data)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

impl Default for WebhookAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for WebhookAction {
    fn action_type(&self) -> &'static str {
        "webhook"
    }

    fn display_name(&self) -> &'static str {
        "Webhook"
    }

    fn validate_params(&self, params: &Value) -> Result<(), String> {
        let url = params.get("url").and_then(Value::as_str).unwrap_or("");
        if url.is_empty() {
            return Err("URL is required".to_string());
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(format!("Invalid webhook URL: {url}"));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<ActionResult> {
        let params = &ctx.params;
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let body = params.get("payload").cloned().unwrap_or_else(|| json!({}));
        let rendered = Self::render_body(&body, &ctx.event_data());

        let response = self
            .client
            .post(&url)
            .json(&rendered)
            .send()
            .await
            .with_context(|| format!("webhook request to {url} failed"))?;

        let status = response.status();
        let mut data = Map::new();
        data.insert("url".to_string(), json!(url));
        data.insert("status_code".to_string(), json!(status.as_u16()));

        if status.is_success() {
            Ok(ActionResult::success(
                format!("Webhook delivered ({status})"),
                data,
            ))
        } else {
            Ok(ActionResult::failure(
                format!("Webhook endpoint returned {status}"),
                "",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        let action = WebhookAction::new();
        assert!(action.validate_params(&json!({})).is_err());
        assert!(action.validate_params(&json!({"url": "ftp://x"})).is_err());
        assert!(action
            .validate_params(&json!({"url": "https://hooks.example/incoming"}))
            .is_ok());
    }

    #[test]
    fn test_render_body_substitutes_nested_strings() {
        let body = json!({
            "text": "cpu at {cpu_percent}%",
            "tags": ["host", "{metric}"],
            "count": 3,
        });
        let rendered = WebhookAction::render_body(
            &body,
            &json!({"cpu_percent": 88, "metric": "cpu"}),
        );
        assert_eq!(rendered["text"], json!("cpu at 88%"));
        assert_eq!(rendered["tags"][1], json!("cpu"));
        assert_eq!(rendered["count"], json!(3));
    }
}
