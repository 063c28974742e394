// Network control action
//
// enable/disable a network interface (nmcli first, ip link as fallback)
// or report interface status. Enable/disable is idempotent: an adapter
// already in the requested state is a success with skipped=true, matching
// how the UI presents repeat runs.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use sysinfo::Networks;
use tokio::process::Command;

use super::{Action, ActionContext};
use crate::config::PERM_NETWORK;
use crate::events::ActionResult;

const OPERATIONS: &[&str] = &["enable", "disable", "status"];

pub struct NetworkControlAction;

impl NetworkControlAction {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NetworkControlAction {
    fn default() -> Self {
        Self::new()
    }
}

fn interface_state(name: &str) -> Option<String> {
    std::fs::read_to_string(Path::new("/sys/class/net").join(name).join("operstate"))
        .ok()
        .map(|s| s.trim().to_string())
}

fn list_interfaces() -> Vec<Value> {
    let networks = Networks::new_with_refreshed_list();
    let mut interfaces: Vec<Value> = networks
        .iter()
        .map(|(name, data)| {
            json!({
                "name": name,
                "state": interface_state(name).unwrap_or_else(|| "unknown".to_string()),
                "total_received": data.total_received(),
                "total_transmitted": data.total_transmitted(),
            })
        })
        .collect();
    interfaces.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
    interfaces
}

async fn run(cmd: &str, args: &[&str]) -> Result<std::process::Output> {
    Command::new(cmd)
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to run {cmd}"))
}

#[async_trait]
impl Action for NetworkControlAction {
    fn action_type(&self) -> &'static str {
        "network_control"
    }

    fn display_name(&self) -> &'static str {
        "Network Control"
    }

    fn permission_tag(&self) -> Option<&'static str> {
        Some(PERM_NETWORK)
    }

    fn validate_params(&self, params: &Value) -> Result<(), String> {
        let operation = params
            .get("operation")
            .and_then(Value::as_str)
            .unwrap_or("status");
        if !OPERATIONS.contains(&operation) {
            return Err(format!(
                "Invalid operation: {operation}. Must be one of: {OPERATIONS:?}"
            ));
        }
        if operation != "status" {
            let adapter = params
                .get("adapter_name")
                .and_then(Value::as_str)
                .unwrap_or("");
            if adapter.is_empty() {
                return Err("Adapter name required for enable/disable".to_string());
            }
        }
        Ok(())
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<ActionResult> {
        let params = &ctx.params;
        let operation = params
            .get("operation")
            .and_then(Value::as_str)
            .unwrap_or("status");

        if operation == "status" {
            let interfaces = list_interfaces();
            let message = format!("{} interface(s)", interfaces.len());
            let mut data = Map::new();
            data.insert("adapters".to_string(), json!(interfaces));
            return Ok(ActionResult::success(message, data));
        }

        let adapter = params
            .get("adapter_name")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let want_up = operation == "enable";

        // Idempotency check against the current state
        if let Some(state) = interface_state(adapter) {
            let is_up = state == "up";
            if is_up == want_up {
                let mut data = Map::new();
                data.insert("adapter".to_string(), json!(adapter));
                data.insert("operation".to_string(), json!(operation));
                data.insert("skipped".to_string(), json!(true));
                return Ok(ActionResult::success(
                    format!("Adapter '{adapter}' is already {state}"),
                    data,
                ));
            }
        }

        // nmcli understands connection state; fall back to ip link
        let nmcli_op = if want_up { "connect" } else { "disconnect" };
        let nmcli_worked = matches!(
            run("nmcli", &["device", nmcli_op, adapter]).await,
            Ok(output) if output.status.success()
        );
        if !nmcli_worked {
            let link_op = if want_up { "up" } else { "down" };
            let output = run("ip", &["link", "set", adapter, link_op]).await?;
            if !output.status.success() {
                return Ok(ActionResult::failure(
                    String::from_utf8_lossy(&output.stderr).trim().to_string(),
                    format!("Could not {operation} adapter '{adapter}'"),
                ));
            }
        }

        let mut data = Map::new();
        data.insert("adapter".to_string(), json!(adapter));
        data.insert("operation".to_string(), json!(operation));
        Ok(ActionResult::success(
            format!("Adapter '{adapter}' {operation}d"),
            data,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ActionStatus;

    fn ctx(params: Value) -> ActionContext {
        ActionContext {
            payload: json!({"data": {}}),
            pipeline_id: 1,
            node_id: "net".to_string(),
            params,
        }
    }

    #[test]
    fn test_validation() {
        let action = NetworkControlAction::new();
        assert!(action.validate_params(&json!({"operation": "status"})).is_ok());
        assert!(action.validate_params(&json!({"operation": "enable"})).is_err());
        assert!(action
            .validate_params(&json!({"operation": "enable", "adapter_name": "eth0"}))
            .is_ok());
        assert!(action.validate_params(&json!({"operation": "flood"})).is_err());
    }

    #[tokio::test]
    async fn test_status_lists_adapters() {
        let action = NetworkControlAction::new();
        let result = action
            .execute(&ctx(json!({"operation": "status"})))
            .await
            .unwrap();
        assert_eq!(result.status, ActionStatus::Success);
        assert!(result.data["adapters"].is_array());
    }
}
