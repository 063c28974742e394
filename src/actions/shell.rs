// Shell command action
//
// Runs a command line through `sh -c` as a child process with a kill-on-
// expiry timeout. The command string supports {key} templates filled from
// the event data. Captured output is truncated before it rides along in
// the result.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::process::Command;

use super::{Action, ActionContext};
use crate::config::PERM_SHELL;
use crate::events::ActionResult;
use crate::template;
use crate::util::truncate_utf8_safe;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const OUTPUT_CAP_BYTES: usize = 1000;

/// Command fragments that are never worth the risk, checked case-insensitively
const DENIED_PATTERNS: &[&str] = &["rm -rf /", "mkfs", ":(){ :|:& };:"];

pub struct ShellAction;

impl ShellAction {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ShellAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for ShellAction {
    fn action_type(&self) -> &'static str {
        "shell"
    }

    fn display_name(&self) -> &'static str {
        "Shell Command"
    }

    fn permission_tag(&self) -> Option<&'static str> {
        Some(PERM_SHELL)
    }

    fn validate_params(&self, params: &Value) -> Result<(), String> {
        let command = params.get("command").and_then(Value::as_str).unwrap_or("");
        if command.is_empty() {
            return Err("Command is required".to_string());
        }

        let timeout = params.get("timeout").and_then(Value::as_f64).unwrap_or(30.0);
        if timeout < 1.0 {
            return Err("Timeout must be a positive number".to_string());
        }

        let lowered = command.to_lowercase();
        for pattern in DENIED_PATTERNS {
            if lowered.contains(pattern) {
                return Err(format!(
                    "Potentially dangerous command pattern detected: {pattern}"
                ));
            }
        }
        Ok(())
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<ActionResult> {
        let params = &ctx.params;
        let raw_command = params
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let timeout = params
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        let working_dir = params.get("working_dir").and_then(Value::as_str);
        let capture_output = params
            .get("capture_output")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let command = template::substitute(raw_command, &ctx.event_data());

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&command);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }
        if capture_output {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        cmd.kill_on_drop(true);

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn: {command}"))?;

        let output =
            match tokio::time::timeout(Duration::from_secs(timeout), child.wait_with_output())
                .await
            {
                Ok(output) => output.context("failed to collect command output")?,
                // kill_on_drop reaps the child when the future is dropped
                Err(_) => {
                    return Ok(ActionResult::failure(
                        format!("Command timed out after {timeout} seconds"),
                        "Process was killed due to timeout",
                    ));
                }
            };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code();

        if output.status.success() {
            let mut data = Map::new();
            data.insert("command".to_string(), json!(command));
            data.insert("return_code".to_string(), json!(code));
            data.insert(
                "stdout".to_string(),
                json!(truncate_utf8_safe(&stdout, OUTPUT_CAP_BYTES)),
            );
            data.insert(
                "stderr".to_string(),
                json!(truncate_utf8_safe(&stderr, OUTPUT_CAP_BYTES)),
            );
            Ok(ActionResult::success("Command executed successfully", data))
        } else {
            Ok(ActionResult::failure(
                format!("Command failed with return code {code:?}"),
                truncate_utf8_safe(&stderr, OUTPUT_CAP_BYTES / 2).to_string(),
            ))
        }
    }
}
