// Process control action
//
// suspend/resume/terminate/kill/check a process found by pid or by a
// case-insensitive name substring. With match_all every matching process
// is controlled; otherwise only the first match is touched.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};

use super::{Action, ActionContext};
use crate::config::PERM_PROCESS;
use crate::events::ActionResult;

const OPERATIONS: &[&str] = &["suspend", "resume", "terminate", "kill", "check"];

pub struct ProcessControlAction;

impl ProcessControlAction {
    pub fn new() -> Self {
        Self
    }

    fn signal_for(operation: &str) -> Option<Signal> {
        match operation {
            "suspend" => Some(Signal::Stop),
            "resume" => Some(Signal::Continue),
            "terminate" => Some(Signal::Term),
            "kill" => Some(Signal::Kill),
            _ => None,
        }
    }
}

impl Default for ProcessControlAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for ProcessControlAction {
    fn action_type(&self) -> &'static str {
        "process_control"
    }

    fn display_name(&self) -> &'static str {
        "Process Control"
    }

    fn permission_tag(&self) -> Option<&'static str> {
        Some(PERM_PROCESS)
    }

    fn validate_params(&self, params: &Value) -> Result<(), String> {
        let operation = params
            .get("operation")
            .and_then(Value::as_str)
            .unwrap_or("check");
        if !OPERATIONS.contains(&operation) {
            return Err(format!(
                "Invalid operation: {operation}. Must be one of: {OPERATIONS:?}"
            ));
        }

        let has_name = params
            .get("process_name")
            .and_then(Value::as_str)
            .is_some_and(|s| !s.is_empty());
        let has_pid = params.get("pid").and_then(Value::as_u64).is_some();
        if !has_name && !has_pid {
            return Err("Either process_name or pid is required".to_string());
        }
        Ok(())
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<ActionResult> {
        let params = &ctx.params;
        let operation = params
            .get("operation")
            .and_then(Value::as_str)
            .unwrap_or("check")
            .to_string();
        let process_name = params
            .get("process_name")
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        let pid = params.get("pid").and_then(Value::as_u64);
        let match_all = params
            .get("match_all")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        // Process table walks and signals are blocking calls
        let result = tokio::task::spawn_blocking(move || {
            control_processes(&operation, process_name.as_deref(), pid, match_all)
        })
        .await?;
        Ok(result)
    }
}

fn find_targets(system: &System, name: Option<&str>, pid: Option<u64>) -> Vec<Pid> {
    if let Some(pid) = pid {
        let pid = Pid::from_u32(pid as u32);
        return if system.process(pid).is_some() {
            vec![pid]
        } else {
            Vec::new()
        };
    }

    let Some(name) = name else {
        return Vec::new();
    };
    let needle = name.to_lowercase();
    let mut pids: Vec<Pid> = system
        .processes()
        .iter()
        .filter(|(_, process)| {
            process
                .name()
                .to_string_lossy()
                .to_lowercase()
                .contains(&needle)
        })
        .map(|(pid, _)| *pid)
        .collect();
    pids.sort_unstable();
    pids
}

fn control_processes(
    operation: &str,
    name: Option<&str>,
    pid: Option<u64>,
    match_all: bool,
) -> ActionResult {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let targets = find_targets(&system, name, pid);
    let wanted = name
        .map(|n| n.to_string())
        .or_else(|| pid.map(|p| p.to_string()))
        .unwrap_or_default();

    if targets.is_empty() {
        if operation == "check" {
            let mut data = Map::new();
            data.insert("found".to_string(), json!(false));
            data.insert("running".to_string(), json!(false));
            return ActionResult::success(format!("Process not found: {wanted}"), data);
        }
        return ActionResult::failure(format!("No process found matching: {wanted}"), "");
    }

    if operation == "check" {
        let details: Vec<Value> = targets
            .iter()
            .filter_map(|pid| system.process(*pid))
            .map(|p| {
                json!({
                    "pid": p.pid().as_u32(),
                    "name": p.name().to_string_lossy(),
                })
            })
            .collect();
        let mut data = Map::new();
        data.insert("found".to_string(), json!(true));
        data.insert("running".to_string(), json!(true));
        data.insert("details".to_string(), json!(details));
        return ActionResult::success(format!("Process found: {wanted}"), data);
    }

    let signal = match ProcessControlAction::signal_for(operation) {
        Some(signal) => signal,
        None => return ActionResult::failure(format!("Unknown operation: {operation}"), ""),
    };

    let selected: Vec<Pid> = if match_all {
        targets
    } else {
        targets.into_iter().take(1).collect()
    };

    let mut outcomes: Vec<Value> = Vec::new();
    let mut succeeded = 0usize;
    for pid in &selected {
        let Some(process) = system.process(*pid) else {
            continue;
        };
        let ok = process.kill_with(signal).unwrap_or(false);
        if ok {
            succeeded += 1;
        }
        outcomes.push(json!({
            "pid": pid.as_u32(),
            "name": process.name().to_string_lossy(),
            "success": ok,
        }));
    }

    if succeeded == 0 {
        return ActionResult::failure(
            "No processes were controlled successfully",
            serde_json::to_string(&outcomes).unwrap_or_default(),
        );
    }

    let mut data = Map::new();
    data.insert("operation".to_string(), json!(operation));
    data.insert("results".to_string(), json!(outcomes));
    ActionResult::success(format!("Controlled {succeeded} process(es)"), data)
}
