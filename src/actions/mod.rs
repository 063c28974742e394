//! Actions - the side effects a pipeline can trigger
//!
//! Every action implements [`Action`] and is invoked through
//! [`safe_execute`], which layers on the permission check, parameter
//! validation, timing, and error capture so individual actions only worry
//! about their own work. The registry is closed: `create` either returns a
//! known variant or fails the pipeline load.

mod file_ops;
mod network;
mod notification;
mod process;
mod shell;
mod webhook;

pub use file_ops::FileOpsAction;
pub use network::NetworkControlAction;
pub use notification::NotificationAction;
pub use process::ProcessControlAction;
pub use shell::ShellAction;
pub use webhook::WebhookAction;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::config::Permissions;
use crate::events::ActionResult;

/// Everything an action gets to work with for one invocation
#[derive(Debug, Clone)]
pub struct ActionContext {
    /// The branch's event payload at the action node
    pub payload: Value,
    pub pipeline_id: i64,
    pub node_id: String,
    /// Parameters configured on the action node
    pub params: Value,
}

impl ActionContext {
    /// The event's `data` object, the usual template-substitution mapping.
    pub fn event_data(&self) -> Value {
        self.payload.get("data").cloned().unwrap_or(Value::Null)
    }
}

/// One side-effect capability
#[async_trait]
pub trait Action: Send + Sync {
    fn action_type(&self) -> &'static str;

    fn display_name(&self) -> &'static str;

    /// Permission tag consulted before execution; `None` runs unrestricted.
    fn permission_tag(&self) -> Option<&'static str> {
        None
    }

    /// Reject bad parameters before any work happens.
    fn validate_params(&self, _params: &Value) -> Result<(), String> {
        Ok(())
    }

    /// Do the work. Errors are turned into failure results by
    /// [`safe_execute`]; implementations may also return failure results
    /// directly for expected error shapes.
    async fn execute(&self, ctx: &ActionContext) -> Result<ActionResult>;
}

/// Execute with permission checking, validation, timing, and error capture.
pub async fn safe_execute(
    action: &dyn Action,
    ctx: &ActionContext,
    permissions: &Permissions,
) -> ActionResult {
    let start = Instant::now();

    if let Some(tag) = action.permission_tag() {
        if !permissions.granted(tag) {
            return finish(ActionResult::permission_denied(tag), start);
        }
    }

    if let Err(reason) = action.validate_params(&ctx.params) {
        return finish(ActionResult::failure(reason, "Invalid parameters"), start);
    }

    let result = match action.execute(ctx).await {
        Ok(result) => result,
        Err(err) => {
            tracing::error!(
                action = action.action_type(),
                error = %err,
                "action execution failed"
            );
            ActionResult::failure(err.to_string(), "")
        }
    };
    finish(result, start)
}

fn finish(mut result: ActionResult, start: Instant) -> ActionResult {
    result.execution_time_ms = start.elapsed().as_secs_f64() * 1000.0;
    result
}

/// Closed registry of action variants, built once at startup. Actions are
/// stateless, so one instance per variant is shared by every node using it.
pub struct ActionRegistry {
    actions: HashMap<&'static str, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        let mut actions: HashMap<&'static str, Arc<dyn Action>> = HashMap::new();
        for action in [
            Arc::new(NotificationAction::new()) as Arc<dyn Action>,
            Arc::new(ShellAction::new()),
            Arc::new(FileOpsAction::new()),
            Arc::new(ProcessControlAction::new()),
            Arc::new(NetworkControlAction::new()),
            Arc::new(WebhookAction::new()),
        ] {
            actions.insert(action.action_type(), action);
        }
        Self { actions }
    }

    /// Add a variant to the registry. Registration happens at program
    /// initialization; tests use this to install instrumented actions.
    pub fn register(&mut self, action: Arc<dyn Action>) {
        self.actions.insert(action.action_type(), action);
    }

    /// Materialize a known variant or reject the pipeline.
    pub fn create(&self, action_type: &str) -> Result<Arc<dyn Action>> {
        match self.actions.get(action_type) {
            Some(action) => Ok(action.clone()),
            None => bail!("unknown action type: {action_type}"),
        }
    }

    pub fn action_types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self.actions.keys().copied().collect();
        types.sort_unstable();
        types
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
