// Execution policies - gate, delay, or rate-limit action invocations
//
// Policies share a two-phase contract: admit decides whether to invoke now
// and record updates state after an invocation. Both are synchronous and
// never block; debounce, the one policy that has to wait, waits by arming
// a timer on the engine's scheduler instead of sleeping in admit.
//
// State lives in the engine, keyed by (pipeline_id, node_id) plus a slot
// index for stateful children inside composites. Re-loading an identical
// graph therefore keeps windows and cooldowns intact, while unloading the
// pipeline discards every key it owns and cancels its pending timers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::filters::Filter;

/// Identity under which policy state is scoped
pub type PolicyKey = (i64, String);

/// A policy key widened with the slot of one stateful policy node; composite
/// children get distinct slots so they never share a window.
type StateKey = (i64, String, u32);

/// Called by the scheduler when a debounce timer fires; executes the action
/// node for `key` with the payload that was current when the timer was last
/// re-armed.
pub type DebounceInvoker = Arc<dyn Fn(PolicyKey, Value) + Send + Sync>;

/// A materialized policy attached to one action node. Instances hold config
/// only; per-key runtime state belongs to the [`PolicyEngine`].
pub enum Policy {
    None,
    Cooldown { seconds: f64, slot: u32 },
    RateLimit { max: usize, window: f64, slot: u32 },
    Conditional { filter: Filter },
    Composite { op: PolicyOp, children: Vec<Policy> },
    Debounce { delay: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyOp {
    And,
    Or,
}

impl Policy {
    /// Build a policy from node config. Unknown types fail construction and
    /// reject the pipeline at load. Slot numbering is deterministic in
    /// config order, so an identical graph maps onto identical state keys.
    pub fn from_config(config: &Value) -> Result<Self> {
        let mut next_slot = 0u32;
        Self::from_config_inner(config, &mut next_slot)
    }

    fn from_config_inner(config: &Value, next_slot: &mut u32) -> Result<Self> {
        let policy_type = config
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("none");
        let params = config
            .get("params")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));

        match policy_type {
            "none" => Ok(Policy::None),
            "cooldown" => {
                #[derive(Deserialize)]
                struct Params {
                    #[serde(default = "default_cooldown")]
                    cooldown_seconds: f64,
                }
                fn default_cooldown() -> f64 {
                    10.0
                }
                let p: Params =
                    serde_json::from_value(params).context("invalid cooldown policy params")?;
                let slot = *next_slot;
                *next_slot += 1;
                Ok(Policy::Cooldown {
                    seconds: p.cooldown_seconds,
                    slot,
                })
            }
            "rate_limit" => {
                #[derive(Deserialize)]
                struct Params {
                    #[serde(default = "default_max")]
                    max_executions: usize,
                    #[serde(default = "default_window")]
                    window_seconds: f64,
                }
                fn default_max() -> usize {
                    5
                }
                fn default_window() -> f64 {
                    60.0
                }
                let p: Params =
                    serde_json::from_value(params).context("invalid rate_limit policy params")?;
                let slot = *next_slot;
                *next_slot += 1;
                Ok(Policy::RateLimit {
                    max: p.max_executions,
                    window: p.window_seconds,
                    slot,
                })
            }
            "conditional" => {
                let condition = params.get("condition").cloned().unwrap_or(Value::Null);
                // No condition means nothing to gate on
                if condition.is_null() || condition == serde_json::json!({}) {
                    return Ok(Policy::None);
                }
                let filter = Filter::from_config(&condition)
                    .context("invalid conditional policy condition")?;
                Ok(Policy::Conditional { filter })
            }
            "composite" => {
                let op = match params
                    .get("operator")
                    .and_then(Value::as_str)
                    .unwrap_or("and")
                {
                    "and" => PolicyOp::And,
                    "or" => PolicyOp::Or,
                    other => bail!("unknown composite policy operator: {other}"),
                };
                let mut children = Vec::new();
                if let Some(configs) = params.get("policies").and_then(Value::as_array) {
                    for config in configs {
                        children.push(Self::from_config_inner(config, next_slot)?);
                    }
                }
                Ok(Policy::Composite { op, children })
            }
            "debounce" => {
                #[derive(Deserialize)]
                struct Params {
                    #[serde(default = "default_delay")]
                    delay_seconds: f64,
                }
                fn default_delay() -> f64 {
                    1.0
                }
                let p: Params =
                    serde_json::from_value(params).context("invalid debounce policy params")?;
                Ok(Policy::Debounce {
                    delay: p.delay_seconds,
                })
            }
            other => bail!("unknown policy type: {other}"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Debounce scheduler
// ─────────────────────────────────────────────────────────────────────────────

struct Pending {
    handle: JoinHandle<()>,
}

/// One timer slot per policy key. Re-arming cancels the previous timer, so
/// a burst collapses to a single invocation carrying the burst's final
/// payload, at least `delay` after the burst went quiet.
struct DebounceScheduler {
    invoker: DebounceInvoker,
    pending: Arc<Mutex<HashMap<PolicyKey, Pending>>>,
}

impl DebounceScheduler {
    fn new(invoker: DebounceInvoker) -> Self {
        Self {
            invoker,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn arm(&self, key: PolicyKey, payload: Value, delay: Duration) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(prior) = pending.remove(&key) {
            prior.handle.abort();
        }

        let invoker = self.invoker.clone();
        let pending_map = self.pending.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Deregister before invoking so a new event arriving during the
            // invocation arms a fresh timer instead of cancelling a live one
            pending_map
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&task_key);
            invoker(task_key, payload);
        });

        pending.insert(key, Pending { handle });
    }

    fn cancel_pipeline(&self, pipeline_id: i64) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|key, entry| {
            if key.0 == pipeline_id {
                entry.handle.abort();
                false
            } else {
                true
            }
        });
    }

    fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Drop for DebounceScheduler {
    fn drop(&mut self) {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for entry in pending.values() {
            entry.handle.abort();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Policy engine
// ─────────────────────────────────────────────────────────────────────────────

/// Owns all per-key policy state and the debounce scheduler, and fronts the
/// admit/record contract for the executor.
pub struct PolicyEngine {
    scheduler: DebounceScheduler,
    cooldowns: Mutex<HashMap<StateKey, Instant>>,
    windows: Mutex<HashMap<StateKey, VecDeque<Instant>>>,
}

impl PolicyEngine {
    pub fn new(invoker: DebounceInvoker) -> Self {
        Self {
            scheduler: DebounceScheduler::new(invoker),
            cooldowns: Mutex::new(HashMap::new()),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// True when the action should run now. A debounce policy always
    /// returns false here and fires through the invoker later.
    pub fn admit(&self, policy: &Policy, key: &PolicyKey, payload: &Value) -> bool {
        match policy {
            Policy::None => true,
            Policy::Cooldown { seconds, slot } => {
                let map = self.cooldowns.lock().unwrap_or_else(|e| e.into_inner());
                match map.get(&state_key(key, *slot)) {
                    Some(at) => at.elapsed() >= Duration::from_secs_f64(*seconds),
                    None => true,
                }
            }
            Policy::RateLimit { max, window, slot } => {
                let mut map = self.windows.lock().unwrap_or_else(|e| e.into_inner());
                let times = map.entry(state_key(key, *slot)).or_default();
                let horizon = Duration::from_secs_f64(*window);
                while times.front().is_some_and(|t| t.elapsed() > horizon) {
                    times.pop_front();
                }
                times.len() < *max
            }
            Policy::Conditional { filter } => match filter.evaluate(payload) {
                Ok(pass) => pass,
                // Evaluation error admits rather than silently dropping
                Err(err) => {
                    tracing::error!(error = %err, "conditional policy evaluation failed, admitting");
                    true
                }
            },
            Policy::Composite { op, children } => {
                if children.is_empty() {
                    return true;
                }
                // Every child is consulted so stateful children stay
                // consistent; short-circuiting would starve their windows
                let results: Vec<bool> = children
                    .iter()
                    .map(|c| self.admit(c, key, payload))
                    .collect();
                match op {
                    PolicyOp::And => results.iter().all(|r| *r),
                    PolicyOp::Or => results.iter().any(|r| *r),
                }
            }
            Policy::Debounce { delay } => {
                self.scheduler.arm(
                    key.clone(),
                    payload.clone(),
                    Duration::from_secs_f64(*delay),
                );
                false
            }
        }
    }

    /// Update state after an invocation. Fans out to every composite child
    /// unconditionally.
    pub fn record(&self, policy: &Policy, key: &PolicyKey) {
        match policy {
            Policy::Cooldown { slot, .. } => {
                self.cooldowns
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(state_key(key, *slot), Instant::now());
            }
            Policy::RateLimit { slot, .. } => {
                self.windows
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .entry(state_key(key, *slot))
                    .or_default()
                    .push_back(Instant::now());
            }
            Policy::Composite { children, .. } => {
                for child in children {
                    self.record(child, key);
                }
            }
            Policy::None | Policy::Conditional { .. } | Policy::Debounce { .. } => {}
        }
    }

    /// Drop all policy state and pending debounce timers for a pipeline.
    /// Called on unload; a subsequent load starts from a clean slate.
    pub fn cancel_pipeline(&self, pipeline_id: i64) {
        self.scheduler.cancel_pipeline(pipeline_id);
        self.cooldowns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|key, _| key.0 != pipeline_id);
        self.windows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|key, _| key.0 != pipeline_id);
    }

    pub fn pending_debounce_count(&self) -> usize {
        self.scheduler.pending_count()
    }
}

fn state_key(key: &PolicyKey, slot: u32) -> StateKey {
    (key.0, key.1.clone(), slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn key(pipeline: i64, node: &str) -> PolicyKey {
        (pipeline, node.to_string())
    }

    fn engine() -> PolicyEngine {
        PolicyEngine::new(Arc::new(|_, _| {}))
    }

    fn engine_with_channel() -> (PolicyEngine, mpsc::UnboundedReceiver<(PolicyKey, Value)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = PolicyEngine::new(Arc::new(move |key, payload| {
            let _ = tx.send((key, payload));
        }));
        (engine, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_spacing() {
        let engine = engine();
        let policy = Policy::from_config(&json!({
            "type": "cooldown",
            "params": {"cooldown_seconds": 10.0}
        }))
        .unwrap();
        let k = key(1, "a");
        let payload = json!({});

        assert!(engine.admit(&policy, &k, &payload));
        engine.record(&policy, &k);
        assert!(!engine.admit(&policy, &k, &payload));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!engine.admit(&policy, &k, &payload));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(engine.admit(&policy, &k, &payload));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_bounds_rolling_window() {
        let engine = engine();
        let policy = Policy::from_config(&json!({
            "type": "rate_limit",
            "params": {"max_executions": 3, "window_seconds": 1.0}
        }))
        .unwrap();
        let k = key(1, "a");
        let payload = json!({});

        // 10 events over 200ms: exactly 3 admitted
        let mut admitted = 0;
        for _ in 0..10 {
            if engine.admit(&policy, &k, &payload) {
                engine.record(&policy, &k);
                admitted += 1;
            }
            tokio::time::advance(Duration::from_millis(20)).await;
        }
        assert_eq!(admitted, 3);

        // Window slides; capacity returns
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(engine.admit(&policy, &k, &payload));
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_state_is_per_key() {
        let engine = engine();
        let policy = Policy::from_config(&json!({
            "type": "cooldown",
            "params": {"cooldown_seconds": 60.0}
        }))
        .unwrap();
        let payload = json!({});

        let a = key(1, "a");
        assert!(engine.admit(&policy, &a, &payload));
        engine.record(&policy, &a);
        assert!(!engine.admit(&policy, &a, &payload));

        // Same node id in a different pipeline is a different key
        let b = key(2, "a");
        assert!(engine.admit(&policy, &b, &payload));
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_survives_identical_reload_but_not_unload() {
        let engine = engine();
        let config = json!({"type": "cooldown", "params": {"cooldown_seconds": 60.0}});
        let k = key(1, "a");
        let payload = json!({});

        let policy = Policy::from_config(&config).unwrap();
        assert!(engine.admit(&policy, &k, &payload));
        engine.record(&policy, &k);

        // A replace-load materializes a fresh instance; the engine keeps
        // the key's state
        let reloaded = Policy::from_config(&config).unwrap();
        assert!(!engine.admit(&reloaded, &k, &payload));

        // Unload wipes it
        engine.cancel_pipeline(1);
        assert!(engine.admit(&reloaded, &k, &payload));
    }

    #[tokio::test]
    async fn test_conditional_admits_on_filter_and_on_error() {
        let engine = engine();
        let policy = Policy::from_config(&json!({
            "type": "conditional",
            "params": {"condition": {
                "type": "boolean",
                "params": {"field": "cpu_percent", "operator": ">", "value": 80}
            }}
        }))
        .unwrap();
        let k = key(1, "a");

        assert!(engine.admit(&policy, &k, &json!({"data": {"cpu_percent": 95}})));
        assert!(!engine.admit(&policy, &k, &json!({"data": {"cpu_percent": 50}})));
        // Non-numeric field is an evaluation error: fail-open
        assert!(engine.admit(&policy, &k, &json!({"data": {"cpu_percent": "busy"}})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_composite_and_or() {
        let engine = engine();
        let k = key(1, "a");
        let payload = json!({"data": {"cpu_percent": 95}});

        let and = Policy::from_config(&json!({
            "type": "composite",
            "params": {"operator": "and", "policies": [
                {"type": "conditional", "params": {"condition": {
                    "type": "boolean",
                    "params": {"field": "cpu_percent", "operator": ">", "value": 80}
                }}},
                {"type": "cooldown", "params": {"cooldown_seconds": 60.0}},
            ]}
        }))
        .unwrap();

        assert!(engine.admit(&and, &k, &payload));
        // Record fans out to all children; the cooldown child now blocks
        engine.record(&and, &k);
        assert!(!engine.admit(&and, &k, &payload));

        let or = Policy::from_config(&json!({
            "type": "composite",
            "params": {"operator": "or", "policies": [
                {"type": "conditional", "params": {"condition": {
                    "type": "boolean",
                    "params": {"field": "cpu_percent", "operator": ">", "value": 99}
                }}},
                {"type": "none"},
            ]}
        }))
        .unwrap();
        assert!(engine.admit(&or, &k, &payload));
    }

    #[tokio::test(start_paused = true)]
    async fn test_composite_children_have_distinct_state_slots() {
        let engine = engine();
        let k = key(1, "a");
        let payload = json!({});

        // Two cooldowns with very different lengths under one key
        let policy = Policy::from_config(&json!({
            "type": "composite",
            "params": {"operator": "or", "policies": [
                {"type": "cooldown", "params": {"cooldown_seconds": 1.0}},
                {"type": "cooldown", "params": {"cooldown_seconds": 100.0}},
            ]}
        }))
        .unwrap();

        assert!(engine.admit(&policy, &k, &payload));
        engine.record(&policy, &k);
        assert!(!engine.admit(&policy, &k, &payload));

        // Only the short cooldown has expired; OR admits again
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(engine.admit(&policy, &k, &payload));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_collapses_burst_to_last_payload() {
        let (engine, mut rx) = engine_with_channel();
        let policy = Policy::from_config(&json!({
            "type": "debounce",
            "params": {"delay_seconds": 0.5}
        }))
        .unwrap();
        let k = key(1, "a");

        // 10 events spaced 100ms: every admit answers no and re-arms
        for n in 0..10 {
            assert!(!engine.admit(&policy, &k, &json!({"n": n})));
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        assert!(rx.try_recv().is_err(), "nothing fires during the burst");

        // Quiet period elapses: exactly one invocation, with event #9
        tokio::time::advance(Duration::from_millis(500)).await;
        let (fired_key, payload) = rx.recv().await.unwrap();
        assert_eq!(fired_key, k);
        assert_eq!(payload["n"], json!(9));
        assert!(rx.try_recv().is_err(), "exactly one invocation");
        assert_eq!(engine.pending_debounce_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_keys_do_not_interfere() {
        let (engine, mut rx) = engine_with_channel();
        let policy = Policy::from_config(&json!({
            "type": "debounce",
            "params": {"delay_seconds": 0.2}
        }))
        .unwrap();

        engine.admit(&policy, &key(1, "a"), &json!({"who": "a"}));
        engine.admit(&policy, &key(1, "b"), &json!({"who": "b"}));
        tokio::time::advance(Duration::from_millis(250)).await;

        let mut fired = vec![rx.recv().await.unwrap().0, rx.recv().await.unwrap().0];
        fired.sort();
        assert_eq!(fired, vec![key(1, "a"), key(1, "b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unload_cancels_pending_debounce() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let engine = PolicyEngine::new(Arc::new(move |_, _| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        }));
        let policy = Policy::from_config(&json!({
            "type": "debounce",
            "params": {"delay_seconds": 0.1}
        }))
        .unwrap();

        engine.admit(&policy, &key(7, "a"), &json!({}));
        engine.admit(&policy, &key(8, "b"), &json!({}));
        engine.cancel_pipeline(7);

        tokio::time::advance(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        // Only the survivor fired
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(engine.pending_debounce_count(), 0);
    }

    #[test]
    fn test_unknown_policy_type_fails_construction() {
        assert!(Policy::from_config(&json!({"type": "jitter"})).is_err());
        assert!(Policy::from_config(&json!({
            "type": "composite",
            "params": {"operator": "xor", "policies": []}
        }))
        .is_err());
    }

    #[test]
    fn test_missing_type_defaults_to_none() {
        let policy = Policy::from_config(&json!({})).unwrap();
        assert!(matches!(policy, Policy::None));
    }
}
