// Pipeline executor - routes every event through the subscribing graphs
//
// Lookup is O(1) by source type through the subscription index. Each
// matching entry node starts one BFS walk; the walk carries a payload copy
// per branch, prunes on failed filters, swaps payloads on transformers,
// and runs actions through the policy gate. Load and unload mutate the
// pipeline table and subscription index atomically under short locks;
// action execution never happens while a lock is held.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use anyhow::Result;
use serde_json::Value;
use tokio::sync::mpsc;

use super::graph::{NodeComponent, Pipeline};
use super::policies::{DebounceInvoker, PolicyEngine, PolicyKey};
use crate::actions::{safe_execute, ActionContext, ActionRegistry};
use crate::bus::{BusMessage, EventBus};
use crate::config::Permissions;
use crate::events::{ActionResult, SignalEvent, SourceType};

pub struct Executor {
    bus: EventBus,
    registry: ActionRegistry,
    permissions: Permissions,
    policy_engine: PolicyEngine,
    pipelines: Mutex<HashMap<i64, Arc<Pipeline>>>,
    subscriptions: Mutex<HashMap<SourceType, HashSet<i64>>>,
}

impl Executor {
    /// The executor hands the policy engine an invoker pointing back at
    /// itself, so debounce timers fire on the executor's context with
    /// whatever payload was latest when the burst went quiet.
    pub fn new(bus: EventBus, registry: ActionRegistry, permissions: Permissions) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Executor>| {
            let weak = weak.clone();
            let invoker: DebounceInvoker = Arc::new(move |key, payload| {
                let Some(executor) = weak.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    executor.invoke_debounced(key, payload).await;
                });
            });

            Executor {
                bus,
                registry,
                permissions,
                policy_engine: PolicyEngine::new(invoker),
                pipelines: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
            }
        })
    }

    /// Drain signal events from a bus subscription until it closes.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<BusMessage>) {
        while let Some(msg) = rx.recv().await {
            if let BusMessage::Signal(event) = msg {
                self.process_event(&event).await;
            }
        }
        tracing::info!("executor shutting down");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Load / unload
    // ─────────────────────────────────────────────────────────────────────

    /// Build, materialize, and publish a pipeline. A prior pipeline with
    /// the same id is replaced; a build failure leaves the executor
    /// untouched.
    pub fn load(&self, id: i64, name: &str, nodes: &Value, edges: &Value) -> Result<()> {
        let pipeline = Arc::new(Pipeline::build(id, name, nodes, edges, &self.registry)?);

        {
            let mut pipelines = self.pipelines.lock().unwrap_or_else(|e| e.into_inner());
            let mut subscriptions = self
                .subscriptions
                .lock()
                .unwrap_or_else(|e| e.into_inner());

            for set in subscriptions.values_mut() {
                set.remove(&id);
            }
            subscriptions.retain(|_, set| !set.is_empty());
            for source_type in pipeline.source_types() {
                subscriptions.entry(source_type).or_default().insert(id);
            }
            pipelines.insert(id, pipeline.clone());
        }

        tracing::info!(pipeline = %name, id, "loaded pipeline");
        self.publish_pipeline_status(id, pipeline.status());
        Ok(())
    }

    /// Remove a pipeline, its subscriptions, and its policy state
    /// (including pending debounce timers). Returns false if unknown.
    pub fn unload(&self, id: i64) -> bool {
        let removed = {
            let mut pipelines = self.pipelines.lock().unwrap_or_else(|e| e.into_inner());
            let mut subscriptions = self
                .subscriptions
                .lock()
                .unwrap_or_else(|e| e.into_inner());

            let removed = pipelines.remove(&id).is_some();
            if removed {
                for set in subscriptions.values_mut() {
                    set.remove(&id);
                }
                subscriptions.retain(|_, set| !set.is_empty());
            }
            removed
        };

        if removed {
            self.policy_engine.cancel_pipeline(id);
            tracing::info!(id, "unloaded pipeline");
            self.publish_pipeline_status(id, serde_json::json!({"id": id, "loaded": false}));
        }
        removed
    }

    /// Enable or disable traversal for a loaded pipeline.
    pub fn set_active(&self, id: i64, active: bool) -> bool {
        let Some(pipeline) = self.pipeline(id) else {
            return false;
        };
        pipeline.set_active(active);
        self.publish_pipeline_status(id, pipeline.status());
        true
    }

    pub fn pipeline_status(&self, id: i64) -> Option<Value> {
        self.pipeline(id).map(|p| p.status())
    }

    pub fn all_pipelines(&self) -> Vec<Value> {
        let pipelines = self.pipelines.lock().unwrap_or_else(|e| e.into_inner());
        let mut statuses: Vec<(i64, Value)> =
            pipelines.iter().map(|(id, p)| (*id, p.status())).collect();
        statuses.sort_by_key(|(id, _)| *id);
        statuses.into_iter().map(|(_, s)| s).collect()
    }

    /// Pipeline ids currently subscribed to a source type, sorted.
    pub fn subscribers_of(&self, source_type: SourceType) -> Vec<i64> {
        let subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<i64> = subscriptions
            .get(&source_type)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn pipeline(&self, id: i64) -> Option<Arc<Pipeline>> {
        self.pipelines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    fn publish_pipeline_status(&self, pipeline_id: i64, status: Value) {
        self.bus.publish(BusMessage::PipelineStatus {
            pipeline_id,
            status,
        });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Traversal
    // ─────────────────────────────────────────────────────────────────────

    /// Route one event through every subscribing pipeline and collect the
    /// action results.
    pub async fn process_event(&self, event: &SignalEvent) -> Vec<ActionResult> {
        let ids = self.subscribers_of(event.source_type);
        let mut results = Vec::new();

        for id in ids {
            let Some(pipeline) = self.pipeline(id) else {
                continue;
            };
            if !pipeline.is_active() {
                continue;
            }
            for entry in pipeline.entry_points(event.source_type) {
                results
                    .extend(self.traverse(&pipeline, entry, event.payload()).await);
            }
        }
        results
    }

    /// One BFS walk from an entry node. Neighbor order follows edge
    /// insertion order; a visited set caps cycles at one visit per node;
    /// each branch owns its payload copy.
    async fn traverse(
        &self,
        pipeline: &Pipeline,
        start: &str,
        payload: Value,
    ) -> Vec<ActionResult> {
        let mut results = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, Value)> = VecDeque::new();
        queue.push_back((start.to_string(), payload));

        while let Some((node_id, mut payload)) = queue.pop_front() {
            if !visited.insert(node_id.clone()) {
                continue;
            }
            let Some(node) = pipeline.node(&node_id) else {
                // Edges are validated at load; reaching this means the
                // graph invariant broke. Drop the walk, stay alive.
                tracing::error!(pipeline = pipeline.id, node = %node_id, "traversal hit unknown node, abandoning");
                return results;
            };

            match &node.component {
                NodeComponent::Source { .. } => {}
                NodeComponent::Filter(filter) => match filter.evaluate(&payload) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(err) => {
                        // Fail closed: an unevaluable condition never passes
                        tracing::warn!(
                            pipeline = pipeline.id,
                            node = %node_id,
                            error = %err,
                            "filter evaluation failed, pruning branch"
                        );
                        continue;
                    }
                },
                NodeComponent::Transformer(transformer) => {
                    match transformer.transform(&payload) {
                        Ok(next) => payload = next,
                        Err(err) => {
                            // Fail open: the branch continues with the old payload
                            tracing::warn!(
                                pipeline = pipeline.id,
                                node = %node_id,
                                error = %err,
                                "transformer failed, payload unchanged"
                            );
                        }
                    }
                }
                NodeComponent::Action {
                    action,
                    params,
                    policy,
                } => {
                    let key: PolicyKey = (pipeline.id, node_id.clone());
                    if !self.policy_engine.admit(policy, &key, &payload) {
                        tracing::debug!(pipeline = pipeline.id, node = %node_id, "action gated by policy");
                        continue;
                    }

                    let ctx = ActionContext {
                        payload: payload.clone(),
                        pipeline_id: pipeline.id,
                        node_id: node_id.clone(),
                        params: params.clone(),
                    };
                    let result = safe_execute(action.as_ref(), &ctx, &self.permissions).await;
                    self.policy_engine.record(policy, &key);
                    self.bus.publish(BusMessage::Action {
                        result: result.clone(),
                        pipeline_id: pipeline.id,
                        node_id: node_id.clone(),
                    });
                    results.push(result);
                }
            }

            for next in pipeline.neighbors(&node_id) {
                queue.push_back((next.clone(), payload.clone()));
            }
        }

        results
    }

    /// Debounce timer expiry: run the action node with the burst's final
    /// payload, if its pipeline is still loaded and active.
    async fn invoke_debounced(&self, key: PolicyKey, payload: Value) {
        let (pipeline_id, node_id) = key;
        let Some(pipeline) = self.pipeline(pipeline_id) else {
            return;
        };
        if !pipeline.is_active() {
            return;
        }
        let Some(node) = pipeline.node(&node_id) else {
            return;
        };
        let NodeComponent::Action { action, params, .. } = &node.component else {
            return;
        };

        let ctx = ActionContext {
            payload,
            pipeline_id,
            node_id: node_id.clone(),
            params: params.clone(),
        };
        let result = safe_execute(action.as_ref(), &ctx, &self.permissions).await;
        self.bus.publish(BusMessage::Action {
            result,
            pipeline_id,
            node_id,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Action;
    use crate::events::{ActionStatus, EventDraft, EventType};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    /// Test action that records every context it executes with
    struct RecordingAction {
        invocations: Arc<Mutex<Vec<ActionContext>>>,
    }

    #[async_trait]
    impl Action for RecordingAction {
        fn action_type(&self) -> &'static str {
            "recording"
        }
        fn display_name(&self) -> &'static str {
            "Recording"
        }
        async fn execute(&self, ctx: &ActionContext) -> Result<ActionResult> {
            self.invocations
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(ctx.clone());
            Ok(ActionResult::success("recorded", serde_json::Map::new()))
        }
    }

    fn executor_with_recorder() -> (Arc<Executor>, Arc<Mutex<Vec<ActionContext>>>) {
        let invocations = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ActionRegistry::new();
        registry.register(Arc::new(RecordingAction {
            invocations: invocations.clone(),
        }));
        let executor = Executor::new(EventBus::new(), registry, Permissions::default());
        (executor, invocations)
    }

    fn cpu_event(cpu_percent: f64) -> SignalEvent {
        EventDraft::new(EventType::ValueChanged)
            .with_data("cpu_percent", json!(cpu_percent))
            .stamp(SourceType::Cpu, "cpu_ram_monitor", Utc::now())
    }

    fn filter_pipeline_nodes() -> Value {
        json!([
            {"id": "src", "type": "source", "data": {"source_type": "cpu"}},
            {"id": "flt", "type": "filter", "data": {"filter": {
                "type": "boolean",
                "params": {"field": "data.cpu_percent", "operator": ">", "value": 80}
            }}},
            {"id": "act", "type": "action", "data": {"action_type": "recording"}},
        ])
    }

    fn filter_pipeline_edges() -> Value {
        json!([
            {"id": "e1", "source": "src", "target": "flt"},
            {"id": "e2", "source": "flt", "target": "act"},
        ])
    }

    #[tokio::test]
    async fn test_filter_prunes_below_threshold() {
        let (executor, invocations) = executor_with_recorder();
        executor
            .load(1, "alert", &filter_pipeline_nodes(), &filter_pipeline_edges())
            .unwrap();

        let results = executor.process_event(&cpu_event(50.0)).await;
        assert!(results.is_empty());
        assert!(invocations.lock().unwrap().is_empty());

        let results = executor.process_event(&cpu_event(95.0)).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, ActionStatus::Success);
        assert_eq!(invocations.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_event_only_reaches_subscribed_pipelines() {
        let (executor, invocations) = executor_with_recorder();
        executor
            .load(1, "alert", &filter_pipeline_nodes(), &filter_pipeline_edges())
            .unwrap();

        let battery_event = EventDraft::new(EventType::ValueChanged)
            .with_data("percent", json!(10))
            .stamp(SourceType::Battery, "battery_monitor", Utc::now());
        let results = executor.process_event(&battery_event).await;
        assert!(results.is_empty());
        assert!(invocations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_branch_isolation() {
        let (executor, invocations) = executor_with_recorder();
        // src fans out to two transformer+action branches writing x=1 / x=2
        let nodes = json!([
            {"id": "src", "type": "source", "data": {"source_type": "cpu"}},
            {"id": "t1", "type": "transformer", "data": {"transformer": {
                "type": "math",
                "params": {"field": "data.cpu_percent", "operation": "multiply", "operand": 0, "output_key": "x"}
            }}},
            {"id": "t2", "type": "transformer", "data": {"transformer": {
                "type": "math",
                "params": {"field": "data.cpu_percent", "operation": "divide", "operand": 50, "output_key": "x"}
            }}},
            {"id": "a1", "type": "action", "data": {"action_type": "recording"}},
            {"id": "a2", "type": "action", "data": {"action_type": "recording"}},
        ]);
        let edges = json!([
            {"id": "e1", "source": "src", "target": "t1"},
            {"id": "e2", "source": "src", "target": "t2"},
            {"id": "e3", "source": "t1", "target": "a1"},
            {"id": "e4", "source": "t2", "target": "a2"},
        ]);
        executor.load(1, "branches", &nodes, &edges).unwrap();

        let results = executor.process_event(&cpu_event(50.0)).await;
        assert_eq!(results.len(), 2);

        let invocations = invocations.lock().unwrap();
        let mut xs: Vec<f64> = invocations
            .iter()
            .map(|ctx| ctx.payload["x"].as_f64().unwrap())
            .collect();
        xs.sort_by(f64::total_cmp);
        // Branch A saw 50*0=0, branch B saw 50/50=1; neither saw the other's x
        assert_eq!(xs, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_cycle_visits_each_node_once() {
        let (executor, invocations) = executor_with_recorder();
        let nodes = json!([
            {"id": "src", "type": "source", "data": {"source_type": "cpu"}},
            {"id": "act", "type": "action", "data": {"action_type": "recording"}},
        ]);
        // src -> act -> src is a cycle
        let edges = json!([
            {"id": "e1", "source": "src", "target": "act"},
            {"id": "e2", "source": "act", "target": "src"},
        ]);
        executor.load(1, "loop", &nodes, &edges).unwrap();

        let results = executor.process_event(&cpu_event(10.0)).await;
        assert_eq!(results.len(), 1);
        assert_eq!(invocations.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_multiple_entry_points_all_traversed() {
        let (executor, invocations) = executor_with_recorder();
        let nodes = json!([
            {"id": "s1", "type": "source", "data": {"source_type": "cpu"}},
            {"id": "s2", "type": "source", "data": {"source_type": "cpu"}},
            {"id": "a1", "type": "action", "data": {"action_type": "recording"}},
            {"id": "a2", "type": "action", "data": {"action_type": "recording"}},
        ]);
        let edges = json!([
            {"id": "e1", "source": "s1", "target": "a1"},
            {"id": "e2", "source": "s2", "target": "a2"},
        ]);
        executor.load(1, "two-entries", &nodes, &edges).unwrap();

        let results = executor.process_event(&cpu_event(10.0)).await;
        assert_eq!(results.len(), 2);
        assert_eq!(invocations.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_inactive_pipeline_is_skipped() {
        let (executor, _) = executor_with_recorder();
        executor
            .load(1, "alert", &filter_pipeline_nodes(), &filter_pipeline_edges())
            .unwrap();
        assert!(executor.set_active(1, false));

        let results = executor.process_event(&cpu_event(95.0)).await;
        assert!(results.is_empty());

        assert!(executor.set_active(1, true));
        let results = executor.process_event(&cpu_event(95.0)).await;
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_load_failure_leaves_executor_unchanged() {
        let (executor, _) = executor_with_recorder();
        executor
            .load(1, "good", &filter_pipeline_nodes(), &filter_pipeline_edges())
            .unwrap();

        let bad_nodes = json!([
            {"id": "src", "type": "source", "data": {"source_type": "warp_core"}},
        ]);
        assert!(executor.load(1, "bad", &bad_nodes, &json!([])).is_err());

        // The original pipeline is still loaded and subscribed
        let status = executor.pipeline_status(1).unwrap();
        assert_eq!(status["name"], json!("good"));
        assert_eq!(executor.subscribers_of(SourceType::Cpu), vec![1]);
    }

    #[tokio::test]
    async fn test_repeated_load_is_idempotent_for_subscriptions() {
        let (executor, _) = executor_with_recorder();
        executor
            .load(1, "alert", &filter_pipeline_nodes(), &filter_pipeline_edges())
            .unwrap();
        let before = executor.subscribers_of(SourceType::Cpu);

        executor
            .load(1, "alert", &filter_pipeline_nodes(), &filter_pipeline_edges())
            .unwrap();
        assert_eq!(executor.subscribers_of(SourceType::Cpu), before);
        assert_eq!(executor.pipeline_count(), 1);
    }

    #[tokio::test]
    async fn test_unload_removes_subscriptions() {
        let (executor, _) = executor_with_recorder();
        executor
            .load(1, "alert", &filter_pipeline_nodes(), &filter_pipeline_edges())
            .unwrap();

        assert!(executor.unload(1));
        assert!(!executor.unload(1));
        assert!(executor.subscribers_of(SourceType::Cpu).is_empty());
        assert!(executor.process_event(&cpu_event(95.0)).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_action_fires_once_with_last_payload() {
        let (executor, invocations) = executor_with_recorder();
        let nodes = json!([
            {"id": "src", "type": "source", "data": {"source_type": "cpu"}},
            {"id": "act", "type": "action", "data": {
                "action_type": "recording",
                "policy": {"type": "debounce", "params": {"delay_seconds": 0.5}},
            }},
        ]);
        let edges = json!([{"id": "e1", "source": "src", "target": "act"}]);
        executor.load(1, "debounced", &nodes, &edges).unwrap();

        for n in 0..10 {
            let results = executor.process_event(&cpu_event(n as f64)).await;
            assert!(results.is_empty(), "debounce admits nothing synchronously");
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        assert!(invocations.lock().unwrap().is_empty());

        tokio::time::advance(Duration::from_millis(500)).await;
        // Timer task fires, then the spawned invocation runs
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let invocations = invocations.lock().unwrap();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].payload["data"]["cpu_percent"], json!(9.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unloading_cancels_debounce_timer() {
        let (executor, invocations) = executor_with_recorder();
        let nodes = json!([
            {"id": "src", "type": "source", "data": {"source_type": "cpu"}},
            {"id": "act", "type": "action", "data": {
                "action_type": "recording",
                "policy": {"type": "debounce", "params": {"delay_seconds": 0.2}},
            }},
        ]);
        let edges = json!([{"id": "e1", "source": "src", "target": "act"}]);
        executor.load(1, "debounced", &nodes, &edges).unwrap();

        executor.process_event(&cpu_event(1.0)).await;
        executor.unload(1);

        tokio::time::advance(Duration::from_millis(400)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(invocations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_action_results_are_published_to_bus() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("hub", 16);

        let invocations = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ActionRegistry::new();
        registry.register(Arc::new(RecordingAction {
            invocations: invocations.clone(),
        }));
        let executor = Executor::new(bus, registry, Permissions::default());
        executor
            .load(1, "alert", &filter_pipeline_nodes(), &filter_pipeline_edges())
            .unwrap();

        // Skip the load's pipeline-status message
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, BusMessage::PipelineStatus { .. }));

        executor.process_event(&cpu_event(95.0)).await;
        let msg = rx.recv().await.unwrap();
        match msg {
            BusMessage::Action {
                result,
                pipeline_id,
                node_id,
            } => {
                assert_eq!(result.status, ActionStatus::Success);
                assert_eq!(pipeline_id, 1);
                assert_eq!(node_id, "act");
            }
            other => panic!("expected action message, got {other:?}"),
        }
    }
}
