// Pipeline graph model
//
// A pipeline is a labeled directed graph of source, filter, transformer,
// and action nodes. Construction materializes every node's component from
// its config blob; any unknown variant or dangling edge rejects the whole
// graph, so a pipeline either loads complete or not at all. Adjacency
// lists keep edge insertion order, which fixes the BFS neighbor order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};

use super::filters::Filter;
use super::policies::Policy;
use super::transformers::Transformer;
use crate::actions::{Action, ActionRegistry};
use crate::events::SourceType;

/// The materialized behavior of one node
pub enum NodeComponent {
    /// Entry point; passes the payload through unchanged
    Source { source_type: SourceType },
    Filter(Filter),
    Transformer(Transformer),
    Action {
        action: Arc<dyn Action>,
        params: Value,
        policy: Policy,
    },
}

pub struct PipelineNode {
    pub id: String,
    pub component: NodeComponent,
}

pub struct Pipeline {
    pub id: i64,
    pub name: String,
    active: AtomicBool,
    nodes: HashMap<String, PipelineNode>,
    /// node id -> successor ids, in edge insertion order
    adjacency: HashMap<String, Vec<String>>,
    /// source nodes in node insertion order
    entry_nodes: Vec<(String, SourceType)>,
    edge_count: usize,
}

#[derive(Deserialize)]
struct NodeConfig {
    id: String,
    #[serde(rename = "type", default = "default_node_type")]
    node_type: String,
    #[serde(default)]
    data: Value,
}

fn default_node_type() -> String {
    "source".to_string()
}

#[derive(Deserialize)]
struct EdgeConfig {
    source: String,
    target: String,
}

impl Pipeline {
    /// Build and materialize a pipeline from its stored graph config.
    pub fn build(
        id: i64,
        name: &str,
        nodes: &Value,
        edges: &Value,
        registry: &ActionRegistry,
    ) -> Result<Self> {
        let node_configs: Vec<NodeConfig> = serde_json::from_value(nodes.clone())
            .with_context(|| format!("pipeline '{name}': invalid nodes config"))?;
        let edge_configs: Vec<EdgeConfig> = serde_json::from_value(edges.clone())
            .with_context(|| format!("pipeline '{name}': invalid edges config"))?;

        let mut built_nodes = HashMap::new();
        let mut entry_nodes = Vec::new();

        for config in node_configs {
            if built_nodes.contains_key(&config.id) {
                bail!("pipeline '{name}': duplicate node id '{}'", config.id);
            }
            let component = Self::materialize(&config, registry)
                .with_context(|| format!("pipeline '{name}': node '{}'", config.id))?;
            if let NodeComponent::Source { source_type } = &component {
                entry_nodes.push((config.id.clone(), *source_type));
            }
            built_nodes.insert(
                config.id.clone(),
                PipelineNode {
                    id: config.id,
                    component,
                },
            );
        }

        let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
        for edge in &edge_configs {
            for endpoint in [&edge.source, &edge.target] {
                if !built_nodes.contains_key(endpoint) {
                    bail!(
                        "pipeline '{name}': edge references unknown node '{endpoint}'"
                    );
                }
            }
            adjacency
                .entry(edge.source.clone())
                .or_default()
                .push(edge.target.clone());
        }

        Ok(Self {
            id,
            name: name.to_string(),
            active: AtomicBool::new(true),
            nodes: built_nodes,
            adjacency,
            entry_nodes,
            edge_count: edge_configs.len(),
        })
    }

    fn materialize(config: &NodeConfig, registry: &ActionRegistry) -> Result<NodeComponent> {
        match config.node_type.as_str() {
            "source" => {
                let source_type = config
                    .data
                    .get("source_type")
                    .and_then(Value::as_str)
                    .context("source node missing source_type")?;
                Ok(NodeComponent::Source {
                    source_type: source_type.parse()?,
                })
            }
            "filter" => {
                let filter_config = config
                    .data
                    .get("filter")
                    .context("filter node missing filter config")?;
                Ok(NodeComponent::Filter(Filter::from_config(filter_config)?))
            }
            "transformer" => {
                let transformer_config = config
                    .data
                    .get("transformer")
                    .context("transformer node missing transformer config")?;
                Ok(NodeComponent::Transformer(Transformer::from_config(
                    transformer_config,
                )?))
            }
            "action" => {
                let action_type = config
                    .data
                    .get("action_type")
                    .and_then(Value::as_str)
                    .unwrap_or("notification");
                let action = registry.create(action_type)?;
                let params = config.data.get("params").cloned().unwrap_or(json!({}));
                let policy_config = config
                    .data
                    .get("policy")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "none"}));
                let policy = Policy::from_config(&policy_config)?;
                Ok(NodeComponent::Action {
                    action,
                    params,
                    policy,
                })
            }
            other => bail!("unknown node type: {other}"),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn node(&self, id: &str) -> Option<&PipelineNode> {
        self.nodes.get(id)
    }

    pub fn neighbors(&self, id: &str) -> &[String] {
        self.adjacency.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Source node ids declaring the given type, in node insertion order.
    pub fn entry_points(&self, source_type: SourceType) -> Vec<&str> {
        self.entry_nodes
            .iter()
            .filter(|(_, t)| *t == source_type)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// The set of source types this pipeline subscribes to.
    pub fn source_types(&self) -> HashSet<SourceType> {
        self.entry_nodes.iter().map(|(_, t)| *t).collect()
    }

    pub fn status(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "is_active": self.is_active(),
            "node_count": self.nodes.len(),
            "edge_count": self.edge_count,
            "source_types": self.entry_nodes.iter().map(|(_, t)| t.as_str()).collect::<Vec<_>>(),
        })
    }
}
