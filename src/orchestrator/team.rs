//! Data model for Teams and their topology (`spec.md` §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Lifecycle status of a [`Team`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TeamStatus {
    Active,
    Inactive,
    Error,
}

/// Kind of a topology [`Node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKind {
    GlobalSupervisor,
    NodeSupervisor,
    Agent,
}

/// Dispatch strategy used by a supervisor node among its ready children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoordinationStrategy {
    RoundRobin,
    Priority,
    Adaptive,
    Hierarchical,
    Parallel,
    Sequential,
}

/// `(provider_tag, model_id)` — resolved to a callable [`crate::orchestrator::registry::LlmClient`]
/// via the external [`crate::orchestrator::registry::ModelRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider_tag: String,
    pub model_id: String,
}

/// Per-node agent configuration. Present on `AGENT` nodes; supervisors ignore
/// most of it but may still carry `role`/`instructions` for their own
/// synthesis step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub role: String,
    pub instructions: String,
    pub model_ref: ModelRef,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    pub max_tokens: u32,
}

fn default_temperature() -> f32 {
    1.0
}

/// A vertex in a [`TopologyConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
    pub agent_config: AgentConfig,
    /// Required for supervisor kinds; ignored for `AGENT`.
    pub coordination_strategy: Option<CoordinationStrategy>,
}

/// An edge of the topology DAG. `condition_label`, when parseable as a
/// number, is used as a `PRIORITY` dispatch weight (descending, missing = 0).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source_id: String,
    pub target_id: String,
    pub condition_label: Option<String>,
}

/// The declarative, validated shape of a [`Team`]'s agent graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    pub nodes: HashMap<String, Node>,
    pub edges: Vec<Edge>,
    pub entry_point: String,
    pub output_schema: Option<serde_json::Value>,
}

impl TopologyConfig {
    /// Children of `node_id` in edge-declaration order.
    pub fn children_of<'a>(&'a self, node_id: &str) -> Vec<&'a Edge> {
        self.edges
            .iter()
            .filter(|e| e.source_id == node_id)
            .collect()
    }

    /// Parents (predecessors) of `node_id`.
    pub fn parents_of(&self, node_id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.target_id == node_id)
            .map(|e| e.source_id.as_str())
            .collect()
    }

    /// Every node reachable from `node_id` via outgoing edges, `node_id` excluded.
    pub fn descendants_of(&self, node_id: &str) -> Vec<String> {
        let mut visited = std::collections::HashSet::new();
        let mut stack = vec![node_id.to_string()];
        let mut out = Vec::new();
        while let Some(current) = stack.pop() {
            for edge in self.edges.iter().filter(|e| e.source_id == current) {
                if visited.insert(edge.target_id.clone()) {
                    out.push(edge.target_id.clone());
                    stack.push(edge.target_id.clone());
                }
            }
        }
        out
    }
}

/// A named, validated topology blueprint (`spec.md` §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub status: TeamStatus,
    pub timeout_seconds: u32,
    pub max_iterations: u32,
    pub topology: TopologyConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Team {
    /// Construct a new, `ACTIVE` team with the `spec.md` defaults
    /// (`timeout_seconds=300`, `max_iterations=50`).
    pub fn new(name: impl Into<String>, topology: TopologyConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            status: TeamStatus::Active,
            timeout_seconds: 300,
            max_iterations: 50,
            topology,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: u32) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }
}
