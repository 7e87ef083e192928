//! Data model for Executions, NodeResults, and ExecutionLogs (`spec.md` §3).

use crate::orchestrator::team::TopologyConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Per-execution terminal/non-terminal status (`spec.md` §4.2 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal statuses are absorbing: re-entry from one is a programming error.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success
                | ExecutionStatus::Failed
                | ExecutionStatus::Timeout
                | ExecutionStatus::Cancelled
        )
    }
}

/// Per-node outcome within one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

/// Outcome of running a single node to completion (or skip).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub status: NodeStatus,
    pub output: String,
    pub error: Option<String>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl NodeResult {
    pub fn pending() -> Self {
        Self {
            status: NodeStatus::Pending,
            output: String::new(),
            error: None,
            attempts: 0,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Free-form trigger input: a task description plus caller-supplied parameters.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutionInput {
    pub task: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// Final aggregated output of an execution, optionally schema-validated (C5).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutionOutput {
    /// Always present once the graph runner produces a candidate string.
    pub raw: Option<String>,
    /// Present only if structured-output validation (C5) succeeded.
    pub structured: Option<serde_json::Value>,
}

/// One instantiation of a [`crate::orchestrator::team::Team`] (`spec.md` §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub team_id: Uuid,
    pub topology_snapshot: TopologyConfig,
    pub input: ExecutionInput,
    pub output: ExecutionOutput,
    pub output_schema: Option<serde_json::Value>,
    pub parse_error: Option<String>,
    pub node_results: HashMap<String, NodeResult>,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
}

impl Execution {
    pub fn new(
        team_id: Uuid,
        topology_snapshot: TopologyConfig,
        input: ExecutionInput,
        output_schema: Option<serde_json::Value>,
    ) -> Self {
        let node_results = topology_snapshot
            .nodes
            .keys()
            .map(|id| (id.clone(), NodeResult::pending()))
            .collect();
        Self {
            id: Uuid::new_v4(),
            team_id,
            topology_snapshot,
            input,
            output: ExecutionOutput::default(),
            output_schema,
            parse_error: None,
            node_results,
            status: ExecutionStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error_message: None,
        }
    }

    /// Transition to `RUNNING`. Panics if not currently `PENDING` — a
    /// terminal or already-running execution re-entering is a programming error.
    pub fn mark_running(&mut self) {
        assert_eq!(
            self.status,
            ExecutionStatus::Pending,
            "programming error: execution {} re-entered RUNNING from {:?}",
            self.id,
            self.status
        );
        self.status = ExecutionStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Transition into a terminal status exactly once. Panics on re-entry.
    pub fn mark_terminal(&mut self, status: ExecutionStatus, error_message: Option<String>) {
        assert!(status.is_terminal(), "mark_terminal called with {:?}", status);
        assert!(
            !self.status.is_terminal(),
            "programming error: execution {} re-entered terminal state from {:?}",
            self.id,
            self.status
        );
        self.status = status;
        self.error_message = error_message;
        let now = Utc::now();
        self.completed_at = Some(now);
        if let Some(started_at) = self.started_at {
            self.duration_ms = Some((now - started_at).num_milliseconds());
        }
    }
}

/// Append-only ordered event record (`spec.md` §3, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub node_id: Option<String>,
    pub agent_id: Option<String>,
    pub supervisor_id: Option<String>,
    pub message: Option<String>,
    pub extra_data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "programming error")]
    fn terminal_reentry_panics() {
        let topology = TopologyConfig {
            nodes: HashMap::new(),
            edges: vec![],
            entry_point: "g".to_string(),
            output_schema: None,
        };
        let mut exec = Execution::new(Uuid::new_v4(), topology, ExecutionInput::default(), None);
        exec.mark_running();
        exec.mark_terminal(ExecutionStatus::Success, None);
        exec.mark_terminal(ExecutionStatus::Failed, None);
    }
}
