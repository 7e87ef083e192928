//! End-to-end scenarios for the Agent Team Orchestration Core, exercised
//! through `ExecutionManager` with hand-written mock `LlmClient`s — no live
//! network calls, matching the teacher's `MockClient` convention in
//! `tests/orchestration_tests.rs`.

use agentgraph::orchestrator::error::Error;
use agentgraph::orchestrator::event_bus::{EventBus, StreamItem};
use agentgraph::orchestrator::execution::{ExecutionInput, ExecutionStatus};
use agentgraph::orchestrator::manager::ExecutionManager;
use agentgraph::orchestrator::registry::{
    ChatMessage, InMemoryModelRegistry, InMemoryToolRegistry, LlmCallError, LlmClient,
};
use agentgraph::orchestrator::repository::{ExecutionLogRepository, InMemoryRepository, TeamRepository};
use agentgraph::orchestrator::team::{AgentConfig, CoordinationStrategy, Edge, ModelRef, Node, NodeKind, Team, TopologyConfig};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct ScriptedClient(String);

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn complete(&self, _m: &[ChatMessage], _t: f32, _mt: u32) -> Result<String, LlmCallError> {
        Ok(self.0.clone())
    }
}

/// Returns a fixed sequence of responses, one per call; panics if exhausted.
struct SequencedClient(std::sync::Mutex<Vec<String>>);

#[async_trait]
impl LlmClient for SequencedClient {
    async fn complete(&self, _m: &[ChatMessage], _t: f32, _mt: u32) -> Result<String, LlmCallError> {
        Ok(self.0.lock().unwrap().remove(0))
    }
}

fn single_agent_node(id: &str, kind: NodeKind, strategy: Option<CoordinationStrategy>) -> Node {
    Node {
        id: id.to_string(),
        name: id.to_string(),
        kind,
        agent_config: AgentConfig {
            role: "r".to_string(),
            instructions: "i".to_string(),
            model_ref: ModelRef { provider_tag: "mock".to_string(), model_id: id.to_string() },
            tools: vec![],
            temperature: 0.0,
            max_tokens: 256,
        },
        coordination_strategy: strategy,
    }
}

fn single_agent_team(name: &str) -> Team {
    let mut nodes = HashMap::new();
    nodes.insert("g".to_string(), single_agent_node("g", NodeKind::GlobalSupervisor, Some(CoordinationStrategy::Sequential)));
    nodes.insert("a1".to_string(), single_agent_node("a1", NodeKind::Agent, None));
    let topology = TopologyConfig {
        nodes,
        edges: vec![Edge { source_id: "g".to_string(), target_id: "a1".to_string(), condition_label: None }],
        entry_point: "g".to_string(),
        output_schema: None,
    };
    Team::new(name, topology)
}

async fn wait_for_terminal(manager: &ExecutionManager, execution_id: uuid::Uuid) -> ExecutionStatus {
    for _ in 0..200 {
        let execution = manager.get(execution_id).await.unwrap();
        if execution.status.is_terminal() {
            return execution.status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("execution {} never reached a terminal state", execution_id);
}

/// S4 — Concurrency cap: with `N_max=2`, a third concurrent trigger is
/// rejected with 429/`CONCURRENCY_LIMIT`; after one completes, a fresh
/// trigger is admitted again.
#[tokio::test]
async fn s4_concurrency_cap_rejects_then_recovers() {
    let teams: Arc<dyn TeamRepository> = InMemoryRepository::new();
    let executions = InMemoryRepository::new();
    let logs = InMemoryRepository::new();
    let event_bus = EventBus::new(logs, Duration::from_secs(30));
    let models = Arc::new(
        InMemoryModelRegistry::new()
            .register("mock", "g", Arc::new(ScriptedClient("g-out".to_string())))
            .register("mock", "a1", Arc::new(ScriptedClient("a1-out".to_string()))),
    );
    let tools = Arc::new(InMemoryToolRegistry::new());

    let team = single_agent_team("concurrency-cap");
    let team_id = team.id;
    teams.insert(team).await.unwrap();

    let manager = ExecutionManager::new(teams, executions, event_bus, models, tools, 2, Duration::from_secs(30));

    let first = manager.trigger(team_id, ExecutionInput { task: "1".to_string(), parameters: Value::Null }, None).await.unwrap();
    let _second = manager.trigger(team_id, ExecutionInput { task: "2".to_string(), parameters: Value::Null }, None).await.unwrap();

    let third = manager.trigger(team_id, ExecutionInput { task: "3".to_string(), parameters: Value::Null }, None).await;
    assert!(matches!(third, Err(Error::ConcurrencyLimitExceeded)));

    assert_eq!(wait_for_terminal(&manager, first.id).await, ExecutionStatus::Success);

    let fourth = manager.trigger(team_id, ExecutionInput { task: "4".to_string(), parameters: Value::Null }, None).await;
    assert!(fourth.is_ok());
}

/// S5 — Resumable stream: a subscriber that resumes with `since_sequence=5`
/// sees exactly the events with `sequence > 5`, with no gaps or duplicates
/// relative to the full log.
#[tokio::test]
async fn s5_resumable_stream_has_no_gap_or_duplicate() {
    let teams: Arc<dyn TeamRepository> = InMemoryRepository::new();
    let executions = InMemoryRepository::new();
    let logs = InMemoryRepository::new();
    let event_bus = EventBus::new(logs.clone(), Duration::from_secs(30));
    let models = Arc::new(
        InMemoryModelRegistry::new()
            .register("mock", "g", Arc::new(ScriptedClient("g-out".to_string())))
            .register("mock", "a1", Arc::new(ScriptedClient("a1-out".to_string()))),
    );
    let tools = Arc::new(InMemoryToolRegistry::new());

    let team = single_agent_team("resumable-stream");
    let team_id = team.id;
    teams.insert(team).await.unwrap();

    let manager = ExecutionManager::new(teams, executions, event_bus.clone(), models, tools, 2, Duration::from_secs(30));
    let execution = manager.trigger(team_id, ExecutionInput { task: "ping".to_string(), parameters: Value::Null }, None).await.unwrap();
    assert_eq!(wait_for_terminal(&manager, execution.id).await, ExecutionStatus::Success);

    let full_log = logs.list_since(execution.id, 0).await;
    assert!(full_log.len() >= 4, "expected at least execution_started/node_entered/node_completed/execution_completed");

    let cutoff = full_log[1].sequence;
    let resumed = event_bus.subscribe(execution.id, Some(cutoff));
    tokio::pin!(resumed);
    let mut resumed_sequences = Vec::new();
    while let Some(item) = resumed.next().await {
        match item {
            Ok(StreamItem::Log(log)) => resumed_sequences.push(log.sequence),
            Ok(StreamItem::Heartbeat { .. }) => break,
            Err(_) => break,
        }
    }

    let expected: Vec<u64> = full_log.iter().map(|l| l.sequence).filter(|s| *s > cutoff).collect();
    assert_eq!(resumed_sequences, expected);
}

/// S6 — Structured output retry: the terminal node's LLM returns an invalid
/// value once, then a schema-satisfying one; the execution still succeeds
/// with `output.structured` populated and no `parse_error`.
#[tokio::test]
async fn s6_structured_output_retries_then_succeeds() {
    let teams: Arc<dyn TeamRepository> = InMemoryRepository::new();
    let executions = InMemoryRepository::new();
    let logs = InMemoryRepository::new();
    let event_bus = EventBus::new(logs, Duration::from_secs(30));
    let models = Arc::new(
        InMemoryModelRegistry::new()
            .register("mock", "g", Arc::new(SequencedClient(std::sync::Mutex::new(vec!["hello".to_string(), "{\"answer\":42}".to_string()]))))
            .register("mock", "a1", Arc::new(ScriptedClient("hello".to_string()))),
    );
    let tools = Arc::new(InMemoryToolRegistry::new());

    let mut team = single_agent_team("structured-output-retry");
    team.topology.output_schema = Some(json!({"type": "object", "required": ["answer"]}));
    teams.insert(team.clone()).await.unwrap();

    let manager = ExecutionManager::new(teams, executions, event_bus, models, tools, 2, Duration::from_secs(30));
    let execution = manager.trigger(team.id, ExecutionInput { task: "ping".to_string(), parameters: Value::Null }, None).await.unwrap();
    assert_eq!(wait_for_terminal(&manager, execution.id).await, ExecutionStatus::Success);

    let stored = manager.get(execution.id).await.unwrap();
    assert_eq!(stored.output.structured, Some(json!({"answer": 42})));
    assert!(stored.parse_error.is_none());
}

/// S6 (failure branch) — if every attempt fails to parse, the execution
/// still completes SUCCESS with the raw text and a `parse_error` set.
#[tokio::test]
async fn s6_structured_output_gives_up_but_stays_success() {
    let teams: Arc<dyn TeamRepository> = InMemoryRepository::new();
    let executions = InMemoryRepository::new();
    let logs = InMemoryRepository::new();
    let event_bus = EventBus::new(logs, Duration::from_secs(30));
    let models = Arc::new(
        InMemoryModelRegistry::new()
            .register("mock", "g", Arc::new(ScriptedClient("not json".to_string())))
            .register("mock", "a1", Arc::new(ScriptedClient("not json".to_string()))),
    );
    let tools = Arc::new(InMemoryToolRegistry::new());

    let mut team = single_agent_team("structured-output-gives-up");
    team.topology.output_schema = Some(json!({"type": "object", "required": ["answer"]}));
    teams.insert(team.clone()).await.unwrap();

    let manager = ExecutionManager::new(teams, executions, event_bus, models, tools, 2, Duration::from_secs(30));
    let execution = manager.trigger(team.id, ExecutionInput { task: "ping".to_string(), parameters: Value::Null }, None).await.unwrap();
    assert_eq!(wait_for_terminal(&manager, execution.id).await, ExecutionStatus::Success);

    let stored = manager.get(execution.id).await.unwrap();
    assert!(stored.output.structured.is_none());
    assert!(stored.parse_error.is_some());
    assert!(stored.output.raw.is_some());
}
