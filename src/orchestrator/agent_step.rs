//! Agent Step (C4, `spec.md` §4.4).
//!
//! Executes one node end-to-end: builds the prompt, drives the LLM/tool-call
//! loop, retries transient failures with backoff. The tool-call convention
//! (a `{"tool_call": {"name": ..., "parameters": ...}}` JSON fragment inside
//! the assistant's reply, brace-counted out of the surrounding text) mirrors
//! `Agent::send`/`Agent::parse_tool_call` in `src/cloudllm/agent.rs`.

use crate::orchestrator::event_bus::EventBus;
use crate::orchestrator::execution::{NodeResult, NodeStatus};
use crate::orchestrator::registry::{
    ChatMessage, ChatRole, LlmCallError, ModelRegistry, ToolRegistry,
};
use crate::orchestrator::team::Node;
use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Failures that end a node run outright (no further retry is possible).
#[derive(Debug, Clone)]
pub enum AgentStepError {
    UnknownModel,
    UnknownTool(String),
    Permanent(String),
    Cancelled,
}

impl std::fmt::Display for AgentStepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStepError::UnknownModel => write!(f, "unknown model"),
            AgentStepError::UnknownTool(name) => write!(f, "unknown tool: {}", name),
            AgentStepError::Permanent(msg) => write!(f, "{}", msg),
            AgentStepError::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Exponential backoff schedule for transient LLM failures: 1s, 2s, 4s
/// (three retries, four attempts total) — `spec.md` §4.4.
const BACKOFF_SCHEDULE: &[Duration] = &[
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Run `node` to completion and return its [`NodeResult`].
///
/// `upstream_summaries` is rendered into the user turn alongside the
/// execution's `task`/`parameters`; `max_iterations` bounds the tool-call loop.
#[allow(clippy::too_many_arguments)]
pub async fn run_node(
    execution_id: Uuid,
    node: &Node,
    task: &str,
    parameters: &Value,
    upstream_summaries: &[(String, String)],
    models: &dyn ModelRegistry,
    tools: &dyn ToolRegistry,
    event_bus: &std::sync::Arc<EventBus>,
    cancellation: &CancellationToken,
    max_iterations: u32,
) -> NodeResult {
    let started_at = Utc::now();
    let mut result = NodeResult {
        status: NodeStatus::Running,
        output: String::new(),
        error: None,
        attempts: 0,
        started_at: Some(started_at),
        completed_at: None,
    };

    let outcome = run_inner(
        execution_id,
        node,
        task,
        parameters,
        upstream_summaries,
        models,
        tools,
        event_bus,
        cancellation,
        max_iterations,
        &mut result.attempts,
    )
    .await;

    result.completed_at = Some(Utc::now());
    match outcome {
        Ok(output) => {
            result.status = NodeStatus::Success;
            result.output = output;
        }
        Err(err) => {
            result.status = NodeStatus::Failed;
            result.error = Some(err.to_string());
        }
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_inner(
    execution_id: Uuid,
    node: &Node,
    task: &str,
    parameters: &Value,
    upstream_summaries: &[(String, String)],
    models: &dyn ModelRegistry,
    tools: &dyn ToolRegistry,
    event_bus: &std::sync::Arc<EventBus>,
    cancellation: &CancellationToken,
    max_iterations: u32,
    attempts: &mut u32,
) -> Result<String, AgentStepError> {
    let client = models
        .resolve(&node.agent_config.model_ref.provider_tag, &node.agent_config.model_ref.model_id)
        .await
        .ok_or(AgentStepError::UnknownModel)?;

    let mut history = vec![
        ChatMessage { role: ChatRole::System, content: node.agent_config.instructions.clone() },
        ChatMessage { role: ChatRole::User, content: build_user_turn(task, parameters, upstream_summaries) },
    ];

    let mut iteration = 0;
    loop {
        if cancellation.is_cancelled() {
            return Err(AgentStepError::Cancelled);
        }

        let response = retrying_complete(
            client.as_ref(),
            &history,
            node.agent_config.temperature,
            node.agent_config.max_tokens,
            execution_id,
            &node.id,
            event_bus,
            cancellation,
            attempts,
        )
        .await?;

        match parse_tool_call(&response) {
            Some(call) if iteration < max_iterations => {
                iteration += 1;
                let tool = tools
                    .lookup(&call.name)
                    .await
                    .ok_or_else(|| AgentStepError::UnknownTool(call.name.clone()))?;

                let tool_started = std::time::Instant::now();
                let tool_output = tool
                    .invoke(call.parameters.clone())
                    .await
                    .map_err(|e| AgentStepError::Permanent(format!("tool '{}' failed: {}", call.name, e)))?;
                let duration_ms = tool_started.elapsed().as_millis() as u64;

                let output_hash = format!("{:x}", Sha256::digest(tool_output.as_bytes()));
                let _ = event_bus
                    .publish(
                        execution_id,
                        "tool_call",
                        Some(node.id.clone()),
                        Some(node.id.clone()),
                        None,
                        None,
                        json!({
                            "tool": call.name,
                            "input": call.parameters,
                            "output_hash": output_hash,
                            "duration_ms": duration_ms,
                        }),
                    )
                    .await;

                history.push(ChatMessage { role: ChatRole::Assistant, content: response });
                history.push(ChatMessage {
                    role: ChatRole::User,
                    content: format!("Tool '{}' result:\n{}", call.name, tool_output),
                });
            }
            _ => return Ok(response),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn retrying_complete(
    client: &dyn crate::orchestrator::registry::LlmClient,
    history: &[ChatMessage],
    temperature: f32,
    max_tokens: u32,
    execution_id: Uuid,
    node_id: &str,
    event_bus: &std::sync::Arc<EventBus>,
    cancellation: &CancellationToken,
    attempts: &mut u32,
) -> Result<String, AgentStepError> {
    let mut last_error = String::new();
    for (idx, backoff) in std::iter::once(None)
        .chain(BACKOFF_SCHEDULE.iter().map(Some))
        .enumerate()
    {
        if let Some(delay) = backoff {
            let _ = event_bus
                .publish(
                    execution_id,
                    "llm_retry",
                    Some(node_id.to_string()),
                    None,
                    None,
                    Some(last_error.clone()),
                    json!({ "attempt": idx + 1 }),
                )
                .await;
            tokio::select! {
                _ = tokio::time::sleep(*delay) => {}
                _ = cancellation.cancelled() => return Err(AgentStepError::Cancelled),
            }
        }
        *attempts += 1;
        match client.complete(history, temperature, max_tokens).await {
            Ok(text) => return Ok(text),
            Err(LlmCallError::Transient(msg)) => {
                last_error = msg;
                continue;
            }
            Err(LlmCallError::Permanent(msg)) => return Err(AgentStepError::Permanent(msg)),
        }
    }
    Err(AgentStepError::Permanent(format!(
        "exhausted retries: {}",
        last_error
    )))
}

struct ToolCall {
    name: String,
    parameters: Value,
}

/// Locate a `{"tool_call": {"name": ..., "parameters": ...}}` fragment via
/// brace counting, the same convention `Agent::parse_tool_call` uses.
fn parse_tool_call(response: &str) -> Option<ToolCall> {
    let start_idx = response.find("{\"tool_call\"")?;
    let chars: Vec<char> = response.chars().collect();
    let mut brace_count = 0;
    let mut end_idx = start_idx;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in chars.iter().enumerate().skip(start_idx) {
        if in_string {
            if escaped {
                escaped = false;
            } else if *ch == '\\' {
                escaped = true;
            } else if *ch == '"' {
                in_string = false;
            }
            continue;
        }
        match *ch {
            '"' => in_string = true,
            '{' => brace_count += 1,
            '}' => {
                brace_count -= 1;
                if brace_count == 0 {
                    end_idx = i + 1;
                    break;
                }
            }
            _ => {}
        }
    }
    if end_idx <= start_idx {
        return None;
    }
    let json_str: String = chars[start_idx..end_idx].iter().collect();
    let parsed: Value = serde_json::from_str(&json_str).ok()?;
    let call = parsed.get("tool_call")?;
    let name = call.get("name")?.as_str()?.to_string();
    let parameters = call.get("parameters")?.clone();
    Some(ToolCall { name, parameters })
}

/// Re-invoke a single model with a standalone prompt — no tool-call loop, no
/// retry schedule. Used by the Structured Output Parser's corrective re-ask
/// (`spec.md` §4.5, §9 "Structured-output loop").
pub async fn reinvoke(
    models: &dyn ModelRegistry,
    model_ref: &crate::orchestrator::team::ModelRef,
    temperature: f32,
    max_tokens: u32,
    prompt: String,
) -> Result<String, String> {
    let client = models
        .resolve(&model_ref.provider_tag, &model_ref.model_id)
        .await
        .ok_or_else(|| "unknown model".to_string())?;
    client
        .complete(&[ChatMessage { role: ChatRole::User, content: prompt }], temperature, max_tokens)
        .await
        .map_err(|e| e.to_string())
}

fn build_user_turn(task: &str, parameters: &Value, upstream_summaries: &[(String, String)]) -> String {
    let mut turn = task.to_string();
    if !upstream_summaries.is_empty() {
        turn.push_str("\n\nUpstream results:\n");
        for (node_id, output) in upstream_summaries {
            turn.push_str(&format!("- {}: {}\n", node_id, output));
        }
    }
    if !parameters.is_null() {
        turn.push_str(&format!("\n\nParameters: {}", parameters));
    }
    turn
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::event_bus::EventBus;
    use crate::orchestrator::registry::{InMemoryModelRegistry, InMemoryToolRegistry};
    use crate::orchestrator::repository::InMemoryRepository;
    use crate::orchestrator::team::{AgentConfig, ModelRef, NodeKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn test_node() -> Node {
        Node {
            id: "a1".to_string(),
            name: "Agent 1".to_string(),
            kind: NodeKind::Agent,
            agent_config: AgentConfig {
                role: "worker".to_string(),
                instructions: "be helpful".to_string(),
                model_ref: ModelRef { provider_tag: "mock".to_string(), model_id: "mock".to_string() },
                tools: vec!["echo".to_string()],
                temperature: 0.0,
                max_tokens: 256,
            },
            coordination_strategy: None,
        }
    }

    struct ScriptedClient {
        responses: std::sync::Mutex<Vec<Result<String, LlmCallError>>>,
    }

    #[async_trait]
    impl crate::orchestrator::registry::LlmClient for ScriptedClient {
        async fn complete(&self, _messages: &[ChatMessage], _t: f32, _m: u32) -> Result<String, LlmCallError> {
            self.responses.lock().unwrap().remove(0)
        }
    }

    struct EchoTool {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl crate::orchestrator::registry::Tool for EchoTool {
        async fn invoke(&self, arguments: Value) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(arguments.to_string())
        }
    }

    #[tokio::test]
    async fn direct_response_without_tool_call() {
        let client = Arc::new(ScriptedClient { responses: std::sync::Mutex::new(vec![Ok("pong".to_string())]) });
        let models = InMemoryModelRegistry::new().register("mock", "mock", client);
        let tools = InMemoryToolRegistry::new();
        let repo = InMemoryRepository::new();
        let bus = EventBus::new(repo, std::time::Duration::from_secs(30));
        let cancellation = CancellationToken::new();

        let result = run_node(
            Uuid::new_v4(),
            &test_node(),
            "ping",
            &Value::Null,
            &[],
            &models,
            &tools,
            &bus,
            &cancellation,
            5,
        )
        .await;

        assert_eq!(result.status, NodeStatus::Success);
        assert_eq!(result.output, "pong");
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn retries_transient_failure_then_succeeds() {
        let client = Arc::new(ScriptedClient {
            responses: std::sync::Mutex::new(vec![
                Err(LlmCallError::Transient("rate limited".to_string())),
                Ok("pong".to_string()),
            ]),
        });
        let models = InMemoryModelRegistry::new().register("mock", "mock", client);
        let tools = InMemoryToolRegistry::new();
        let repo = InMemoryRepository::new();
        let bus = EventBus::new(repo, std::time::Duration::from_secs(30));
        let cancellation = CancellationToken::new();

        let result = run_node(
            Uuid::new_v4(),
            &test_node(),
            "ping",
            &Value::Null,
            &[],
            &models,
            &tools,
            &bus,
            &cancellation,
            5,
        )
        .await;

        assert_eq!(result.status, NodeStatus::Success);
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let client = Arc::new(ScriptedClient {
            responses: std::sync::Mutex::new(vec![Err(LlmCallError::Permanent("bad auth".to_string()))]),
        });
        let models = InMemoryModelRegistry::new().register("mock", "mock", client);
        let tools = InMemoryToolRegistry::new();
        let repo = InMemoryRepository::new();
        let bus = EventBus::new(repo, std::time::Duration::from_secs(30));
        let cancellation = CancellationToken::new();

        let result = run_node(
            Uuid::new_v4(),
            &test_node(),
            "ping",
            &Value::Null,
            &[],
            &models,
            &tools,
            &bus,
            &cancellation,
            5,
        )
        .await;

        assert_eq!(result.status, NodeStatus::Failed);
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn tool_call_is_dispatched_and_hashed() {
        let tool_response = "{\"tool_call\": {\"name\": \"echo\", \"parameters\": {\"x\": 1}}}";
        let client = Arc::new(ScriptedClient {
            responses: std::sync::Mutex::new(vec![Ok(tool_response.to_string()), Ok("final answer".to_string())]),
        });
        let models = InMemoryModelRegistry::new().register("mock", "mock", client);
        let echo = Arc::new(EchoTool { calls: AtomicUsize::new(0) });
        let tools = InMemoryToolRegistry::new().register("echo", echo.clone());
        let repo = InMemoryRepository::new();
        let bus = EventBus::new(repo, std::time::Duration::from_secs(30));
        let cancellation = CancellationToken::new();

        let result = run_node(
            Uuid::new_v4(),
            &test_node(),
            "ping",
            &Value::Null,
            &[],
            &models,
            &tools,
            &bus,
            &cancellation,
            5,
        )
        .await;

        assert_eq!(result.status, NodeStatus::Success);
        assert_eq!(result.output, "final answer");
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }
}
