//! Execution Manager (C2, `spec.md` §4.2).
//!
//! Owns the per-execution state machine and the admission semaphore that
//! bounds `N_max` concurrent executions. Generalizes the teacher's
//! `Orchestration` (a `HashMap` of named agents driven synchronously by one
//! caller) into a background-task supervisor: `trigger` hands back
//! immediately once a slot is admitted, and a spawned task drives the
//! Graph Runner (C3) to completion, racing a per-team timeout.

use crate::orchestrator::agent_step;
use crate::orchestrator::error::{Error, Result};
use crate::orchestrator::event_bus::EventBus;
use crate::orchestrator::execution::{Execution, ExecutionInput, ExecutionStatus};
use crate::orchestrator::graph_runner;
use crate::orchestrator::registry::{ModelRegistry, ToolRegistry};
use crate::orchestrator::repository::{ExecutionFilters, ExecutionRepository, TeamRepository};
use crate::orchestrator::structured_output;
use crate::orchestrator::topology;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct RunningHandle {
    cancellation: CancellationToken,
}

/// Drives executions end to end: admission, dispatch, cancellation, and
/// startup recovery, per `spec.md` §4.2's state machine and §6's "host
/// restart" semantics.
pub struct ExecutionManager {
    teams: Arc<dyn TeamRepository>,
    executions: Arc<dyn ExecutionRepository>,
    event_bus: Arc<EventBus>,
    models: Arc<dyn ModelRegistry>,
    tools: Arc<dyn ToolRegistry>,
    admission: Arc<Semaphore>,
    running: Arc<Mutex<HashMap<Uuid, RunningHandle>>>,
    default_timeout: Duration,
}

impl ExecutionManager {
    pub fn new(
        teams: Arc<dyn TeamRepository>,
        executions: Arc<dyn ExecutionRepository>,
        event_bus: Arc<EventBus>,
        models: Arc<dyn ModelRegistry>,
        tools: Arc<dyn ToolRegistry>,
        max_concurrent_executions: usize,
        default_timeout: Duration,
    ) -> Self {
        Self {
            teams,
            executions,
            event_bus,
            models,
            tools,
            admission: Arc::new(Semaphore::new(max_concurrent_executions)),
            running: Arc::new(Mutex::new(HashMap::new())),
            default_timeout,
        }
    }

    /// Sweep every `PENDING`/`RUNNING` execution left over from a prior
    /// process into `FAILED` (`spec.md` §6: "a host restart never leaves an
    /// execution stuck mid-flight"). Call once at startup before serving traffic.
    pub async fn recover(&self) {
        for mut execution in self.executions.list_unterminated().await {
            if execution.status == ExecutionStatus::Pending {
                execution.mark_running();
            }
            execution.mark_terminal(ExecutionStatus::Failed, Some("host restart".to_string()));
            if let Err(err) = self.executions.update(execution).await {
                log::error!("startup recovery failed to persist an execution: {}", err);
            }
        }
    }

    /// Admit and start a new execution of `team_id`. Re-validates the
    /// team's topology against the live registries before admitting, since
    /// model/tool availability can drift between team creation and trigger
    /// time (`spec.md` §4.1 "validated again at trigger time").
    pub async fn trigger(
        &self,
        team_id: Uuid,
        input: ExecutionInput,
        output_schema_override: Option<Value>,
    ) -> Result<Execution> {
        let team = self.teams.get(team_id).await?;

        if let Err(issues) = topology::validate(&team.topology, self.models.as_ref(), self.tools.as_ref()).await {
            return Err(Error::Validation(issues));
        }

        let permit = self
            .admission
            .clone()
            .try_acquire_owned()
            .map_err(|_| Error::ConcurrencyLimitExceeded)?;

        let output_schema = output_schema_override.or_else(|| team.topology.output_schema.clone());
        let mut execution = Execution::new(team.id, team.topology.clone(), input, output_schema);
        execution = self.executions.insert(execution).await?;
        execution.mark_running();
        execution = self.executions.update(execution).await?;

        let cancellation = CancellationToken::new();
        self.running.lock().await.insert(
            execution.id,
            RunningHandle { cancellation: cancellation.clone() },
        );

        let executions_repo = Arc::clone(&self.executions);
        let event_bus = Arc::clone(&self.event_bus);
        let models = Arc::clone(&self.models);
        let tools = Arc::clone(&self.tools);
        let running = Arc::clone(&self.running);
        let timeout = if team.timeout_seconds > 0 {
            Duration::from_secs(team.timeout_seconds as u64)
        } else {
            self.default_timeout
        };
        let max_iterations = team.max_iterations;
        let execution_id = execution.id;
        let task = execution.input.task.clone();
        let parameters = execution.input.parameters.clone();
        let topology_snapshot = execution.topology_snapshot.clone();
        let schema = execution.output_schema.clone();
        let entry_model_ref = topology_snapshot
            .nodes
            .get(&topology_snapshot.entry_point)
            .map(|n| (n.agent_config.model_ref.clone(), n.agent_config.temperature, n.agent_config.max_tokens));
        let models_for_schema = Arc::clone(&models);

        tokio::spawn(async move {
            let _permit = permit;
            let mut handle = tokio::spawn(graph_runner::run(
                execution_id,
                topology_snapshot,
                task,
                parameters,
                models,
                tools,
                Arc::clone(&event_bus),
                cancellation.clone(),
                max_iterations,
            ));

            let raced = tokio::select! {
                result = &mut handle => Some(result),
                _ = tokio::time::sleep(timeout) => None,
            };

            let timed_out = raced.is_none();
            let mut panic_message: Option<String> = None;
            let fallback = |cancelled: bool| graph_runner::GraphRunOutcome {
                node_results: HashMap::new(),
                success: false,
                output: String::new(),
                cancelled,
            };
            let outcome = match raced {
                Some(Ok(o)) => o,
                Some(Err(join_err)) => {
                    log::error!("graph runner task for execution {} failed: {}", execution_id, join_err);
                    panic_message = Some(format!("internal error: {}", join_err));
                    fallback(false)
                }
                None => {
                    // Cancel cooperatively and await the same handle so any
                    // in-flight node_skipped events it still publishes land
                    // before we write the terminal event below — never after.
                    cancellation.cancel();
                    match handle.await {
                        Ok(o) => o,
                        Err(join_err) => {
                            log::error!("graph runner task for execution {} failed during cancellation: {}", execution_id, join_err);
                            panic_message = Some(format!("internal error: {}", join_err));
                            fallback(true)
                        }
                    }
                }
            };

            let final_status = if timed_out {
                ExecutionStatus::Timeout
            } else if panic_message.is_some() {
                ExecutionStatus::Failed
            } else if outcome.cancelled {
                ExecutionStatus::Cancelled
            } else if outcome.success {
                ExecutionStatus::Success
            } else {
                ExecutionStatus::Failed
            };

            if let Ok(mut stored) = executions_repo.get(execution_id).await {
                if !outcome.node_results.is_empty() {
                    stored.node_results = outcome.node_results;
                }
                if final_status == ExecutionStatus::Success {
                    if let (Some(schema), Some((model_ref, temperature, max_tokens))) =
                        (schema.as_ref(), entry_model_ref.as_ref())
                    {
                        let enforced = structured_output::enforce(outcome.output, schema, |prompt| {
                            agent_step::reinvoke(
                                models_for_schema.as_ref(),
                                model_ref,
                                *temperature,
                                *max_tokens,
                                prompt,
                            )
                        })
                        .await;
                        stored.output.raw = Some(enforced.raw);
                        stored.output.structured = enforced.structured;
                        stored.parse_error = enforced.parse_error;
                    } else {
                        stored.output.raw = Some(outcome.output);
                    }
                } else if !outcome.output.is_empty() {
                    stored.output.raw = Some(outcome.output);
                }
                let error_message = match final_status {
                    ExecutionStatus::Failed => Some(panic_message.unwrap_or_else(|| "one or more nodes failed".to_string())),
                    ExecutionStatus::Timeout => Some(format!("execution exceeded {}s", timeout.as_secs())),
                    ExecutionStatus::Cancelled => Some("cancelled".to_string()),
                    _ => None,
                };
                stored.mark_terminal(final_status, error_message);
                let event_type = match final_status {
                    ExecutionStatus::Success => "execution_completed",
                    ExecutionStatus::Failed => "execution_failed",
                    ExecutionStatus::Timeout => "execution_timeout",
                    ExecutionStatus::Cancelled => "execution_cancelled",
                    _ => "execution_completed",
                };
                let _ = event_bus
                    .publish(execution_id, event_type, None, None, None, stored.error_message.clone(), Value::Null)
                    .await;
                if let Err(err) = executions_repo.update(stored).await {
                    log::error!("failed to persist terminal execution {}: {}", execution_id, err);
                }
            }

            running.lock().await.remove(&execution_id);
        });

        Ok(execution)
    }

    /// Request cancellation of a running execution. No-op-safe: cancelling
    /// an execution that finished moments ago simply finds nothing to signal.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<()> {
        let running = self.running.lock().await;
        match running.get(&execution_id) {
            Some(handle) => {
                handle.cancellation.cancel();
                Ok(())
            }
            None => {
                let execution = self.executions.get(execution_id).await?;
                if execution.status.is_terminal() {
                    Err(Error::Conflict(format!("execution {} already terminal", execution_id)))
                } else {
                    Err(Error::NotFound(format!("execution {} is not running", execution_id)))
                }
            }
        }
    }

    pub async fn get(&self, execution_id: Uuid) -> Result<Execution> {
        self.executions.get(execution_id).await
    }

    pub async fn list(&self, filters: ExecutionFilters) -> Vec<Execution> {
        self.executions.list(filters).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::event_bus::EventBus;
    use crate::orchestrator::registry::{
        ChatMessage, InMemoryModelRegistry, InMemoryToolRegistry, LlmCallError, LlmClient,
    };
    use crate::orchestrator::repository::InMemoryRepository;
    use crate::orchestrator::team::{AgentConfig, CoordinationStrategy, Edge, ModelRef, Node, NodeKind, Team, TopologyConfig};
    use async_trait::async_trait;

    struct ScriptedClient(String);

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn complete(&self, _m: &[ChatMessage], _t: f32, _mt: u32) -> Result<String, LlmCallError> {
            Ok(self.0.clone())
        }
    }

    fn single_agent_team() -> Team {
        let mut nodes = HashMap::new();
        nodes.insert(
            "g".to_string(),
            Node {
                id: "g".to_string(),
                name: "g".to_string(),
                kind: NodeKind::GlobalSupervisor,
                agent_config: AgentConfig {
                    role: "r".to_string(),
                    instructions: "i".to_string(),
                    model_ref: ModelRef { provider_tag: "mock".to_string(), model_id: "g".to_string() },
                    tools: vec![],
                    temperature: 0.0,
                    max_tokens: 100,
                },
                coordination_strategy: Some(CoordinationStrategy::Sequential),
            },
        );
        nodes.insert(
            "a1".to_string(),
            Node {
                id: "a1".to_string(),
                name: "a1".to_string(),
                kind: NodeKind::Agent,
                agent_config: AgentConfig {
                    role: "r".to_string(),
                    instructions: "i".to_string(),
                    model_ref: ModelRef { provider_tag: "mock".to_string(), model_id: "a1".to_string() },
                    tools: vec![],
                    temperature: 0.0,
                    max_tokens: 100,
                },
                coordination_strategy: None,
            },
        );
        let topology = TopologyConfig {
            nodes,
            edges: vec![Edge { source_id: "g".to_string(), target_id: "a1".to_string(), condition_label: None }],
            entry_point: "g".to_string(),
            output_schema: None,
        };
        Team::new("single-agent", topology)
    }

    #[tokio::test]
    async fn trigger_runs_to_completion_and_releases_slot() {
        let teams: Arc<dyn TeamRepository> = InMemoryRepository::new();
        let executions: Arc<dyn ExecutionRepository> = InMemoryRepository::new();
        let logs = InMemoryRepository::new();
        let event_bus = EventBus::new(logs, Duration::from_secs(30));
        let models = Arc::new(
            InMemoryModelRegistry::new()
                .register("mock", "g", Arc::new(ScriptedClient("g-out".to_string())))
                .register("mock", "a1", Arc::new(ScriptedClient("a1-out".to_string()))),
        );
        let tools = Arc::new(InMemoryToolRegistry::new());

        let team = single_agent_team();
        let team_id = team.id;
        teams.insert(team).await.unwrap();

        let manager = ExecutionManager::new(teams, executions, event_bus, models, tools, 2, Duration::from_secs(30));
        let execution = manager
            .trigger(team_id, ExecutionInput { task: "ping".to_string(), parameters: Value::Null }, None)
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Running);

        let mut attempts = 0;
        loop {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let current = manager.get(execution.id).await.unwrap();
            if current.status.is_terminal() {
                assert_eq!(current.status, ExecutionStatus::Success);
                break;
            }
            attempts += 1;
            assert!(attempts < 100, "execution never reached a terminal state");
        }

        assert_eq!(manager.admission.available_permits(), 2);
    }

    #[tokio::test]
    async fn concurrency_limit_rejects_when_saturated() {
        let teams: Arc<dyn TeamRepository> = InMemoryRepository::new();
        let executions: Arc<dyn ExecutionRepository> = InMemoryRepository::new();
        let logs = InMemoryRepository::new();
        let event_bus = EventBus::new(logs, Duration::from_secs(30));
        let models = Arc::new(
            InMemoryModelRegistry::new()
                .register("mock", "g", Arc::new(ScriptedClient("g-out".to_string())))
                .register("mock", "a1", Arc::new(ScriptedClient("a1-out".to_string()))),
        );
        let tools = Arc::new(InMemoryToolRegistry::new());

        let team = single_agent_team();
        let team_id = team.id;
        teams.insert(team).await.unwrap();

        let manager = ExecutionManager::new(teams, executions, event_bus, models, tools, 0, Duration::from_secs(30));
        let result = manager.trigger(team_id, ExecutionInput::default(), None).await;
        assert!(matches!(result, Err(Error::ConcurrencyLimitExceeded)));
    }
}
