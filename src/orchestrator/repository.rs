//! Persistence contracts for Teams, Executions, and ExecutionLogs
//! (`spec.md` §2 "Store", §6 "Persistence layout").
//!
//! The orchestration core only ever depends on these traits — concrete
//! storage is external (`spec.md` §1). [`InMemoryRepository`] is the
//! reference implementation used by tests and local/single-process
//! deployments; a `sqlx`-backed adapter lives behind the `postgres` feature
//! in `postgres.rs`.

use crate::orchestrator::error::{Error, Result};
use crate::orchestrator::execution::{Execution, ExecutionLog, ExecutionStatus};
use crate::orchestrator::team::Team;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Filters accepted by [`ExecutionRepository::list`].
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilters {
    pub team_id: Option<Uuid>,
    pub status: Option<ExecutionStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: u32,
    pub offset: u32,
}

impl ExecutionFilters {
    pub fn paginated(limit: u32, offset: u32) -> Self {
        Self {
            limit: limit.clamp(1, 100),
            offset,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait TeamRepository: Send + Sync {
    async fn insert(&self, team: Team) -> Result<Team>;
    async fn get(&self, id: Uuid) -> Result<Team>;
    async fn get_by_name(&self, name: &str) -> Option<Team>;
    async fn update(&self, team: Team) -> Result<Team>;
    async fn delete(&self, id: Uuid) -> Result<()>;
    async fn list(&self) -> Vec<Team>;
}

#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    async fn insert(&self, execution: Execution) -> Result<Execution>;
    async fn get(&self, id: Uuid) -> Result<Execution>;
    async fn update(&self, execution: Execution) -> Result<Execution>;
    async fn list(&self, filters: ExecutionFilters) -> Vec<Execution>;
    /// Executions still `PENDING`/`RUNNING` — consulted by startup recovery.
    async fn list_unterminated(&self) -> Vec<Execution>;
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait ExecutionLogRepository: Send + Sync {
    /// Append `log` and return it with the next monotone `sequence` for
    /// `log.execution_id` filled in. Must be called under the per-execution
    /// sequencing lock the event bus holds (`spec.md` §4.6, §5).
    async fn append(&self, log: ExecutionLog) -> Result<ExecutionLog>;
    async fn list_since(&self, execution_id: Uuid, since_sequence: u64) -> Vec<ExecutionLog>;
    async fn highest_sequence(&self, execution_id: Uuid) -> u64;
    async fn delete_for_execution(&self, execution_id: Uuid) -> Result<u64>;
}

/// A single in-process store for all three entities, guarded by short-held
/// `RwLock`s — the same shape as the teacher's `Orchestration.agents:
/// HashMap` field, generalized to three tables.
#[derive(Default)]
pub struct InMemoryRepository {
    teams: RwLock<HashMap<Uuid, Team>>,
    executions: RwLock<HashMap<Uuid, Execution>>,
    logs: RwLock<HashMap<Uuid, Vec<ExecutionLog>>>,
}

impl InMemoryRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl TeamRepository for InMemoryRepository {
    async fn insert(&self, team: Team) -> Result<Team> {
        let mut teams = self.teams.write().await;
        if teams.values().any(|t| t.name == team.name) {
            return Err(Error::Conflict(format!("team name '{}' already exists", team.name)));
        }
        teams.insert(team.id, team.clone());
        Ok(team)
    }

    async fn get(&self, id: Uuid) -> Result<Team> {
        self.teams
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("team {}", id)))
    }

    async fn get_by_name(&self, name: &str) -> Option<Team> {
        self.teams.read().await.values().find(|t| t.name == name).cloned()
    }

    async fn update(&self, team: Team) -> Result<Team> {
        let mut teams = self.teams.write().await;
        if !teams.contains_key(&team.id) {
            return Err(Error::NotFound(format!("team {}", team.id)));
        }
        teams.insert(team.id, team.clone());
        Ok(team)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let running = self
            .executions
            .read()
            .await
            .values()
            .any(|e| e.team_id == id && e.status == ExecutionStatus::Running);
        if running {
            return Err(Error::Conflict("team has a RUNNING execution".to_string()));
        }
        self.teams.write().await.remove(&id);
        Ok(())
    }

    async fn list(&self) -> Vec<Team> {
        self.teams.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryRepository {
    async fn insert(&self, execution: Execution) -> Result<Execution> {
        self.executions.write().await.insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn get(&self, id: Uuid) -> Result<Execution> {
        self.executions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("execution {}", id)))
    }

    async fn update(&self, execution: Execution) -> Result<Execution> {
        self.executions.write().await.insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn list(&self, filters: ExecutionFilters) -> Vec<Execution> {
        let mut results: Vec<Execution> = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| filters.team_id.map(|id| id == e.team_id).unwrap_or(true))
            .filter(|e| filters.status.map(|s| s == e.status).unwrap_or(true))
            .filter(|e| {
                filters
                    .created_after
                    .zip(e.started_at)
                    .map(|(after, started)| started >= after)
                    .unwrap_or(true)
            })
            .filter(|e| {
                filters
                    .created_before
                    .zip(e.started_at)
                    .map(|(before, started)| started <= before)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        results.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let limit = if filters.limit == 0 { 20 } else { filters.limit as usize };
        results.into_iter().skip(filters.offset as usize).take(limit).collect()
    }

    async fn list_unterminated(&self) -> Vec<Execution> {
        self.executions
            .read()
            .await
            .values()
            .filter(|e| !e.status.is_terminal())
            .cloned()
            .collect()
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut executions = self.executions.write().await;
        let expired: Vec<Uuid> = executions
            .values()
            .filter(|e| e.status.is_terminal() && e.completed_at.map(|c| c < cutoff).unwrap_or(false))
            .map(|e| e.id)
            .collect();
        for id in &expired {
            executions.remove(id);
        }
        drop(executions);
        let mut logs = self.logs.write().await;
        for id in &expired {
            logs.remove(id);
        }
        Ok(expired.len() as u64)
    }
}

#[async_trait]
impl ExecutionLogRepository for InMemoryRepository {
    async fn append(&self, log: ExecutionLog) -> Result<ExecutionLog> {
        let mut logs = self.logs.write().await;
        logs.entry(log.execution_id).or_default().push(log.clone());
        Ok(log)
    }

    async fn list_since(&self, execution_id: Uuid, since_sequence: u64) -> Vec<ExecutionLog> {
        self.logs
            .read()
            .await
            .get(&execution_id)
            .map(|rows| rows.iter().filter(|r| r.sequence > since_sequence).cloned().collect())
            .unwrap_or_default()
    }

    async fn highest_sequence(&self, execution_id: Uuid) -> u64 {
        self.logs
            .read()
            .await
            .get(&execution_id)
            .and_then(|rows| rows.last())
            .map(|r| r.sequence)
            .unwrap_or(0)
    }

    async fn delete_for_execution(&self, execution_id: Uuid) -> Result<u64> {
        let removed = self
            .logs
            .write()
            .await
            .remove(&execution_id)
            .map(|rows| rows.len() as u64)
            .unwrap_or(0);
        Ok(removed)
    }
}
