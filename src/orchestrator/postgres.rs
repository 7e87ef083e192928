//! Postgres-backed repositories (`spec.md` §6 "Persistence layout"), behind
//! the `postgres` feature. Grounded on `tftio-gator`'s `sqlx::PgPool` +
//! hand-mapped row-struct convention from the retrieved pack, since the
//! teacher crate has no SQL persistence layer of its own to draw from.
//!
//! Schema (see `migrations/`): `teams`, `executions`, `execution_logs`, with
//! `(team_id, status, created_at DESC)` on executions and
//! `(execution_id, sequence)` on logs, matching `spec.md` §6.

use crate::orchestrator::error::{Error, Result};
use crate::orchestrator::execution::{Execution, ExecutionLog, ExecutionStatus, NodeResult};
use crate::orchestrator::repository::{ExecutionFilters, ExecutionLogRepository, ExecutionRepository, TeamRepository};
use crate::orchestrator::team::{Team, TeamStatus, TopologyConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use std::collections::HashMap;
use uuid::Uuid;

/// `sqlx`-backed implementation of the three repository traits, all sharing
/// one connection pool (`spec.md` §6).
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run the embedded migrations. Failure here is the `2`
    /// exit code spec.md §6.1 reserves for "migration failed".
    pub async fn connect(database_url: &str) -> std::result::Result<Self, sqlx::Error> {
        let pool = PgPool::connect(database_url).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self::new(pool))
    }
}

#[derive(FromRow)]
struct TeamRow {
    id: Uuid,
    name: String,
    description: String,
    status: String,
    timeout_seconds: i32,
    max_iterations: i32,
    topology: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TeamRow> for Team {
    type Error = Error;

    fn try_from(row: TeamRow) -> Result<Self> {
        Ok(Team {
            id: row.id,
            name: row.name,
            description: row.description,
            status: match row.status.as_str() {
                "ACTIVE" => TeamStatus::Active,
                "INACTIVE" => TeamStatus::Inactive,
                _ => TeamStatus::Error,
            },
            timeout_seconds: row.timeout_seconds as u32,
            max_iterations: row.max_iterations as u32,
            topology: serde_json::from_value::<TopologyConfig>(row.topology)
                .map_err(|e| Error::Internal(format!("corrupt topology row for team {}: {}", row.id, e)))?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn team_status_str(status: TeamStatus) -> &'static str {
    match status {
        TeamStatus::Active => "ACTIVE",
        TeamStatus::Inactive => "INACTIVE",
        TeamStatus::Error => "ERROR",
    }
}

#[async_trait]
impl TeamRepository for PostgresRepository {
    async fn insert(&self, team: Team) -> Result<Team> {
        let topology = serde_json::to_value(&team.topology).map_err(|e| Error::Internal(e.to_string()))?;
        let existing = sqlx::query("SELECT 1 FROM teams WHERE name = $1")
            .bind(&team.name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        if existing.is_some() {
            return Err(Error::Conflict(format!("team name '{}' already exists", team.name)));
        }
        sqlx::query(
            "INSERT INTO teams (id, name, description, status, timeout_seconds, max_iterations, topology, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(team.id)
        .bind(&team.name)
        .bind(&team.description)
        .bind(team_status_str(team.status))
        .bind(team.timeout_seconds as i32)
        .bind(team.max_iterations as i32)
        .bind(topology)
        .bind(team.created_at)
        .bind(team.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(team)
    }

    async fn get(&self, id: Uuid) -> Result<Team> {
        let row: TeamRow = sqlx::query_as("SELECT * FROM teams WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Internal(e.to_string()))?
            .ok_or_else(|| Error::NotFound(format!("team {}", id)))?;
        row.try_into()
    }

    async fn get_by_name(&self, name: &str) -> Option<Team> {
        let row: Option<TeamRow> = sqlx::query_as("SELECT * FROM teams WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten();
        row.and_then(|r| r.try_into().ok())
    }

    async fn update(&self, team: Team) -> Result<Team> {
        let topology = serde_json::to_value(&team.topology).map_err(|e| Error::Internal(e.to_string()))?;
        let result = sqlx::query(
            "UPDATE teams SET name = $2, description = $3, status = $4, timeout_seconds = $5,
             max_iterations = $6, topology = $7, updated_at = $8 WHERE id = $1",
        )
        .bind(team.id)
        .bind(&team.name)
        .bind(&team.description)
        .bind(team_status_str(team.status))
        .bind(team.timeout_seconds as i32)
        .bind(team.max_iterations as i32)
        .bind(topology)
        .bind(team.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("team {}", team.id)));
        }
        Ok(team)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let running: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM executions WHERE team_id = $1 AND status = 'RUNNING'",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;
        if running > 0 {
            return Err(Error::Conflict("team has a RUNNING execution".to_string()));
        }
        sqlx::query("DELETE FROM teams WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(())
    }

    async fn list(&self) -> Vec<Team> {
        sqlx::query_as::<_, TeamRow>("SELECT * FROM teams ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .unwrap_or_default()
            .into_iter()
            .filter_map(|r| r.try_into().ok())
            .collect()
    }
}

#[derive(FromRow)]
struct ExecutionRow {
    id: Uuid,
    team_id: Uuid,
    topology_snapshot: serde_json::Value,
    input_task: String,
    input_parameters: serde_json::Value,
    output_raw: Option<String>,
    output_structured: Option<serde_json::Value>,
    output_schema: Option<serde_json::Value>,
    parse_error: Option<String>,
    node_results: serde_json::Value,
    status: String,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    error_message: Option<String>,
}

fn execution_status_str(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Pending => "PENDING",
        ExecutionStatus::Running => "RUNNING",
        ExecutionStatus::Success => "SUCCESS",
        ExecutionStatus::Failed => "FAILED",
        ExecutionStatus::Timeout => "TIMEOUT",
        ExecutionStatus::Cancelled => "CANCELLED",
    }
}

fn parse_execution_status(value: &str) -> ExecutionStatus {
    match value {
        "PENDING" => ExecutionStatus::Pending,
        "RUNNING" => ExecutionStatus::Running,
        "SUCCESS" => ExecutionStatus::Success,
        "FAILED" => ExecutionStatus::Failed,
        "TIMEOUT" => ExecutionStatus::Timeout,
        _ => ExecutionStatus::Cancelled,
    }
}

impl TryFrom<ExecutionRow> for Execution {
    type Error = Error;

    fn try_from(row: ExecutionRow) -> Result<Self> {
        let corrupt = |e: serde_json::Error| Error::Internal(format!("corrupt execution row {}: {}", row.id, e));
        Ok(Execution {
            id: row.id,
            team_id: row.team_id,
            topology_snapshot: serde_json::from_value(row.topology_snapshot).map_err(corrupt)?,
            input: crate::orchestrator::execution::ExecutionInput {
                task: row.input_task,
                parameters: row.input_parameters,
            },
            output: crate::orchestrator::execution::ExecutionOutput {
                raw: row.output_raw,
                structured: row.output_structured,
            },
            output_schema: row.output_schema,
            parse_error: row.parse_error,
            node_results: serde_json::from_value::<HashMap<String, NodeResult>>(row.node_results).map_err(corrupt)?,
            status: parse_execution_status(&row.status),
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_ms: row.duration_ms,
            error_message: row.error_message,
        })
    }
}

#[async_trait]
impl ExecutionRepository for PostgresRepository {
    async fn insert(&self, execution: Execution) -> Result<Execution> {
        let topology_snapshot =
            serde_json::to_value(&execution.topology_snapshot).map_err(|e| Error::Internal(e.to_string()))?;
        let node_results = serde_json::to_value(&execution.node_results).map_err(|e| Error::Internal(e.to_string()))?;
        sqlx::query(
            "INSERT INTO executions
             (id, team_id, topology_snapshot, input_task, input_parameters, output_raw, output_structured,
              output_schema, parse_error, node_results, status, started_at, completed_at, duration_ms, error_message)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)",
        )
        .bind(execution.id)
        .bind(execution.team_id)
        .bind(topology_snapshot)
        .bind(&execution.input.task)
        .bind(&execution.input.parameters)
        .bind(&execution.output.raw)
        .bind(&execution.output.structured)
        .bind(&execution.output_schema)
        .bind(&execution.parse_error)
        .bind(node_results)
        .bind(execution_status_str(execution.status))
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.duration_ms)
        .bind(&execution.error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(execution)
    }

    async fn get(&self, id: Uuid) -> Result<Execution> {
        let row: ExecutionRow = sqlx::query_as("SELECT * FROM executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Internal(e.to_string()))?
            .ok_or_else(|| Error::NotFound(format!("execution {}", id)))?;
        row.try_into()
    }

    async fn update(&self, execution: Execution) -> Result<Execution> {
        let node_results = serde_json::to_value(&execution.node_results).map_err(|e| Error::Internal(e.to_string()))?;
        sqlx::query(
            "UPDATE executions SET output_raw = $2, output_structured = $3, parse_error = $4, node_results = $5,
             status = $6, started_at = $7, completed_at = $8, duration_ms = $9, error_message = $10 WHERE id = $1",
        )
        .bind(execution.id)
        .bind(&execution.output.raw)
        .bind(&execution.output.structured)
        .bind(&execution.parse_error)
        .bind(node_results)
        .bind(execution_status_str(execution.status))
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.duration_ms)
        .bind(&execution.error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(execution)
    }

    async fn list(&self, filters: ExecutionFilters) -> Vec<Execution> {
        let limit = if filters.limit == 0 { 20 } else { filters.limit } as i64;
        let rows: Vec<ExecutionRow> = sqlx::query_as(
            "SELECT * FROM executions
             WHERE ($1::uuid IS NULL OR team_id = $1)
               AND ($2::text IS NULL OR status = $2)
               AND ($3::timestamptz IS NULL OR started_at >= $3)
               AND ($4::timestamptz IS NULL OR started_at <= $4)
             ORDER BY started_at DESC NULLS LAST
             LIMIT $5 OFFSET $6",
        )
        .bind(filters.team_id)
        .bind(filters.status.map(execution_status_str))
        .bind(filters.created_after)
        .bind(filters.created_before)
        .bind(limit)
        .bind(filters.offset as i64)
        .fetch_all(&self.pool)
        .await
        .unwrap_or_default();
        rows.into_iter().filter_map(|r| r.try_into().ok()).collect()
    }

    async fn list_unterminated(&self) -> Vec<Execution> {
        let rows: Vec<ExecutionRow> =
            sqlx::query_as("SELECT * FROM executions WHERE status IN ('PENDING', 'RUNNING')")
                .fetch_all(&self.pool)
                .await
                .unwrap_or_default();
        rows.into_iter().filter_map(|r| r.try_into().ok()).collect()
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM executions WHERE status NOT IN ('PENDING', 'RUNNING') AND completed_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ExecutionLogRepository for PostgresRepository {
    async fn append(&self, log: ExecutionLog) -> Result<ExecutionLog> {
        let sequence: i64 = sqlx::query_scalar(
            "INSERT INTO execution_logs
             (id, execution_id, sequence, timestamp, event_type, node_id, agent_id, supervisor_id, message, extra_data)
             VALUES ($1, $2,
                     (SELECT COALESCE(MAX(sequence), 0) + 1 FROM execution_logs WHERE execution_id = $2),
                     $3, $4, $5, $6, $7, $8, $9)
             RETURNING sequence",
        )
        .bind(log.id)
        .bind(log.execution_id)
        .bind(log.timestamp)
        .bind(&log.event_type)
        .bind(&log.node_id)
        .bind(&log.agent_id)
        .bind(&log.supervisor_id)
        .bind(&log.message)
        .bind(&log.extra_data)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(ExecutionLog { sequence: sequence as u64, ..log })
    }

    async fn list_since(&self, execution_id: Uuid, since_sequence: u64) -> Vec<ExecutionLog> {
        let rows = sqlx::query(
            "SELECT id, execution_id, sequence, timestamp, event_type, node_id, agent_id, supervisor_id, message, extra_data
             FROM execution_logs WHERE execution_id = $1 AND sequence > $2 ORDER BY sequence ASC",
        )
        .bind(execution_id)
        .bind(since_sequence as i64)
        .fetch_all(&self.pool)
        .await
        .unwrap_or_default();
        rows.into_iter()
            .map(|row| ExecutionLog {
                id: row.get("id"),
                execution_id: row.get("execution_id"),
                sequence: row.get::<i64, _>("sequence") as u64,
                timestamp: row.get("timestamp"),
                event_type: row.get("event_type"),
                node_id: row.get("node_id"),
                agent_id: row.get("agent_id"),
                supervisor_id: row.get("supervisor_id"),
                message: row.get("message"),
                extra_data: row.get("extra_data"),
            })
            .collect()
    }

    async fn highest_sequence(&self, execution_id: Uuid) -> u64 {
        sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MAX(sequence) FROM execution_logs WHERE execution_id = $1",
        )
        .bind(execution_id)
        .fetch_one(&self.pool)
        .await
        .ok()
        .flatten()
        .unwrap_or(0) as u64
    }

    async fn delete_for_execution(&self, execution_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM execution_logs WHERE execution_id = $1")
            .bind(execution_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(result.rows_affected())
    }
}
