//! `/teams/{id}/executions` and `/executions/{id}` handlers (`spec.md` §6).

use super::AppState;
use crate::orchestrator::error::Result;
use crate::orchestrator::event_bus::{Disconnect, StreamItem};
use crate::orchestrator::execution::{ExecutionInput, ExecutionStatus};
use crate::orchestrator::redaction::{redact_text, redact_value};
use crate::orchestrator::repository::ExecutionFilters;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::convert::Infallible;
use uuid::Uuid;

#[derive(Deserialize)]
pub struct TriggerExecutionRequest {
    pub task: String,
    #[serde(default)]
    pub parameters: Value,
    pub output_schema: Option<Value>,
}

pub async fn trigger_execution(
    State(state): State<AppState>,
    Path(team_id): Path<Uuid>,
    Json(body): Json<TriggerExecutionRequest>,
) -> Result<(StatusCode, Json<Value>)> {
    let input = ExecutionInput { task: body.task, parameters: body.parameters };
    let execution = state.manager.trigger(team_id, input, body.output_schema).await?;
    Ok((StatusCode::CREATED, Json(redact_value(&serde_json::to_value(execution).unwrap()))))
}

pub async fn get_execution(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Value>> {
    let execution = state.manager.get(id).await?;
    Ok(Json(redact_value(&serde_json::to_value(execution).unwrap())))
}

pub async fn cancel_execution(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode> {
    state.manager.cancel(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize, Default)]
pub struct ListExecutionsQuery {
    pub status: Option<ExecutionStatus>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub async fn list_team_executions(
    State(state): State<AppState>,
    Path(team_id): Path<Uuid>,
    Query(query): Query<ListExecutionsQuery>,
) -> Json<Value> {
    let filters = ExecutionFilters {
        team_id: Some(team_id),
        status: query.status,
        created_after: query.started_after,
        created_before: query.started_before,
        ..ExecutionFilters::paginated(query.limit.unwrap_or(20), query.offset.unwrap_or(0))
    };
    let executions = state.manager.list(filters).await;
    Json(redact_value(&serde_json::to_value(executions).unwrap()))
}

#[derive(Deserialize, Default)]
pub struct ListLogsQuery {
    pub event_type: Option<String>,
    pub node_id: Option<String>,
    pub since_sequence: Option<u64>,
}

pub async fn list_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ListLogsQuery>,
) -> Result<Json<Value>> {
    // Confirm the execution exists before returning (possibly empty) logs for it.
    state.manager.get(id).await?;
    let rows = state.logs.list_since(id, query.since_sequence.unwrap_or(0)).await;
    let filtered: Vec<_> = rows
        .into_iter()
        .filter(|r| query.event_type.as_deref().map(|t| r.event_type == t).unwrap_or(true))
        .filter(|r| query.node_id.as_deref().map(|n| r.node_id.as_deref() == Some(n)).unwrap_or(true))
        .collect();
    Ok(Json(redact_value(&serde_json::to_value(filtered).unwrap())))
}

/// `GET /executions/{id}/stream`. Resumes from the `Last-Event-ID` header per
/// `spec.md` §6; every frame is redacted before it crosses the wire.
pub async fn stream_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    state.manager.get(id).await?;

    let since_sequence = headers
        .get("Last-Event-ID")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let events = state.event_bus.subscribe(id, since_sequence);
    let sse_stream = events.map(|item| -> std::result::Result<Event, Infallible> {
        match item {
            Ok(StreamItem::Log(log)) => {
                let redacted = redact_value(&serde_json::to_value(&log).unwrap());
                Ok(Event::default()
                    .id(log.sequence.to_string())
                    .event(log.event_type.clone())
                    .data(redacted.to_string()))
            }
            Ok(StreamItem::Heartbeat { next_sequence, .. }) => {
                Ok(Event::default().event("heartbeat").data(format!("{{\"next_sequence\":{}}}", next_sequence)))
            }
            Err(Disconnect::BufferOverflow) => {
                Ok(Event::default().event("disconnect").data(redact_text("subscriber buffer overflow, reconnect with Last-Event-ID")))
            }
        }
    });

    Ok(Sse::new(sse_stream).keep_alive(KeepAlive::default()))
}
