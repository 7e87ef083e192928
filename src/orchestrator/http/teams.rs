//! `/teams` handlers (`spec.md` §6).

use super::AppState;
use crate::orchestrator::error::{Error, Result};
use crate::orchestrator::redaction::redact_value;
use crate::orchestrator::team::{Team, TopologyConfig};
use crate::orchestrator::topology;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Deserialize)]
pub struct CreateTeamRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub topology: TopologyConfig,
    pub timeout_seconds: Option<u32>,
    pub max_iterations: Option<u32>,
}

#[derive(Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<crate::orchestrator::error::ValidationIssue>>,
}

#[derive(Deserialize, Default)]
pub struct TeamPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub topology: Option<TopologyConfig>,
    pub timeout_seconds: Option<u32>,
    pub max_iterations: Option<u32>,
}

pub async fn create_team(
    State(state): State<AppState>,
    Json(body): Json<CreateTeamRequest>,
) -> Result<(StatusCode, Json<Value>)> {
    topology::validate(&body.topology, state.models.as_ref(), state.tools.as_ref())
        .await
        .map_err(Error::Validation)?;

    let mut team = Team::new(body.name, body.topology).with_description(body.description);
    if let Some(timeout) = body.timeout_seconds {
        team = team.with_timeout_seconds(timeout);
    }
    if let Some(max_iterations) = body.max_iterations {
        team = team.with_max_iterations(max_iterations);
    }

    let team = state.teams.insert(team).await?;
    Ok((StatusCode::CREATED, Json(redact_value(&serde_json::to_value(team).unwrap()))))
}

pub async fn validate_team(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<TopologyConfig>>,
) -> Result<Json<ValidationResult>> {
    let candidate = match body {
        Some(Json(topology)) => topology,
        None => state.teams.get(id).await?.topology,
    };
    match topology::validate(&candidate, state.models.as_ref(), state.tools.as_ref()).await {
        Ok(()) => Ok(Json(ValidationResult { valid: true, errors: None })),
        Err(errors) => Ok(Json(ValidationResult { valid: false, errors: Some(errors) })),
    }
}

pub async fn get_team(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Value>> {
    let team = state.teams.get(id).await?;
    Ok(Json(redact_value(&serde_json::to_value(team).unwrap())))
}

pub async fn update_team(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<TeamPatch>,
) -> Result<Json<Value>> {
    let mut team = state.teams.get(id).await?;
    if let Some(topology) = patch.topology {
        topology::validate(&topology, state.models.as_ref(), state.tools.as_ref())
            .await
            .map_err(Error::Validation)?;
        team.topology = topology;
    }
    if let Some(name) = patch.name {
        team.name = name;
    }
    if let Some(description) = patch.description {
        team.description = description;
    }
    if let Some(timeout) = patch.timeout_seconds {
        team.timeout_seconds = timeout;
    }
    if let Some(max_iterations) = patch.max_iterations {
        team.max_iterations = max_iterations;
    }
    team.updated_at = chrono::Utc::now();
    let team = state.teams.update(team).await?;
    Ok(Json(redact_value(&serde_json::to_value(team).unwrap())))
}

pub async fn delete_team(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode> {
    state.teams.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
