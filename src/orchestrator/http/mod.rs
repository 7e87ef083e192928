//! HTTP boundary (`spec.md` §6).
//!
//! Thin axum handlers over [`crate::orchestrator::manager::ExecutionManager`]
//! and the repository traits. Every outbound JSON body and SSE frame passes
//! through [`crate::orchestrator::redaction::redact_value`] before leaving the
//! process (`spec.md` §8 invariant 9) — handlers never return a raw `Execution`
//! or `ExecutionLog` without redacting it first.

mod executions;
mod teams;

use crate::orchestrator::event_bus::EventBus;
use crate::orchestrator::manager::ExecutionManager;
use crate::orchestrator::registry::{ModelRegistry, ToolRegistry};
use crate::orchestrator::repository::{ExecutionLogRepository, TeamRepository};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ExecutionManager>,
    pub teams: Arc<dyn TeamRepository>,
    pub logs: Arc<dyn ExecutionLogRepository>,
    pub event_bus: Arc<EventBus>,
    /// Needed to re-validate a topology at `POST /teams` and `PATCH /teams/{id}`
    /// time, independent of any particular execution.
    pub models: Arc<dyn ModelRegistry>,
    pub tools: Arc<dyn ToolRegistry>,
}

/// Assemble the full `axum::Router` for the orchestration API.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/teams", post(teams::create_team))
        .route(
            "/teams/{id}",
            get(teams::get_team).patch(teams::update_team).delete(teams::delete_team),
        )
        .route("/teams/{id}/validate", post(teams::validate_team))
        .route(
            "/teams/{id}/executions",
            post(executions::trigger_execution).get(executions::list_team_executions),
        )
        .route("/executions/{id}", get(executions::get_execution))
        .route("/executions/{id}/stream", get(executions::stream_execution))
        .route("/executions/{id}/cancel", post(executions::cancel_execution))
        .route("/executions/{id}/logs", get(executions::list_logs))
        .with_state(state)
}
