//! Error kinds for the orchestration core.
//!
//! Mirrors the error taxonomy of `spec.md` §7: every variant maps to exactly
//! one HTTP status at the API boundary and none leak internal detail to
//! clients verbatim.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::fmt;

/// A single topology defect, as produced by the topology validator (C1).
#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub code: String,
    pub path: String,
    pub message: String,
}

/// Errors surfaced by the orchestration core.
///
/// `Internal` is logged with detail via [`log::error!`] at the raise site and
/// never rendered with its inner message in [`IntoResponse`] — only a flat
/// "internal error" body crosses the boundary.
#[derive(Debug)]
pub enum Error {
    /// Topology or input defects the caller can fix. 400.
    Validation(Vec<ValidationIssue>),
    /// Unknown team/execution id. 404.
    NotFound(String),
    /// Name clash, delete-while-running, cancel-while-not-running. 409.
    Conflict(String),
    /// Admission semaphore exhausted. 429.
    ConcurrencyLimitExceeded,
    /// 500, logged with detail, never echoed verbatim.
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Validation(issues) => write!(f, "validation failed: {} issue(s)", issues.len()),
            Error::NotFound(what) => write!(f, "not found: {}", what),
            Error::Conflict(msg) => write!(f, "conflict: {}", msg),
            Error::ConcurrencyLimitExceeded => write!(f, "concurrency limit exceeded"),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn validation_single(code: &str, path: &str, message: impl Into<String>) -> Self {
        Error::Validation(vec![ValidationIssue {
            code: code.to_string(),
            path: path.to_string(),
            message: message.into(),
        }])
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error_code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<Vec<ValidationIssue>>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_code, message, errors) = match self {
            Error::Validation(issues) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                "one or more validation issues were found".to_string(),
                Some(issues),
            ),
            Error::NotFound(what) => (StatusCode::NOT_FOUND, "NOT_FOUND", what, None),
            Error::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg, None),
            Error::ConcurrencyLimitExceeded => (
                StatusCode::TOO_MANY_REQUESTS,
                "CONCURRENCY_LIMIT",
                "no execution slots available".to_string(),
                None,
            ),
            Error::Internal(detail) => {
                log::error!("internal error: {}", detail);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL",
                    "internal error".to_string(),
                    None,
                )
            }
        };
        let body = ErrorBody {
            error_code,
            message,
            errors,
        };
        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
