use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error;

use crate::types::OutcomeKind;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Proxy list error: {0}")]
    ProxyList(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::Config(_) | AppError::ProxyList(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Typed failure of a single logical outbound request. Returned to callers,
/// never raised past the scan or drain loops.
#[derive(Debug, Clone, Error)]
pub enum RequestFailure {
    #[error("retry budget exhausted after {attempts} attempts (last: {last})")]
    Exhausted { attempts: u32, last: OutcomeKind },

    #[error("no usable proxy left after revalidation")]
    PoolExhausted,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("response decode failed: {0}")]
    Decode(String),
}

/// Failure reported by a collaborator (persistence, cache, notifier, model).
/// Callers log it and carry on.
#[derive(Debug, Error)]
pub enum CollabError {
    #[error("persistence unavailable: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("notifier delivery failed: {0}")]
    Notify(String),

    #[error("collaborator request failed: {0}")]
    Request(#[from] RequestFailure),
}
