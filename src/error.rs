//! Typed error kinds surfaced by the gateway (spec.md §7) plus the
//! reconciler-internal error used by the pool and sandbox controllers.

use kube::runtime::controller::Action;
use std::time::Duration;

/// Errors returned by the execution gateway's HTTP surface.
///
/// Each variant maps to exactly one HTTP status code; see
/// [`GatewayError::status_code`].
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status code this error maps to, per spec.md §7's propagation
    /// policy table.
    pub fn status_code(&self) -> hyper::StatusCode {
        use hyper::StatusCode;
        match self {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Invalid(_) => StatusCode::BAD_REQUEST,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable kind string for the JSON error body.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::NotFound(_) => "NotFound",
            GatewayError::Unavailable(_) => "Unavailable",
            GatewayError::Timeout(_) => "Timeout",
            GatewayError::Invalid(_) => "Invalid",
            GatewayError::Conflict(_) => "Conflict",
            GatewayError::Internal(_) => "Internal",
        }
    }
}

impl From<kube::Error> for GatewayError {
    fn from(source: kube::Error) -> Self {
        GatewayError::Internal(source.to_string())
    }
}

impl From<tonic::Status> for GatewayError {
    fn from(source: tonic::Status) -> Self {
        match source.code() {
            tonic::Code::NotFound => GatewayError::NotFound(source.message().to_string()),
            tonic::Code::DeadlineExceeded => GatewayError::Timeout(source.message().to_string()),
            tonic::Code::Unavailable => GatewayError::Unavailable(source.message().to_string()),
            tonic::Code::InvalidArgument => GatewayError::Invalid(source.message().to_string()),
            _ => GatewayError::Internal(source.to_string()),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(source: serde_json::Error) -> Self {
        GatewayError::Invalid(source.to_string())
    }
}

/// Error type for the pool and sandbox reconcilers.
///
/// Reconciliation errors are logged, counted, and retried via the queue's
/// backoff; per spec.md §7 they never propagate to the user, so this type
/// carries only enough context for logging and the requeue decision.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct ReconcileError {
    #[from]
    pub source: anyhow::Error,
}

/// Standard error policy for reconcilers: log and requeue with backoff.
/// Reconciliation never panics on missing owned objects (concurrent
/// deletion is expected) and never blocks the queue on a persistent
/// failure. `backoff` comes from `ReconcilerConfig::error_backoff_seconds`.
pub fn reconcile_backoff(error: &ReconcileError, backoff: Duration) -> Action {
    tracing::warn!(error = %error.source, backoff_seconds = backoff.as_secs(), "reconcile error, requeuing with backoff");
    Action::requeue(backoff)
}
