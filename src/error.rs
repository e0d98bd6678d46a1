// =============================================================================
// Service errors — one variant per machine-readable error kind
// =============================================================================
//
// Every error carries a stable `code()` string that appears verbatim in RPC
// responses and error frames. The risk path never substitutes defaults for
// missing upstream data: unavailability is its own error kind, surfaced to
// the caller.
// =============================================================================

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed service error. The `Display` text is the human-readable message;
/// `code()` is the stable machine-readable identifier.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("authentication required")]
    Unauthenticated,

    #[error("forbidden")]
    Forbidden,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// No fresh price within the cache TTL. Never answered from stale data.
    #[error("no fresh price for {0}")]
    PriceUnavailable(String),

    /// The account monitor could not provide account state.
    #[error("account state unavailable: {0}")]
    AccountUnavailable(String),

    #[error("rate limited")]
    RateLimited,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("policy violation")]
    PolicyViolation,

    #[error("emergency stop active")]
    EmergencyStopActive,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code carried in RPC error bodies and error
    /// frames on the streaming transport.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::PriceUnavailable(_) => "price_unavailable",
            Self::AccountUnavailable(_) => "account_unavailable",
            Self::RateLimited => "rate_limited",
            Self::Timeout(_) => "timeout",
            Self::Serialization(_) => "serialization_error",
            Self::PolicyViolation => "policy_violation",
            Self::EmergencyStopActive => "emergency_stop_active",
            Self::Internal(_) => "internal",
        }
    }

    /// HTTP status for the REST surface.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) | Self::Serialization(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamUnavailable(_)
            | Self::PriceUnavailable(_)
            | Self::AccountUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::PolicyViolation | Self::EmergencyStopActive => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        (self.status(), axum::Json(body)).into_response()
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

// =============================================================================
// Tests
// =============================================================================
