// =============================================================================
// Bearer token authentication — constant time, fail secure
// =============================================================================
//
// The expected key comes from configuration. Comparison always examines
// every byte to avoid timing side-channels. Fail-secure rule: when auth is
// enabled and the configured key is empty, every request is rejected —
// a misconfigured gate must deny, never allow.
//
// Usage as an Axum extractor on protected handlers:
//
//   async fn handler(_auth: ApiAuth, ...) { ... }
// =============================================================================

use std::sync::Arc;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use tracing::warn;

use crate::app::AppContext;
use crate::config::AuthConfig;
use crate::error::Error;

// =============================================================================
// Constant-time comparison
// =============================================================================

/// Compare two byte slices in constant time. The loop always visits every
/// byte of equal-length inputs; a length mismatch is observable but the
/// attacker does not control the expected key's length.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Decide whether `token` grants access to `path` under `cfg`.
pub fn token_allowed(cfg: &AuthConfig, path: &str, token: Option<&str>) -> bool {
    if !cfg.enabled {
        return true;
    }
    if cfg.bypass_paths.iter().any(|p| p == path) {
        return true;
    }
    if cfg.api_key.is_empty() {
        warn!("auth enabled with empty api_key — rejecting all requests");
        return false;
    }
    match token {
        Some(token) => constant_time_eq(token.as_bytes(), cfg.api_key.as_bytes()),
        None => false,
    }
}

// =============================================================================
// Extractor
// =============================================================================

/// Extractor validating `Authorization: Bearer <key>` against the configured
/// API key. Bypass paths and disabled auth pass through.
pub struct ApiAuth;

#[async_trait]
impl FromRequestParts<Arc<AppContext>> for ApiAuth {
    type Rejection = Error;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppContext>,
    ) -> Result<Self, Self::Rejection> {
        let cfg = &state.config.auth;
        let path = parts.uri.path().to_string();

        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        if token_allowed(cfg, &path, token) {
            Ok(ApiAuth)
        } else if token.is_none() && cfg.api_key.is_empty() {
            Err(Error::Forbidden)
        } else if token.is_none() {
            warn!(path = %path, "missing authorization header");
            Err(Error::Unauthenticated)
        } else {
            warn!(path = %path, "invalid api key presented");
            Err(Error::Forbidden)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
