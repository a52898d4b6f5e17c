//! Error types and HTTP mapping for the gateway.
//!
//! Every failure surfaced to a caller flows through [`AppError`], which maps
//! each kind to a status code and an OpenAI-shaped `{"error": {...}}` body.
//! Upstream failures carry a retryable/terminal distinction that drives
//! failover in the proxy engine.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::core::config::ConfigError;

/// Main error type for the gateway.
#[derive(Error, Debug)]
pub enum AppError {
    /// Malformed inbound request (missing model, unparsable body).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Rejected configuration edit. Live state is untouched.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The selector produced an empty candidate list. Carries the
    /// per-provider deny breakdown for diagnostics.
    #[error("no provider available for model '{model}'")]
    NoProviderAvailable {
        model: String,
        reasons: BTreeMap<String, String>,
    },

    /// Connect/TLS/DNS failure or timeout before any response byte.
    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),

    /// Non-2xx status from the upstream provider.
    #[error("upstream returned HTTP {status}")]
    UpstreamHttp { status: u16, body: String },

    /// Upstream bytes did not parse as the expected SSE/JSON shape.
    #[error("malformed upstream response: {0}")]
    UpstreamMalformed(String),

    /// JSON serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invariant violation. Logged and never retried.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether the proxy engine may advance to the next candidate after this
    /// error. Only failures that happened before any byte reached the caller
    /// qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::UpstreamTransport(_)
                | AppError::UpstreamHttp { .. }
                | AppError::UpstreamMalformed(_)
        )
    }
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::ConfigInvalid(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message, reasons) = match &self {
            AppError::InvalidRequest(msg) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                msg.clone(),
                None,
            ),
            AppError::ConfigInvalid(msg) => (
                StatusCode::BAD_REQUEST,
                "config_invalid",
                msg.clone(),
                None,
            ),
            AppError::NoProviderAvailable { reasons, .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "no_provider_available",
                self.to_string(),
                Some(reasons.clone()),
            ),
            AppError::UpstreamTransport(msg) => (
                StatusCode::BAD_GATEWAY,
                "upstream_transport",
                msg.clone(),
                None,
            ),
            AppError::UpstreamHttp { status, body } => (
                StatusCode::BAD_GATEWAY,
                "upstream_http_error",
                format!("upstream returned HTTP {status}: {body}"),
                None,
            ),
            AppError::UpstreamMalformed(msg) => (
                StatusCode::BAD_GATEWAY,
                "upstream_malformed",
                msg.clone(),
                None,
            ),
            AppError::Serialization(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                err.to_string(),
                None,
            ),
            AppError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
                None,
            ),
        };

        let mut error = json!({
            "message": message,
            "type": error_type,
            "code": status.as_u16(),
        });
        if let Some(reasons) = reasons {
            error["reasons"] = json!(reasons);
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}

/// Convenience alias for handler results.
pub type Result<T> = std::result::Result<T, AppError>;
