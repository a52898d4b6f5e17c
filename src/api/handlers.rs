//! HTTP request handlers and shared application state.

use crate::api::models::{ModelInfo, ModelList, ProviderUsage, UsageReport, WindowUsage};
use crate::api::proxy;
use crate::api::upstream::UpstreamClient;
use crate::core::config::ConfigStore;
use crate::core::error::Result;
use crate::core::ledger::UsageLedger;
use crate::core::rate_limiter::RateLimiter;
use crate::services::health::HealthProber;
use crate::services::selector::AUTO_MODEL;
use axum::{extract::State, response::Response, Json};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Shared application state.
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub limiter: Arc<RateLimiter>,
    pub ledger: Arc<UsageLedger>,
    pub upstream: UpstreamClient,
    pub prober: HealthProber,
}

impl AppState {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self {
            config,
            limiter: Arc::new(RateLimiter::new()),
            ledger: Arc::new(UsageLedger::default()),
            upstream: UpstreamClient::new(),
            prober: HealthProber::new(),
        }
    }
}

/// OpenAI-compatible chat completions endpoint.
///
/// The body is taken as raw JSON so provider-specific fields pass through
/// untouched; only the `model` field is rewritten per the selected binding.
#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    tag = "completions",
    request_body = crate::api::models::ChatCompletionRequest,
    responses(
        (status = 200, description = "Completion or SSE stream from the selected provider"),
        (status = 503, description = "No provider available, with per-provider deny reasons"),
        (status = 502, description = "All candidate providers failed")
    )
)]
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> Result<Response> {
    proxy::dispatch_chat(&state, payload).await
}

/// List the declared logical models plus `auto`.
#[utoipa::path(
    get,
    path = "/v1/models",
    tag = "models",
    responses(
        (status = 200, description = "Declared logical models", body = ModelList)
    )
)]
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    let snapshot = state.config.snapshot();
    let created = Utc::now().timestamp();

    let mut data = vec![ModelInfo {
        id: AUTO_MODEL.to_string(),
        object: "model".to_string(),
        created,
        owned_by: "system".to_string(),
    }];
    for (model, bindings) in &snapshot.model_config {
        data.push(ModelInfo {
            id: model.clone(),
            object: "model".to_string(),
            created,
            owned_by: bindings
                .keys()
                .next()
                .cloned()
                .unwrap_or_else(|| "unbound".to_string()),
        });
    }

    Json(ModelList {
        object: "list".to_string(),
        data,
    })
}

/// Rolling per-provider usage against the configured windows.
#[utoipa::path(
    get,
    path = "/api_usage",
    tag = "usage",
    responses(
        (status = 200, description = "Current window usage per provider", body = UsageReport)
    )
)]
pub async fn api_usage(State(state): State<Arc<AppState>>) -> Json<UsageReport> {
    let snapshot = state.config.snapshot();
    let mut data = HashMap::new();

    for (name, provider) in &snapshot.api_provider {
        let status = state.limiter.status(name, &provider.limits);
        data.insert(
            name.clone(),
            ProviderUsage {
                rpm: WindowUsage {
                    current: status.rpm_used as u64,
                    limit: status.rpm_limit.map(u64::from).unwrap_or(0),
                },
                tpm: WindowUsage {
                    current: status.tpm_used,
                    limit: status.tpm_limit.unwrap_or(0),
                },
                rpd: WindowUsage {
                    current: status.rpd_used as u64,
                    limit: status.rpd_limit.unwrap_or(0),
                },
            },
        );
    }

    Json(UsageReport {
        data,
        timestamp: Utc::now().to_rfc3339(),
    })
}
