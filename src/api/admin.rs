//! Admin API backing the static management page.
//!
//! Reads and writes of the routing document all flow through the config
//! store's validated mutators, so a rejected edit never touches live state.
//! The inbound `Authorization` header is accepted but not verified anywhere
//! on this surface; deployments that need caller auth are expected to front
//! the gateway with one.

use crate::api::handlers::AppState;
use crate::core::config::{BindingEdit, LimitField, RoutingConfig};
use crate::core::error::{AppError, Result};
use crate::core::ledger::{ProviderUsageSummary, UsageRecord};
use crate::services::health::{HealthEntry, DEFAULT_PROBE_CONCURRENCY};
use axum::{
    extract::{Path, Query, State},
    routing::{get, patch, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use utoipa::{OpenApi, ToSchema};

/// OpenAPI documentation for the gateway surface.
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::api::handlers::chat_completions,
        crate::api::handlers::list_models,
        crate::api::handlers::api_usage,
        get_config,
        replace_config,
        patch_binding,
        update_limit,
        set_key,
        set_base_url,
        reset_limits,
        reset_all_limits,
        run_health,
        ledger_usage,
    ),
    components(schemas(
        crate::api::models::ChatCompletionRequest,
        crate::api::models::Message,
        crate::api::models::Usage,
        crate::api::models::ModelList,
        crate::api::models::ModelInfo,
        crate::api::models::UsageReport,
        crate::api::models::ProviderUsage,
        crate::api::models::WindowUsage,
        BindingPatchRequest,
        LimitUpdateRequest,
        SetKeyRequest,
        SetBaseUrlRequest,
        HealthProbeRequest,
        HealthMatrix,
        LedgerReport,
        LimitField,
        HealthEntry,
        ProviderUsageSummary,
        UsageRecord,
        crate::core::ledger::UsageStatus,
    )),
    tags(
        (name = "completions", description = "OpenAI-compatible proxy endpoints"),
        (name = "models", description = "Model listing"),
        (name = "usage", description = "Usage reporting"),
        (name = "admin", description = "Routing configuration management")
    ),
    info(
        title = "modelrelay",
        version = "0.3.1",
        description = "OpenAI-compatible reverse proxy with quota-aware provider routing."
    )
)]
pub struct ApiDoc;

/// Deserialize a field that distinguishes "absent" from "explicit null".
fn double_option<'de, T, D>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

/// Patch for one (model, provider) binding.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct BindingPatchRequest {
    /// New enable flag, unchanged when absent.
    pub enable: Option<bool>,
    /// New alias; explicit `null` clears it, absent leaves it unchanged.
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<String>, nullable)]
    pub alias: Option<Option<String>>,
}

/// Edit of a single quota field. `value: null` removes the limit.
#[derive(Debug, Deserialize, ToSchema)]
pub struct LimitUpdateRequest {
    pub field: LimitField,
    pub value: Option<u64>,
}

/// Credential rotation request.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SetKeyRequest {
    pub api_key: String,
}

/// Base URL update request.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SetBaseUrlRequest {
    pub base_url: String,
}

/// Probe target selection: a single binding, one model's bindings, or
/// everything when both fields are absent.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct HealthProbeRequest {
    pub model: Option<String>,
    pub provider: Option<String>,
    pub max_concurrent: Option<usize>,
}

/// Health matrix returned by `POST /admin/health`.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthMatrix {
    pub results: Vec<HealthEntry>,
    pub checked_at: String,
}

/// Ledger snapshot returned by `GET /admin/usage`.
#[derive(Debug, Serialize, ToSchema)]
pub struct LedgerReport {
    pub summary: BTreeMap<String, ProviderUsageSummary>,
    pub recent: Vec<UsageRecord>,
}

#[derive(Debug, Deserialize)]
pub struct LedgerQuery {
    pub recent: Option<usize>,
}

/// Build the admin routes, rooted at `/admin/*`. State is applied by the
/// caller when the full application router is assembled.
pub fn admin_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/config", get(get_config).post(replace_config))
        .route("/admin/bindings/:model/:provider", patch(patch_binding))
        .route("/admin/providers/:provider/limits", patch(update_limit))
        .route("/admin/providers/:provider/key", put(set_key))
        .route("/admin/providers/:provider/base_url", put(set_base_url))
        .route("/admin/limits/reset", post(reset_all_limits))
        .route("/admin/limits/:provider/reset", post(reset_limits))
        .route("/admin/health", post(run_health))
        .route("/admin/usage", get(ledger_usage))
}

/// Read the full routing document.
#[utoipa::path(
    get,
    path = "/admin/config",
    tag = "admin",
    responses((status = 200, description = "Current routing document"))
)]
pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<RoutingConfig> {
    Json((*state.config.snapshot()).clone())
}

/// Replace the routing document wholesale.
#[utoipa::path(
    post,
    path = "/admin/config",
    tag = "admin",
    responses(
        (status = 200, description = "Document validated, persisted, and published"),
        (status = 400, description = "Validation failed; live state unchanged")
    )
)]
pub async fn replace_config(
    State(state): State<Arc<AppState>>,
    Json(document): Json<RoutingConfig>,
) -> Result<Json<Value>> {
    state.config.replace(document)?;
    tracing::info!("routing config replaced via admin API");
    Ok(Json(json!({"status": "ok"})))
}

/// Edit one binding's enable flag or alias.
#[utoipa::path(
    patch,
    path = "/admin/bindings/{model}/{provider}",
    tag = "admin",
    params(
        ("model" = String, Path, description = "Logical model name"),
        ("provider" = String, Path, description = "Provider name")
    ),
    request_body = BindingPatchRequest,
    responses(
        (status = 200, description = "Binding updated"),
        (status = 400, description = "Unknown binding or validation failure")
    )
)]
pub async fn patch_binding(
    State(state): State<Arc<AppState>>,
    Path((model, provider)): Path<(String, String)>,
    Json(request): Json<BindingPatchRequest>,
) -> Result<Json<Value>> {
    state.config.update_binding(
        &model,
        &provider,
        BindingEdit {
            enable: request.enable,
            alias: request.alias,
        },
    )?;
    Ok(Json(json!({"status": "ok"})))
}

/// Set or clear one quota field on a provider.
#[utoipa::path(
    patch,
    path = "/admin/providers/{provider}/limits",
    tag = "admin",
    params(("provider" = String, Path, description = "Provider name")),
    request_body = LimitUpdateRequest,
    responses(
        (status = 200, description = "Limit updated"),
        (status = 400, description = "Unknown provider or validation failure")
    )
)]
pub async fn update_limit(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Json(request): Json<LimitUpdateRequest>,
) -> Result<Json<Value>> {
    state
        .config
        .update_limit(&provider, request.field, request.value)?;
    Ok(Json(json!({"status": "ok"})))
}

/// Rotate a provider's credential.
#[utoipa::path(
    put,
    path = "/admin/providers/{provider}/key",
    tag = "admin",
    params(("provider" = String, Path, description = "Provider name")),
    request_body = SetKeyRequest,
    responses(
        (status = 200, description = "Key replaced"),
        (status = 400, description = "Unknown provider")
    )
)]
pub async fn set_key(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Json(request): Json<SetKeyRequest>,
) -> Result<Json<Value>> {
    state.config.set_key(&provider, request.api_key)?;
    tracing::info!(provider = %provider, "provider api key rotated");
    Ok(Json(json!({"status": "ok"})))
}

/// Update a provider's base URL.
#[utoipa::path(
    put,
    path = "/admin/providers/{provider}/base_url",
    tag = "admin",
    params(("provider" = String, Path, description = "Provider name")),
    request_body = SetBaseUrlRequest,
    responses(
        (status = 200, description = "Base URL updated"),
        (status = 400, description = "Unknown provider or invalid URL")
    )
)]
pub async fn set_base_url(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Json(request): Json<SetBaseUrlRequest>,
) -> Result<Json<Value>> {
    state.config.set_base_url(&provider, request.base_url)?;
    Ok(Json(json!({"status": "ok"})))
}

/// Clear one provider's counters, including its error cooldown.
#[utoipa::path(
    post,
    path = "/admin/limits/{provider}/reset",
    tag = "admin",
    params(("provider" = String, Path, description = "Provider name")),
    responses(
        (status = 200, description = "Counters cleared"),
        (status = 400, description = "Unknown provider")
    )
)]
pub async fn reset_limits(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
) -> Result<Json<Value>> {
    if state.config.snapshot().provider(&provider).is_none() {
        return Err(AppError::ConfigInvalid(format!(
            "provider '{provider}' is not configured"
        )));
    }
    state.limiter.reset(&provider);
    tracing::info!(provider = %provider, "rate limit counters reset");
    Ok(Json(json!({"status": "ok"})))
}

/// Clear every provider's counters.
#[utoipa::path(
    post,
    path = "/admin/limits/reset",
    tag = "admin",
    responses((status = 200, description = "All counters cleared"))
)]
pub async fn reset_all_limits(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.limiter.reset_all();
    tracing::info!("all rate limit counters reset");
    Json(json!({"status": "ok", "message": "all rate limits have been reset"}))
}

/// Trigger health probes and return the resulting matrix.
#[utoipa::path(
    post,
    path = "/admin/health",
    tag = "admin",
    request_body = HealthProbeRequest,
    responses((status = 200, description = "Probe results", body = HealthMatrix))
)]
pub async fn run_health(
    State(state): State<Arc<AppState>>,
    payload: Option<Json<HealthProbeRequest>>,
) -> Json<HealthMatrix> {
    let request = payload.map(|Json(r)| r).unwrap_or_default();
    let max_concurrent = request
        .max_concurrent
        .unwrap_or(DEFAULT_PROBE_CONCURRENCY);

    match (request.model, request.provider) {
        (Some(model), Some(provider)) => {
            state.prober.probe(&state, &model, &provider).await;
        }
        (Some(model), None) => {
            let snapshot = state.config.snapshot();
            let providers: Vec<String> = snapshot
                .model_config
                .get(&model)
                .map(|bindings| bindings.keys().cloned().collect())
                .unwrap_or_default();
            for provider in providers {
                state.prober.probe(&state, &model, &provider).await;
            }
        }
        _ => {
            state.prober.probe_all(&state, max_concurrent).await;
        }
    }

    Json(HealthMatrix {
        results: state.prober.matrix(),
        checked_at: Utc::now().to_rfc3339(),
    })
}

/// Recent ledger records plus rolling per-provider totals.
#[utoipa::path(
    get,
    path = "/admin/usage",
    tag = "admin",
    responses((status = 200, description = "Ledger snapshot", body = LedgerReport))
)]
pub async fn ledger_usage(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LedgerQuery>,
) -> Json<LedgerReport> {
    Json(LedgerReport {
        summary: state.ledger.summary_by_provider(),
        recent: state.ledger.recent(query.recent.unwrap_or(100)),
    })
}
