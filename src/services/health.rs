//! Health probing for (model, provider) bindings.
//!
//! Each probe issues a minimal one-message chat request with `max_tokens: 1`
//! through the same attempt path the proxy engine uses, pinned to a single
//! target with no failover. Probes therefore count against the provider's
//! quota like any other call. Results overwrite the previous entry for the
//! probed pair.

use crate::api::handlers::AppState;
use crate::api::proxy;
use crate::services::selector::Candidate;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use utoipa::ToSchema;

/// Default number of probes run concurrently by a full sweep.
pub const DEFAULT_PROBE_CONCURRENCY: usize = 2;

/// Outcome of the latest probe of one binding.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthResult {
    pub last_checked: DateTime<Utc>,
    pub ok: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One row of the health matrix.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthEntry {
    pub model: String,
    pub provider: String,
    pub last_checked: DateTime<Utc>,
    pub ok: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Keeper of per-binding probe results.
pub struct HealthProber {
    results: DashMap<(String, String), HealthResult>,
}

impl HealthProber {
    pub fn new() -> Self {
        Self {
            results: DashMap::new(),
        }
    }

    /// The current health matrix, sorted by (model, provider).
    pub fn matrix(&self) -> Vec<HealthEntry> {
        let mut entries: Vec<HealthEntry> = self
            .results
            .iter()
            .map(|item| {
                let (model, provider) = item.key();
                let result = item.value();
                HealthEntry {
                    model: model.clone(),
                    provider: provider.clone(),
                    last_checked: result.last_checked,
                    ok: result.ok,
                    latency_ms: result.latency_ms,
                    error: result.error.clone(),
                }
            })
            .collect();
        entries.sort_by(|a, b| (&a.model, &a.provider).cmp(&(&b.model, &b.provider)));
        entries
    }

    /// Probe one binding and record the result.
    pub async fn probe(&self, state: &Arc<AppState>, model: &str, provider: &str) -> HealthEntry {
        let started = Utc::now();
        let snapshot = state.config.snapshot();

        let result = match snapshot.binding(model, provider) {
            None => HealthResult {
                last_checked: started,
                ok: false,
                latency_ms: 0,
                error: Some(format!("no binding for model '{model}' on '{provider}'")),
            },
            Some(binding) => {
                let candidate = Candidate {
                    provider: provider.to_string(),
                    upstream_model: binding
                        .alias
                        .clone()
                        .unwrap_or_else(|| model.to_string()),
                };
                let payload = json!({
                    "model": model,
                    "messages": [{"role": "user", "content": "Hello"}],
                    "max_tokens": 1
                });

                let timer = Instant::now();
                let outcome = proxy::execute_attempt(
                    state,
                    &snapshot,
                    &candidate,
                    model,
                    &payload,
                    false,
                    Some(1),
                )
                .await;
                let latency_ms = timer.elapsed().as_millis() as u64;

                match outcome {
                    Ok(_) => HealthResult {
                        last_checked: started,
                        ok: true,
                        latency_ms,
                        error: None,
                    },
                    Err(err) => HealthResult {
                        last_checked: started,
                        ok: false,
                        latency_ms,
                        error: Some(err.to_string()),
                    },
                }
            }
        };

        tracing::info!(
            model = %model,
            provider = %provider,
            ok = result.ok,
            latency_ms = result.latency_ms,
            "health probe finished"
        );
        self.results
            .insert((model.to_string(), provider.to_string()), result.clone());

        HealthEntry {
            model: model.to_string(),
            provider: provider.to_string(),
            last_checked: result.last_checked,
            ok: result.ok,
            latency_ms: result.latency_ms,
            error: result.error,
        }
    }

    /// Probe every binding in the config, a bounded number at a time.
    pub async fn probe_all(&self, state: &Arc<AppState>, max_concurrent: usize) -> Vec<HealthEntry> {
        let snapshot = state.config.snapshot();
        let pairs: Vec<(String, String)> = snapshot
            .model_config
            .iter()
            .flat_map(|(model, bindings)| {
                bindings
                    .keys()
                    .map(move |provider| (model.clone(), provider.clone()))
            })
            .collect();

        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let mut tasks = Vec::with_capacity(pairs.len());
        for (model, provider) in pairs {
            let state = state.clone();
            let semaphore = semaphore.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("health probe semaphore closed");
                state.prober.probe(&state, &model, &provider).await
            }));
        }

        let mut entries = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(entry) => entries.push(entry),
                Err(err) => tracing::error!(error = %err, "health probe task panicked"),
            }
        }
        entries.sort_by(|a, b| (&a.model, &a.provider).cmp(&(&b.model, &b.provider)));
        entries
    }
}

impl Default for HealthProber {
    fn default() -> Self {
        Self::new()
    }
}
