//! The proxy engine: selection, admission, forwarding, failover.
//!
//! One inbound chat request walks the selector's candidate list in order.
//! Each attempt reserves a request slot, rewrites the body's `model` field
//! to the binding's upstream name, and forwards the call. Failures that
//! happen before any byte reaches the caller roll the reservation back and
//! advance to the next candidate; once a response starts flowing the
//! provider choice is final and accounting is settled at end of stream.

use crate::api::handlers::AppState;
use crate::api::models::Usage;
use crate::api::streaming::{relay_sse, StreamAccounting};
use crate::core::config::{RoutingConfig, DEFAULT_STREAM_IDLE_TIMEOUT_SECS};
use crate::core::error::{AppError, Result};
use crate::core::ledger::{UsageRecord, UsageStatus};
use crate::core::rate_limiter::{estimate_tokens, Ticket};
use crate::services::selector::{select_candidates, Candidate};
use axum::http::{header, StatusCode};
use axum::response::Response;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

/// Provider-relative path of the chat endpoint.
pub const CHAT_COMPLETIONS_PATH: &str = "chat/completions";

/// What a successful attempt produced.
pub(crate) enum AttemptOutcome {
    /// Full upstream body, already committed against the quota.
    NonStreaming { body: String },
    /// SSE response; accounting settles when the stream ends.
    Streaming(Response),
}

/// Admission token hint: the caller's `max_tokens` when present, otherwise
/// the coarse chars/4 estimate over the concatenated message contents.
/// `None` when the body carries no messages to estimate from.
pub(crate) fn prompt_token_hint(payload: &Value) -> Option<u64> {
    if let Some(max_tokens) = payload.get("max_tokens").and_then(Value::as_u64) {
        return Some(max_tokens);
    }
    let messages = payload.get("messages")?.as_array()?;
    let mut chars = 0usize;
    for message in messages {
        match message.get("content") {
            Some(Value::String(text)) => chars += text.chars().count(),
            Some(Value::Null) | None => {}
            // Multimodal content arrives as structured parts; their JSON
            // rendering is close enough for a 4-chars-per-token estimate.
            Some(other) => chars += other.to_string().chars().count(),
        }
    }
    Some(estimate_tokens(chars))
}

/// Drive a chat-completions request end to end.
pub async fn dispatch_chat(state: &AppState, payload: Value) -> Result<Response> {
    let model = payload
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            AppError::InvalidRequest("request body is missing the 'model' field".to_string())
        })?;
    let stream = payload
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let tokens_hint = prompt_token_hint(&payload);

    // One snapshot for the whole request: concurrent admin edits do not
    // change routing mid-flight.
    let snapshot = state.config.snapshot();
    let candidates = select_candidates(&snapshot, &state.limiter, &model, tokens_hint)
        .map_err(|err| AppError::NoProviderAvailable {
            model: err.model,
            reasons: err.reasons,
        })?;

    tracing::debug!(
        model = %model,
        candidates = candidates.len(),
        stream,
        tokens_hint = ?tokens_hint,
        "dispatching chat request"
    );

    let mut last_error: Option<AppError> = None;
    for candidate in &candidates {
        match execute_attempt(state, &snapshot, candidate, &model, &payload, stream, tokens_hint)
            .await
        {
            Ok(AttemptOutcome::NonStreaming { body }) => {
                return Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(body.into())
                    .unwrap());
            }
            Ok(AttemptOutcome::Streaming(response)) => return Ok(response),
            Err(err) if err.is_retryable() => {
                tracing::warn!(
                    provider = %candidate.provider,
                    model = %model,
                    error = %err,
                    "attempt failed before response, trying next candidate"
                );
                last_error = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_error
        .unwrap_or_else(|| AppError::Internal("candidate list exhausted without error".into())))
}

/// Run one attempt against a single candidate, fully accounting for it.
///
/// The reserve taken here is always resolved: rolled back on pre-send
/// failure, committed after a non-streaming body, or handed to the stream
/// relay whose drop guard commits on every terminal path. The health prober
/// calls this directly, which is how probes share the proxy path and count
/// against quota.
pub(crate) async fn execute_attempt(
    state: &AppState,
    config: &RoutingConfig,
    candidate: &Candidate,
    logical_model: &str,
    payload: &Value,
    stream: bool,
    tokens_hint: Option<u64>,
) -> Result<AttemptOutcome> {
    let provider_cfg = config.provider(&candidate.provider).ok_or_else(|| {
        AppError::Internal(format!(
            "selected provider '{}' missing from config snapshot",
            candidate.provider
        ))
    })?;

    let mut body = payload.clone();
    body["model"] = Value::String(candidate.upstream_model.clone());
    if candidate.upstream_model != logical_model {
        tracing::debug!(
            provider = %candidate.provider,
            upstream_model = %candidate.upstream_model,
            "rewrote model to binding alias"
        );
    }

    let started_at = Utc::now();
    let ticket = state.limiter.reserve(&candidate.provider);

    let response = match state
        .upstream
        .call(provider_cfg, CHAT_COMPLETIONS_PATH, &body, stream)
        .await
    {
        Ok(response) => response,
        Err(err) => {
            fail_attempt(state, ticket, logical_model, started_at, &err);
            return Err(err);
        }
    };

    if stream {
        let accounting = StreamAccounting::new(
            state.limiter.clone(),
            state.ledger.clone(),
            ticket,
            logical_model.to_string(),
            tokens_hint.unwrap_or(0),
            started_at,
        );
        let idle_timeout = provider_cfg
            .timeout
            .unwrap_or(DEFAULT_STREAM_IDLE_TIMEOUT_SECS);
        return Ok(AttemptOutcome::Streaming(relay_sse(
            response,
            accounting,
            Duration::from_secs(idle_timeout),
        )));
    }

    // Nothing has been written to the caller yet, so a failed body read is
    // still a pre-send failure and eligible for failover.
    let text = match response.text().await {
        Ok(text) => text,
        Err(err) => {
            let err = AppError::UpstreamTransport(format!("failed to read upstream body: {err}"));
            fail_attempt(state, ticket, logical_model, started_at, &err);
            return Err(err);
        }
    };

    let (prompt, completion, total) = non_streaming_counts(&text, tokens_hint);
    state.limiter.commit(ticket, total);
    state.ledger.append(UsageRecord {
        started_at,
        finished_at: Utc::now(),
        model: logical_model.to_string(),
        provider: candidate.provider.clone(),
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total,
        status: UsageStatus::Ok,
        error: None,
    });

    Ok(AttemptOutcome::NonStreaming { body: text })
}

/// Roll back a reserve after a pre-send failure and record the failed call.
fn fail_attempt(
    state: &AppState,
    ticket: Ticket,
    logical_model: &str,
    started_at: DateTime<Utc>,
    err: &AppError,
) {
    let provider = ticket.provider().to_string();
    state.limiter.rollback(ticket);
    state.limiter.record_error(&provider);
    state.ledger.append(UsageRecord {
        started_at,
        finished_at: Utc::now(),
        model: logical_model.to_string(),
        provider,
        prompt_tokens: 0,
        completion_tokens: 0,
        total_tokens: 0,
        status: UsageStatus::UpstreamError,
        error: Some(err.to_string()),
    });
}

/// Token split for a non-streaming body: the provider's `usage` when
/// reported, otherwise hint + chars/4 over the raw response text.
fn non_streaming_counts(text: &str, tokens_hint: Option<u64>) -> (u64, u64, u64) {
    let usage = serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|value| value.get("usage").cloned())
        .and_then(|usage| serde_json::from_value::<Usage>(usage).ok())
        .filter(|usage| usage.total_tokens > 0 || usage.prompt_tokens > 0);

    match usage {
        Some(usage) => {
            let total = if usage.total_tokens > 0 {
                usage.total_tokens
            } else {
                usage.prompt_tokens + usage.completion_tokens
            };
            (usage.prompt_tokens, usage.completion_tokens, total)
        }
        None => {
            let prompt = tokens_hint.unwrap_or(0);
            let completion = estimate_tokens(text.chars().count());
            (prompt, completion, prompt + completion)
        }
    }
}
