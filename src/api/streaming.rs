//! Server-sent-event relay for streamed chat completions.
//!
//! Upstream chunks arrive on arbitrary TCP boundaries, so bytes accumulate
//! in a line buffer and only complete events (terminated by a blank line)
//! are forwarded, unchanged. Each event is also parsed to pick up the final
//! `usage` payload, accumulate a fallback token estimate from
//! `delta.content`, and spot the terminating `data: [DONE]` marker.
//!
//! Token commit and the ledger record happen exactly once per stream: at
//! `[DONE]`/EOF, on a mid-stream failure (after a synthetic error event is
//! emitted), or from the drop guard when the caller disconnects. Once any
//! byte has been relayed the provider choice is final; mid-stream failures
//! never fail over.

use crate::api::models::Usage;
use crate::core::ledger::{UsageLedger, UsageRecord, UsageStatus};
use crate::core::rate_limiter::{estimate_tokens, RateLimiter, Ticket};
use axum::body::Body;
use axum::response::Response as AxumResponse;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{Stream, StreamExt};
use serde_json::json;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Accounting state shared by every terminal path of one streamed attempt.
///
/// The drop guard covers caller disconnects: axum drops the body stream,
/// which drops the relay state, which commits observed usage. A reserve is
/// therefore never leaked.
pub(crate) struct StreamAccounting {
    limiter: Arc<RateLimiter>,
    ledger: Arc<UsageLedger>,
    ticket: Option<Ticket>,
    model: String,
    provider: String,
    prompt_hint: u64,
    started_at: DateTime<Utc>,
    usage: Option<Usage>,
    content_chars: u64,
    finished: bool,
}

impl StreamAccounting {
    pub(crate) fn new(
        limiter: Arc<RateLimiter>,
        ledger: Arc<UsageLedger>,
        ticket: Ticket,
        model: String,
        prompt_hint: u64,
        started_at: DateTime<Utc>,
    ) -> Self {
        let provider = ticket.provider().to_string();
        Self {
            limiter,
            ledger,
            ticket: Some(ticket),
            model,
            provider,
            prompt_hint,
            started_at,
            usage: None,
            content_chars: 0,
            finished: false,
        }
    }

    fn absorb(&mut self, delta: ScanDelta) {
        if self.usage.is_none() {
            self.usage = delta.usage;
        }
        self.content_chars += delta.content_chars;
    }

    /// Provider usage when reported, otherwise hint + chars/4 estimate.
    fn final_counts(&self) -> (u64, u64, u64) {
        match &self.usage {
            Some(usage) => {
                let total = if usage.total_tokens > 0 {
                    usage.total_tokens
                } else {
                    usage.prompt_tokens + usage.completion_tokens
                };
                (usage.prompt_tokens, usage.completion_tokens, total)
            }
            None => {
                let completion = estimate_tokens(self.content_chars as usize);
                (self.prompt_hint, completion, self.prompt_hint + completion)
            }
        }
    }

    /// Commit observed tokens and write the ledger record. Idempotent.
    fn finish(&mut self, status: UsageStatus, error: Option<String>) {
        if self.finished {
            return;
        }
        self.finished = true;

        let (prompt, completion, total) = self.final_counts();
        if let Some(ticket) = self.ticket.take() {
            self.limiter.commit(ticket, total);
        }
        if status == UsageStatus::StreamAborted {
            self.limiter.record_error(&self.provider);
        }
        tracing::info!(
            provider = %self.provider,
            model = %self.model,
            total_tokens = total,
            status = ?status,
            "stream finished"
        );
        self.ledger.append(UsageRecord {
            started_at: self.started_at,
            finished_at: Utc::now(),
            model: self.model.clone(),
            provider: self.provider.clone(),
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: total,
            status,
            error,
        });
    }
}

impl Drop for StreamAccounting {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(
                UsageStatus::ClientDisconnect,
                Some("client disconnected before end of stream".to_string()),
            );
        }
    }
}

/// What one scan pass extracted from the parsed events.
#[derive(Debug, Default, PartialEq)]
struct ScanDelta {
    content_chars: u64,
    usage: Option<Usage>,
    saw_done: bool,
}

/// Result of feeding one network chunk to the scanner.
#[derive(Debug)]
enum ScanOutcome {
    /// Complete events extracted so far, in arrival order. Empty while a
    /// partial event is still buffering.
    Clean {
        delta: ScanDelta,
        events: Vec<String>,
    },
    /// A complete event failed to parse. `events` holds the clean events
    /// that preceded it and must still be forwarded.
    Broken {
        delta: ScanDelta,
        events: Vec<String>,
        error: String,
    },
}

/// Incremental SSE parser over arbitrarily fragmented chunks.
#[derive(Default)]
struct SseScanner {
    buffer: String,
}

impl SseScanner {
    fn scan(&mut self, chunk: &str) -> ScanOutcome {
        self.buffer.push_str(chunk);

        let mut delta = ScanDelta::default();
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let event = self.buffer[..pos].to_string();
            self.buffer.drain(..pos + 2);
            match Self::scan_event(&event, &mut delta) {
                Ok(()) => events.push(event),
                Err(error) => {
                    return ScanOutcome::Broken {
                        delta,
                        events,
                        error,
                    }
                }
            }
        }
        ScanOutcome::Clean { delta, events }
    }

    /// Bytes still buffered, for the EOF flush of a stream that ended
    /// without a final blank line.
    fn take_remainder(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }

    fn scan_event(event: &str, delta: &mut ScanDelta) -> Result<(), String> {
        for line in event.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            if let Some(payload) = line.strip_prefix("data:") {
                let payload = payload.trim();
                if payload == "[DONE]" {
                    delta.saw_done = true;
                    continue;
                }
                let value: serde_json::Value = serde_json::from_str(payload)
                    .map_err(|err| format!("event payload is not valid JSON: {err}"))?;

                if delta.usage.is_none() {
                    if let Some(usage) = value.get("usage").filter(|u| u.is_object()) {
                        if let Ok(usage) = serde_json::from_value::<Usage>(usage.clone()) {
                            if usage.total_tokens > 0 || usage.prompt_tokens > 0 {
                                delta.usage = Some(usage);
                            }
                        }
                    }
                }
                if let Some(choices) = value.get("choices").and_then(|c| c.as_array()) {
                    for choice in choices {
                        if let Some(content) = choice
                            .get("delta")
                            .and_then(|d| d.get("content"))
                            .and_then(|c| c.as_str())
                        {
                            delta.content_chars += content.chars().count() as u64;
                        }
                    }
                }
            } else if line.starts_with("event:")
                || line.starts_with("id:")
                || line.starts_with("retry:")
            {
                continue;
            } else {
                return Err(format!("unexpected non-event bytes in stream: {line:.60}"));
            }
        }
        Ok(())
    }
}

/// Re-frame extracted events for the caller, restoring the blank-line
/// terminators consumed by the scanner.
fn frame_events(events: &[String]) -> Vec<u8> {
    let mut out = String::new();
    for event in events {
        out.push_str(event);
        out.push_str("\n\n");
    }
    out.into_bytes()
}

/// Synthetic SSE error event emitted to the caller when the upstream breaks
/// mid-stream, followed by the `[DONE]` terminator.
fn error_event(message: &str, error_type: &str) -> Vec<u8> {
    let payload = json!({
        "error": {
            "message": message,
            "type": error_type,
            "code": 502,
        }
    });
    format!("event: error\ndata: {payload}\n\ndata: [DONE]\n\n").into_bytes()
}

struct RelayState {
    upstream: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    scanner: SseScanner,
    accounting: StreamAccounting,
    idle_timeout: Duration,
    saw_done: bool,
    finished: bool,
}

impl RelayState {
    /// Terminal emission: forward any clean events, append the synthetic
    /// error, and settle accounting.
    fn abort(&mut self, events: &[String], message: &str, error_type: &str) -> Vec<u8> {
        tracing::warn!(
            provider = %self.accounting.provider,
            model = %self.accounting.model,
            "aborting stream: {message}"
        );
        self.accounting
            .finish(UsageStatus::StreamAborted, Some(message.to_string()));
        self.finished = true;

        let mut out = frame_events(events);
        out.extend_from_slice(&error_event(message, error_type));
        out
    }
}

/// Turn a 2xx upstream response into an SSE response for the caller,
/// forwarding complete events as they arrive.
pub(crate) fn relay_sse(
    upstream: reqwest::Response,
    accounting: StreamAccounting,
    idle_timeout: Duration,
) -> AxumResponse {
    let state = RelayState {
        upstream: Box::pin(upstream.bytes_stream()),
        scanner: SseScanner::default(),
        accounting,
        idle_timeout,
        saw_done: false,
        finished: false,
    };

    let byte_stream = futures::stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }

            let next = tokio::time::timeout(state.idle_timeout, state.upstream.next()).await;
            match next {
                Err(_) => {
                    let message = format!(
                        "no upstream data for {}s, aborting stream",
                        state.idle_timeout.as_secs()
                    );
                    let out = state.abort(&[], &message, "upstream_transport");
                    return Some((Ok::<Vec<u8>, std::io::Error>(out), state));
                }
                Ok(Some(Ok(bytes))) => {
                    let chunk = String::from_utf8_lossy(&bytes).into_owned();
                    match state.scanner.scan(&chunk) {
                        ScanOutcome::Clean { delta, events } => {
                            state.saw_done |= delta.saw_done;
                            state.accounting.absorb(delta);
                            if events.is_empty() {
                                // Partial event still buffering, read on.
                                continue;
                            }
                            return Some((Ok(frame_events(&events)), state));
                        }
                        ScanOutcome::Broken {
                            delta,
                            events,
                            error,
                        } => {
                            state.accounting.absorb(delta);
                            let message = format!("malformed stream chunk: {error}");
                            let out = state.abort(&events, &message, "upstream_malformed");
                            return Some((Ok(out), state));
                        }
                    }
                }
                Ok(Some(Err(err))) => {
                    let message = format!("upstream stream error: {err}");
                    let out = state.abort(&[], &message, "upstream_transport");
                    return Some((Ok(out), state));
                }
                Ok(None) => {
                    if !state.saw_done {
                        tracing::warn!(
                            provider = %state.accounting.provider,
                            model = %state.accounting.model,
                            "stream ended without data: [DONE]"
                        );
                    }
                    state.accounting.finish(UsageStatus::Ok, None);
                    state.finished = true;

                    // Flush whatever was still buffering when the upstream
                    // closed, so the caller sees every byte received.
                    let remainder = state.scanner.take_remainder();
                    if remainder.trim().is_empty() {
                        return None;
                    }
                    return Some((Ok(remainder.into_bytes()), state));
                }
            }
        }
    });

    AxumResponse::builder()
        .status(200)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .body(Body::from_stream(byte_stream))
        .unwrap()
}
