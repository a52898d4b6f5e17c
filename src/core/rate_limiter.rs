//! Per-provider sliding-window rate limiting.
//!
//! Each provider gets three timestamp buckets: requests in the last 60
//! seconds (rpm), token consumption in the last 60 seconds (tpm), and
//! requests in the last 24 hours (rpd). Buckets are monotonic-append with
//! lazy front-popping eviction, so memory is bounded by the limit itself.
//! `tpr` is a stateless per-call ceiling.
//!
//! Admission is split into `reserve` (taken before the upstream call, counts
//! the request) and `commit` (taken at end of response, records observed
//! tokens). A call that fails before any byte reaches the caller is
//! `rollback`ed so the slot is released.
//!
//! Upstream failures additionally feed a 24h error bucket: every error
//! extends a cooldown of ten minutes per accumulated error (capped at 24h)
//! from the latest failure, during which the provider is denied admission.

use crate::core::config::RateLimits;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Rolling window for rpm and tpm.
pub const MINUTE_WINDOW: Duration = Duration::from_secs(60);

/// Rolling window for rpd and the error counter.
pub const DAY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Cooldown added per accumulated upstream error.
const COOLDOWN_PER_ERROR: Duration = Duration::from_secs(10 * 60);

/// Ceiling on the total cooldown duration.
const COOLDOWN_CAP: Duration = DAY_WINDOW;

/// Coarse prompt-size estimate: four characters per token, rounded up.
pub fn estimate_tokens(char_count: usize) -> u64 {
    (char_count as u64).div_ceil(4)
}

/// Why a provider was denied admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    RequestsPerMinute { used: usize, limit: u32 },
    TokensPerMinute { used: u64, requested: u64, limit: u64 },
    RequestsPerDay { used: usize, limit: u32 },
    TokensPerRequest { requested: u64, limit: u64 },
    Cooldown { remaining_secs: u64 },
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::RequestsPerMinute { used, limit } => {
                write!(f, "rpm limit exceeded: {used}/{limit} in the last 60s")
            }
            DenyReason::TokensPerMinute {
                used,
                requested,
                limit,
            } => write!(
                f,
                "tpm limit exceeded: {used} used + {requested} requested > {limit}"
            ),
            DenyReason::RequestsPerDay { used, limit } => {
                write!(f, "rpd limit exceeded: {used}/{limit} in the last 24h")
            }
            DenyReason::TokensPerRequest { requested, limit } => {
                write!(f, "tpr limit exceeded: {requested} > {limit}")
            }
            DenyReason::Cooldown { remaining_secs } => {
                write!(f, "provider in error cooldown for {remaining_secs}s")
            }
        }
    }
}

/// Opaque handle returned by `reserve`, consumed by `commit` or `rollback`.
#[derive(Debug)]
pub struct Ticket {
    provider: String,
    at: Instant,
}

impl Ticket {
    pub fn provider(&self) -> &str {
        &self.provider
    }
}

/// Point-in-time usage totals for one provider.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStatus {
    pub rpm_used: usize,
    pub tpm_used: u64,
    pub rpd_used: usize,
    pub rpm_limit: Option<u32>,
    pub tpm_limit: Option<u64>,
    pub rpd_limit: Option<u64>,
}

#[derive(Default)]
struct Buckets {
    req_60s: VecDeque<Instant>,
    tok_60s: VecDeque<(Instant, u64)>,
    req_24h: VecDeque<Instant>,
    errors_24h: VecDeque<Instant>,
}

impl Buckets {
    /// Drop entries that fell out of their window. Buckets are appended in
    /// timestamp order, so eviction is front-popping only.
    fn evict(&mut self, now: Instant) {
        while self
            .req_60s
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) > MINUTE_WINDOW)
        {
            self.req_60s.pop_front();
        }
        while self
            .tok_60s
            .front()
            .is_some_and(|(t, _)| now.saturating_duration_since(*t) > MINUTE_WINDOW)
        {
            self.tok_60s.pop_front();
        }
        while self
            .req_24h
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) > DAY_WINDOW)
        {
            self.req_24h.pop_front();
        }
        while self
            .errors_24h
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) > DAY_WINDOW)
        {
            self.errors_24h.pop_front();
        }
    }

    fn tokens_used(&self) -> u64 {
        self.tok_60s.iter().map(|(_, tokens)| tokens).sum()
    }

    /// Remaining cooldown, if the provider is currently error-limited.
    /// Each accumulated error extends the cooldown by ten minutes from the
    /// most recent failure, capped at 24 hours.
    fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        let latest = self.errors_24h.back()?;
        let span = COOLDOWN_PER_ERROR
            .checked_mul(self.errors_24h.len() as u32)
            .unwrap_or(COOLDOWN_CAP)
            .min(COOLDOWN_CAP);
        let elapsed = now.saturating_duration_since(*latest);
        (elapsed < span).then(|| span - elapsed)
    }
}

/// Sliding-window limiter keyed by provider name.
///
/// Limits are not stored here: they live in the routing config and are
/// passed to `check`/`status` so that admin edits take effect immediately.
pub struct RateLimiter {
    providers: DashMap<String, Arc<Mutex<Buckets>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
        }
    }

    fn buckets(&self, provider: &str) -> Arc<Mutex<Buckets>> {
        self.providers
            .entry(provider.to_string())
            .or_default()
            .clone()
    }

    /// Non-mutating admission test: would a request with `tokens_hint`
    /// estimated tokens keep every configured limit satisfied right now?
    ///
    /// An absent hint skips only the tpm and tpr pre-checks; commit still
    /// records the actual consumption.
    pub fn check(
        &self,
        provider: &str,
        limits: &RateLimits,
        tokens_hint: Option<u64>,
    ) -> Result<(), DenyReason> {
        self.check_at(provider, limits, tokens_hint, Instant::now())
    }

    pub(crate) fn check_at(
        &self,
        provider: &str,
        limits: &RateLimits,
        tokens_hint: Option<u64>,
        now: Instant,
    ) -> Result<(), DenyReason> {
        let cell = self.buckets(provider);
        let mut buckets = cell.lock().expect("limiter lock poisoned");
        buckets.evict(now);

        if let Some(remaining) = buckets.cooldown_remaining(now) {
            return Err(DenyReason::Cooldown {
                remaining_secs: remaining.as_secs(),
            });
        }
        if let Some(rpm) = limits.rpm {
            let used = buckets.req_60s.len();
            if used as u64 + 1 > rpm as u64 {
                return Err(DenyReason::RequestsPerMinute { used, limit: rpm });
            }
        }
        if let Some(rpd) = limits.rpd {
            let used = buckets.req_24h.len();
            if used as u64 + 1 > rpd as u64 {
                return Err(DenyReason::RequestsPerDay { used, limit: rpd });
            }
        }
        if let Some(hint) = tokens_hint {
            if let Some(tpm) = limits.tpm {
                let used = buckets.tokens_used();
                if used + hint > tpm {
                    return Err(DenyReason::TokensPerMinute {
                        used,
                        requested: hint,
                        limit: tpm,
                    });
                }
            }
            if let Some(tpr) = limits.tpr {
                if hint > tpr {
                    return Err(DenyReason::TokensPerRequest {
                        requested: hint,
                        limit: tpr,
                    });
                }
            }
        }
        Ok(())
    }

    /// Record a request start and return the ticket that must later be
    /// committed or rolled back.
    pub fn reserve(&self, provider: &str) -> Ticket {
        self.reserve_at(provider, Instant::now())
    }

    pub(crate) fn reserve_at(&self, provider: &str, now: Instant) -> Ticket {
        let cell = self.buckets(provider);
        let mut buckets = cell.lock().expect("limiter lock poisoned");
        buckets.evict(now);
        buckets.req_60s.push_back(now);
        buckets.req_24h.push_back(now);
        Ticket {
            provider: provider.to_string(),
            at: now,
        }
    }

    /// Record observed token consumption for a reserved request.
    pub fn commit(&self, ticket: Ticket, tokens: u64) {
        self.commit_at(ticket, tokens, Instant::now());
    }

    pub(crate) fn commit_at(&self, ticket: Ticket, tokens: u64, now: Instant) {
        let cell = self.buckets(&ticket.provider);
        let mut buckets = cell.lock().expect("limiter lock poisoned");
        buckets.evict(now);
        buckets.tok_60s.push_back((now, tokens));
    }

    /// Release a reserved request slot. Used when the upstream call failed
    /// before producing any response byte.
    pub fn rollback(&self, ticket: Ticket) {
        let cell = self.buckets(&ticket.provider);
        let mut buckets = cell.lock().expect("limiter lock poisoned");
        if let Some(pos) = buckets.req_60s.iter().position(|t| *t == ticket.at) {
            let _ = buckets.req_60s.remove(pos);
        }
        if let Some(pos) = buckets.req_24h.iter().position(|t| *t == ticket.at) {
            let _ = buckets.req_24h.remove(pos);
        }
    }

    /// Register an upstream failure, extending the provider's cooldown.
    pub fn record_error(&self, provider: &str) {
        self.record_error_at(provider, Instant::now());
    }

    pub(crate) fn record_error_at(&self, provider: &str, now: Instant) {
        let cell = self.buckets(provider);
        let mut buckets = cell.lock().expect("limiter lock poisoned");
        buckets.evict(now);
        buckets.errors_24h.push_back(now);
        tracing::warn!(
            provider = %provider,
            errors_24h = buckets.errors_24h.len(),
            "upstream error recorded for provider"
        );
    }

    /// Empty every bucket for one provider, including the error counter.
    pub fn reset(&self, provider: &str) {
        if let Some(cell) = self.providers.get(provider) {
            *cell.lock().expect("limiter lock poisoned") = Buckets::default();
        }
    }

    /// Empty every bucket for every provider.
    pub fn reset_all(&self) {
        for cell in self.providers.iter() {
            *cell.lock().expect("limiter lock poisoned") = Buckets::default();
        }
    }

    /// Current usage versus the supplied limits.
    pub fn status(&self, provider: &str, limits: &RateLimits) -> LimiterStatus {
        self.status_at(provider, limits, Instant::now())
    }

    pub(crate) fn status_at(
        &self,
        provider: &str,
        limits: &RateLimits,
        now: Instant,
    ) -> LimiterStatus {
        let cell = self.buckets(provider);
        let mut buckets = cell.lock().expect("limiter lock poisoned");
        buckets.evict(now);
        LimiterStatus {
            rpm_used: buckets.req_60s.len(),
            tpm_used: buckets.tokens_used(),
            rpd_used: buckets.req_24h.len(),
            rpm_limit: limits.rpm,
            tpm_limit: limits.tpm,
            rpd_limit: limits.rpd.map(|v| v as u64),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
