//! modelrelay - an OpenAI-compatible reverse proxy for LLM providers
//!
//! This library fronts multiple upstream LLM services behind a single
//! chat-completions endpoint, with:
//!
//! - **Quota-aware routing**: per-provider sliding-window limits on
//!   requests and tokens (rpm/tpm/rpd) plus per-request ceilings (tpr)
//! - **Ordered failover**: providers are tried in configuration order and
//!   alternates are attempted until a response starts flowing
//! - **Model aliasing**: logical model names are rewritten to each
//!   provider's local name on the way upstream
//! - **Streaming support**: verbatim server-sent-event relay with token
//!   accounting from usage payloads or fallback estimation
//! - **Runtime administration**: the routing document can be inspected and
//!   edited while requests are in flight
//!
//! # Architecture
//!
//! The codebase is organized into three layers:
//!
//! - [`core`]: configuration store, rate limiter, usage ledger, errors
//! - [`api`]: HTTP handlers, upstream client, streaming relay, admin API
//! - [`services`]: candidate selection and health probing

pub mod api;
pub mod core;
pub mod services;

// Re-export commonly used types for convenience
pub use crate::api::{router, AppState};
pub use crate::core::{AppError, ConfigStore, RateLimiter, Result, RoutingConfig, UsageLedger};
pub use crate::services::{select_candidates, Candidate, HealthProber};
