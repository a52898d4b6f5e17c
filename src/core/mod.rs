//! Core functionality for the gateway.
//!
//! This module contains the fundamental components used throughout the
//! application:
//! - Routing configuration (load, validate, atomic rewrite)
//! - Error handling
//! - Sliding-window rate limiting
//! - The usage ledger
//! - HTTP middleware

pub mod config;
pub mod error;
pub mod ledger;
pub mod middleware;
pub mod rate_limiter;

// Re-export commonly used types
pub use config::{
    BindingEdit, ConfigError, ConfigStore, LimitField, ModelBinding, ProviderConfig, RateLimits,
    RoutingConfig,
};
pub use error::{AppError, Result};
pub use ledger::{ProviderUsageSummary, UsageLedger, UsageRecord, UsageStatus};
pub use middleware::{request_id_middleware, RequestId};
pub use rate_limiter::{estimate_tokens, DenyReason, LimiterStatus, RateLimiter, Ticket};
