//! API request and response models.
//!
//! OpenAI-compatible chat-completion shapes plus the gateway's own usage
//! reporting types. The proxy itself forwards request bodies as raw JSON so
//! unknown fields survive untouched; these typed shapes back the OpenAPI
//! documentation and the endpoints the gateway answers locally.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;

/// Chat completion request following the OpenAI API format.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatCompletionRequest {
    /// Logical model identifier, or `auto`.
    pub model: String,

    /// Conversation messages.
    pub messages: Vec<Message>,

    /// Whether to stream the response as server-sent events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// Maximum tokens to generate. Also used as the admission token hint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,

    /// Additional provider-specific parameters, forwarded verbatim.
    #[serde(flatten)]
    #[schema(additional_properties)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// A single message in a conversation. `content` is kept as raw JSON because
/// multimodal callers send arrays of content parts.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Message {
    /// Role: "system", "user", or "assistant".
    pub role: String,

    #[schema(value_type = Object)]
    pub content: serde_json::Value,
}

/// Token usage statistics as reported by providers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Model information entry for `GET /v1/models`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

/// Model listing for `GET /v1/models`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

/// Usage of one window as current/limit, mirroring the admin page's gauge
/// rendering.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WindowUsage {
    pub current: u64,
    /// Zero means unbounded.
    pub limit: u64,
}

/// Rolling per-provider usage for `GET /api_usage`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProviderUsage {
    pub rpm: WindowUsage,
    pub tpm: WindowUsage,
    pub rpd: WindowUsage,
}

/// Response body of `GET /api_usage`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UsageReport {
    pub data: HashMap<String, ProviderUsage>,
    pub timestamp: String,
}
