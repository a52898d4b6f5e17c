//! Thin HTTP client for upstream providers.
//!
//! Wraps one pooled `reqwest::Client`, injecting the provider's credential
//! and base URL. Non-streaming calls get the provider timeout as a total
//! request deadline; streaming calls are bounded by the shared connect
//! timeout here and by the relay's idle-read timeout per chunk.

use crate::core::config::{ProviderConfig, DEFAULT_UPSTREAM_TIMEOUT_SECS};
use crate::core::error::AppError;
use serde_json::Value;
use std::time::Duration;

/// Pooled HTTP client for all providers.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .expect("failed to build HTTP client");
        Self { client }
    }

    /// POST `body` to the provider at `path`. Returns the raw response with
    /// a 2xx status; non-2xx statuses come back as `UpstreamHttp` with the
    /// captured body, transport failures as `UpstreamTransport`.
    pub async fn call(
        &self,
        provider: &ProviderConfig,
        path: &str,
        body: &Value,
        stream: bool,
    ) -> Result<reqwest::Response, AppError> {
        let url = join_url(&provider.base_url, path);
        let mut request = self
            .client
            .post(&url)
            .bearer_auth(&provider.api_key)
            .header("Content-Type", "application/json")
            .json(body);

        if !stream {
            let timeout = provider.timeout.unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS);
            request = request.timeout(Duration::from_secs(timeout));
        }

        let response = request.send().await.map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::UpstreamHttp {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn map_transport_error(err: reqwest::Error) -> AppError {
    if err.is_timeout() {
        AppError::UpstreamTransport(format!("upstream request timed out: {err}"))
    } else if err.is_connect() {
        AppError::UpstreamTransport(format!("failed to connect to upstream: {err}"))
    } else {
        AppError::UpstreamTransport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url_handles_slashes() {
        assert_eq!(
            join_url("https://api.test/v1", "chat/completions"),
            "https://api.test/v1/chat/completions"
        );
        assert_eq!(
            join_url("https://api.test/v1/", "/chat/completions"),
            "https://api.test/v1/chat/completions"
        );
    }
}
