//! Routing configuration management.
//!
//! This module holds the live routing document that maps logical models to
//! upstream providers, loads it from a YAML file, validates every mutation,
//! and persists changes atomically (write-to-temp + rename). Readers take an
//! immutable snapshot that stays stable for the lifetime of a request even
//! while admin edits land concurrently.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Default timeout applied to non-streaming upstream calls when a provider
/// does not declare one.
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 60;

/// Default idle-read timeout for streamed responses.
pub const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 90;

/// Errors produced while loading or mutating the routing document.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("failed to persist config to {path}: {source}")]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("model '{model}' binds unknown provider '{provider}'")]
    UnknownProvider { model: String, provider: String },

    #[error("provider '{provider}' has invalid base_url '{base_url}': {reason}")]
    InvalidBaseUrl {
        provider: String,
        base_url: String,
        reason: String,
    },

    #[error("provider '{0}' is not configured")]
    NoSuchProvider(String),

    #[error("model '{model}' has no binding for provider '{provider}'")]
    NoSuchBinding { model: String, provider: String },
}

/// Per-provider sliding-window quota declarations. Absent values mean
/// unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    /// Requests per rolling minute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpm: Option<u32>,

    /// Tokens per rolling minute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tpm: Option<u64>,

    /// Requests per rolling 24 hours.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpd: Option<u32>,

    /// Maximum tokens a single request may claim. Stateless ceiling, not a
    /// window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tpr: Option<u64>,
}

/// Which limit field an admin edit targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum LimitField {
    Rpm,
    Tpm,
    Rpd,
    Tpr,
}

/// A single upstream provider entry in the routing document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Absolute URL prefix ending at the provider's `/v1` equivalent.
    pub base_url: String,

    /// Bearer credential injected into every upstream request.
    pub api_key: String,

    #[serde(default, skip_serializing_if = "rate_limits_is_empty")]
    pub limits: RateLimits,

    /// Connect / idle timeout in seconds for calls to this provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

fn rate_limits_is_empty(limits: &RateLimits) -> bool {
    *limits == RateLimits::default()
}

/// A (logical model, provider) binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBinding {
    /// Provider-local model name. Absent forwards the logical name
    /// unchanged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// Disabled bindings are skipped by selection but keep their counters.
    #[serde(default = "default_enable")]
    pub enable: bool,
}

fn default_enable() -> bool {
    true
}

impl Default for ModelBinding {
    fn default() -> Self {
        Self {
            alias: None,
            enable: true,
        }
    }
}

/// Fine-grained edit applied to a single binding.
#[derive(Debug, Clone, Default)]
pub struct BindingEdit {
    pub enable: Option<bool>,
    /// `Some(None)` clears the alias, `Some(Some(_))` replaces it.
    pub alias: Option<Option<String>>,
}

/// The routing document: providers plus the model binding table.
///
/// Both maps are `IndexMap` because declaration order is semantic: the
/// selector walks bindings in the order the operator listed them, and `auto`
/// resolution walks models in document order. Unknown top-level keys are
/// carried in `extra` so a rewrite never drops them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub api_provider: IndexMap<String, ProviderConfig>,

    #[serde(default)]
    pub model_config: IndexMap<String, IndexMap<String, ModelBinding>>,

    #[serde(flatten)]
    pub extra: IndexMap<String, serde_yaml::Value>,
}

impl RoutingConfig {
    /// Validate the whole document: every binding must point at a declared
    /// provider and every base_url must parse as an absolute URL.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, provider) in &self.api_provider {
            if let Err(err) = reqwest::Url::parse(&provider.base_url) {
                return Err(ConfigError::InvalidBaseUrl {
                    provider: name.clone(),
                    base_url: provider.base_url.clone(),
                    reason: err.to_string(),
                });
            }
        }
        for (model, bindings) in &self.model_config {
            for provider in bindings.keys() {
                if !self.api_provider.contains_key(provider) {
                    return Err(ConfigError::UnknownProvider {
                        model: model.clone(),
                        provider: provider.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Look up a provider by name.
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.api_provider.get(name)
    }

    /// Look up the binding for (model, provider).
    pub fn binding(&self, model: &str, provider: &str) -> Option<&ModelBinding> {
        self.model_config.get(model).and_then(|b| b.get(provider))
    }
}

/// Owner of the live routing document.
///
/// Reads are copy-on-write: `snapshot` hands out the current `Arc` and every
/// successful mutation publishes a fresh one, so in-flight requests keep the
/// view they started with. Mutations validate first, persist to disk, and
/// only then swap the live pointer, so a partial write never becomes
/// visible.
pub struct ConfigStore {
    path: PathBuf,
    live: RwLock<Arc<RoutingConfig>>,
}

impl ConfigStore {
    /// Load and validate the document at `path`.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config: RoutingConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(Self {
            path,
            live: RwLock::new(Arc::new(config)),
        })
    }

    /// Build a store around an in-memory document, persisting to `path`.
    pub fn new(path: impl Into<PathBuf>, config: RoutingConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            path: path.into(),
            live: RwLock::new(Arc::new(config)),
        })
    }

    /// Current immutable view. Cheap to clone and safe to hold across a
    /// request.
    pub fn snapshot(&self) -> Arc<RoutingConfig> {
        self.live.read().expect("config lock poisoned").clone()
    }

    /// Path of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Validate `next`, persist it, then atomically publish it.
    pub fn replace(&self, next: RoutingConfig) -> Result<(), ConfigError> {
        next.validate()?;
        let next = Arc::new(next);
        self.persist(&next)?;
        *self.live.write().expect("config lock poisoned") = next;
        Ok(())
    }

    /// Apply a fine-grained edit to one binding.
    pub fn update_binding(
        &self,
        model: &str,
        provider: &str,
        edit: BindingEdit,
    ) -> Result<(), ConfigError> {
        let mut next = (*self.snapshot()).clone();
        let binding = next
            .model_config
            .get_mut(model)
            .and_then(|b| b.get_mut(provider))
            .ok_or_else(|| ConfigError::NoSuchBinding {
                model: model.to_string(),
                provider: provider.to_string(),
            })?;
        if let Some(enable) = edit.enable {
            binding.enable = enable;
        }
        if let Some(alias) = edit.alias {
            binding.alias = alias;
        }
        self.replace(next)
    }

    /// Set or clear one quota field on a provider.
    pub fn update_limit(
        &self,
        provider: &str,
        field: LimitField,
        value: Option<u64>,
    ) -> Result<(), ConfigError> {
        let mut next = (*self.snapshot()).clone();
        let entry = next
            .api_provider
            .get_mut(provider)
            .ok_or_else(|| ConfigError::NoSuchProvider(provider.to_string()))?;
        match field {
            LimitField::Rpm => entry.limits.rpm = value.map(|v| v as u32),
            LimitField::Tpm => entry.limits.tpm = value,
            LimitField::Rpd => entry.limits.rpd = value.map(|v| v as u32),
            LimitField::Tpr => entry.limits.tpr = value,
        }
        self.replace(next)
    }

    /// Replace a provider's credential.
    pub fn set_key(&self, provider: &str, api_key: String) -> Result<(), ConfigError> {
        let mut next = (*self.snapshot()).clone();
        let entry = next
            .api_provider
            .get_mut(provider)
            .ok_or_else(|| ConfigError::NoSuchProvider(provider.to_string()))?;
        entry.api_key = api_key;
        self.replace(next)
    }

    /// Update a provider's base URL.
    pub fn set_base_url(&self, provider: &str, base_url: String) -> Result<(), ConfigError> {
        let mut next = (*self.snapshot()).clone();
        let entry = next
            .api_provider
            .get_mut(provider)
            .ok_or_else(|| ConfigError::NoSuchProvider(provider.to_string()))?;
        entry.base_url = base_url;
        self.replace(next)
    }

    fn persist(&self, config: &RoutingConfig) -> Result<(), ConfigError> {
        let serialized = serde_yaml::to_string(config)?;
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|source| {
            ConfigError::Persist {
                path: self.path.clone(),
                source,
            }
        })?;
        std::io::Write::write_all(&mut tmp, serialized.as_bytes()).map_err(|source| {
            ConfigError::Persist {
                path: self.path.clone(),
                source,
            }
        })?;
        tmp.persist(&self.path).map_err(|err| ConfigError::Persist {
            path: self.path.clone(),
            source: err.error,
        })?;
        Ok(())
    }
}
