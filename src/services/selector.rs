//! Candidate provider selection.
//!
//! Maps a logical model to the ordered list of providers that may serve it
//! right now. Configuration order is authoritative: there is no
//! randomization and no load-based reordering, so a healthy earlier provider
//! always wins and operators get deterministic routing by listing providers
//! in preference order.

use crate::core::config::RoutingConfig;
use crate::core::rate_limiter::RateLimiter;
use std::collections::BTreeMap;

/// Special logical model that resolves to the first eligible binding across
/// the whole document, in declaration order.
pub const AUTO_MODEL: &str = "auto";

/// An eligible (provider, upstream model) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub provider: String,
    /// Model name sent upstream: the binding alias, or the binding's logical
    /// model when no alias is set. Never a name absent from both the
    /// caller's request and the config.
    pub upstream_model: String,
}

/// Produced when no binding survives filtering. Carries one deny reason per
/// provider considered, for the 503 diagnostics payload.
#[derive(Debug, Clone)]
pub struct SelectionError {
    pub model: String,
    pub reasons: BTreeMap<String, String>,
}

/// Compute the ordered candidate list for `model` with an estimated token
/// footprint of `tokens_hint`.
pub fn select_candidates(
    config: &RoutingConfig,
    limiter: &RateLimiter,
    model: &str,
    tokens_hint: Option<u64>,
) -> Result<Vec<Candidate>, SelectionError> {
    let mut candidates = Vec::new();
    let mut reasons: BTreeMap<String, String> = BTreeMap::new();
    let mut seen_providers = Vec::new();

    let bindings: Vec<(&str, &str, &crate::core::config::ModelBinding)> = if model == AUTO_MODEL {
        config
            .model_config
            .iter()
            .flat_map(|(logical, bindings)| {
                bindings
                    .iter()
                    .map(move |(provider, binding)| (logical.as_str(), provider.as_str(), binding))
            })
            .collect()
    } else {
        match config.model_config.get(model) {
            Some(bindings) => bindings
                .iter()
                .map(|(provider, binding)| (model, provider.as_str(), binding))
                .collect(),
            None => {
                return Err(SelectionError {
                    model: model.to_string(),
                    reasons: BTreeMap::from([(
                        model.to_string(),
                        "model not present in routing config".to_string(),
                    )]),
                });
            }
        }
    };

    for (logical, provider, binding) in bindings {
        // `auto` takes the union over providers: the first eligible binding
        // per provider wins.
        if model == AUTO_MODEL && seen_providers.contains(&provider.to_string()) {
            continue;
        }

        if !binding.enable {
            reasons
                .entry(provider.to_string())
                .or_insert_with(|| "binding disabled".to_string());
            continue;
        }

        let Some(provider_cfg) = config.provider(provider) else {
            // Validation rejects this at write time; treat a stale snapshot
            // defensively rather than panicking.
            reasons.insert(provider.to_string(), "provider not configured".to_string());
            continue;
        };

        if let Err(deny) = limiter.check(provider, &provider_cfg.limits, tokens_hint) {
            reasons.insert(provider.to_string(), deny.to_string());
            continue;
        }

        let upstream_model = binding
            .alias
            .clone()
            .unwrap_or_else(|| logical.to_string());
        seen_providers.push(provider.to_string());
        reasons.remove(provider);
        candidates.push(Candidate {
            provider: provider.to_string(),
            upstream_model,
        });
    }

    if candidates.is_empty() {
        return Err(SelectionError {
            model: model.to_string(),
            reasons,
        });
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{ModelBinding, ProviderConfig, RateLimits, RoutingConfig};
    use indexmap::IndexMap;

    fn provider(rpm: Option<u32>) -> ProviderConfig {
        ProviderConfig {
            base_url: "https://api.test/v1".to_string(),
            api_key: "sk-test".to_string(),
            limits: RateLimits {
                rpm,
                ..Default::default()
            },
            timeout: None,
        }
    }

    fn binding(alias: Option<&str>, enable: bool) -> ModelBinding {
        ModelBinding {
            alias: alias.map(str::to_string),
            enable,
        }
    }

    fn config() -> RoutingConfig {
        let mut api_provider = IndexMap::new();
        api_provider.insert("first".to_string(), provider(None));
        api_provider.insert("second".to_string(), provider(None));
        api_provider.insert("third".to_string(), provider(Some(1)));

        let mut gpt4o = IndexMap::new();
        gpt4o.insert("first".to_string(), binding(None, true));
        gpt4o.insert("second".to_string(), binding(Some("gpt4o-mini"), true));

        let mut haiku = IndexMap::new();
        haiku.insert("third".to_string(), binding(None, true));
        haiku.insert("second".to_string(), binding(Some("haiku-alt"), true));

        let mut model_config = IndexMap::new();
        model_config.insert("gpt-4o".to_string(), gpt4o);
        model_config.insert("claude-haiku".to_string(), haiku);

        RoutingConfig {
            api_provider,
            model_config,
            extra: IndexMap::new(),
        }
    }

    #[test]
    fn test_candidates_follow_declaration_order() {
        let limiter = RateLimiter::new();
        let candidates = select_candidates(&config(), &limiter, "gpt-4o", None).unwrap();

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].provider, "first");
        assert_eq!(candidates[0].upstream_model, "gpt-4o");
        assert_eq!(candidates[1].provider, "second");
        assert_eq!(candidates[1].upstream_model, "gpt4o-mini");
    }

    #[test]
    fn test_disabled_binding_is_skipped() {
        let mut cfg = config();
        cfg.model_config
            .get_mut("gpt-4o")
            .unwrap()
            .get_mut("first")
            .unwrap()
            .enable = false;

        let limiter = RateLimiter::new();
        let candidates = select_candidates(&cfg, &limiter, "gpt-4o", None).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].provider, "second");
    }

    #[test]
    fn test_quota_denied_provider_is_filtered_with_reason() {
        let cfg = config();
        let limiter = RateLimiter::new();
        let _inflight = limiter.reserve("third");

        // third (rpm=1) is saturated, so claude-haiku falls through to
        // second.
        let candidates = select_candidates(&cfg, &limiter, "claude-haiku", None).unwrap();
        assert_eq!(candidates[0].provider, "second");

        // With the remaining provider also saturated the selection fails
        // and names both reasons.
        let mut tight = config();
        tight.api_provider.get_mut("second").unwrap().limits.rpm = Some(1);
        let _inflight2 = limiter.reserve("second");

        let err = select_candidates(&tight, &limiter, "claude-haiku", None).unwrap_err();
        assert!(err.reasons["third"].contains("rpm"));
        assert!(err.reasons["second"].contains("rpm"));
    }

    #[test]
    fn test_tpr_violation_reports_reason() {
        let mut cfg = config();
        cfg.api_provider.get_mut("first").unwrap().limits.tpr = Some(100);
        cfg.api_provider.get_mut("second").unwrap().limits.tpr = Some(100);

        let limiter = RateLimiter::new();
        let err = select_candidates(&cfg, &limiter, "gpt-4o", Some(500)).unwrap_err();
        assert!(err.reasons["first"].contains("tpr"));
    }

    #[test]
    fn test_unknown_model_fails_selection() {
        let limiter = RateLimiter::new();
        let err = select_candidates(&config(), &limiter, "ghost-model", None).unwrap_err();
        assert_eq!(err.model, "ghost-model");
        assert!(!err.reasons.is_empty());
    }

    #[test]
    fn test_auto_walks_global_declaration_order() {
        let limiter = RateLimiter::new();
        let candidates = select_candidates(&config(), &limiter, AUTO_MODEL, None).unwrap();

        // gpt-4o is declared first, so its providers lead; third comes from
        // claude-haiku. second already appeared under gpt-4o, so its
        // claude-haiku binding is not added again.
        let providers: Vec<&str> = candidates.iter().map(|c| c.provider.as_str()).collect();
        assert_eq!(providers, vec!["first", "second", "third"]);
        assert_eq!(candidates[2].upstream_model, "claude-haiku");
    }

    #[test]
    fn test_auto_resolves_logical_model_not_auto() {
        let limiter = RateLimiter::new();
        let candidates = select_candidates(&config(), &limiter, AUTO_MODEL, None).unwrap();
        for candidate in candidates {
            assert_ne!(candidate.upstream_model, AUTO_MODEL);
        }
    }

    #[test]
    fn test_all_disabled_reports_each_provider() {
        let mut cfg = config();
        for binding in cfg.model_config.get_mut("gpt-4o").unwrap().values_mut() {
            binding.enable = false;
        }

        let limiter = RateLimiter::new();
        let err = select_candidates(&cfg, &limiter, "gpt-4o", None).unwrap_err();
        assert_eq!(err.reasons.len(), 2);
        assert!(err.reasons.values().all(|r| r.contains("disabled")));
    }
}
