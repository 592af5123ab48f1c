use std::collections::HashMap;

/// Configuration derived from environment variables.
///
/// Built from a snapshot of the environment so tests can construct one
/// without touching the process environment.
#[derive(Debug, Clone, Default)]
pub struct RotatorConfig {
    /// Bearer token required on proxy requests. `None` disables auth.
    pub proxy_api_key: Option<String>,
    /// Models excluded per provider (`IGNORE_MODELS_{PROVIDER}`).
    pub ignore_models: HashMap<String, Vec<String>>,
    /// If set for a provider, only these models are served
    /// (`WHITELIST_MODELS_{PROVIDER}`).
    pub whitelist_models: HashMap<String, Vec<String>>,
    /// Per-credential concurrency caps
    /// (`MAX_CONCURRENT_REQUESTS_PER_KEY_{PROVIDER}`), default 1.
    pub max_concurrent_per_key: HashMap<String, usize>,
    /// Skip the per-startup OAuth validation pass.
    pub skip_oauth_init_check: bool,
}

impl RotatorConfig {
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars().collect())
    }

    pub fn from_vars(vars: HashMap<String, String>) -> Self {
        let mut cfg = Self {
            proxy_api_key: vars
                .get("PROXY_API_KEY")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            skip_oauth_init_check: vars
                .get("SKIP_OAUTH_INIT_CHECK")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(false),
            ..Self::default()
        };

        for (key, value) in &vars {
            if let Some(provider) = key.strip_prefix("IGNORE_MODELS_") {
                cfg.ignore_models
                    .insert(provider.to_lowercase(), split_model_list(value));
            } else if let Some(provider) = key.strip_prefix("WHITELIST_MODELS_") {
                cfg.whitelist_models
                    .insert(provider.to_lowercase(), split_model_list(value));
            } else if let Some(provider) = key.strip_prefix("MAX_CONCURRENT_REQUESTS_PER_KEY_") {
                let provider = provider.to_lowercase();
                match value.trim().parse::<usize>() {
                    Ok(n) if n >= 1 => {
                        cfg.max_concurrent_per_key.insert(provider, n);
                    }
                    _ => {
                        tracing::warn!(
                            provider = %provider,
                            value = %value,
                            "invalid concurrency cap, must be a positive integer; using default (1)"
                        );
                    }
                }
            }
        }

        cfg
    }

    /// Concurrency cap for one credential of `provider`.
    pub fn concurrency_for(&self, provider: &str) -> usize {
        self.max_concurrent_per_key.get(provider).copied().unwrap_or(1)
    }
}

fn split_model_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .collect()
}
