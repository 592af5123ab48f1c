//! Static model catalog: per-provider model tables with context limits
//! and pricing, filtered by the ignore/whitelist configuration.

use rotator::RotatorConfig;
use rotator::client::split_model_id;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
pub struct ModelEntry {
    pub provider: &'static str,
    pub id: &'static str,
    pub context_window: u64,
    pub max_output_tokens: u64,
    /// USD per token.
    pub input_cost_per_token: f64,
    pub output_cost_per_token: f64,
    pub supports_tools: bool,
    pub supports_vision: bool,
}

static MODELS: &[ModelEntry] = &[
    // OpenAI
    ModelEntry { provider: "openai", id: "gpt-4o", context_window: 128_000, max_output_tokens: 16_384, input_cost_per_token: 2.5e-6, output_cost_per_token: 10.0e-6, supports_tools: true, supports_vision: true },
    ModelEntry { provider: "openai", id: "gpt-4o-mini", context_window: 128_000, max_output_tokens: 16_384, input_cost_per_token: 0.15e-6, output_cost_per_token: 0.6e-6, supports_tools: true, supports_vision: true },
    ModelEntry { provider: "openai", id: "gpt-4.1", context_window: 1_047_576, max_output_tokens: 32_768, input_cost_per_token: 2.0e-6, output_cost_per_token: 8.0e-6, supports_tools: true, supports_vision: true },
    ModelEntry { provider: "openai", id: "text-embedding-3-small", context_window: 8_191, max_output_tokens: 0, input_cost_per_token: 0.02e-6, output_cost_per_token: 0.0, supports_tools: false, supports_vision: false },
    // Anthropic
    ModelEntry { provider: "anthropic", id: "claude-sonnet-4-20250514", context_window: 200_000, max_output_tokens: 64_000, input_cost_per_token: 3.0e-6, output_cost_per_token: 15.0e-6, supports_tools: true, supports_vision: true },
    ModelEntry { provider: "anthropic", id: "claude-haiku-3-5-20241022", context_window: 200_000, max_output_tokens: 8_192, input_cost_per_token: 0.8e-6, output_cost_per_token: 4.0e-6, supports_tools: true, supports_vision: true },
    // Gemini (API key and OAuth variants serve the same catalog)
    ModelEntry { provider: "gemini", id: "gemini-2.5-pro", context_window: 1_048_576, max_output_tokens: 65_536, input_cost_per_token: 1.25e-6, output_cost_per_token: 10.0e-6, supports_tools: true, supports_vision: true },
    ModelEntry { provider: "gemini", id: "gemini-2.5-flash", context_window: 1_048_576, max_output_tokens: 65_536, input_cost_per_token: 0.3e-6, output_cost_per_token: 2.5e-6, supports_tools: true, supports_vision: true },
    ModelEntry { provider: "gemini_cli", id: "gemini-2.5-pro", context_window: 1_048_576, max_output_tokens: 65_536, input_cost_per_token: 0.0, output_cost_per_token: 0.0, supports_tools: true, supports_vision: true },
    ModelEntry { provider: "gemini_cli", id: "gemini-2.5-flash", context_window: 1_048_576, max_output_tokens: 65_536, input_cost_per_token: 0.0, output_cost_per_token: 0.0, supports_tools: true, supports_vision: true },
    ModelEntry { provider: "antigravity", id: "gemini-2.5-pro", context_window: 1_048_576, max_output_tokens: 65_536, input_cost_per_token: 0.0, output_cost_per_token: 0.0, supports_tools: true, supports_vision: true },
    // Qwen
    ModelEntry { provider: "qwen_code", id: "qwen3-coder-plus", context_window: 1_000_000, max_output_tokens: 65_536, input_cost_per_token: 0.0, output_cost_per_token: 0.0, supports_tools: true, supports_vision: false },
    ModelEntry { provider: "qwen_code", id: "qwen3-coder-flash", context_window: 1_000_000, max_output_tokens: 65_536, input_cost_per_token: 0.0, output_cost_per_token: 0.0, supports_tools: true, supports_vision: false },
    // iFlow
    ModelEntry { provider: "iflow", id: "qwen3-max", context_window: 262_144, max_output_tokens: 32_768, input_cost_per_token: 0.0, output_cost_per_token: 0.0, supports_tools: true, supports_vision: false },
    ModelEntry { provider: "iflow", id: "deepseek-v3.1", context_window: 131_072, max_output_tokens: 32_768, input_cost_per_token: 0.0, output_cost_per_token: 0.0, supports_tools: true, supports_vision: false },
    // Groq
    ModelEntry { provider: "groq", id: "llama-3.3-70b-versatile", context_window: 131_072, max_output_tokens: 32_768, input_cost_per_token: 0.59e-6, output_cost_per_token: 0.79e-6, supports_tools: true, supports_vision: false },
    // OpenRouter
    ModelEntry { provider: "openrouter", id: "meta-llama/llama-3.3-70b-instruct", context_window: 131_072, max_output_tokens: 16_384, input_cost_per_token: 0.3e-6, output_cost_per_token: 0.3e-6, supports_tools: true, supports_vision: false },
];

pub struct Catalog {
    ignore: HashMap<String, Vec<String>>,
    whitelist: HashMap<String, Vec<String>>,
}

impl Catalog {
    pub fn new(config: &RotatorConfig) -> Self {
        Self {
            ignore: config.ignore_models.clone(),
            whitelist: config.whitelist_models.clone(),
        }
    }

    fn served(&self, provider: &str, model: &str) -> bool {
        if let Some(allowed) = self.whitelist.get(provider) {
            if !allowed.iter().any(|m| m == model) {
                return false;
            }
        }
        if let Some(ignored) = self.ignore.get(provider) {
            if ignored.iter().any(|m| m == model) {
                return false;
            }
        }
        true
    }

    /// Full `provider/model` ids served for the configured providers.
    pub fn list(&self, providers: &[String]) -> Vec<String> {
        let mut out = Vec::new();
        for entry in MODELS {
            if providers.iter().any(|p| p == entry.provider)
                && self.served(entry.provider, entry.id)
            {
                out.push(format!("{}/{}", entry.provider, entry.id));
            }
        }
        out
    }

    pub fn lookup(&self, full_id: &str) -> Option<&'static ModelEntry> {
        let (provider, model) = split_model_id(full_id)?;
        MODELS
            .iter()
            .find(|e| e.provider == provider && e.id == model)
            .filter(|e| self.served(e.provider, e.id))
    }
}

/// Rough token estimate: one token per four characters of content, plus
/// a small per-message overhead. Good enough for budgeting; providers
/// report exact usage in their responses.
pub fn estimate_tokens(messages: &[serde_json::Value]) -> u64 {
    let mut chars = 0usize;
    for msg in messages {
        if let Some(content) = msg.get("content") {
            match content {
                serde_json::Value::String(s) => chars += s.len(),
                serde_json::Value::Array(parts) => {
                    for part in parts {
                        if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                            chars += text.len();
                        }
                    }
                }
                _ => {}
            }
        }
    }
    (chars as u64).div_ceil(4) + messages.len() as u64 * 4
}

pub fn estimate_cost(entry: &ModelEntry, prompt_tokens: u64, completion_tokens: u64) -> f64 {
    prompt_tokens as f64 * entry.input_cost_per_token
        + completion_tokens as f64 * entry.output_cost_per_token
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;

    fn config(pairs: &[(&str, &str)]) -> RotatorConfig {
        let vars: StdHashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RotatorConfig::from_vars(vars)
    }

    #[test]
    fn lists_only_configured_providers() {
        let catalog = Catalog::new(&config(&[]));
        let models = catalog.list(&["openai".to_string()]);
        assert!(models.contains(&"openai/gpt-4o".to_string()));
        assert!(!models.iter().any(|m| m.starts_with("qwen_code/")));
    }

    #[test]
    fn ignore_list_drops_models() {
        let catalog = Catalog::new(&config(&[("IGNORE_MODELS_OPENAI", "gpt-4o")]));
        let models = catalog.list(&["openai".to_string()]);
        assert!(!models.contains(&"openai/gpt-4o".to_string()));
        assert!(models.contains(&"openai/gpt-4o-mini".to_string()));
    }

    #[test]
    fn whitelist_serves_only_listed_models() {
        let catalog = Catalog::new(&config(&[("WHITELIST_MODELS_OPENAI", "gpt-4o-mini")]));
        let models = catalog.list(&["openai".to_string()]);
        assert_eq!(models, vec!["openai/gpt-4o-mini".to_string()]);
        assert!(catalog.lookup("openai/gpt-4o").is_none());
    }

    #[test]
    fn token_estimate_counts_text_and_overhead() {
        let messages = vec![
            json!({"role": "user", "content": "12345678"}),
            json!({"role": "user", "content": [{"type": "text", "text": "abcd"}]}),
        ];
        // 8 chars -> 2 tokens, 4 chars -> 1 token, 2 messages * 4 overhead
        assert_eq!(estimate_tokens(&messages), 2 + 1 + 8);
    }

    #[test]
    fn cost_estimate_uses_table_pricing() {
        let catalog = Catalog::new(&config(&[]));
        let entry = catalog.lookup("openai/gpt-4o").unwrap();
        let cost = estimate_cost(entry, 1000, 500);
        assert!((cost - (1000.0 * 2.5e-6 + 500.0 * 10.0e-6)).abs() < 1e-12);
    }
}
