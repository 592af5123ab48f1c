pub mod api_key;
pub mod device_flow;
pub mod headless;
pub mod oauth;
pub mod pkce;
pub mod profiles;

use crate::credentials::CredentialId;
use crate::error::RotatorError;
use async_trait::async_trait;

/// What a request needs to call the upstream provider.
#[derive(Debug, Clone)]
pub struct ApiDetails {
    pub base_url: String,
    pub bearer_token: String,
}

/// User identity attached to a credential, used for deduplication.
#[derive(Debug, Clone, Default)]
pub struct UserInfo {
    pub email: Option<String>,
}

/// Per-provider authentication adapter.
///
/// Two variants exist: plain API keys (trivial) and device-code OAuth
/// ([`oauth::OAuthAuthenticator`]), which owns the refresh lifecycle.
/// All refresh state lives behind this trait; the rotator only ever
/// asks for `api_details`, availability, and refresh enqueues.
#[async_trait]
pub trait ProviderAuth: Send + Sync {
    /// Symbolic provider name (e.g. `qwen_code`, `openai`).
    fn provider(&self) -> &str;

    /// Validate (and if necessary repair) a credential at startup.
    async fn initialize(&self, id: &CredentialId) -> Result<(), RotatorError>;

    /// Resolve `(base_url, bearer_token)` for a request. OAuth variants
    /// refresh inline when the token expires within the refresh buffer.
    async fn api_details(&self, id: &CredentialId) -> Result<ApiDetails, RotatorError>;

    /// Identity for deduplication. Providers without a user endpoint
    /// return an empty identity and are treated as unique.
    async fn user_info(&self, id: &CredentialId) -> Result<UserInfo, RotatorError>;

    /// Queue an asynchronous refresh. `needs_reauth` bypasses the
    /// failure backoff window (reactive refreshes after upstream
    /// 401/403).
    async fn enqueue_refresh(&self, id: &CredentialId, force: bool, needs_reauth: bool);

    /// Whether the credential may be handed out by the rotator right
    /// now. Performs lazy TTL cleanup of stuck entries.
    fn is_available(&self, id: &CredentialId) -> bool;

    /// Check expiry and enqueue a refresh when the token is inside the
    /// refresh buffer. Called by the background refresher.
    async fn proactively_refresh(&self, id: &CredentialId);

    /// Cancel background workers owned by this adapter. Part of
    /// graceful shutdown; default is a no-op.
    fn shutdown(&self) {}
}

// ---------------------------------------------------------------------------
// Provider base URLs (single source; OAuth credentials may override via
// their `resource_url`)
// ---------------------------------------------------------------------------

/// Returns the default base URL for a provider. `None` for providers we
/// don't have a registered base URL for.
pub fn provider_base_url(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("https://api.openai.com/v1"),
        "anthropic" => Some("https://api.anthropic.com/v1"),
        "gemini" => Some("https://generativelanguage.googleapis.com/v1beta"),
        "gemini_cli" => Some("https://generativelanguage.googleapis.com/v1beta"),
        "antigravity" => Some("https://generativelanguage.googleapis.com/v1beta"),
        "mistral" => Some("https://api.mistral.ai/v1"),
        "cohere" => Some("https://api.cohere.ai/v1"),
        "openrouter" => Some("https://openrouter.ai/api/v1"),
        "together" => Some("https://api.together.xyz/v1"),
        "fireworks" => Some("https://api.fireworks.ai/inference/v1"),
        "groq" => Some("https://api.groq.com/openai/v1"),
        "deepseek" => Some("https://api.deepseek.com/v1"),
        "deepinfra" => Some("https://api.deepinfra.com/v1/openai"),
        "novita" => Some("https://api.novita.ai/v3/openai"),
        "xai" => Some("https://api.x.ai/v1"),
        "qwen_code" => Some("https://portal.qwen.ai/v1"),
        "iflow" => Some("https://apis.iflow.cn/v1"),
        _ => None,
    }
}
