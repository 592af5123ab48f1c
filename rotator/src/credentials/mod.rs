pub mod manager;
pub mod store;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

// ---------------------------------------------------------------------------
// Credential identity
// ---------------------------------------------------------------------------

/// Stable identifier for one credential.
///
/// Three forms:
/// - a filesystem path (`./oauth_creds/qwen_code_oauth_1.json`)
/// - `env://{provider}/{index}` for OAuth credentials assembled from
///   environment variables
/// - `env-key://{provider}/{n}` for plain API keys from the environment
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialId(String);

impl CredentialId {
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self(path.as_ref().to_string_lossy().into_owned())
    }

    pub fn from_env(provider: &str, index: &str) -> Self {
        Self(format!("env://{}/{}", provider, index))
    }

    pub fn from_env_key(provider: &str, ordinal: usize) -> Self {
        Self(format!("env-key://{}/{}", provider, ordinal))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_env(&self) -> bool {
        self.0.starts_with("env://") || self.0.starts_with("env-key://")
    }

    /// The env credential index for `env://provider/N` ids.
    pub fn env_index(&self) -> Option<&str> {
        self.0.strip_prefix("env://")?.split('/').nth(1)
    }

    /// Short human-readable name: file basename, or the virtual id itself.
    pub fn basename(&self) -> &str {
        if self.is_env() {
            &self.0
        } else {
            Path::new(&self.0)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(&self.0)
        }
    }
}

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.basename())
    }
}

// ---------------------------------------------------------------------------
// Credential types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyCredential {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// Provider-specific optional fields carried alongside the token set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderExtras {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Some providers hand out a long-lived API key next to the OAuth
    /// token set; when present it is used as the bearer instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Bookkeeping stored under `_proxy_metadata` in the credential file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check_timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub loaded_from_env: bool,
}

/// An OAuth token set as persisted on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthTokens {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    /// Expiry timestamp in milliseconds since epoch.
    #[serde(default)]
    pub expiry_date: i64,
    /// Optional per-credential override of the provider base URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_url: Option<String>,
    #[serde(flatten)]
    pub extras: ProviderExtras,
    #[serde(rename = "_proxy_metadata", default)]
    pub metadata: CredentialMetadata,
}

impl OAuthTokens {
    pub fn is_expired(&self) -> bool {
        self.expires_within(std::time::Duration::ZERO)
    }

    /// True when the token expires within `buffer` from now.
    pub fn expires_within(&self, buffer: std::time::Duration) -> bool {
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.expiry_date < now_ms + buffer.as_millis() as i64
    }

    pub fn email(&self) -> Option<&str> {
        self.metadata.email.as_deref()
    }
}
