use std::path::PathBuf;
use std::time::Duration;

/// Errors from credential discovery, refresh, rotation, and upstream calls.
#[derive(Debug, thiserror::Error)]
pub enum RotatorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("credential file not found: {0}")]
    CredentialMissing(PathBuf),

    #[error("credential file corrupt: {path}: {reason}")]
    CredentialCorrupt { path: PathBuf, reason: String },

    /// 429/5xx/network failure during token refresh; retried with backoff.
    #[error("transient refresh failure: {0}")]
    RefreshTransient(String),

    /// 401/403 from the token endpoint; the refresh token is no longer usable.
    #[error("refresh token rejected by token endpoint (HTTP {status})")]
    RefreshInvalidGrant { status: u16 },

    #[error("interactive re-authorization timed out after {0:?}")]
    ReauthTimeout(Duration),

    #[error("interactive re-authorization cancelled")]
    ReauthCancelled,

    #[error("no available credential for provider '{0}'")]
    NoAvailableCredential(String),

    /// Error status from the upstream model invocation, with enough
    /// structure for rotation decisions (no string matching on bodies).
    #[error("upstream returned HTTP {status}")]
    Upstream {
        status: u16,
        retry_after_ms: Option<u64>,
        body: String,
    },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl RotatorError {
    /// True for upstream errors that should rotate to another credential
    /// rather than surface to the caller.
    pub fn is_credential_scoped(&self) -> bool {
        matches!(
            self,
            RotatorError::Upstream { status: 401 | 403 | 429, .. }
        )
    }
}
