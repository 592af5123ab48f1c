use crate::credentials::OAuthTokens;
use crate::error::RotatorError;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_REAUTH_TIMEOUT: Duration = Duration::from_secs(300);

type InflightFlow = Shared<BoxFuture<'static, Result<OAuthTokens, String>>>;

/// Process-wide gate for interactive OAuth flows.
///
/// At most one device-code flow runs at any time, so the user never sees
/// two browser windows or interleaved console prompts. Callers asking to
/// re-authorize a credential that already has a flow in progress join
/// that flow instead of starting a second one.
///
/// Owned by the proxy root and injected into every OAuth authenticator.
pub struct ReauthCoordinator {
    interactive_gate: Arc<tokio::sync::Mutex<()>>,
    inflight: Mutex<HashMap<String, InflightFlow>>,
    timeout: Duration,
}

impl Default for ReauthCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ReauthCoordinator {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_REAUTH_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            interactive_gate: Arc::new(tokio::sync::Mutex::new(())),
            inflight: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Run `flow` under the global interactive gate.
    ///
    /// `reauth_id` identifies the credential (`provider:basename`); a
    /// second caller with the same id while the flow is running awaits
    /// the in-flight result. Returns `ReauthTimeout` if the flow (plus
    /// any wait for the gate) exceeds the coordinator timeout.
    pub async fn execute<F>(&self, reauth_id: &str, flow: F) -> Result<OAuthTokens, RotatorError>
    where
        F: Future<Output = Result<OAuthTokens, RotatorError>> + Send + 'static,
    {
        enum Role {
            Owner(InflightFlow),
            Joiner(InflightFlow),
        }

        let role = {
            let mut map = self.inflight.lock();
            if let Some(existing) = map.get(reauth_id) {
                Role::Joiner(existing.clone())
            } else {
                // The gate is acquired inside the shared future, so a
                // joiner polling it cannot bypass global serialization.
                let gate = Arc::clone(&self.interactive_gate);
                let shared: InflightFlow = async move {
                    let _guard = gate.lock().await;
                    flow.await.map_err(|e| e.to_string())
                }
                .boxed()
                .shared();
                map.insert(reauth_id.to_string(), shared.clone());
                Role::Owner(shared)
            }
        };

        match role {
            Role::Joiner(shared) => {
                tracing::info!(reauth_id, "re-authorization already in progress, joining");
                match tokio::time::timeout(self.timeout, shared).await {
                    Err(_) => Err(RotatorError::ReauthTimeout(self.timeout)),
                    Ok(Ok(tokens)) => Ok(tokens),
                    Ok(Err(msg)) => Err(RotatorError::Internal(format!(
                        "re-authorization failed: {msg}"
                    ))),
                }
            }
            Role::Owner(shared) => {
                tracing::info!(reauth_id, "starting interactive re-authorization");
                let result = tokio::time::timeout(self.timeout, shared).await;
                self.inflight.lock().remove(reauth_id);
                match result {
                    Err(_) => {
                        tracing::error!(reauth_id, "re-authorization timed out");
                        Err(RotatorError::ReauthTimeout(self.timeout))
                    }
                    Ok(Ok(tokens)) => {
                        tracing::info!(reauth_id, "re-authorization completed");
                        Ok(tokens)
                    }
                    Ok(Err(msg)) => Err(RotatorError::Internal(format!(
                        "re-authorization failed: {msg}"
                    ))),
                }
            }
        }
    }
}
