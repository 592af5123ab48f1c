//! Device-code OAuth lifecycle engine: token cache, serialized
//! refreshes with retry and failure backoff, and escalation to the
//! interactive flow when the refresh token stops working.

use super::device_flow;
use super::profiles::{OAuthProfile, REFRESH_EXPIRY_BUFFER};
use super::{ApiDetails, ProviderAuth, UserInfo};
use crate::credentials::store::CredentialStore;
use crate::credentials::{CredentialId, OAuthTokens};
use crate::error::RotatorError;
use crate::reauth::ReauthCoordinator;
use crate::refresh_queue::{RefreshDriver, RefreshQueue};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const MAX_REFRESH_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_SECS: u64 = 30;
const BACKOFF_CAP_SECS: u64 = 300;

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    resource_url: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
}

struct BackoffState {
    failures: u32,
    next_attempt: Instant,
}

struct OAuthInner {
    profile: OAuthProfile,
    store: Arc<CredentialStore>,
    reauth: Arc<ReauthCoordinator>,
    http: reqwest::Client,
    queue: RefreshQueue,
    /// Token sets as of the last completed load/refresh. Updated only
    /// after the atomic file write succeeds.
    cache: Mutex<HashMap<CredentialId, OAuthTokens>>,
    /// Per-credential refresh serialization.
    locks: Mutex<HashMap<CredentialId, Arc<tokio::sync::Mutex<()>>>>,
    backoff: Mutex<HashMap<CredentialId, BackoffState>>,
    /// Sleep unit for transient-error retries (`2^attempt` units).
    retry_base: Duration,
}

/// OAuth device-code provider adapter. Cheap to clone; all state is
/// shared behind one inner allocation.
#[derive(Clone)]
pub struct OAuthAuthenticator {
    inner: Arc<OAuthInner>,
}

impl OAuthAuthenticator {
    pub fn new(
        profile: OAuthProfile,
        store: Arc<CredentialStore>,
        reauth: Arc<ReauthCoordinator>,
    ) -> Self {
        Self::with_retry_base(profile, store, reauth, Duration::from_secs(1))
    }

    pub fn with_retry_base(
        profile: OAuthProfile,
        store: Arc<CredentialStore>,
        reauth: Arc<ReauthCoordinator>,
        retry_base: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(OAuthInner {
                profile,
                store,
                reauth,
                http: reqwest::Client::new(),
                queue: RefreshQueue::new(),
                cache: Mutex::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                backoff: Mutex::new(HashMap::new()),
                retry_base,
            }),
        }
    }

    fn driver(&self) -> Arc<dyn RefreshDriver> {
        Arc::new(self.clone())
    }
}

impl OAuthInner {
    fn credential_lock(&self, id: &CredentialId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn cached(&self, id: &CredentialId) -> Option<OAuthTokens> {
        self.cache.lock().get(id).cloned()
    }

    fn token_is_fresh(&self, id: &CredentialId) -> bool {
        self.cached(id)
            .map(|t| !t.expires_within(REFRESH_EXPIRY_BUFFER))
            .unwrap_or(false)
    }

    fn backoff_remaining(&self, id: &CredentialId) -> Option<Duration> {
        let map = self.backoff.lock();
        let state = map.get(id)?;
        state.next_attempt.checked_duration_since(Instant::now())
    }

    fn record_failure(&self, id: &CredentialId) {
        let mut map = self.backoff.lock();
        let state = map.entry(id.clone()).or_insert(BackoffState {
            failures: 0,
            next_attempt: Instant::now(),
        });
        state.failures += 1;
        let delay = BACKOFF_CAP_SECS.min(BACKOFF_BASE_SECS.saturating_mul(1 << state.failures.min(10)));
        state.next_attempt = Instant::now() + Duration::from_secs(delay);
        tracing::debug!(
            credential = %id,
            failures = state.failures,
            backoff_secs = delay,
            "setting refresh backoff"
        );
    }

    fn clear_backoff(&self, id: &CredentialId) {
        self.backoff.lock().remove(id);
    }

    /// Load a credential into the cache (from env or disk).
    async fn load(&self, id: &CredentialId) -> Result<OAuthTokens, RotatorError> {
        if let Some(t) = self.cached(id) {
            return Ok(t);
        }
        let lock = self.credential_lock(id);
        let _guard = lock.lock().await;
        if let Some(t) = self.cached(id) {
            return Ok(t);
        }
        let tokens = self.store.load(id)?;
        self.cache.lock().insert(id.clone(), tokens.clone());
        Ok(tokens)
    }

    fn display_name(&self, id: &CredentialId) -> String {
        self.cached(id)
            .and_then(|t| t.metadata.display_name)
            .unwrap_or_else(|| id.basename().to_string())
    }

    /// One pass of the refresh algorithm against the token endpoint.
    /// Transient failures (429/5xx/network) are retried up to three
    /// times with exponential backoff; 401/403 classifies as invalid
    /// grant and is never retried here.
    async fn refresh_over_http(
        &self,
        id: &CredentialId,
        refresh_token: &str,
    ) -> Result<RefreshResponse, RotatorError> {
        let client_id = self.profile.client_id();
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("client_id", client_id),
        ];
        if let Some(secret) = self.profile.client_secret() {
            form.push(("client_secret", secret));
        }

        let mut last_error: Option<RotatorError> = None;
        for attempt in 0..MAX_REFRESH_ATTEMPTS {
            let result = self
                .http
                .post(self.profile.token_url)
                .header("Accept", "application/json")
                .form(&form)
                .send()
                .await;

            let resp = match result {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(
                        credential = %id,
                        attempt = attempt + 1,
                        error = %e,
                        "network error during token refresh"
                    );
                    last_error = Some(RotatorError::RefreshTransient(e.to_string()));
                    if attempt + 1 < MAX_REFRESH_ATTEMPTS {
                        tokio::time::sleep(self.retry_base * (1u32 << attempt)).await;
                        continue;
                    }
                    break;
                }
            };

            let status = resp.status().as_u16();
            match status {
                200..=299 => {
                    return Ok(resp.json().await?);
                }
                401 | 403 => {
                    let body = resp.text().await.unwrap_or_default();
                    tracing::warn!(
                        credential = %id,
                        status,
                        body = %body,
                        "refresh token rejected, token may have been revoked"
                    );
                    return Err(RotatorError::RefreshInvalidGrant { status });
                }
                429 => {
                    let retry_after = resp
                        .headers()
                        .get("Retry-After")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.trim().parse::<u64>().ok())
                        .unwrap_or(60);
                    tracing::warn!(credential = %id, retry_after, "token endpoint rate limited");
                    last_error = Some(RotatorError::RefreshTransient(format!(
                        "HTTP 429 from token endpoint (Retry-After: {retry_after}s)"
                    )));
                    if attempt + 1 < MAX_REFRESH_ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(retry_after)).await;
                        continue;
                    }
                    break;
                }
                500..=599 => {
                    let body = resp.text().await.unwrap_or_default();
                    tracing::warn!(
                        credential = %id,
                        status,
                        attempt = attempt + 1,
                        "server error during token refresh"
                    );
                    last_error = Some(RotatorError::RefreshTransient(format!(
                        "HTTP {status} from token endpoint: {body}"
                    )));
                    if attempt + 1 < MAX_REFRESH_ATTEMPTS {
                        tokio::time::sleep(self.retry_base * (1u32 << attempt)).await;
                        continue;
                    }
                    break;
                }
                _ => {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(RotatorError::RefreshTransient(format!(
                        "HTTP {status} from token endpoint: {body}"
                    )));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| RotatorError::RefreshTransient("refresh failed".into())))
    }

    /// Refresh the token set. Caller must hold the per-credential lock.
    async fn refresh_locked(
        &self,
        id: &CredentialId,
        force: bool,
    ) -> Result<OAuthTokens, RotatorError> {
        if !force {
            if let Some(t) = self.cached(id) {
                if !t.expires_within(REFRESH_EXPIRY_BUFFER) {
                    return Ok(t);
                }
            }
        }

        let current = match self.cached(id) {
            Some(t) => t,
            None => {
                let t = self.store.load(id)?;
                self.cache.lock().insert(id.clone(), t.clone());
                t
            }
        };

        if current.refresh_token.is_empty() {
            return Err(RotatorError::Internal(format!(
                "no refresh_token in credentials for {id}"
            )));
        }

        tracing::debug!(credential = %id, provider = self.profile.provider, "refreshing OAuth token");

        match self.refresh_over_http(id, &current.refresh_token).await {
            Ok(resp) => {
                let updated = self.apply_refresh(id, current, resp)?;
                self.clear_backoff(id);
                tracing::debug!(credential = %id, "token refresh succeeded");
                Ok(updated)
            }
            Err(e @ RotatorError::RefreshInvalidGrant { .. }) => Err(e),
            Err(e) => {
                self.record_failure(id);
                Err(e)
            }
        }
    }

    /// Merge a token-endpoint response into the stored credential,
    /// persist it, and only then publish it to the cache.
    fn apply_refresh(
        &self,
        id: &CredentialId,
        mut current: OAuthTokens,
        resp: RefreshResponse,
    ) -> Result<OAuthTokens, RotatorError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let new_expiry = now_ms + resp.expires_in.unwrap_or(3600) * 1000;

        current.access_token = resp.access_token;
        if let Some(rt) = resp.refresh_token {
            if !rt.is_empty() {
                current.refresh_token = rt;
            }
        }
        // Expiry never moves backwards across refreshes.
        current.expiry_date = current.expiry_date.max(new_expiry);
        if let Some(url) = resp.resource_url {
            current.resource_url = Some(url);
        }
        if let Some(key) = resp.api_key {
            current.extras.api_key = Some(key);
        }
        current.metadata.last_check_timestamp = Some(now_ms as f64 / 1000.0);

        if current.access_token.is_empty() || current.refresh_token.is_empty() {
            self.record_failure(id);
            return Err(RotatorError::RefreshTransient(
                "refreshed credentials missing access_token or refresh_token".into(),
            ));
        }

        self.store.save(id, &current)?;
        self.cache.lock().insert(id.clone(), current.clone());
        Ok(current)
    }
}

/// Refresh with escalation: an invalid grant hands the credential to the
/// interactive device flow under the global coordinator. Caller must
/// hold the per-credential lock.
async fn refresh_or_reauth(
    inner: &Arc<OAuthInner>,
    id: &CredentialId,
    force: bool,
) -> Result<OAuthTokens, RotatorError> {
    match inner.refresh_locked(id, force).await {
        Err(RotatorError::RefreshInvalidGrant { status }) => {
            tracing::warn!(
                credential = %id,
                status,
                "refresh token invalid, starting re-authorization"
            );
            match interactive_reauth(inner, id).await {
                Ok(tokens) => {
                    inner.clear_backoff(id);
                    Ok(tokens)
                }
                Err(e) => {
                    inner.record_failure(id);
                    tracing::error!(credential = %id, error = %e, "re-authorization failed");
                    Err(e)
                }
            }
        }
        other => other,
    }
}

/// Run the interactive device flow for one credential, serialized by the
/// process-wide coordinator, and persist the result.
async fn interactive_reauth(
    inner: &Arc<OAuthInner>,
    id: &CredentialId,
) -> Result<OAuthTokens, RotatorError> {
    let reauth_id = format!("{}:{}", inner.profile.provider, id.basename());
    let display_name = inner.display_name(id);

    let flow_inner = Arc::clone(inner);
    let flow_id = id.clone();
    let flow = async move {
        let mut tokens =
            device_flow::run_device_flow(&flow_inner.http, &flow_inner.profile, &display_name)
                .await?;

        // Carry identity and provider extras over from the previous
        // token set; the device flow only yields fresh tokens.
        if let Some(prev) = flow_inner.cached(&flow_id) {
            if tokens.metadata.email.is_none() {
                tokens.metadata.email = prev.metadata.email.clone();
            }
            if tokens.metadata.display_name.is_none() {
                tokens.metadata.display_name = prev.metadata.display_name.clone();
            }
            tokens.metadata.loaded_from_env = prev.metadata.loaded_from_env;
            let fresh_api_key = tokens.extras.api_key.take();
            tokens.extras = prev.extras.clone();
            if let Some(key) = fresh_api_key {
                tokens.extras.api_key = Some(key);
            }
        }

        flow_inner.store.save(&flow_id, &tokens)?;
        flow_inner.cache.lock().insert(flow_id.clone(), tokens.clone());
        Ok(tokens)
    };

    inner.reauth.execute(&reauth_id, flow).await
}

#[async_trait]
impl ProviderAuth for OAuthAuthenticator {
    fn provider(&self) -> &str {
        self.inner.profile.provider
    }

    async fn initialize(&self, id: &CredentialId) -> Result<(), RotatorError> {
        let tokens = self.inner.load(id).await?;

        if tokens.refresh_token.is_empty() {
            tracing::warn!(credential = %id, "credential needs setup: refresh token missing");
            let lock = self.inner.credential_lock(id);
            let _guard = lock.lock().await;
            return interactive_reauth(&self.inner, id).await.map(|_| ());
        }

        if tokens.expires_within(REFRESH_EXPIRY_BUFFER) {
            let lock = self.inner.credential_lock(id);
            let _guard = lock.lock().await;
            return refresh_or_reauth(&self.inner, id, false).await.map(|_| ());
        }

        tracing::debug!(credential = %id, "OAuth token is valid");
        Ok(())
    }

    async fn api_details(&self, id: &CredentialId) -> Result<ApiDetails, RotatorError> {
        let mut tokens = self.inner.load(id).await?;

        if tokens.expires_within(REFRESH_EXPIRY_BUFFER) {
            let lock = self.inner.credential_lock(id);
            let _guard = lock.lock().await;
            tokens = refresh_or_reauth(&self.inner, id, false).await?;
        }

        let base = tokens
            .resource_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| self.inner.profile.default_base_url.to_string());
        let base_url = if base.starts_with("http") {
            base
        } else {
            format!("https://{base}")
        };

        let bearer_token = if self.inner.profile.bearer_from_api_key_extra {
            tokens
                .extras
                .api_key
                .clone()
                .unwrap_or_else(|| tokens.access_token.clone())
        } else {
            tokens.access_token.clone()
        };

        Ok(ApiDetails {
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer_token,
        })
    }

    async fn user_info(&self, id: &CredentialId) -> Result<UserInfo, RotatorError> {
        let mut tokens = self.inner.load(id).await?;
        let email = tokens.metadata.email.clone();
        if email.is_none() {
            tracing::warn!(credential = %id, "no email in credential metadata");
        }

        tokens.metadata.last_check_timestamp =
            Some(chrono::Utc::now().timestamp_millis() as f64 / 1000.0);
        self.inner.store.save(id, &tokens)?;
        self.inner.cache.lock().insert(id.clone(), tokens);

        Ok(UserInfo { email })
    }

    async fn enqueue_refresh(&self, id: &CredentialId, force: bool, needs_reauth: bool) {
        self.inner.queue.enqueue(id, force, needs_reauth, self.driver());
    }

    fn is_available(&self, id: &CredentialId) -> bool {
        self.inner.queue.is_available(id)
    }

    async fn proactively_refresh(&self, id: &CredentialId) {
        let tokens = match self.inner.load(id).await {
            Ok(t) => t,
            Err(e) => {
                tracing::debug!(credential = %id, error = %e, "skipping proactive refresh");
                return;
            }
        };
        if tokens.expires_within(REFRESH_EXPIRY_BUFFER) {
            tracing::debug!(credential = %id, "queueing proactive refresh");
            self.inner.queue.enqueue(id, false, false, self.driver());
        }
    }

    fn shutdown(&self) {
        self.inner.queue.shutdown();
    }
}

#[async_trait]
impl RefreshDriver for OAuthAuthenticator {
    fn token_is_fresh(&self, id: &CredentialId) -> bool {
        self.inner.token_is_fresh(id)
    }

    fn backoff_remaining(&self, id: &CredentialId) -> Option<Duration> {
        self.inner.backoff_remaining(id)
    }

    async fn run_refresh(
        &self,
        id: &CredentialId,
        force: bool,
        _needs_reauth: bool,
    ) -> Result<(), RotatorError> {
        let lock = self.inner.credential_lock(id);
        let _guard = lock.lock().await;
        refresh_or_reauth(&self.inner, id, force).await.map(|_| ())
    }
}
