//! Credential rotation: pick one viable credential per request, enforce
//! per-credential concurrency caps, and turn upstream auth/rate-limit
//! errors into rotation decisions.

use crate::auth::ProviderAuth;
use crate::config::RotatorConfig;
use crate::credentials::CredentialId;
use crate::error::RotatorError;
use crate::upstream::{OpenAiUpstream, Upstream};
use futures::{FutureExt, StreamExt};
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_ROTATIONS: usize = 3;
pub const DEFAULT_RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(60);

/// One credential as the rotator sees it: identity, its auth adapter,
/// an in-flight semaphore, and selection bookkeeping.
pub struct CredentialHandle {
    pub id: CredentialId,
    pub auth: Arc<dyn ProviderAuth>,
    semaphore: Arc<Semaphore>,
    last_used: Mutex<Option<Instant>>,
    cooldown_until: Mutex<Option<Instant>>,
}

impl CredentialHandle {
    fn new(id: CredentialId, auth: Arc<dyn ProviderAuth>, permits: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            auth,
            semaphore: Arc::new(Semaphore::new(permits.max(1))),
            last_used: Mutex::new(None),
            cooldown_until: Mutex::new(None),
        })
    }

    fn cooling_down(&self) -> bool {
        self.cooldown_until
            .lock()
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    fn set_cooldown(&self, duration: Duration) {
        *self.cooldown_until.lock() = Some(Instant::now() + duration);
    }

    fn touch(&self) {
        *self.last_used.lock() = Some(Instant::now());
    }

    fn last_used(&self) -> Option<Instant> {
        *self.last_used.lock()
    }

    #[cfg(test)]
    pub fn free_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

struct ProviderSlot {
    handles: Vec<Arc<CredentialHandle>>,
}

enum UnaryOp {
    Chat,
    Embeddings,
}

/// Selects one credential per request from the per-provider pools.
pub struct RotatingClient {
    slots: HashMap<String, ProviderSlot>,
    upstream: Arc<dyn Upstream>,
    acquire_timeout: Duration,
    max_rotations: usize,
}

impl RotatingClient {
    pub fn builder() -> RotatingClientBuilder {
        RotatingClientBuilder::new()
    }

    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn credentials_for(&self, provider: &str) -> Vec<CredentialId> {
        self.slots
            .get(provider)
            .map(|s| s.handles.iter().map(|h| h.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Non-streaming chat completion. `payload` is the OpenAI-format
    /// request body with a `provider/model` model id.
    pub async fn chat_completion(
        &self,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, RotatorError> {
        self.unary_with_rotation(UnaryOp::Chat, payload).await
    }

    pub async fn embeddings(
        &self,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, RotatorError> {
        self.unary_with_rotation(UnaryOp::Embeddings, payload).await
    }

    /// Streaming chat completion: raw SSE frames from the upstream,
    /// passed through verbatim. The credential's semaphore slot is held
    /// until the returned stream is dropped (completion, client
    /// disconnect, or error). A mid-stream failure emits a terminal
    /// error frame followed by `data: [DONE]`.
    pub async fn stream_chat_completion(
        &self,
        payload: &serde_json::Value,
    ) -> Result<BoxStream<'static, String>, RotatorError> {
        let (provider, request) = self.prepare(payload)?;
        let slot = self.slot(&provider)?;

        let mut tried: HashSet<CredentialId> = HashSet::new();
        for _ in 0..=self.max_rotations {
            let (handle, permit) = self.acquire(slot, &provider, &tried).await?;
            let details = match handle.auth.api_details(&handle.id).await {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(credential = %handle.id, error = %e, "could not resolve api details");
                    tried.insert(handle.id.clone());
                    continue;
                }
            };
            handle.touch();

            match self.upstream.open_stream(&details, &request).await {
                Ok(mut inner) => {
                    let stream = async_stream::stream! {
                        let _permit = permit;
                        while let Some(chunk) = inner.next().await {
                            match chunk {
                                Ok(bytes) => yield String::from_utf8_lossy(&bytes).into_owned(),
                                Err(e) => {
                                    tracing::error!(error = %e, "error during response stream");
                                    let payload = json!({
                                        "error": {
                                            "message": format!("stream interrupted: {e}"),
                                            "type": "proxy_internal_error",
                                            "code": 500,
                                        }
                                    });
                                    yield format!("data: {payload}\n\n");
                                    yield "data: [DONE]\n\n".to_string();
                                    return;
                                }
                            }
                        }
                    };
                    return Ok(Box::pin(stream));
                }
                Err(e) => {
                    drop(permit);
                    if !self.note_credential_error(&handle, &e).await {
                        return Err(e);
                    }
                    tried.insert(handle.id.clone());
                }
            }
        }
        Err(RotatorError::NoAvailableCredential(provider))
    }

    async fn unary_with_rotation(
        &self,
        op: UnaryOp,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, RotatorError> {
        let (provider, request) = self.prepare(payload)?;
        let slot = self.slot(&provider)?;

        let mut tried: HashSet<CredentialId> = HashSet::new();
        for _ in 0..=self.max_rotations {
            let (handle, permit) = self.acquire(slot, &provider, &tried).await?;
            let details = match handle.auth.api_details(&handle.id).await {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(credential = %handle.id, error = %e, "could not resolve api details");
                    tried.insert(handle.id.clone());
                    continue;
                }
            };
            handle.touch();

            let result = match op {
                UnaryOp::Chat => self.upstream.chat(&details, &request).await,
                UnaryOp::Embeddings => self.upstream.embeddings(&details, &request).await,
            };
            drop(permit);

            match result {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if !self.note_credential_error(&handle, &e).await {
                        return Err(e);
                    }
                    tried.insert(handle.id.clone());
                }
            }
        }
        Err(RotatorError::NoAvailableCredential(provider))
    }

    /// Record a credential-scoped upstream error. Returns true when the
    /// rotator should try another credential, false when the error must
    /// surface to the caller.
    async fn note_credential_error(
        &self,
        handle: &CredentialHandle,
        err: &RotatorError,
    ) -> bool {
        match err {
            RotatorError::Upstream { status: status @ (401 | 403), .. } => {
                tracing::warn!(
                    credential = %handle.id,
                    status,
                    "credential rejected upstream, queueing reactive refresh"
                );
                handle.auth.enqueue_refresh(&handle.id, true, true).await;
                true
            }
            RotatorError::Upstream { status: 429, retry_after_ms, .. } => {
                let cooldown = retry_after_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_RATE_LIMIT_COOLDOWN);
                tracing::warn!(
                    credential = %handle.id,
                    cooldown_secs = cooldown.as_secs(),
                    "credential rate limited, cooling down"
                );
                handle.set_cooldown(cooldown);
                true
            }
            _ => false,
        }
    }

    /// Run a proactive-refresh pass over every credential. Driven by the
    /// background refresher on its tick.
    pub async fn proactively_refresh_all(&self) {
        for slot in self.slots.values() {
            for handle in &slot.handles {
                handle.auth.proactively_refresh(&handle.id).await;
            }
        }
    }

    /// Cancel adapter-owned background workers.
    pub fn shutdown(&self) {
        for slot in self.slots.values() {
            for handle in &slot.handles {
                handle.auth.shutdown();
            }
        }
    }

    fn slot(&self, provider: &str) -> Result<&ProviderSlot, RotatorError> {
        self.slots
            .get(provider)
            .ok_or_else(|| RotatorError::NoAvailableCredential(provider.to_string()))
    }

    /// Split the `provider/model` id and rewrite the payload with the
    /// bare model id the upstream expects.
    fn prepare(
        &self,
        payload: &serde_json::Value,
    ) -> Result<(String, serde_json::Value), RotatorError> {
        let model = payload
            .get("model")
            .and_then(|m| m.as_str())
            .ok_or_else(|| RotatorError::Config("request is missing 'model'".into()))?;
        let (provider, bare) = split_model_id(model)
            .ok_or_else(|| RotatorError::Config(format!("invalid model id: {model}")))?;
        let mut request = payload.clone();
        request["model"] = serde_json::Value::String(bare.to_string());
        Ok((provider.to_string(), request))
    }

    /// Pick a credential: available, not cooling down, not yet tried;
    /// prefer free semaphore slots, least-recently-used first (stable
    /// sort keeps insertion order on ties). When everything is busy,
    /// wait for the earliest released slot, bounded by the acquire
    /// timeout.
    async fn acquire(
        &self,
        slot: &ProviderSlot,
        provider: &str,
        tried: &HashSet<CredentialId>,
    ) -> Result<(Arc<CredentialHandle>, OwnedSemaphorePermit), RotatorError> {
        let candidates: Vec<Arc<CredentialHandle>> = slot
            .handles
            .iter()
            .filter(|h| !tried.contains(&h.id))
            .filter(|h| h.auth.is_available(&h.id))
            .filter(|h| !h.cooling_down())
            .cloned()
            .collect();

        if candidates.is_empty() {
            return Err(RotatorError::NoAvailableCredential(provider.to_string()));
        }

        let mut free: Vec<Arc<CredentialHandle>> = candidates
            .iter()
            .filter(|h| h.semaphore.available_permits() > 0)
            .cloned()
            .collect();
        free.sort_by_key(|h| h.last_used());
        for handle in free {
            if let Ok(permit) = Arc::clone(&handle.semaphore).try_acquire_owned() {
                return Ok((handle, permit));
            }
        }

        let waits = candidates
            .iter()
            .map(|h| {
                let handle = Arc::clone(h);
                async move {
                    let permit = Arc::clone(&handle.semaphore).acquire_owned().await;
                    (handle, permit)
                }
                .boxed()
            })
            .collect::<Vec<_>>();

        match tokio::time::timeout(self.acquire_timeout, futures::future::select_all(waits)).await
        {
            Ok(((handle, Ok(permit)), _, _)) => Ok((handle, permit)),
            Ok(((_, Err(_)), _, _)) => {
                Err(RotatorError::Internal("credential semaphore closed".into()))
            }
            Err(_) => Err(RotatorError::NoAvailableCredential(provider.to_string())),
        }
    }
}

/// Split `provider/model` into its parts. Model ids may themselves
/// contain slashes (`openrouter/meta-llama/llama-3-70b`).
pub fn split_model_id(full: &str) -> Option<(&str, &str)> {
    let (provider, model) = full.split_once('/')?;
    if provider.is_empty() || model.is_empty() {
        return None;
    }
    Some((provider, model))
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct RotatingClientBuilder {
    upstream: Option<Arc<dyn Upstream>>,
    config: RotatorConfig,
    slots: HashMap<String, ProviderSlot>,
    acquire_timeout: Duration,
    max_rotations: usize,
}

impl RotatingClientBuilder {
    pub fn new() -> Self {
        Self {
            upstream: None,
            config: RotatorConfig::default(),
            slots: HashMap::new(),
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            max_rotations: DEFAULT_MAX_ROTATIONS,
        }
    }

    /// Concurrency caps and filters from the environment.
    pub fn with_config(mut self, config: RotatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_upstream(mut self, upstream: Arc<dyn Upstream>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_max_rotations(mut self, rotations: usize) -> Self {
        self.max_rotations = rotations;
        self
    }

    /// Register one provider's ordered credential list.
    pub fn with_provider(
        mut self,
        provider: &str,
        credentials: Vec<(CredentialId, Arc<dyn ProviderAuth>)>,
    ) -> Self {
        let permits = self.config.concurrency_for(provider);
        let handles = credentials
            .into_iter()
            .map(|(id, auth)| CredentialHandle::new(id, auth, permits))
            .collect();
        self.slots
            .insert(provider.to_string(), ProviderSlot { handles });
        self
    }

    pub fn build(self) -> RotatingClient {
        RotatingClient {
            slots: self.slots,
            upstream: self
                .upstream
                .unwrap_or_else(|| Arc::new(OpenAiUpstream::new())),
            acquire_timeout: self.acquire_timeout,
            max_rotations: self.max_rotations,
        }
    }
}

impl Default for RotatingClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ApiDetails, UserInfo};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // -- fakes ------------------------------------------------------------

    struct FakeAuth {
        provider: String,
        unavailable: Mutex<HashSet<CredentialId>>,
        reauth_enqueues: Mutex<Vec<(CredentialId, bool)>>,
    }

    impl FakeAuth {
        fn new(provider: &str) -> Arc<Self> {
            Arc::new(Self {
                provider: provider.into(),
                unavailable: Mutex::new(HashSet::new()),
                reauth_enqueues: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ProviderAuth for FakeAuth {
        fn provider(&self) -> &str {
            &self.provider
        }
        async fn initialize(&self, _id: &CredentialId) -> Result<(), RotatorError> {
            Ok(())
        }
        async fn api_details(&self, id: &CredentialId) -> Result<ApiDetails, RotatorError> {
            Ok(ApiDetails {
                base_url: "https://upstream.test/v1".into(),
                bearer_token: id.as_str().to_string(),
            })
        }
        async fn user_info(&self, _id: &CredentialId) -> Result<UserInfo, RotatorError> {
            Ok(UserInfo::default())
        }
        async fn enqueue_refresh(&self, id: &CredentialId, _force: bool, needs_reauth: bool) {
            self.reauth_enqueues.lock().push((id.clone(), needs_reauth));
            self.unavailable.lock().insert(id.clone());
        }
        fn is_available(&self, id: &CredentialId) -> bool {
            !self.unavailable.lock().contains(id)
        }
        async fn proactively_refresh(&self, _id: &CredentialId) {}
    }

    type Script = dyn Fn(&str) -> Result<serde_json::Value, RotatorError> + Send + Sync;

    struct FakeUpstream {
        script: Box<Script>,
        calls: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl FakeUpstream {
        fn new(script: impl Fn(&str) -> Result<serde_json::Value, RotatorError> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                script: Box::new(script),
                calls: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay: Duration::ZERO,
            })
        }

        fn with_delay(
            script: impl Fn(&str) -> Result<serde_json::Value, RotatorError> + Send + Sync + 'static,
            delay: Duration,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: Box::new(script),
                calls: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay,
            })
        }

        fn calls_for(&self, token: &str) -> usize {
            self.calls.lock().iter().filter(|c| *c == token).count()
        }
    }

    #[async_trait]
    impl Upstream for FakeUpstream {
        async fn chat(
            &self,
            api: &ApiDetails,
            _payload: &serde_json::Value,
        ) -> Result<serde_json::Value, RotatorError> {
            self.calls.lock().push(api.bearer_token.clone());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if self.delay > Duration::ZERO {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            (self.script)(&api.bearer_token)
        }

        async fn open_stream(
            &self,
            api: &ApiDetails,
            _payload: &serde_json::Value,
        ) -> Result<BoxStream<'static, Result<Bytes, reqwest::Error>>, RotatorError> {
            self.calls.lock().push(api.bearer_token.clone());
            (self.script)(&api.bearer_token)?;
            let chunks: Vec<Result<Bytes, reqwest::Error>> = vec![
                Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n")),
                Ok(Bytes::from_static(b"data: [DONE]\n\n")),
            ];
            Ok(futures::stream::iter(chunks).boxed())
        }

        async fn embeddings(
            &self,
            api: &ApiDetails,
            payload: &serde_json::Value,
        ) -> Result<serde_json::Value, RotatorError> {
            self.chat(api, payload).await
        }
    }

    fn key(provider: &str, n: usize) -> CredentialId {
        CredentialId::from_env_key(provider, n)
    }

    fn client_with(
        upstream: Arc<FakeUpstream>,
        auth: Arc<FakeAuth>,
        creds: Vec<CredentialId>,
    ) -> RotatingClient {
        RotatingClient::builder()
            .with_upstream(upstream)
            .with_provider(
                "p",
                creds
                    .into_iter()
                    .map(|id| (id, auth.clone() as Arc<dyn ProviderAuth>))
                    .collect(),
            )
            .build()
    }

    fn rate_limited(retry_after_ms: u64) -> RotatorError {
        RotatorError::Upstream {
            status: 429,
            retry_after_ms: Some(retry_after_ms),
            body: "rate limited".into(),
        }
    }

    fn unauthorized() -> RotatorError {
        RotatorError::Upstream {
            status: 401,
            retry_after_ms: None,
            body: "bad credential".into(),
        }
    }

    fn chat_req() -> serde_json::Value {
        json!({"model": "p/model-x", "messages": [{"role": "user", "content": "ping"}]})
    }

    // -- tests ------------------------------------------------------------

    #[test]
    fn model_id_splitting() {
        assert_eq!(split_model_id("openai/gpt-x"), Some(("openai", "gpt-x")));
        assert_eq!(
            split_model_id("openrouter/meta-llama/llama-3-70b"),
            Some(("openrouter", "meta-llama/llama-3-70b"))
        );
        assert_eq!(split_model_id("no-slash"), None);
    }

    #[tokio::test]
    async fn happy_path_passes_through() {
        let k1 = key("p", 1);
        let upstream = FakeUpstream::new(|_| Ok(json!({"id": "chatcmpl-1"})));
        let client = client_with(upstream.clone(), FakeAuth::new("p"), vec![k1.clone()]);

        let out = client.chat_completion(&chat_req()).await.unwrap();
        assert_eq!(out["id"], "chatcmpl-1");
        // payload reached the upstream with the bare model id
        assert_eq!(upstream.calls_for(k1.as_str()), 1);
    }

    #[tokio::test]
    async fn rotates_to_second_key_on_rate_limit() {
        let k1 = key("p", 1);
        let k2 = key("p", 2);
        let k1_token = k1.as_str().to_string();
        let upstream = FakeUpstream::new(move |token| {
            if token == k1_token {
                Err(rate_limited(5_000))
            } else {
                Ok(json!({"id": "ok"}))
            }
        });
        let client = client_with(upstream.clone(), FakeAuth::new("p"), vec![k1.clone(), k2.clone()]);

        let out = client.chat_completion(&chat_req()).await.unwrap();
        assert_eq!(out["id"], "ok");
        assert_eq!(upstream.calls_for(k1.as_str()), 1);
        assert_eq!(upstream.calls_for(k2.as_str()), 1);

        // K1 is cooling down: the next request goes straight to K2.
        let out = client.chat_completion(&chat_req()).await.unwrap();
        assert_eq!(out["id"], "ok");
        assert_eq!(upstream.calls_for(k1.as_str()), 1, "K1 must not be retried during cooldown");
    }

    #[tokio::test]
    async fn upstream_auth_failure_queues_reactive_refresh() {
        let k1 = key("p", 1);
        let k2 = key("p", 2);
        let k1_token = k1.as_str().to_string();
        let auth = FakeAuth::new("p");
        let upstream = FakeUpstream::new(move |token| {
            if token == k1_token {
                Err(unauthorized())
            } else {
                Ok(json!({"id": "ok"}))
            }
        });
        let client = client_with(upstream.clone(), auth.clone(), vec![k1.clone(), k2]);

        let out = client.chat_completion(&chat_req()).await.unwrap();
        assert_eq!(out["id"], "ok");

        let enqueues = auth.reauth_enqueues.lock().clone();
        assert_eq!(enqueues, vec![(k1.clone(), true)]);
        // marked unavailable immediately
        assert!(!auth.is_available(&k1));
    }

    #[tokio::test]
    async fn exhausted_candidates_is_no_available_credential() {
        let upstream = FakeUpstream::new(|_| Err(rate_limited(60_000)));
        let client = client_with(
            upstream,
            FakeAuth::new("p"),
            vec![key("p", 1), key("p", 2)],
        );

        match client.chat_completion(&chat_req()).await {
            Err(RotatorError::NoAvailableCredential(p)) => assert_eq!(p, "p"),
            other => panic!("expected NoAvailableCredential, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn non_credential_errors_surface_unchanged() {
        let upstream = FakeUpstream::new(|_| {
            Err(RotatorError::Upstream {
                status: 404,
                retry_after_ms: None,
                body: "model not found".into(),
            })
        });
        let client = client_with(upstream.clone(), FakeAuth::new("p"), vec![key("p", 1), key("p", 2)]);

        match client.chat_completion(&chat_req()).await {
            Err(RotatorError::Upstream { status: 404, body, .. }) => {
                assert!(body.contains("model not found"));
            }
            other => panic!("expected Upstream 404, got {:?}", other.map(|_| ())),
        }
        // no rotation happened
        assert_eq!(upstream.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn semaphore_caps_in_flight_requests_per_key() {
        let upstream =
            FakeUpstream::with_delay(|_| Ok(json!({"ok": true})), Duration::from_millis(50));
        let client = Arc::new(client_with(
            upstream.clone(),
            FakeAuth::new("p"),
            vec![key("p", 1)],
        ));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let client = Arc::clone(&client);
            handles.push(tokio::spawn(async move {
                client.chat_completion(&chat_req()).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(
            upstream.max_in_flight.load(Ordering::SeqCst),
            1,
            "default cap is one in-flight request per credential"
        );
    }

    #[tokio::test]
    async fn least_recently_used_spreads_load() {
        let k1 = key("p", 1);
        let k2 = key("p", 2);
        let upstream = FakeUpstream::new(|_| Ok(json!({"ok": true})));
        let client = client_with(upstream.clone(), FakeAuth::new("p"), vec![k1.clone(), k2.clone()]);

        client.chat_completion(&chat_req()).await.unwrap();
        client.chat_completion(&chat_req()).await.unwrap();

        // insertion order first, then the never-used credential
        let calls = upstream.calls.lock().clone();
        assert_eq!(calls, vec![k1.as_str().to_string(), k2.as_str().to_string()]);
    }

    #[tokio::test]
    async fn acquire_times_out_into_no_available_credential() {
        let upstream = FakeUpstream::with_delay(
            |_| Ok(json!({"ok": true})),
            Duration::from_millis(500),
        );
        let auth = FakeAuth::new("p");
        let client = Arc::new(
            RotatingClient::builder()
                .with_upstream(upstream)
                .with_acquire_timeout(Duration::from_millis(50))
                .with_provider("p", vec![(key("p", 1), auth as Arc<dyn ProviderAuth>)])
                .build(),
        );

        let holder = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.chat_completion(&chat_req()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        match client.chat_completion(&chat_req()).await {
            Err(RotatorError::NoAvailableCredential(_)) => {}
            other => panic!("expected timeout, got {:?}", other.map(|_| ())),
        }
        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stream_passes_frames_and_releases_permit() {
        let k1 = key("p", 1);
        let upstream = FakeUpstream::new(|_| Ok(json!({})));
        let auth = FakeAuth::new("p");
        let client = RotatingClient::builder()
            .with_upstream(upstream)
            .with_provider(
                "p",
                vec![(k1.clone(), auth.clone() as Arc<dyn ProviderAuth>)],
            )
            .build();

        let stream = client
            .stream_chat_completion(&json!({"model": "p/m", "stream": true, "messages": []}))
            .await
            .unwrap();

        // While streaming, the slot is held.
        let handle = &client.slots["p"].handles[0];
        assert_eq!(handle.free_permits(), 0);

        let frames: Vec<String> = stream.collect().await;
        assert_eq!(frames.len(), 2);
        assert!(frames[0].contains("\"content\":\"hi\""));
        assert_eq!(frames[1], "data: [DONE]\n\n");

        // Stream fully consumed and dropped: permit released.
        assert_eq!(handle.free_permits(), 1);
    }

    #[tokio::test]
    async fn dropping_stream_early_releases_permit() {
        let upstream = FakeUpstream::new(|_| Ok(json!({})));
        let auth = FakeAuth::new("p");
        let client = RotatingClient::builder()
            .with_upstream(upstream)
            .with_provider(
                "p",
                vec![(key("p", 1), auth as Arc<dyn ProviderAuth>)],
            )
            .build();

        let mut stream = client
            .stream_chat_completion(&json!({"model": "p/m", "stream": true, "messages": []}))
            .await
            .unwrap();
        let _first = stream.next().await;
        drop(stream); // client disconnected mid-stream

        let handle = &client.slots["p"].handles[0];
        tokio::time::timeout(Duration::from_millis(100), async {
            loop {
                if handle.free_permits() == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("permit must be released promptly after disconnect");
    }

    #[tokio::test]
    async fn stream_open_errors_rotate_like_unary_calls() {
        let k1 = key("p", 1);
        let k2 = key("p", 2);
        let k1_token = k1.as_str().to_string();
        let upstream = FakeUpstream::new(move |token| {
            if token == k1_token {
                Err(rate_limited(1_000))
            } else {
                Ok(json!({}))
            }
        });
        let client = client_with(upstream.clone(), FakeAuth::new("p"), vec![k1.clone(), k2.clone()]);

        let stream = client
            .stream_chat_completion(&json!({"model": "p/m", "stream": true, "messages": []}))
            .await
            .unwrap();
        let frames: Vec<String> = stream.collect().await;
        assert!(!frames.is_empty());
        assert_eq!(upstream.calls_for(k2.as_str()), 1);
    }
}
