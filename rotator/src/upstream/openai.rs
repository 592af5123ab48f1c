//! OpenAI-compatible upstream: POST JSON to `{base}/chat/completions`
//! and `{base}/embeddings` with a bearer token.

use super::Upstream;
use crate::auth::ApiDetails;
use crate::error::RotatorError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;

pub struct OpenAiUpstream {
    http: reqwest::Client,
}

impl OpenAiUpstream {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    fn chat_url(base: &str) -> String {
        let base = base.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{base}/chat/completions")
        }
    }

    fn embeddings_url(base: &str) -> String {
        format!("{}/embeddings", base.trim_end_matches('/'))
    }

    async fn send(
        &self,
        url: &str,
        api: &ApiDetails,
        payload: &serde_json::Value,
    ) -> Result<reqwest::Response, RotatorError> {
        let resp = self
            .http
            .post(url)
            .bearer_auth(&api.bearer_token)
            .header("Accept", "application/json")
            .json(payload)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let retry_after_ms = resp
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .map(|secs| (secs * 1000.0) as u64);
        let body = resp.text().await.unwrap_or_default();

        Err(RotatorError::Upstream {
            status: status.as_u16(),
            retry_after_ms,
            body,
        })
    }
}

impl Default for OpenAiUpstream {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Upstream for OpenAiUpstream {
    async fn chat(
        &self,
        api: &ApiDetails,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, RotatorError> {
        let resp = self.send(&Self::chat_url(&api.base_url), api, payload).await?;
        Ok(resp.json().await?)
    }

    async fn open_stream(
        &self,
        api: &ApiDetails,
        payload: &serde_json::Value,
    ) -> Result<BoxStream<'static, Result<Bytes, reqwest::Error>>, RotatorError> {
        let resp = self.send(&Self::chat_url(&api.base_url), api, payload).await?;
        Ok(resp.bytes_stream().boxed())
    }

    async fn embeddings(
        &self,
        api: &ApiDetails,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, RotatorError> {
        let resp = self
            .send(&Self::embeddings_url(&api.base_url), api, payload)
            .await?;
        Ok(resp.json().await?)
    }
}
