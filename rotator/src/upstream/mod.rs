pub mod openai;

pub use openai::OpenAiUpstream;

use crate::auth::ApiDetails;
use crate::error::RotatorError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

/// Thin adapter for invoking the upstream LLM with resolved credentials.
///
/// Implementations receive `(base_url, bearer_token)` and a request
/// payload; everything credential-related stays in the rotator. Error
/// statuses come back as structured [`RotatorError::Upstream`] values so
/// rotation decisions never parse message strings.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn chat(
        &self,
        api: &ApiDetails,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, RotatorError>;

    /// Open an SSE stream. The status line is checked before this
    /// returns, so rotation decisions happen before any bytes flow.
    async fn open_stream(
        &self,
        api: &ApiDetails,
        payload: &serde_json::Value,
    ) -> Result<BoxStream<'static, Result<Bytes, reqwest::Error>>, RotatorError>;

    async fn embeddings(
        &self,
        api: &ApiDetails,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, RotatorError>;
}
