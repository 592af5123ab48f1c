use super::{ApiDetails, ProviderAuth, UserInfo, provider_base_url};
use crate::credentials::{ApiKeyCredential, CredentialId};
use crate::error::RotatorError;
use async_trait::async_trait;
use std::collections::HashMap;

/// Trivial adapter for plain API keys: no refresh lifecycle, always
/// available. One instance serves every key of a provider.
pub struct ApiKeyAuth {
    provider: String,
    keys: HashMap<CredentialId, ApiKeyCredential>,
}

impl ApiKeyAuth {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            keys: HashMap::new(),
        }
    }

    pub fn with_key(mut self, id: CredentialId, credential: ApiKeyCredential) -> Self {
        self.keys.insert(id, credential);
        self
    }

    pub fn insert(&mut self, id: CredentialId, credential: ApiKeyCredential) {
        self.keys.insert(id, credential);
    }

    fn credential(&self, id: &CredentialId) -> Result<&ApiKeyCredential, RotatorError> {
        self.keys
            .get(id)
            .ok_or_else(|| RotatorError::Internal(format!("unknown API key credential: {id}")))
    }
}

#[async_trait]
impl ProviderAuth for ApiKeyAuth {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn initialize(&self, id: &CredentialId) -> Result<(), RotatorError> {
        self.credential(id).map(|_| ())
    }

    async fn api_details(&self, id: &CredentialId) -> Result<ApiDetails, RotatorError> {
        let cred = self.credential(id)?;
        let base_url = cred
            .base_url
            .clone()
            .or_else(|| provider_base_url(&self.provider).map(String::from))
            .ok_or_else(|| {
                RotatorError::Config(format!(
                    "no base URL registered for provider '{}'",
                    self.provider
                ))
            })?;
        Ok(ApiDetails {
            base_url,
            bearer_token: cred.key.clone(),
        })
    }

    async fn user_info(&self, _id: &CredentialId) -> Result<UserInfo, RotatorError> {
        // API keys carry no identity; each key is unique by itself.
        Ok(UserInfo::default())
    }

    async fn enqueue_refresh(&self, _id: &CredentialId, _force: bool, _needs_reauth: bool) {}

    fn is_available(&self, _id: &CredentialId) -> bool {
        true
    }

    async fn proactively_refresh(&self, _id: &CredentialId) {}
}
