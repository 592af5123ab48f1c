//! Startup credential discovery: environment API keys, on-disk OAuth
//! files, env-sourced OAuth credentials, deduplication by user identity,
//! and the optional per-startup validation pass.

use super::store::CredentialStore;
use super::{ApiKeyCredential, CredentialId};
use crate::auth::api_key::ApiKeyAuth;
use crate::auth::oauth::OAuthAuthenticator;
use crate::auth::profiles::{oauth_profile, oauth_providers};
use crate::auth::ProviderAuth;
use crate::reauth::ReauthCoordinator;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// One provider's resolved credential list, in rotation order. Each
/// credential carries the adapter that owns its lifecycle.
pub struct ProviderCredentials {
    pub provider: String,
    pub credentials: Vec<(CredentialId, Arc<dyn ProviderAuth>)>,
}

pub struct CredentialManager {
    store: Arc<CredentialStore>,
    reauth: Arc<ReauthCoordinator>,
    env: HashMap<String, String>,
    skip_init: bool,
}

impl CredentialManager {
    pub fn new(store: Arc<CredentialStore>, reauth: Arc<ReauthCoordinator>) -> Self {
        let env: HashMap<String, String> = std::env::vars().collect();
        let skip_init = env
            .get("SKIP_OAUTH_INIT_CHECK")
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);
        Self::with_env(store, reauth, env, skip_init)
    }

    pub fn with_env(
        store: Arc<CredentialStore>,
        reauth: Arc<ReauthCoordinator>,
        env: HashMap<String, String>,
        skip_init: bool,
    ) -> Self {
        Self {
            store,
            reauth,
            env,
            skip_init,
        }
    }

    /// Full startup pipeline: discovery, duplicate pre-scan, and (unless
    /// `SKIP_OAUTH_INIT_CHECK`) per-credential initialization with a
    /// final identity-based dedup.
    pub async fn discover_and_initialize(&self) -> Vec<ProviderCredentials> {
        let mut entries = self.discover();
        self.dedup_by_stored_email(&mut entries);

        if self.skip_init {
            tracing::info!("skipping OAuth credential validation pass");
            return entries;
        }

        self.initialize_and_dedup(&mut entries).await;
        entries
    }

    /// Enumerate all credential candidates, without touching the
    /// network: API keys from `{PROVIDER}_API_KEY[_N]`, OAuth files from
    /// the credential directory, and env-sourced OAuth credentials.
    pub fn discover(&self) -> Vec<ProviderCredentials> {
        let mut api_keys: BTreeMap<String, Vec<(CredentialId, ApiKeyCredential)>> =
            BTreeMap::new();
        let sorted_env: BTreeMap<&String, &String> = self.env.iter().collect();
        for (key, value) in sorted_env {
            if key == "PROXY_API_KEY" || value.trim().is_empty() {
                continue;
            }
            let Some(pos) = key.find("_API_KEY") else {
                continue;
            };
            let provider = key[..pos].to_lowercase();
            if provider.is_empty() {
                continue;
            }
            let keys = api_keys.entry(provider.clone()).or_default();
            let ordinal = keys.len() + 1;
            keys.push((
                CredentialId::from_env_key(&provider, ordinal),
                ApiKeyCredential {
                    key: value.trim().to_string(),
                    base_url: None,
                },
            ));
        }

        let mut oauth_ids: BTreeMap<String, Vec<CredentialId>> = BTreeMap::new();
        for provider in oauth_providers() {
            for id in self.store.scan_env(provider) {
                oauth_ids.entry(provider.to_string()).or_default().push(id);
            }
        }
        for (provider, id) in self.store.scan_files() {
            if oauth_profile(&provider).is_none() {
                tracing::warn!(
                    provider = %provider,
                    credential = %id,
                    "no OAuth adapter for provider, skipping credential file"
                );
                continue;
            }
            oauth_ids.entry(provider).or_default().push(id);
        }

        let mut providers: BTreeMap<String, Vec<(CredentialId, Arc<dyn ProviderAuth>)>> =
            BTreeMap::new();

        for (provider, keys) in api_keys {
            let mut adapter = ApiKeyAuth::new(&provider);
            let ids: Vec<CredentialId> = keys.iter().map(|(id, _)| id.clone()).collect();
            for (id, cred) in keys {
                adapter.insert(id, cred);
            }
            let adapter: Arc<dyn ProviderAuth> = Arc::new(adapter);
            let entry = providers.entry(provider).or_default();
            for id in ids {
                entry.push((id, adapter.clone()));
            }
        }

        for (provider, ids) in oauth_ids {
            let Some(profile) = oauth_profile(&provider) else {
                continue;
            };
            let adapter: Arc<dyn ProviderAuth> = Arc::new(OAuthAuthenticator::new(
                *profile,
                Arc::clone(&self.store),
                Arc::clone(&self.reauth),
            ));
            let entry = providers.entry(provider.clone()).or_default();
            for id in ids {
                entry.push((id, adapter.clone()));
            }
        }

        let total: usize = providers.values().map(Vec::len).sum();
        tracing::info!(
            providers = providers.len(),
            credentials = total,
            "credential discovery complete"
        );

        providers
            .into_iter()
            .map(|(provider, credentials)| ProviderCredentials {
                provider,
                credentials,
            })
            .collect()
    }

    /// Pre-initialization duplicate scan using persisted metadata.
    /// `(provider, email)` must be unique; the earlier credential (by
    /// enumeration order) wins, later ones are skipped with a warning.
    /// Corrupt or missing files are dropped here as well.
    fn dedup_by_stored_email(&self, entries: &mut Vec<ProviderCredentials>) {
        let mut seen: HashSet<(String, String)> = HashSet::new();
        for entry in entries.iter_mut() {
            let provider = entry.provider.clone();
            entry.credentials.retain(|(id, auth)| {
                if !is_oauth(auth.as_ref()) {
                    return true;
                }
                let tokens = match self.store.load(id) {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::warn!(credential = %id, error = %e, "skipping unreadable credential");
                        return false;
                    }
                };
                let Some(email) = tokens.email().map(str::to_string) else {
                    return true; // no identity, treated as unique
                };
                if seen.insert((provider.clone(), email.clone())) {
                    true
                } else {
                    tracing::warn!(
                        provider = %provider,
                        email = %email,
                        credential = %id,
                        "duplicate credential for user, skipping (first one wins)"
                    );
                    false
                }
            });
        }
        entries.retain(|e| !e.credentials.is_empty());
    }

    /// Validation pass: initialize each OAuth credential (refreshing or
    /// re-authorizing as needed), fetch user identity, and drop failures
    /// and post-initialization duplicates.
    async fn initialize_and_dedup(&self, entries: &mut Vec<ProviderCredentials>) {
        let mut checks = Vec::new();
        for entry in entries.iter() {
            for (id, auth) in &entry.credentials {
                if !is_oauth(auth.as_ref()) {
                    continue;
                }
                let provider = entry.provider.clone();
                let id = id.clone();
                let auth = auth.clone();
                checks.push(async move {
                    match auth.initialize(&id).await {
                        Ok(()) => match auth.user_info(&id).await {
                            Ok(info) => (provider, id, info.email, true),
                            Err(e) => {
                                tracing::warn!(credential = %id, error = %e, "could not fetch user info");
                                (provider, id, None, true)
                            }
                        },
                        Err(e) => {
                            tracing::error!(
                                provider = %provider,
                                credential = %id,
                                error = %e,
                                "failed to initialize OAuth credential, excluding from rotation"
                            );
                            (provider, id, None, false)
                        }
                    }
                });
            }
        }

        let results = futures::future::join_all(checks).await;

        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut dropped: HashSet<CredentialId> = HashSet::new();
        for (provider, id, email, ok) in results {
            if !ok {
                dropped.insert(id);
                continue;
            }
            if let Some(email) = email {
                if !seen.insert((provider.clone(), email.clone())) {
                    tracing::warn!(
                        provider = %provider,
                        email = %email,
                        credential = %id,
                        "duplicate credential found after initialization, skipping"
                    );
                    dropped.insert(id);
                }
            }
        }

        for entry in entries.iter_mut() {
            entry.credentials.retain(|(id, _)| !dropped.contains(id));
        }
        entries.retain(|e| !e.credentials.is_empty());
        tracing::info!("OAuth credential processing complete");
    }
}

fn is_oauth(auth: &dyn ProviderAuth) -> bool {
    oauth_profile(auth.provider()).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialMetadata, OAuthTokens};
    use std::path::Path;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn manager(dir: &Path, vars: HashMap<String, String>, skip_init: bool) -> CredentialManager {
        let store = Arc::new(CredentialStore::with_env(dir, vars.clone()));
        CredentialManager::with_env(store, Arc::new(ReauthCoordinator::new()), vars, skip_init)
    }

    fn write_oauth(dir: &Path, name: &str, email: Option<&str>, expiry_offset_ms: i64) {
        let tokens = OAuthTokens {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            expiry_date: chrono::Utc::now().timestamp_millis() + expiry_offset_ms,
            resource_url: None,
            extras: Default::default(),
            metadata: CredentialMetadata {
                email: email.map(String::from),
                ..Default::default()
            },
        };
        std::fs::write(dir.join(name), serde_json::to_string_pretty(&tokens).unwrap()).unwrap();
    }

    fn find<'a>(entries: &'a [ProviderCredentials], provider: &str) -> &'a ProviderCredentials {
        entries
            .iter()
            .find(|e| e.provider == provider)
            .unwrap_or_else(|| panic!("provider {provider} not discovered"))
    }

    #[test]
    fn discovers_numbered_api_keys_and_skips_proxy_key() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(
            dir.path(),
            env(&[
                ("OPENAI_API_KEY", "sk-1"),
                ("OPENAI_API_KEY_2", "sk-2"),
                ("GROQ_API_KEY", "gk-1"),
                ("PROXY_API_KEY", "proxy-secret"),
            ]),
            true,
        );

        let entries = mgr.discover();
        assert_eq!(find(&entries, "openai").credentials.len(), 2);
        assert_eq!(find(&entries, "groq").credentials.len(), 1);
        assert!(!entries.iter().any(|e| e.provider == "proxy"));
    }

    #[test]
    fn discovers_oauth_files_and_env_credentials() {
        let dir = tempfile::tempdir().unwrap();
        write_oauth(dir.path(), "qwen_code_oauth_1.json", Some("a@x.com"), 0);
        write_oauth(dir.path(), "gemini_cli_oauth_1.json", Some("b@x.com"), 0);

        let mgr = manager(
            dir.path(),
            env(&[
                ("QWEN_CODE_1_ACCESS_TOKEN", "at"),
                ("QWEN_CODE_1_REFRESH_TOKEN", "rt"),
            ]),
            true,
        );

        let entries = mgr.discover();
        // one env credential + one file credential
        assert_eq!(find(&entries, "qwen_code").credentials.len(), 2);
        assert_eq!(find(&entries, "gemini_cli").credentials.len(), 1);
    }

    #[test]
    fn files_for_unknown_providers_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_oauth(dir.path(), "mystery_oauth_1.json", Some("a@x.com"), 0);
        let mgr = manager(dir.path(), HashMap::new(), true);
        assert!(mgr.discover().is_empty());
    }

    #[tokio::test]
    async fn duplicate_email_keeps_first_by_enumeration_order() {
        let dir = tempfile::tempdir().unwrap();
        write_oauth(dir.path(), "qwen_code_oauth_1.json", Some("dup@x.com"), 0);
        write_oauth(dir.path(), "qwen_code_oauth_2.json", Some("dup@x.com"), 0);
        write_oauth(dir.path(), "qwen_code_oauth_3.json", Some("other@x.com"), 0);

        let mgr = manager(dir.path(), HashMap::new(), true);
        let entries = mgr.discover_and_initialize().await;

        let qwen = find(&entries, "qwen_code");
        assert_eq!(qwen.credentials.len(), 2);
        assert!(qwen.credentials[0].0.basename().ends_with("oauth_1.json"));
        assert!(qwen.credentials[1].0.basename().ends_with("oauth_3.json"));
    }

    #[tokio::test]
    async fn same_email_on_different_providers_is_not_a_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        write_oauth(dir.path(), "qwen_code_oauth_1.json", Some("me@x.com"), 0);
        write_oauth(dir.path(), "gemini_cli_oauth_1.json", Some("me@x.com"), 0);

        let mgr = manager(dir.path(), HashMap::new(), true);
        let entries = mgr.discover_and_initialize().await;
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn corrupt_files_are_skipped_and_enumeration_continues() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("qwen_code_oauth_1.json"), "{ nope").unwrap();
        write_oauth(dir.path(), "qwen_code_oauth_2.json", Some("ok@x.com"), 0);

        let mgr = manager(dir.path(), HashMap::new(), true);
        let entries = mgr.discover_and_initialize().await;
        let qwen = find(&entries, "qwen_code");
        assert_eq!(qwen.credentials.len(), 1);
        assert!(qwen.credentials[0].0.basename().ends_with("oauth_2.json"));
    }

    #[tokio::test]
    async fn init_pass_keeps_valid_credentials_and_stamps_metadata() {
        let dir = tempfile::tempdir().unwrap();
        // valid for 10 hours, outside the refresh buffer: no network
        write_oauth(
            dir.path(),
            "qwen_code_oauth_1.json",
            Some("me@x.com"),
            10 * 60 * 60 * 1000,
        );

        let mgr = manager(dir.path(), HashMap::new(), false);
        let entries = mgr.discover_and_initialize().await;
        assert_eq!(find(&entries, "qwen_code").credentials.len(), 1);

        let on_disk: OAuthTokens = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("qwen_code_oauth_1.json")).unwrap(),
        )
        .unwrap();
        assert!(on_disk.metadata.last_check_timestamp.is_some());
    }

    #[test]
    fn api_keys_and_oauth_coexist_for_one_provider() {
        let dir = tempfile::tempdir().unwrap();
        write_oauth(dir.path(), "qwen_code_oauth_1.json", Some("me@x.com"), 0);
        let mgr = manager(dir.path(), env(&[("QWEN_CODE_API_KEY", "sk-dash")]), true);

        let entries = mgr.discover();
        let qwen = find(&entries, "qwen_code");
        assert_eq!(qwen.credentials.len(), 2);
        // API keys come first in rotation order
        assert!(qwen.credentials[0].0.as_str().starts_with("env-key://"));
    }
}
