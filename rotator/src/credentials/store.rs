use super::{CredentialId, CredentialMetadata, OAuthTokens};
use crate::error::RotatorError;
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Reads and persists OAuth credential files with atomic writes, and
/// assembles virtual credentials from environment variables.
///
/// File naming: `{provider}_oauth_{N}.json` inside the credential
/// directory (default `./oauth_creds`). Env-sourced credentials
/// (`env://provider/N`) are never written back to disk; saving them only
/// updates the in-memory cache.
pub struct CredentialStore {
    dir: PathBuf,
    env: HashMap<String, String>,
    /// Cache of env-sourced token sets; file-backed credentials are
    /// cached by the auth engine, not here.
    env_cache: Mutex<HashMap<CredentialId, OAuthTokens>>,
}

impl CredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_env(dir, std::env::vars().collect())
    }

    pub fn with_env(dir: impl Into<PathBuf>, env: HashMap<String, String>) -> Self {
        Self {
            dir: dir.into(),
            env,
            env_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Enumerate on-disk credential files as `(provider, id)` pairs,
    /// in lexicographic filename order.
    pub fn scan_files(&self) -> Vec<(String, CredentialId)> {
        let mut found = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(_) => return found,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if !name.ends_with(".json") {
                continue;
            }
            if let Some(provider) = name.split("_oauth_").next() {
                if provider != name {
                    found.push((provider.to_string(), CredentialId::from_path(&path)));
                }
            }
        }
        found.sort_by(|a, b| a.1.cmp(&b.1));
        found
    }

    /// Enumerate env-sourced OAuth credentials for `provider`:
    /// numbered `{PREFIX}_{N}_ACCESS_TOKEN` pairs plus the legacy
    /// unnumbered `{PREFIX}_ACCESS_TOKEN` form (treated as index 0).
    pub fn scan_env(&self, provider: &str) -> Vec<CredentialId> {
        let prefix = provider.to_uppercase();
        let mut ids = Vec::new();

        if self.env.contains_key(&format!("{}_ACCESS_TOKEN", prefix)) {
            ids.push(CredentialId::from_env(provider, "0"));
        }

        let mut n = 1;
        loop {
            if self
                .env
                .contains_key(&format!("{}_{}_ACCESS_TOKEN", prefix, n))
            {
                ids.push(CredentialId::from_env(provider, &n.to_string()));
                n += 1;
            } else {
                break;
            }
        }
        ids
    }

    /// Load a credential by id, from the environment or from disk.
    pub fn load(&self, id: &CredentialId) -> Result<OAuthTokens, RotatorError> {
        if let Some(index) = id.env_index() {
            if let Some(cached) = self.env_cache.lock().get(id) {
                return Ok(cached.clone());
            }
            let provider = id
                .as_str()
                .strip_prefix("env://")
                .and_then(|rest| rest.split('/').next())
                .unwrap_or_default();
            let tokens = self.load_from_env(provider, index).ok_or_else(|| {
                RotatorError::Config(format!(
                    "environment variables for credential {} not found",
                    id
                ))
            })?;
            self.env_cache.lock().insert(id.clone(), tokens.clone());
            return Ok(tokens);
        }

        let path = PathBuf::from(id.as_str());
        let content = fs::read_to_string(&path)
            .map_err(|_| RotatorError::CredentialMissing(path.clone()))?;
        serde_json::from_str(&content).map_err(|e| RotatorError::CredentialCorrupt {
            path,
            reason: e.to_string(),
        })
    }

    /// Persist a credential atomically: temp file in the same directory,
    /// owner-only permissions, rename over the target. Serialized by an
    /// exclusive lock on a sibling lock file. Env-sourced credentials are
    /// cached in memory instead of written.
    pub fn save(&self, id: &CredentialId, tokens: &OAuthTokens) -> Result<(), RotatorError> {
        if id.is_env() || tokens.metadata.loaded_from_env {
            tracing::debug!(credential = %id, "credential loaded from env, skipping file save");
            self.env_cache.lock().insert(id.clone(), tokens.clone());
            return Ok(());
        }

        let path = PathBuf::from(id.as_str());
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&parent, fs::Permissions::from_mode(0o700));
        }

        // A sibling lock file (avoids locking the target itself during
        // the atomic replace).
        let lock_path = path.with_extension("json.lock");
        let lock_file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)?;
        lock_file.lock_exclusive()?;

        let result = self.write_atomic(&path, tokens);
        let _ = fs2::FileExt::unlock(&lock_file);
        result
    }

    fn write_atomic(&self, path: &Path, tokens: &OAuthTokens) -> Result<(), RotatorError> {
        let json = serde_json::to_string_pretty(tokens)?;
        let tmp_path = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600));
        }
        fs::rename(&tmp_path, path)?;
        tracing::debug!(path = %path.display(), "saved credential (atomic write)");
        Ok(())
    }

    fn load_from_env(&self, provider: &str, index: &str) -> Option<OAuthTokens> {
        let upper = provider.to_uppercase();
        let (prefix, default_email) = if index != "0" {
            (format!("{}_{}", upper, index), format!("env-user-{}", index))
        } else {
            (upper, "env-user".to_string())
        };

        let access_token = self.env.get(&format!("{}_ACCESS_TOKEN", prefix))?.clone();
        let refresh_token = self.env.get(&format!("{}_REFRESH_TOKEN", prefix))?.clone();

        let expiry_date = self
            .env
            .get(&format!("{}_EXPIRY_DATE", prefix))
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0) as i64;

        tracing::debug!(prefix = %prefix, "loading OAuth credentials from environment variables");

        Some(OAuthTokens {
            access_token,
            refresh_token,
            expiry_date,
            resource_url: self.env.get(&format!("{}_RESOURCE_URL", prefix)).cloned(),
            extras: Default::default(),
            metadata: CredentialMetadata {
                email: Some(
                    self.env
                        .get(&format!("{}_EMAIL", prefix))
                        .cloned()
                        .unwrap_or(default_email),
                ),
                last_check_timestamp: Some(chrono::Utc::now().timestamp_millis() as f64 / 1000.0),
                display_name: None,
                loaded_from_env: true,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> CredentialStore {
        CredentialStore::with_env(dir, HashMap::new())
    }

    fn tokens(access: &str) -> OAuthTokens {
        OAuthTokens {
            access_token: access.into(),
            refresh_token: "rt".into(),
            expiry_date: 1_700_000_000_000,
            ..Default::default()
        }
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let id = CredentialId::from_path(dir.path().join("qwen_code_oauth_1.json"));

        s.save(&id, &tokens("at")).unwrap();
        let loaded = s.load(&id).unwrap();
        assert_eq!(loaded.access_token, "at");
        assert_eq!(loaded.refresh_token, "rt");

        // no stray temp file left behind
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(!names.iter().any(|n| n.ends_with(".tmp")), "{:?}", names);
    }

    #[test]
    fn save_overwrites_fully_never_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let id = CredentialId::from_path(dir.path().join("qwen_code_oauth_1.json"));

        s.save(&id, &tokens("first")).unwrap();
        s.save(&id, &tokens("second-with-a-much-longer-token-value")).unwrap();
        let loaded = s.load(&id).unwrap();
        assert_eq!(loaded.access_token, "second-with-a-much-longer-token-value");
    }

    #[test]
    fn missing_file_is_credential_missing() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let id = CredentialId::from_path(dir.path().join("nope_oauth_1.json"));
        match s.load(&id) {
            Err(RotatorError::CredentialMissing(_)) => {}
            other => panic!("expected CredentialMissing, got {:?}", other.map(|t| t.access_token)),
        }
    }

    #[test]
    fn malformed_json_is_credential_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qwen_code_oauth_1.json");
        fs::write(&path, "{ not json").unwrap();
        let s = store(dir.path());
        match s.load(&CredentialId::from_path(&path)) {
            Err(RotatorError::CredentialCorrupt { .. }) => {}
            other => panic!("expected CredentialCorrupt, got {:?}", other.map(|t| t.access_token)),
        }
    }

    #[test]
    fn scan_files_extracts_provider_names() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        fs::write(dir.path().join("qwen_code_oauth_1.json"), "{}").unwrap();
        fs::write(dir.path().join("gemini_cli_oauth_2.json"), "{}").unwrap();
        fs::write(dir.path().join("README.txt"), "hi").unwrap();

        let found = s.scan_files();
        let providers: Vec<_> = found.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(found.len(), 2);
        assert!(providers.contains(&"qwen_code"));
        assert!(providers.contains(&"gemini_cli"));
    }

    #[test]
    fn env_credentials_numbered_and_legacy() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = HashMap::new();
        env.insert("QWEN_CODE_ACCESS_TOKEN".into(), "legacy-at".into());
        env.insert("QWEN_CODE_REFRESH_TOKEN".into(), "legacy-rt".into());
        env.insert("QWEN_CODE_1_ACCESS_TOKEN".into(), "at1".into());
        env.insert("QWEN_CODE_1_REFRESH_TOKEN".into(), "rt1".into());
        env.insert("QWEN_CODE_1_EXPIRY_DATE".into(), "1700000000000".into());
        env.insert("QWEN_CODE_1_EMAIL".into(), "one@example.com".into());
        let s = CredentialStore::with_env(dir.path(), env);

        let ids = s.scan_env("qwen_code");
        assert_eq!(ids.len(), 2);

        let legacy = s.load(&CredentialId::from_env("qwen_code", "0")).unwrap();
        assert_eq!(legacy.access_token, "legacy-at");
        assert_eq!(legacy.email(), Some("env-user"));
        assert!(legacy.metadata.loaded_from_env);

        let one = s.load(&CredentialId::from_env("qwen_code", "1")).unwrap();
        assert_eq!(one.access_token, "at1");
        assert_eq!(one.expiry_date, 1_700_000_000_000);
        assert_eq!(one.email(), Some("one@example.com"));
    }

    #[test]
    fn env_save_is_cache_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = HashMap::new();
        env.insert("QWEN_CODE_1_ACCESS_TOKEN".into(), "old".into());
        env.insert("QWEN_CODE_1_REFRESH_TOKEN".into(), "rt".into());
        let s = CredentialStore::with_env(dir.path(), env);
        let id = CredentialId::from_env("qwen_code", "1");

        let mut t = s.load(&id).unwrap();
        t.access_token = "new".into();
        s.save(&id, &t).unwrap();

        // nothing hit the disk, but the cache observed the update
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(s.load(&id).unwrap().access_token, "new");
    }
}
