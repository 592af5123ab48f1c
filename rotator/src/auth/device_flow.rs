//! OAuth 2.0 Device Authorization Grant (RFC 8628) with PKCE.

use super::headless::{is_electron_mode, is_headless_environment};
use super::pkce::generate_pkce;
use super::profiles::OAuthProfile;
use crate::credentials::{CredentialMetadata, OAuthTokens};
use crate::error::RotatorError;
use serde::Deserialize;
use std::io::IsTerminal;
use std::time::Duration;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    #[allow(dead_code)]
    user_code: String,
    verification_uri: String,
    #[serde(default)]
    verification_uri_complete: Option<String>,
    expires_in: u64,
    #[serde(default)]
    interval: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenSuccess {
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

#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// `slow_down`: multiply the poll interval by 1.5, capped at 10 s.
fn slowed_down(interval: Duration) -> Duration {
    Duration::from_secs_f64(interval.as_secs_f64() * 1.5).min(MAX_POLL_INTERVAL)
}

/// Run the interactive device flow for `profile` and return a fresh
/// token set. Blocks (asynchronously) until the user authorizes in a
/// browser or the server-side device code expires.
pub async fn run_device_flow(
    http: &reqwest::Client,
    profile: &OAuthProfile,
    display_name: &str,
) -> Result<OAuthTokens, RotatorError> {
    let pkce = generate_pkce();
    let client_id = profile.client_id();

    let resp = http
        .post(profile.device_code_url)
        .header("Accept", "application/json")
        .form(&[
            ("client_id", client_id.as_str()),
            ("scope", profile.scope),
            ("code_challenge", pkce.challenge.as_str()),
            ("code_challenge_method", "S256"),
        ])
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(RotatorError::Internal(format!(
            "device authorization failed: HTTP {} {}",
            status.as_u16(),
            body
        )));
    }
    let device: DeviceCodeResponse = resp.json().await?;

    let url = device
        .verification_uri_complete
        .clone()
        .unwrap_or_else(|| device.verification_uri.clone());
    announce_url(profile, display_name, &url);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(device.expires_in);
    let mut interval = device
        .interval
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_POLL_INTERVAL);

    loop {
        if tokio::time::Instant::now() >= deadline {
            return Err(RotatorError::ReauthTimeout(Duration::from_secs(
                device.expires_in,
            )));
        }

        let mut form = vec![
            ("grant_type", "urn:ietf:params:oauth:grant-type:device_code".to_string()),
            ("device_code", device.device_code.clone()),
            ("client_id", client_id.clone()),
            ("code_verifier", pkce.verifier.clone()),
        ];
        if let Some(secret) = profile.client_secret() {
            form.push(("client_secret", secret));
        }

        let poll = http
            .post(profile.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await?;

        let status = poll.status();
        let body = poll.text().await.unwrap_or_default();

        if status.is_success() {
            let token: TokenSuccess = serde_json::from_str(&body)?;
            tracing::info!(provider = profile.provider, "device flow authorized");
            let now_ms = chrono::Utc::now().timestamp_millis();
            let mut tokens = OAuthTokens {
                access_token: token.access_token,
                refresh_token: token.refresh_token.unwrap_or_default(),
                expiry_date: now_ms + token.expires_in.unwrap_or(3600) * 1000,
                resource_url: token.resource_url,
                extras: Default::default(),
                metadata: CredentialMetadata {
                    display_name: Some(display_name.to_string()),
                    last_check_timestamp: Some(now_ms as f64 / 1000.0),
                    ..Default::default()
                },
            };
            tokens.extras.api_key = token.api_key;
            tokens.metadata.email = prompt_for_email(display_name).await;
            return Ok(tokens);
        }

        let err: TokenErrorBody = serde_json::from_str(&body).unwrap_or(TokenErrorBody {
            error: "invalid_response".into(),
            error_description: Some(body.clone()),
        });

        match err.error.as_str() {
            "authorization_pending" => {
                tracing::debug!(interval_secs = interval.as_secs(), "authorization pending");
            }
            "slow_down" => {
                interval = slowed_down(interval);
                tracing::debug!(interval_secs = interval.as_secs(), "server asked to slow down");
            }
            _ if status.as_u16() == 429 => {
                interval = slowed_down(interval);
            }
            other => {
                return Err(RotatorError::Internal(format!(
                    "device token polling failed: {} - {}",
                    other,
                    err.error_description.unwrap_or_default()
                )));
            }
        }

        tokio::time::sleep(interval).await;
    }
}

fn announce_url(profile: &OAuthProfile, display_name: &str, url: &str) {
    println!();
    println!("=== {} OAuth setup for {} ===", profile.display_name, display_name);
    println!("1. Visit the URL below to sign in and authorize the application.");
    println!("2. Keep this window open; it waits for you to finish.");
    println!("URL: {url}");
    println!();

    if is_electron_mode() {
        // The wrapping desktop app watches stdout for this marker.
        println!("OAUTH_URL:{url}");
        tracing::info!("electron mode, device URL handed to wrapper");
    } else if !is_headless_environment() {
        if let Err(e) = open::that(url) {
            tracing::warn!(error = %e, "could not open browser, open the URL manually");
        }
    } else {
        tracing::info!("headless environment, open the URL on another machine");
    }
}

/// Ask for an identifier used to deduplicate credentials. Skipped when
/// stdin is not a terminal (headless and test runs).
async fn prompt_for_email(display_name: &str) -> Option<String> {
    if !std::io::stdin().is_terminal() {
        return None;
    }
    let display_name = display_name.to_string();
    let line = tokio::task::spawn_blocking(move || {
        println!("Enter your email or a unique identifier for '{display_name}' (optional):");
        let mut buf = String::new();
        std::io::stdin().read_line(&mut buf).ok()?;
        let trimmed = buf.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
    .await
    .ok()
    .flatten();
    if line.is_none() {
        tracing::warn!("no identifier provided, deduplication will not be possible");
    }
    line
}
