pub mod auth;
pub mod background;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod reauth;
pub mod refresh_queue;
pub mod upstream;

// Re-exports for convenience
pub use auth::{ApiDetails, ProviderAuth, provider_base_url};
pub use background::BackgroundRefresher;
pub use client::{RotatingClient, RotatingClientBuilder};
pub use config::RotatorConfig;
pub use credentials::manager::{CredentialManager, ProviderCredentials};
pub use credentials::store::CredentialStore;
pub use credentials::{ApiKeyCredential, CredentialId, CredentialMetadata, OAuthTokens, ProviderExtras};
pub use error::RotatorError;
pub use reauth::ReauthCoordinator;
pub use upstream::{OpenAiUpstream, Upstream};
