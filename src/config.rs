//! OAuth client configuration
//!
//! Client credentials come from the environment; the CalDAV family
//! needs none (per-integration Basic auth). Validation runs at startup
//! so a missing secret surfaces before the first refresh fails at 3am.

use std::env;

use crate::error::{SyncError, SyncResult};
use crate::models::Provider;

pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const OUTLOOK_TOKEN_URL: &str =
    "https://login.microsoftonline.com/common/oauth2/v2.0/token";

/// Client credentials for one OAuth provider's token endpoint.
#[derive(Clone)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
}

impl OAuthClientConfig {
    pub fn for_provider(provider: Provider) -> SyncResult<Self> {
        match provider {
            Provider::Google => Ok(Self {
                client_id: require_env("GOOGLE_CLIENT_ID")?,
                client_secret: require_env("GOOGLE_CLIENT_SECRET")?,
                token_url: GOOGLE_TOKEN_URL.to_string(),
            }),
            Provider::Outlook => Ok(Self {
                client_id: require_env("OUTLOOK_CLIENT_ID")?,
                client_secret: require_env("OUTLOOK_CLIENT_SECRET")?,
                token_url: OUTLOOK_TOKEN_URL.to_string(),
            }),
            other => Err(SyncError::configuration(format!(
                "provider {} does not use OAuth",
                other.as_str()
            ))),
        }
    }
}

// Secrets stay out of Debug output.
impl std::fmt::Debug for OAuthClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClientConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"****")
            .field("token_url", &self.token_url)
            .finish()
    }
}

fn require_env(name: &str) -> SyncResult<String> {
    env::var(name)
        .map_err(|_| SyncError::configuration(format!("missing environment variable {}", name)))
}

/// Validates that credentials exist for every OAuth provider that has
/// at least one active integration. CalDAV providers always pass.
pub fn validate_config(providers_in_use: &[Provider]) -> SyncResult<()> {
    for provider in providers_in_use {
        if provider.is_oauth() {
            OAuthClientConfig::for_provider(*provider)?;
        }
    }
    log::info!("OAuth configuration validated for {} providers", providers_in_use.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_missing_google_credentials() {
        env::remove_var("GOOGLE_CLIENT_ID");
        env::remove_var("GOOGLE_CLIENT_SECRET");
        let result = OAuthClientConfig::for_provider(Provider::Google);
        assert!(matches!(result, Err(SyncError::Configuration(_))));
    }

    #[test]
    #[serial]
    fn test_google_credentials_from_env() {
        env::set_var("GOOGLE_CLIENT_ID", "client-id");
        env::set_var("GOOGLE_CLIENT_SECRET", "client-secret");
        let config = OAuthClientConfig::for_provider(Provider::Google).unwrap();
        assert_eq!(config.client_id, "client-id");
        assert_eq!(config.token_url, GOOGLE_TOKEN_URL);
        env::remove_var("GOOGLE_CLIENT_ID");
        env::remove_var("GOOGLE_CLIENT_SECRET");
    }

    #[test]
    #[serial]
    fn test_caldav_provider_has_no_oauth_config() {
        let result = OAuthClientConfig::for_provider(Provider::Radicale);
        assert!(matches!(result, Err(SyncError::Configuration(_))));
    }

    #[test]
    #[serial]
    fn test_validate_config_skips_caldav() {
        assert!(validate_config(&[Provider::Baikal, Provider::Nextcloud]).is_ok());
    }

    #[test]
    fn test_debug_hides_secret() {
        let config = OAuthClientConfig {
            client_id: "id".to_string(),
            client_secret: "very-secret".to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
        };
        assert!(!format!("{:?}", config).contains("very-secret"));
    }
}
