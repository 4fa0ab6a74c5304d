// Provider adapter layer.
//
// One uniform contract per provider; callers never see provider wire
// formats. Adapters are selected through a static registry keyed by the
// provider enum, not by runtime name lookup.

pub mod caldav;
pub mod google;
pub mod ids;
pub mod outlook;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use serde::Deserialize;

use crate::caldav::ServerType;
use crate::config::OAuthClientConfig;
use crate::error::{SyncError, SyncResult};
use crate::http_config::HttpConfig;
use crate::models::{CalendarEntry, CalendarEvent, CalendarIntegration, Provider};

pub use ids::provider_event_id;

/// Result of a token endpoint exchange.
#[derive(Debug, Clone)]
pub struct TokenRefresh {
    pub access_token: String,
    /// `None` when the provider kept the old refresh token (Google may;
    /// Outlook never does).
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    pub scope: Option<String>,
}

/// Uniform outcome of a connection probe.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub ok: bool,
    pub message: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn list_events(
        &self,
        integration: &CalendarIntegration,
        calendar_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SyncResult<Vec<CalendarEvent>>;

    /// Returns the provider-native id of the created event.
    async fn create_event(
        &self,
        integration: &CalendarIntegration,
        event: &CalendarEvent,
    ) -> SyncResult<String>;

    async fn update_event(
        &self,
        integration: &CalendarIntegration,
        event: &CalendarEvent,
    ) -> SyncResult<()>;

    async fn delete_event(
        &self,
        integration: &CalendarIntegration,
        calendar_id: &str,
        event_id: &str,
    ) -> SyncResult<()>;

    async fn discover_calendars(
        &self,
        integration: &CalendarIntegration,
    ) -> SyncResult<Vec<CalendarEntry>>;

    async fn refresh_token(&self, integration: &CalendarIntegration) -> SyncResult<TokenRefresh>;

    async fn test_connection(
        &self,
        integration: &CalendarIntegration,
    ) -> SyncResult<ConnectionStatus>;
}

/// Static map from provider to adapter implementation.
pub struct AdapterRegistry {
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        let mut adapters: HashMap<Provider, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(Provider::Google, Arc::new(google::GoogleAdapter::new()));
        adapters.insert(Provider::Outlook, Arc::new(outlook::OutlookAdapter::new()));
        // The generic entry detects the server dialect from the base
        // URL at call time; the named entries pin it.
        adapters.insert(Provider::Caldav, Arc::new(caldav::CaldavAdapter::generic()));
        adapters.insert(
            Provider::Nextcloud,
            Arc::new(caldav::CaldavAdapter::for_server(ServerType::Nextcloud)),
        );
        adapters.insert(
            Provider::Owncloud,
            Arc::new(caldav::CaldavAdapter::for_server(ServerType::Owncloud)),
        );
        adapters.insert(
            Provider::Radicale,
            Arc::new(caldav::CaldavAdapter::for_server(ServerType::Radicale)),
        );
        adapters.insert(
            Provider::Baikal,
            Arc::new(caldav::CaldavAdapter::for_server(ServerType::Baikal)),
        );
        adapters.insert(
            Provider::Sabredav,
            Arc::new(caldav::CaldavAdapter::for_server(ServerType::Sabredav)),
        );
        Self { adapters }
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, provider: Provider) -> SyncResult<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(&provider)
            .cloned()
            .ok_or_else(|| {
                SyncError::configuration(format!("no adapter registered for {}", provider.as_str()))
            })
    }

    /// Replace the adapter for one provider. Embedders and tests use
    /// this to swap in instrumented implementations.
    pub fn with_adapter(mut self, provider: Provider, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(provider, adapter);
        self
    }
}

lazy_static! {
    static ref DEFAULT_REGISTRY: AdapterRegistry = AdapterRegistry::default();
}

/// Adapter lookup against the process-wide default registry.
pub fn adapter_for(provider: Provider) -> SyncResult<Arc<dyn ProviderAdapter>> {
    DEFAULT_REGISTRY.get(provider)
}

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
}

/// Shared `grant_type=refresh_token` exchange for the OAuth providers.
pub(crate) async fn refresh_via_token_endpoint(
    provider: Provider,
    integration: &CalendarIntegration,
) -> SyncResult<TokenRefresh> {
    let refresh_token = integration.refresh_token.as_deref().ok_or_else(|| {
        SyncError::permanent("no refresh token on record; re-authorization required")
    })?;
    let config = OAuthClientConfig::for_provider(provider)?;

    let client = HttpConfig::oauth().build_client()?;
    let response = client
        .post(&config.token_url)
        .form(&[
            ("grant_type", "refresh_token"),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
            ("refresh_token", refresh_token),
        ])
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        // invalid_grant means the refresh token itself is dead, whatever
        // the status code; everything else classifies by status.
        if body.contains("invalid_grant") {
            return Err(SyncError::permanent(format!(
                "refresh token rejected by {}: invalid_grant",
                provider.as_str()
            )));
        }
        return Err(SyncError::from_status(status, &body));
    }

    let token: TokenEndpointResponse = response
        .json()
        .await
        .map_err(|e| SyncError::transient(format!("malformed token response: {}", e)))?;

    Ok(TokenRefresh {
        access_token: token.access_token,
        refresh_token: token.refresh_token,
        expires_in: token.expires_in.unwrap_or(3600),
        scope: token.scope,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_covers_every_provider() {
        let registry = AdapterRegistry::default();
        for provider in Provider::all() {
            assert!(registry.get(provider).is_ok(), "missing {}", provider.as_str());
        }
    }

    #[test]
    fn test_with_adapter_overrides() {
        let mock = MockProviderAdapter::new();
        let registry =
            AdapterRegistry::default().with_adapter(Provider::Google, Arc::new(mock));
        assert!(registry.get(Provider::Google).is_ok());
    }
}
