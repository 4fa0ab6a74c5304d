// OAuth token service.
//
// One surface answers "is this integration usable right now" and "make
// it usable". Refresh runs under the coordinator's single-flight lock
// with a double-checked read of the persisted row, so concurrent
// requesters never stack network calls against a provider's token
// endpoint.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use log::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::lock::RefreshCoordinator;
use crate::models::{CalendarIntegration, Provider};
use crate::providers::AdapterRegistry;
use crate::store::IntegrationStore;
use crate::utils::logging::log_token_refresh;

/// Refresh when the token expires within this window, so a request that
/// starts with a barely-valid token does not die mid-flight.
pub const TOKEN_EXPIRY_BUFFER_SECS: i64 = 300;

pub struct TokenService {
    store: Arc<dyn IntegrationStore>,
    coordinator: Arc<RefreshCoordinator>,
    registry: Arc<AdapterRegistry>,
}

impl TokenService {
    pub fn new(
        store: Arc<dyn IntegrationStore>,
        coordinator: Arc<RefreshCoordinator>,
        registry: Arc<AdapterRegistry>,
    ) -> Self {
        Self {
            store,
            coordinator,
            registry,
        }
    }

    /// Return the integration with a usable access token, refreshing if
    /// needed. CalDAV integrations pass through untouched; their Basic
    /// credentials do not expire.
    pub async fn ensure_valid(
        &self,
        integration: CalendarIntegration,
    ) -> SyncResult<CalendarIntegration> {
        let provider = integration.provider()?;
        if !provider.is_oauth() {
            return Ok(integration);
        }
        if !integration.token_expires_within(TOKEN_EXPIRY_BUFFER_SECS) {
            return Ok(integration);
        }
        self.refresh(integration).await
    }

    /// Refresh the integration's tokens under the coordinator lock.
    ///
    /// The persisted row is re-fetched and re-checked once the lock is
    /// held: if a concurrent refresh just completed, the fresh row is
    /// returned without a redundant round trip to the token endpoint.
    pub async fn refresh(
        &self,
        integration: CalendarIntegration,
    ) -> SyncResult<CalendarIntegration> {
        let provider = integration.provider()?;
        let id = integration
            .id
            .ok_or_else(|| SyncError::configuration("cannot refresh an unsaved integration"))?;

        self.coordinator
            .with_lock((provider, id), "token-refresh", async {
                let current = self.store.get(id).await?;
                if !current.token_expires_within(TOKEN_EXPIRY_BUFFER_SECS) {
                    debug!(
                        "Token for {}/{} already refreshed by a concurrent worker",
                        provider.as_str(),
                        id
                    );
                    return Ok(current);
                }

                let adapter = self.registry.get(provider)?;
                match adapter.refresh_token(&current).await {
                    Ok(tokens) => {
                        let mut updated = current;
                        updated.access_token = Some(tokens.access_token);
                        // Providers differ here: Outlook returns a fresh
                        // refresh token on every exchange, Google only
                        // sometimes. Keep the old one unless replaced.
                        if tokens.refresh_token.is_some() {
                            updated.refresh_token = tokens.refresh_token;
                        }
                        updated.token_expires_at =
                            Some(Utc::now() + ChronoDuration::seconds(tokens.expires_in));
                        if tokens.scope.is_some() {
                            updated.oauth_scope = tokens.scope;
                        }
                        updated.sync_error = None;

                        // A failed write must not discard a token we
                        // already obtained: the current request proceeds
                        // with the in-memory copy and the sweep retries
                        // the persistence later.
                        if let Err(e) = self.store.update(&updated).await {
                            warn!(
                                "Persisting refreshed token for {}/{} failed, continuing in-memory: {}",
                                provider.as_str(),
                                id,
                                e
                            );
                        }

                        log_token_refresh(provider.as_str(), id, "refreshed");
                        Ok(updated)
                    }
                    Err(err) => {
                        if matches!(err, SyncError::Permanent(_)) {
                            let mut broken = current;
                            broken.is_active = false;
                            broken.sync_error = Some(err.to_string());
                            if let Err(persist_err) = self.store.update(&broken).await {
                                warn!(
                                    "Could not record permanent refresh failure for {}/{}: {}",
                                    provider.as_str(),
                                    id,
                                    persist_err
                                );
                            }
                            log_token_refresh(provider.as_str(), id, "permanently failed");
                        }
                        Err(err)
                    }
                }
            })
            .await
    }

    /// The adapter registry this service refreshes through, shared with
    /// the fetch path so both sides talk to the same implementations.
    pub fn registry(&self) -> Arc<AdapterRegistry> {
        self.registry.clone()
    }

    /// Sweep every active OAuth integration whose token expires within
    /// the buffer and refresh it. Invoked by the job runner; one failing
    /// integration never aborts the sweep.
    pub async fn refresh_expiring_tokens(
        &self,
        provider: Option<Provider>,
    ) -> SyncResult<SweepStats> {
        let threshold = Utc::now() + ChronoDuration::seconds(TOKEN_EXPIRY_BUFFER_SECS);
        let due = self.store.list_expiring_before(threshold, provider).await?;

        let mut stats = SweepStats::default();
        for integration in due {
            let label = integration.id.unwrap_or_default();
            match self.refresh(integration).await {
                Ok(_) => stats.refreshed += 1,
                Err(SyncError::RefreshInProgress) => {
                    stats.in_progress += 1;
                }
                Err(e) => {
                    stats.failed += 1;
                    warn!("Sweep refresh of integration {} failed: {}", label, e);
                }
            }
        }

        info!(
            "Token sweep done: {} refreshed, {} in progress elsewhere, {} failed",
            stats.refreshed, stats.in_progress, stats.failed
        );
        Ok(stats)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub refreshed: usize,
    pub in_progress: usize,
    pub failed: usize,
}

/// Retry cadence for the job runner when a single-integration refresh
/// job fails: 30 s doubling per attempt, capped at one hour.
pub fn custom_backoff(attempt: u32) -> Duration {
    let capped_attempt = attempt.min(8);
    let secs = 30u64.saturating_mul(1u64 << capped_attempt);
    Duration::from_secs(secs.min(3600))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{MockProviderAdapter, TokenRefresh};
    use crate::store::sqlite::memory_store;
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use chrono::DateTime;

    fn service_with(
        store: SqliteStore,
        mock: MockProviderAdapter,
    ) -> (TokenService, Arc<SqliteStore>) {
        let store = Arc::new(store);
        let registry =
            AdapterRegistry::default().with_adapter(Provider::Google, Arc::new(mock));
        let service = TokenService::new(
            store.clone(),
            Arc::new(RefreshCoordinator::new()),
            Arc::new(registry),
        );
        (service, store)
    }

    fn expired_google(user_id: i64) -> CalendarIntegration {
        let mut integration = CalendarIntegration::new_oauth(
            user_id,
            Provider::Google,
            "stale-access".to_string(),
            Some("old-refresh".to_string()),
            3600,
            None,
        );
        integration.token_expires_at = Some(Utc::now() - ChronoDuration::seconds(60));
        integration
    }

    #[tokio::test]
    async fn test_ensure_valid_passes_through_fresh_token() {
        let store = memory_store().await;
        // No expectations on the mock: any adapter call panics the test.
        let (service, _) = service_with(store, MockProviderAdapter::new());

        let integration = CalendarIntegration::new_oauth(
            1,
            Provider::Google,
            "good".to_string(),
            None,
            3600,
            None,
        );
        let result = service.ensure_valid(integration).await.unwrap();
        assert_eq!(result.access_token.as_deref(), Some("good"));
    }

    #[tokio::test]
    async fn test_ensure_valid_ignores_caldav() {
        let store = memory_store().await;
        let (service, _) = service_with(store, MockProviderAdapter::new());

        let integration = CalendarIntegration::new_caldav(
            1,
            Provider::Radicale,
            "https://cal.example.com:5232".to_string(),
            "alice".to_string(),
            "pw".to_string(),
        );
        assert!(service.ensure_valid(integration).await.is_ok());
    }

    #[tokio::test]
    async fn test_refresh_rotates_and_persists() {
        let store = memory_store().await;
        let id = store.insert(&expired_google(1))
            .await
            .unwrap();

        let mut mock = MockProviderAdapter::new();
        mock.expect_refresh_token().times(1).returning(|_| {
            Ok(TokenRefresh {
                access_token: "new-access".to_string(),
                refresh_token: Some("new-refresh".to_string()),
                expires_in: 3600,
                scope: None,
            })
        });
        let (service, store) = service_with(store, mock);

        let integration = store.get(id).await.unwrap();
        let refreshed = service.ensure_valid(integration).await.unwrap();
        assert_eq!(refreshed.access_token.as_deref(), Some("new-access"));
        assert_eq!(refreshed.refresh_token.as_deref(), Some("new-refresh"));
        assert!(refreshed.sync_error.is_none());

        let persisted = store.get(id).await.unwrap();
        assert_eq!(persisted.access_token.as_deref(), Some("new-access"));
        assert!(!persisted.token_expires_within(TOKEN_EXPIRY_BUFFER_SECS));
    }

    #[tokio::test]
    async fn test_refresh_keeps_old_refresh_token_when_not_rotated() {
        let store = memory_store().await;
        let id = store.insert(&expired_google(1))
            .await
            .unwrap();

        let mut mock = MockProviderAdapter::new();
        mock.expect_refresh_token().times(1).returning(|_| {
            Ok(TokenRefresh {
                access_token: "new-access".to_string(),
                refresh_token: None,
                expires_in: 3600,
                scope: None,
            })
        });
        let (service, store) = service_with(store, mock);

        let integration = store.get(id).await.unwrap();
        let refreshed = service.refresh(integration).await.unwrap();
        assert_eq!(refreshed.refresh_token.as_deref(), Some("old-refresh"));
    }

    #[tokio::test]
    async fn test_double_checked_refresh_skips_provider_call() {
        let store = memory_store().await;
        let id = store.insert(&expired_google(1))
            .await
            .unwrap();

        // The persisted row got refreshed by "another process".
        let mut fresh = store.get(id).await.unwrap();
        fresh.access_token = Some("concurrent-winner".to_string());
        fresh.token_expires_at = Some(Utc::now() + ChronoDuration::hours(1));
        store.update(&fresh)
            .await
            .unwrap();

        // Stale in-memory copy still thinks a refresh is needed; the
        // post-lock re-check must avoid the network call entirely.
        let mut stale = fresh.clone();
        stale.access_token = Some("stale-access".to_string());
        stale.token_expires_at = Some(Utc::now() - ChronoDuration::seconds(60));

        let (service, _) = service_with(store, MockProviderAdapter::new());
        let result = service.refresh(stale).await.unwrap();
        assert_eq!(result.access_token.as_deref(), Some("concurrent-winner"));
    }

    #[tokio::test]
    async fn test_permanent_failure_deactivates_integration() {
        let store = memory_store().await;
        let id = store.insert(&expired_google(1))
            .await
            .unwrap();

        let mut mock = MockProviderAdapter::new();
        mock.expect_refresh_token()
            .times(1)
            .returning(|_| Err(SyncError::permanent("invalid_grant")));
        let (service, store) = service_with(store, mock);

        let integration = store.get(id).await.unwrap();
        let result = service.refresh(integration).await;
        assert!(matches!(result, Err(SyncError::Permanent(_))));

        let persisted = store.get(id).await.unwrap();
        assert!(!persisted.is_active);
        assert!(persisted
            .sync_error
            .as_deref()
            .unwrap()
            .contains("invalid_grant"));
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_integration_active() {
        let store = memory_store().await;
        let id = store.insert(&expired_google(1))
            .await
            .unwrap();

        let mut mock = MockProviderAdapter::new();
        mock.expect_refresh_token()
            .times(1)
            .returning(|_| Err(SyncError::transient("503 from token endpoint")));
        let (service, store) = service_with(store, mock);

        let integration = store.get(id).await.unwrap();
        assert!(matches!(
            service.refresh(integration).await,
            Err(SyncError::Transient(_))
        ));
        assert!(store.get(id).await.unwrap().is_active);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_reports_in_progress() {
        let store = memory_store().await;
        let id = store.insert(&expired_google(1))
            .await
            .unwrap();

        let store = Arc::new(store);
        let coordinator = Arc::new(RefreshCoordinator::new());
        coordinator.seed_lock((Provider::Google, id), "other-worker", std::time::Duration::ZERO);

        let registry = AdapterRegistry::default()
            .with_adapter(Provider::Google, Arc::new(MockProviderAdapter::new()));
        let service = TokenService::new(store.clone(), coordinator, Arc::new(registry));

        let integration = store.get(id).await.unwrap();
        assert!(matches!(
            service.refresh(integration).await,
            Err(SyncError::RefreshInProgress)
        ));
    }

    struct FailingWriteStore {
        inner: SqliteStore,
    }

    #[async_trait]
    impl IntegrationStore for FailingWriteStore {
        async fn get(&self, id: i64) -> SyncResult<CalendarIntegration> {
            self.inner.get(id).await
        }
        async fn insert(&self, integration: &CalendarIntegration) -> SyncResult<i64> {
            self.inner.insert(integration).await
        }
        async fn update(&self, _integration: &CalendarIntegration) -> SyncResult<()> {
            Err(SyncError::Database(sqlx::Error::PoolClosed))
        }
        async fn delete(&self, id: i64) -> SyncResult<()> {
            self.inner.delete(id).await
        }
        async fn list_for_user(&self, user_id: i64) -> SyncResult<Vec<CalendarIntegration>> {
            self.inner.list_for_user(user_id).await
        }
        async fn list_expiring_before(
            &self,
            threshold: DateTime<Utc>,
            provider: Option<Provider>,
        ) -> SyncResult<Vec<CalendarIntegration>> {
            self.inner.list_expiring_before(threshold, provider).await
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_still_returns_fresh_token() {
        let sqlite = memory_store().await;
        let id = sqlite.insert(&expired_google(1))
            .await
            .unwrap();

        let mut mock = MockProviderAdapter::new();
        mock.expect_refresh_token().times(1).returning(|_| {
            Ok(TokenRefresh {
                access_token: "obtained".to_string(),
                refresh_token: None,
                expires_in: 3600,
                scope: None,
            })
        });

        let store = Arc::new(FailingWriteStore { inner: sqlite });
        let registry = AdapterRegistry::default().with_adapter(Provider::Google, Arc::new(mock));
        let service = TokenService::new(
            store.clone(),
            Arc::new(RefreshCoordinator::new()),
            Arc::new(registry),
        );

        let integration = store.get(id).await.unwrap();
        let refreshed = service.refresh(integration).await.unwrap();
        assert_eq!(refreshed.access_token.as_deref(), Some("obtained"));
    }

    #[tokio::test]
    async fn test_sweep_refreshes_expiring_integrations() {
        let store = memory_store().await;
        store.insert(&expired_google(1))
            .await
            .unwrap();
        store.insert(&expired_google(2))
            .await
            .unwrap();

        let mut mock = MockProviderAdapter::new();
        mock.expect_refresh_token().times(2).returning(|_| {
            Ok(TokenRefresh {
                access_token: "swept".to_string(),
                refresh_token: None,
                expires_in: 3600,
                scope: None,
            })
        });
        let (service, _) = service_with(store, mock);

        let stats = service.refresh_expiring_tokens(None).await.unwrap();
        assert_eq!(
            stats,
            SweepStats {
                refreshed: 2,
                in_progress: 0,
                failed: 0
            }
        );
    }

    #[test]
    fn test_custom_backoff_doubles_and_clamps() {
        assert_eq!(custom_backoff(0), Duration::from_secs(30));
        assert_eq!(custom_backoff(1), Duration::from_secs(60));
        assert_eq!(custom_backoff(2), Duration::from_secs(120));
        // monotonically non-decreasing, capped at one hour
        let mut previous = Duration::ZERO;
        for attempt in 0..20 {
            let delay = custom_backoff(attempt);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(3600));
            previous = delay;
        }
        assert_eq!(custom_backoff(19), Duration::from_secs(3600));
    }
}
