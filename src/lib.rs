// calbridge
// Calendar-integration synchronization core: OAuth credential refresh,
// provider adapters over six CalDAV dialects and two REST APIs,
// concurrent multi-calendar fetching, and per-integration health
// tracking with adaptive re-check scheduling.

pub mod aggregator;
pub mod caldav;
pub mod config;
pub mod error;
pub mod health;
pub mod http_config;
pub mod lock;
pub mod models;
pub mod providers;
pub mod scheduler;
pub mod selection;
pub mod store;
pub mod token;
pub mod utils;

// Re-export commonly used types
pub use error::{SyncError, SyncResult};
pub use health::{HealthMonitor, HealthState, HealthStatus};
pub use lock::RefreshCoordinator;
pub use models::{CalendarEntry, CalendarEvent, CalendarIntegration, Provider};
pub use providers::{AdapterRegistry, ProviderAdapter};
pub use store::{IntegrationStore, ProfileStore, SqliteStore};
pub use token::TokenService;

use std::sync::Arc;

/// Wired-together sync core, shared across the application's request
/// handlers and background jobs.
#[derive(Clone)]
pub struct SyncCore {
    pub store: Arc<SqliteStore>,
    pub coordinator: Arc<RefreshCoordinator>,
    pub registry: Arc<AdapterRegistry>,
    pub monitor: Arc<HealthMonitor>,
    pub tokens: Arc<TokenService>,
    pub shutdown: tokio_util::sync::CancellationToken,
}

impl SyncCore {
    pub fn new(store: SqliteStore) -> Self {
        let store = Arc::new(store);
        let coordinator = Arc::new(RefreshCoordinator::new());
        let registry = Arc::new(AdapterRegistry::default());
        let tokens = Arc::new(TokenService::new(
            store.clone(),
            coordinator.clone(),
            registry.clone(),
        ));
        Self {
            store,
            coordinator,
            registry,
            monitor: Arc::new(HealthMonitor::new()),
            tokens,
            shutdown: tokio_util::sync::CancellationToken::new(),
        }
    }
}
