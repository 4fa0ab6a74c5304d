// Persistence seam.
//
// The token service, selection logic and scheduler depend on these two
// narrow traits, not on a storage engine. A SQLite implementation ships
// in `sqlite.rs`; the wider application may substitute its own.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SyncResult;
use crate::models::{CalendarIntegration, Provider};

pub use sqlite::SqliteStore;

#[async_trait]
pub trait IntegrationStore: Send + Sync {
    async fn get(&self, id: i64) -> SyncResult<CalendarIntegration>;

    async fn insert(&self, integration: &CalendarIntegration) -> SyncResult<i64>;

    /// Persist the mutable fields of an already-saved integration.
    async fn update(&self, integration: &CalendarIntegration) -> SyncResult<()>;

    async fn delete(&self, id: i64) -> SyncResult<()>;

    async fn list_for_user(&self, user_id: i64) -> SyncResult<Vec<CalendarIntegration>>;

    /// Active OAuth integrations whose token expires before `threshold`,
    /// optionally narrowed to one provider. Drives the refresh sweep.
    async fn list_expiring_before(
        &self,
        threshold: DateTime<Utc>,
        provider: Option<Provider>,
    ) -> SyncResult<Vec<CalendarIntegration>>;
}

/// The primary-integration designation lives on the owning profile, not
/// on the integration, so there is never a circular ownership between
/// the two rows.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn primary_integration(&self, user_id: i64) -> SyncResult<Option<i64>>;

    async fn set_primary_integration(
        &self,
        user_id: i64,
        integration_id: Option<i64>,
    ) -> SyncResult<()>;
}
