// file: src/store/sqlite.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{SyncError, SyncResult};
use crate::models::{CalendarEntry, CalendarIntegration, Provider};

use super::{IntegrationStore, ProfileStore};

const SELECT_COLUMNS: &str = "id, user_id, provider, access_token, refresh_token, \
     token_expires_at, oauth_scope, base_url, username, password, calendar_list, \
     default_booking_calendar_id, is_active, sync_error, created_at";

#[derive(Clone)]
pub struct SqliteStore {
    pub pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the tables this store needs. Idempotent.
    pub async fn init_schema(&self) -> SyncResult<()> {
        let schema = include_str!("schema.sql");
        for statement in schema.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn row_to_integration(row: &SqliteRow) -> SyncResult<CalendarIntegration> {
    let calendar_list_json: String = row.try_get("calendar_list")?;
    let calendar_list: Vec<CalendarEntry> = serde_json::from_str(&calendar_list_json)
        .unwrap_or_else(|e| {
            log::warn!("Discarding unreadable calendar_list: {}", e);
            Vec::new()
        });

    Ok(CalendarIntegration {
        id: Some(row.try_get("id")?),
        user_id: row.try_get("user_id")?,
        provider: row.try_get("provider")?,
        access_token: row.try_get("access_token")?,
        refresh_token: row.try_get("refresh_token")?,
        token_expires_at: row.try_get("token_expires_at")?,
        oauth_scope: row.try_get("oauth_scope")?,
        base_url: row.try_get("base_url")?,
        username: row.try_get("username")?,
        password: row.try_get("password")?,
        calendar_list,
        default_booking_calendar_id: row.try_get("default_booking_calendar_id")?,
        is_active: row.try_get("is_active")?,
        sync_error: row.try_get("sync_error")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl IntegrationStore for SqliteStore {
    async fn get(&self, id: i64) -> SyncResult<CalendarIntegration> {
        let query = format!(
            "SELECT {} FROM calendar_integrations WHERE id = ?",
            SELECT_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| SyncError::not_found(format!("integration {}", id)))?;
        row_to_integration(&row)
    }

    async fn insert(&self, integration: &CalendarIntegration) -> SyncResult<i64> {
        let calendar_list = serde_json::to_string(&integration.calendar_list)
            .map_err(|e| SyncError::configuration(format!("unserializable calendar list: {}", e)))?;

        let result = sqlx::query(
            "INSERT INTO calendar_integrations \
             (user_id, provider, access_token, refresh_token, token_expires_at, oauth_scope, \
              base_url, username, password, calendar_list, default_booking_calendar_id, \
              is_active, sync_error, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(integration.user_id)
        .bind(&integration.provider)
        .bind(&integration.access_token)
        .bind(&integration.refresh_token)
        .bind(integration.token_expires_at)
        .bind(&integration.oauth_scope)
        .bind(&integration.base_url)
        .bind(&integration.username)
        .bind(&integration.password)
        .bind(&calendar_list)
        .bind(&integration.default_booking_calendar_id)
        .bind(integration.is_active)
        .bind(&integration.sync_error)
        .bind(integration.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn update(&self, integration: &CalendarIntegration) -> SyncResult<()> {
        let id = integration
            .id
            .ok_or_else(|| SyncError::configuration("cannot update an unsaved integration"))?;
        let calendar_list = serde_json::to_string(&integration.calendar_list)
            .map_err(|e| SyncError::configuration(format!("unserializable calendar list: {}", e)))?;

        sqlx::query(
            "UPDATE calendar_integrations SET \
             access_token = ?, refresh_token = ?, token_expires_at = ?, oauth_scope = ?, \
             base_url = ?, username = ?, password = ?, calendar_list = ?, \
             default_booking_calendar_id = ?, is_active = ?, sync_error = ? \
             WHERE id = ?",
        )
        .bind(&integration.access_token)
        .bind(&integration.refresh_token)
        .bind(integration.token_expires_at)
        .bind(&integration.oauth_scope)
        .bind(&integration.base_url)
        .bind(&integration.username)
        .bind(&integration.password)
        .bind(&calendar_list)
        .bind(&integration.default_booking_calendar_id)
        .bind(integration.is_active)
        .bind(&integration.sync_error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: i64) -> SyncResult<()> {
        sqlx::query("DELETE FROM calendar_integrations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_for_user(&self, user_id: i64) -> SyncResult<Vec<CalendarIntegration>> {
        let query = format!(
            "SELECT {} FROM calendar_integrations WHERE user_id = ? ORDER BY created_at ASC, id ASC",
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_integration).collect()
    }

    async fn list_expiring_before(
        &self,
        threshold: DateTime<Utc>,
        provider: Option<Provider>,
    ) -> SyncResult<Vec<CalendarIntegration>> {
        let rows = match provider {
            Some(provider) => {
                let query = format!(
                    "SELECT {} FROM calendar_integrations \
                     WHERE is_active = 1 AND provider = ? \
                       AND token_expires_at IS NOT NULL AND token_expires_at <= ? \
                     ORDER BY token_expires_at ASC",
                    SELECT_COLUMNS
                );
                sqlx::query(&query)
                    .bind(provider.as_str())
                    .bind(threshold)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!(
                    "SELECT {} FROM calendar_integrations \
                     WHERE is_active = 1 \
                       AND token_expires_at IS NOT NULL AND token_expires_at <= ? \
                     ORDER BY token_expires_at ASC",
                    SELECT_COLUMNS
                );
                sqlx::query(&query)
                    .bind(threshold)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_integration).collect()
    }
}

#[async_trait]
impl ProfileStore for SqliteStore {
    async fn primary_integration(&self, user_id: i64) -> SyncResult<Option<i64>> {
        let row = sqlx::query("SELECT primary_integration_id FROM profiles WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|row| row.try_get("primary_integration_id").ok()))
    }

    async fn set_primary_integration(
        &self,
        user_id: i64,
        integration_id: Option<i64>,
    ) -> SyncResult<()> {
        sqlx::query(
            "INSERT INTO profiles (user_id, primary_integration_id) VALUES (?, ?) \
             ON CONFLICT(user_id) DO UPDATE SET primary_integration_id = excluded.primary_integration_id",
        )
        .bind(user_id)
        .bind(integration_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) async fn memory_store() -> SqliteStore {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    let store = SqliteStore::new(pool);
    store.init_schema().await.unwrap();
    store
}
