//! Database repository for the upstream credential pool.

use crate::db::{
    errors::Result,
    models::provider_keys::{ProviderKey, ProviderKeyCreateDBRequest, ProviderKeyUpdateDBRequest},
};
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::instrument;

pub struct ProviderKeys<'c> {
    db: &'c mut SqliteConnection,
}

impl<'c> ProviderKeys<'c> {
    pub fn new(db: &'c mut SqliteConnection) -> Self {
        Self { db }
    }

    /// The full pool in pool order. Selection ordinals are ranks in this list.
    pub async fn list(&mut self) -> Result<Vec<ProviderKey>> {
        let keys = sqlx::query_as::<_, ProviderKey>(
            r#"
            SELECT id, position, display_name, secret_value, is_active, usage_count_today,
                   usage_count_total, last_used_at, daily_limit, created_at
            FROM provider_keys
            ORDER BY position ASC
            "#,
        )
        .fetch_all(&mut *self.db)
        .await?;

        Ok(keys)
    }

    pub async fn get(&mut self, id: i64) -> Result<Option<ProviderKey>> {
        let key = sqlx::query_as::<_, ProviderKey>(
            r#"
            SELECT id, position, display_name, secret_value, is_active, usage_count_today,
                   usage_count_total, last_used_at, daily_limit, created_at
            FROM provider_keys
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(key)
    }

    /// Append a credential at the end of the pool.
    #[instrument(skip(self, request), fields(display_name = %request.display_name), err)]
    pub async fn create(&mut self, request: &ProviderKeyCreateDBRequest, now: DateTime<Utc>) -> Result<ProviderKey> {
        let key = sqlx::query_as::<_, ProviderKey>(
            r#"
            INSERT INTO provider_keys (position, display_name, secret_value, is_active, daily_limit, created_at)
            VALUES ((SELECT COALESCE(MAX(position), -1) + 1 FROM provider_keys), ?, ?, ?, ?, ?)
            RETURNING id, position, display_name, secret_value, is_active, usage_count_today,
                      usage_count_total, last_used_at, daily_limit, created_at
            "#,
        )
        .bind(&request.display_name)
        .bind(&request.secret_value)
        .bind(request.is_active)
        .bind(request.daily_limit)
        .bind(now)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(key)
    }

    /// Apply a partial update. Returns the updated key, or `None` when it does
    /// not exist.
    #[instrument(skip(self, request), err)]
    pub async fn update(&mut self, id: i64, request: &ProviderKeyUpdateDBRequest) -> Result<Option<ProviderKey>> {
        let key = sqlx::query_as::<_, ProviderKey>(
            r#"
            UPDATE provider_keys
            SET display_name = COALESCE(?, display_name),
                secret_value = COALESCE(?, secret_value),
                is_active = COALESCE(?, is_active),
                daily_limit = CASE WHEN ? THEN NULL ELSE COALESCE(?, daily_limit) END
            WHERE id = ?
            RETURNING id, position, display_name, secret_value, is_active, usage_count_today,
                      usage_count_total, last_used_at, daily_limit, created_at
            "#,
        )
        .bind(&request.display_name)
        .bind(&request.secret_value)
        .bind(request.is_active)
        .bind(request.remove_daily_limit)
        .bind(request.daily_limit)
        .bind(id)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(key)
    }

    pub async fn delete(&mut self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM provider_keys WHERE id = ?")
            .bind(id)
            .execute(&mut *self.db)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Count one successful upstream call against a key. Single-statement
    /// increment so parallel calls never undercount.
    pub async fn record_success(&mut self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE provider_keys
            SET usage_count_today = usage_count_today + 1,
                usage_count_total = usage_count_total + 1,
                last_used_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&mut *self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Zero the daily counters across the pool. Invoked by an external
    /// periodic trigger; unlike the rate-limit windows, key quotas do not
    /// reset lazily.
    #[instrument(skip(self), err)]
    pub async fn reset_daily_counters(&mut self) -> Result<u64> {
        let result = sqlx::query("UPDATE provider_keys SET usage_count_today = 0")
            .execute(&mut *self.db)
            .await?;

        Ok(result.rows_affected())
    }
}
