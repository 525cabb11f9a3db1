//! Database repository for the singleton platform-settings aggregate.
//!
//! All writes are optimistic compare-and-swap on the `version` column. A
//! caller that reads version `v` may only commit a write if the row is still
//! at `v`; otherwise somebody else won and the caller re-reads and retries.

use crate::db::{
    errors::{DbError, Result},
    models::settings::{PlatformSettings, PlatformSettingsRow, PlatformSettingsUpdate},
};
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::instrument;

pub struct Settings<'c> {
    db: &'c mut SqliteConnection,
}

impl<'c> Settings<'c> {
    pub fn new(db: &'c mut SqliteConnection) -> Self {
        Self { db }
    }

    /// Read the settings aggregate. The row is seeded at startup; a missing
    /// row is an infrastructure fault, not a business condition.
    pub async fn get(&mut self) -> Result<PlatformSettings> {
        let row = sqlx::query_as::<_, PlatformSettingsRow>(
            r#"
            SELECT version, rotation_strategy, current_key_index, margin, initial_grant_credits,
                   trial_period_days, minimum_balance_for_call, rate_limiting_enabled,
                   per_account_per_minute, per_account_per_day, global_per_minute, updated_at
            FROM platform_settings
            WHERE id = 1
            "#,
        )
        .fetch_one(&mut *self.db)
        .await?;

        PlatformSettings::try_from(row).map_err(DbError::Other)
    }

    /// Insert the settings row if it does not exist yet.
    #[instrument(skip_all, err)]
    pub async fn seed(&mut self, defaults: &PlatformSettings, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO platform_settings (
                id, version, rotation_strategy, current_key_index, margin, initial_grant_credits,
                trial_period_days, minimum_balance_for_call, rate_limiting_enabled,
                per_account_per_minute, per_account_per_day, global_per_minute, updated_at
            )
            VALUES (1, 1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(defaults.rotation_strategy)
        .bind(defaults.current_key_index)
        .bind(defaults.margin.to_string())
        .bind(defaults.initial_grant_credits)
        .bind(defaults.trial_period_days)
        .bind(defaults.minimum_balance_for_call)
        .bind(defaults.rate_limiting_enabled)
        .bind(defaults.per_account_per_minute)
        .bind(defaults.per_account_per_day)
        .bind(defaults.global_per_minute)
        .bind(now)
        .execute(&mut *self.db)
        .await?;

        Ok(())
    }

    /// Move the rotation cursor, conditioned on the version the caller read.
    /// Returns false when the aggregate moved underneath the caller.
    pub async fn advance_key_index(
        &mut self,
        new_index: i64,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE platform_settings
            SET current_key_index = ?, version = version + 1, updated_at = ?
            WHERE id = 1 AND version = ?
            "#,
        )
        .bind(new_index)
        .bind(now)
        .bind(expected_version)
        .execute(&mut *self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Apply a partial admin update, conditioned on the version the caller
    /// read. Returns false when the aggregate moved underneath the caller.
    #[instrument(skip(self, update), err)]
    pub async fn apply_update(
        &mut self,
        update: &PlatformSettingsUpdate,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE platform_settings
            SET rotation_strategy = COALESCE(?, rotation_strategy),
                margin = COALESCE(?, margin),
                initial_grant_credits = COALESCE(?, initial_grant_credits),
                trial_period_days = COALESCE(?, trial_period_days),
                minimum_balance_for_call = COALESCE(?, minimum_balance_for_call),
                rate_limiting_enabled = COALESCE(?, rate_limiting_enabled),
                per_account_per_minute = COALESCE(?, per_account_per_minute),
                per_account_per_day = COALESCE(?, per_account_per_day),
                global_per_minute = COALESCE(?, global_per_minute),
                version = version + 1,
                updated_at = ?
            WHERE id = 1 AND version = ?
            "#,
        )
        .bind(update.rotation_strategy)
        .bind(update.margin.map(|m| m.to_string()))
        .bind(update.initial_grant_credits)
        .bind(update.trial_period_days)
        .bind(update.minimum_balance_for_call)
        .bind(update.rate_limiting_enabled)
        .bind(update.per_account_per_minute)
        .bind(update.per_account_per_day)
        .bind(update.global_per_minute)
        .bind(now)
        .bind(expected_version)
        .execute(&mut *self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
