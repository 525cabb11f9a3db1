//! Database models for the platform-settings aggregate.
//!
//! The settings row is a singleton (`id = 1`) versioned for optimistic
//! compare-and-swap writes: every mutation re-reads, bumps `version`, and
//! only commits if nobody else wrote in between.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Strategy for picking the next upstream credential.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    RoundRobin,
    Failover,
    UsageBased,
}

/// Raw settings row; `margin` is decimal text in SQLite.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PlatformSettingsRow {
    pub version: i64,
    pub rotation_strategy: RotationStrategy,
    pub current_key_index: i64,
    pub margin: String,
    pub initial_grant_credits: i64,
    pub trial_period_days: i64,
    pub minimum_balance_for_call: i64,
    pub rate_limiting_enabled: bool,
    pub per_account_per_minute: i64,
    pub per_account_per_day: i64,
    pub global_per_minute: i64,
    pub updated_at: DateTime<Utc>,
}

/// The decoded configuration aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformSettings {
    pub version: i64,
    pub rotation_strategy: RotationStrategy,
    pub current_key_index: i64,
    /// Fractional markup over raw upstream cost, in `[0, 1]`.
    pub margin: Decimal,
    pub initial_grant_credits: i64,
    pub trial_period_days: i64,
    pub minimum_balance_for_call: i64,
    pub rate_limiting_enabled: bool,
    pub per_account_per_minute: i64,
    pub per_account_per_day: i64,
    pub global_per_minute: i64,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<PlatformSettingsRow> for PlatformSettings {
    type Error = anyhow::Error;

    fn try_from(row: PlatformSettingsRow) -> Result<Self, Self::Error> {
        let margin = Decimal::from_str(&row.margin)
            .map_err(|e| anyhow::anyhow!("stored margin {:?} is not a decimal: {e}", row.margin))?;
        Ok(Self {
            version: row.version,
            rotation_strategy: row.rotation_strategy,
            current_key_index: row.current_key_index,
            margin,
            initial_grant_credits: row.initial_grant_credits,
            trial_period_days: row.trial_period_days,
            minimum_balance_for_call: row.minimum_balance_for_call,
            rate_limiting_enabled: row.rate_limiting_enabled,
            per_account_per_minute: row.per_account_per_minute,
            per_account_per_day: row.per_account_per_day,
            global_per_minute: row.global_per_minute,
            updated_at: row.updated_at,
        })
    }
}

/// Partial update to the settings aggregate; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformSettingsUpdate {
    pub rotation_strategy: Option<RotationStrategy>,
    pub margin: Option<Decimal>,
    pub initial_grant_credits: Option<i64>,
    pub trial_period_days: Option<i64>,
    pub minimum_balance_for_call: Option<i64>,
    pub rate_limiting_enabled: Option<bool>,
    pub per_account_per_minute: Option<i64>,
    pub per_account_per_day: Option<i64>,
    pub global_per_minute: Option<i64>,
}
