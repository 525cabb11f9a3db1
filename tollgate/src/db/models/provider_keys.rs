//! Database models for the upstream credential pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One pool entry. `position` fixes pool order; selection ordinals are the
/// rank within that order, not the stored value.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProviderKey {
    pub id: i64,
    pub position: i64,
    pub display_name: String,
    pub secret_value: String,
    pub is_active: bool,
    pub usage_count_today: i64,
    pub usage_count_total: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub daily_limit: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl ProviderKey {
    /// Whether the key has exhausted its daily quota.
    pub fn over_daily_limit(&self) -> bool {
        matches!(self.daily_limit, Some(limit) if self.usage_count_today >= limit)
    }
}

/// Request to add a credential to the pool
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderKeyCreateDBRequest {
    pub display_name: String,
    pub secret_value: String,
    pub is_active: bool,
    pub daily_limit: Option<i64>,
}

/// Partial update to a pool entry; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderKeyUpdateDBRequest {
    pub display_name: Option<String>,
    pub secret_value: Option<String>,
    pub is_active: Option<bool>,
    pub daily_limit: Option<i64>,
    /// Clears the daily cap entirely; wins over `daily_limit`.
    pub remove_daily_limit: bool,
}

/// Pool entry as exposed to admin callers. The secret never leaves the
/// repository layer through this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderKeyDBResponse {
    pub id: i64,
    pub position: i64,
    pub display_name: String,
    pub is_active: bool,
    pub usage_count_today: i64,
    pub usage_count_total: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub daily_limit: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl From<ProviderKey> for ProviderKeyDBResponse {
    fn from(key: ProviderKey) -> Self {
        Self {
            id: key.id,
            position: key.position,
            display_name: key.display_name,
            is_active: key.is_active,
            usage_count_today: key.usage_count_today,
            usage_count_total: key.usage_count_total,
            last_used_at: key.last_used_at,
            daily_limit: key.daily_limit,
            created_at: key.created_at,
        }
    }
}
