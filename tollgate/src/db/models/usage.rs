//! Database models for usage records.
//!
//! Usage records are write-only analytics; the ledger transaction written in
//! the same metered call is authoritative for billing.

use crate::types::AccountId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Stored usage record. `cost_basis_usd` is kept as text because SQLite has
/// no decimal type; it round-trips through [`Decimal`] at the repository
/// boundary.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UsageRecordRow {
    pub id: i64,
    pub account_id: AccountId,
    pub model_key: String,
    pub feature: String,
    pub input_units: i64,
    pub output_units: i64,
    pub cost_basis_usd: String,
    pub credits_debited: i64,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

/// Usage record as exposed to callers, with the cost decoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecordDBResponse {
    pub id: i64,
    pub account_id: AccountId,
    pub model_key: String,
    pub feature: String,
    pub input_units: i64,
    pub output_units: i64,
    pub cost_basis_usd: Decimal,
    pub credits_debited: i64,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

/// Request to record one metered upstream call
#[derive(Debug, Clone)]
pub struct UsageRecordCreateDBRequest {
    pub account_id: AccountId,
    pub model_key: String,
    pub feature: String,
    pub input_units: i64,
    pub output_units: i64,
    pub cost_basis_usd: Decimal,
    pub credits_debited: i64,
    pub duration_ms: i64,
}
