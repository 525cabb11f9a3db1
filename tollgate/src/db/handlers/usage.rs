//! Database repository for usage records.

use crate::db::{
    errors::{DbError, Result},
    models::usage::{UsageRecordCreateDBRequest, UsageRecordDBResponse, UsageRecordRow},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::SqliteConnection;
use std::str::FromStr;
use tracing::instrument;

pub struct UsageRecords<'c> {
    db: &'c mut SqliteConnection,
}

impl<'c> UsageRecords<'c> {
    pub fn new(db: &'c mut SqliteConnection) -> Self {
        Self { db }
    }

    /// Record one metered upstream call.
    #[instrument(skip(self, request), fields(account_id = %request.account_id, model_key = %request.model_key), err)]
    pub async fn create(&mut self, request: &UsageRecordCreateDBRequest, now: DateTime<Utc>) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO usage_records (account_id, model_key, feature, input_units, output_units, cost_basis_usd, credits_debited, duration_ms, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&request.account_id)
        .bind(&request.model_key)
        .bind(&request.feature)
        .bind(request.input_units)
        .bind(request.output_units)
        .bind(request.cost_basis_usd.to_string())
        .bind(request.credits_debited)
        .bind(request.duration_ms)
        .bind(now)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(id)
    }

    /// List usage for one account, newest first.
    pub async fn list_for_account(&mut self, account_id: &str, skip: i64, limit: i64) -> Result<Vec<UsageRecordDBResponse>> {
        let rows = sqlx::query_as::<_, UsageRecordRow>(
            r#"
            SELECT id, account_id, model_key, feature, input_units, output_units, cost_basis_usd, credits_debited, duration_ms, created_at
            FROM usage_records
            WHERE account_id = ?
            ORDER BY id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(account_id)
        .bind(limit)
        .bind(skip)
        .fetch_all(&mut *self.db)
        .await?;

        rows.into_iter().map(decode_row).collect()
    }
}

fn decode_row(row: UsageRecordRow) -> Result<UsageRecordDBResponse> {
    let cost_basis_usd = Decimal::from_str(&row.cost_basis_usd)
        .map_err(|e| DbError::Other(anyhow::anyhow!("stored cost {:?} is not a decimal: {e}", row.cost_basis_usd)))?;
    Ok(UsageRecordDBResponse {
        id: row.id,
        account_id: row.account_id,
        model_key: row.model_key,
        feature: row.feature,
        input_units: row.input_units,
        output_units: row.output_units,
        cost_basis_usd,
        credits_debited: row.credits_debited,
        duration_ms: row.duration_ms,
        created_at: row.created_at,
    })
}
