//! Database models for account balances and credit transactions.

use crate::types::AccountId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Credit transaction type enum stored as TEXT in database
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CreditTransactionType {
    InitialGrant,
    PurchaseTopUp,
    UsageDebit,
    ManualAdjustment,
}

/// Database representation of an account's authoritative balance.
///
/// `trial_ends_at` is epoch seconds so the expiry comparison can run inside
/// the debit statement itself.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AccountBalance {
    pub account_id: AccountId,
    pub credit_balance: i64,
    pub is_trial_account: bool,
    pub trial_ends_at: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One append-only ledger entry. `amount` is signed: positive for grants,
/// negative for debits. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CreditTransaction {
    pub id: i64,
    pub account_id: AccountId,
    pub transaction_type: CreditTransactionType,
    pub amount: i64,
    pub balance_after: i64,
    pub description: Option<String>,
    pub payment_reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Request to bootstrap a new account's balance
#[derive(Debug, Clone)]
pub struct InitializeAccountDBRequest {
    pub account_id: AccountId,
    pub initial_credits: i64,
    /// `Some` marks the account as a trial account until the given instant.
    pub trial_ends_at: Option<i64>,
}

/// Per-account balance summary for the admin listing
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AccountBalanceSummary {
    pub account_id: AccountId,
    pub credit_balance: i64,
    pub is_trial_account: bool,
}
