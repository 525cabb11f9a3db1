//! Database repository for account balances and the credit transaction ledger.
//!
//! These are the storage primitives only; [`crate::ledger::CreditLedger`]
//! composes them into atomic grant/debit operations and owns the error
//! taxonomy. Every mutating statement here is conditional, so the ledger can
//! run write-first transactions and never lose a race between its read and
//! its write.

use crate::db::{
    errors::Result,
    models::credits::{
        AccountBalance, AccountBalanceSummary, CreditTransaction, CreditTransactionType, InitializeAccountDBRequest,
    },
};
use crate::types::AccountId;
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::instrument;

pub struct Credits<'c> {
    db: &'c mut SqliteConnection,
}

impl<'c> Credits<'c> {
    pub fn new(db: &'c mut SqliteConnection) -> Self {
        Self { db }
    }

    /// Fetch an account's balance row, if the account has been initialized.
    pub async fn get(&mut self, account_id: &str) -> Result<Option<AccountBalance>> {
        let balance = sqlx::query_as::<_, AccountBalance>(
            r#"
            SELECT account_id, credit_balance, is_trial_account, trial_ends_at, created_at, updated_at
            FROM account_balances
            WHERE account_id = ?
            "#,
        )
        .bind(account_id)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(balance)
    }

    /// Current balance; 0 for accounts that were never initialized.
    pub async fn current_balance(&mut self, account_id: &str) -> Result<i64> {
        Ok(self.get(account_id).await?.map(|b| b.credit_balance).unwrap_or(0))
    }

    /// Insert the balance row for a new account.
    #[instrument(skip(self, request), fields(account_id = %request.account_id), err)]
    pub async fn insert_account(
        &mut self,
        request: &InitializeAccountDBRequest,
        now: DateTime<Utc>,
    ) -> Result<AccountBalance> {
        let balance = sqlx::query_as::<_, AccountBalance>(
            r#"
            INSERT INTO account_balances (account_id, credit_balance, is_trial_account, trial_ends_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING account_id, credit_balance, is_trial_account, trial_ends_at, created_at, updated_at
            "#,
        )
        .bind(&request.account_id)
        .bind(request.initial_credits)
        .bind(request.trial_ends_at.is_some())
        .bind(request.trial_ends_at)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(balance)
    }

    /// Conditionally add `amount` to the balance. Returns the new balance, or
    /// `None` when the account does not exist.
    pub async fn apply_grant(&mut self, account_id: &str, amount: i64, now: DateTime<Utc>) -> Result<Option<i64>> {
        let new_balance = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE account_balances
            SET credit_balance = credit_balance + ?, updated_at = ?
            WHERE account_id = ?
            RETURNING credit_balance
            "#,
        )
        .bind(amount)
        .bind(now)
        .bind(account_id)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(new_balance)
    }

    /// Compare-and-swap debit: subtracts `amount` only when the balance
    /// covers it and the account is not an expired trial. Returns the new
    /// balance when the debit applied; `None` means the caller must diagnose
    /// (missing account, insufficient balance, or trial expiry).
    ///
    /// This is deliberately the first statement of the ledger's debit
    /// transaction: it takes the write lock before any read, so two racing
    /// debits serialize on the database and at most one can win a balance
    /// that only covers one.
    pub async fn try_apply_debit(
        &mut self,
        account_id: &str,
        amount: i64,
        now_secs: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let new_balance = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE account_balances
            SET credit_balance = credit_balance - ?, updated_at = ?
            WHERE account_id = ?
              AND credit_balance >= ?
              AND (is_trial_account = FALSE OR trial_ends_at IS NULL OR trial_ends_at > ?)
            RETURNING credit_balance
            "#,
        )
        .bind(amount)
        .bind(now)
        .bind(account_id)
        .bind(amount)
        .bind(now_secs)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(new_balance)
    }

    /// Forfeit an expired trial: zero the balance and clear the trial flag.
    #[instrument(skip(self), err)]
    pub async fn expire_trial(&mut self, account_id: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE account_balances
            SET credit_balance = 0, is_trial_account = FALSE, updated_at = ?
            WHERE account_id = ?
            "#,
        )
        .bind(now)
        .bind(account_id)
        .execute(&mut *self.db)
        .await?;

        Ok(())
    }

    /// Append one immutable ledger entry.
    #[allow(clippy::too_many_arguments)]
    pub async fn append_transaction(
        &mut self,
        account_id: &str,
        transaction_type: CreditTransactionType,
        amount: i64,
        balance_after: i64,
        description: Option<&str>,
        payment_reference: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<CreditTransaction> {
        let transaction = sqlx::query_as::<_, CreditTransaction>(
            r#"
            INSERT INTO credit_transactions (account_id, transaction_type, amount, balance_after, description, payment_reference, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id, account_id, transaction_type, amount, balance_after, description, payment_reference, created_at
            "#,
        )
        .bind(account_id)
        .bind(transaction_type)
        .bind(amount)
        .bind(balance_after)
        .bind(description)
        .bind(payment_reference)
        .bind(now)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(transaction)
    }

    /// Look up a transaction by its external payment correlation id.
    pub async fn find_by_payment_reference(&mut self, reference: &str) -> Result<Option<CreditTransaction>> {
        let transaction = sqlx::query_as::<_, CreditTransaction>(
            r#"
            SELECT id, account_id, transaction_type, amount, balance_after, description, payment_reference, created_at
            FROM credit_transactions
            WHERE payment_reference = ?
            LIMIT 1
            "#,
        )
        .bind(reference)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(transaction)
    }

    /// List transactions for one account, newest first. Ordering uses the
    /// monotonic rowid, which is the creation order.
    pub async fn list_for_account(&mut self, account_id: &str, skip: i64, limit: i64) -> Result<Vec<CreditTransaction>> {
        let transactions = sqlx::query_as::<_, CreditTransaction>(
            r#"
            SELECT id, account_id, transaction_type, amount, balance_after, description, payment_reference, created_at
            FROM credit_transactions
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

        Ok(transactions)
    }

    /// All accounts with their current balances (admin view).
    pub async fn list_all_balances(&mut self) -> Result<Vec<AccountBalanceSummary>> {
        let balances = sqlx::query_as::<_, AccountBalanceSummary>(
            r#"
            SELECT account_id, credit_balance, is_trial_account
            FROM account_balances
            ORDER BY account_id
            "#,
        )
        .fetch_all(&mut *self.db)
        .await?;

        Ok(balances)
    }
}

/// The full transaction sequence for one account, oldest first, for
/// consistency checks and exports.
pub async fn replay_order(db: &mut SqliteConnection, account_id: &AccountId) -> Result<Vec<CreditTransaction>> {
    let transactions = sqlx::query_as::<_, CreditTransaction>(
        r#"
        SELECT id, account_id, transaction_type, amount, balance_after, description, payment_reference, created_at
        FROM credit_transactions
        WHERE account_id = ?
        ORDER BY id ASC
        "#,
    )
    .bind(account_id)
    .fetch_all(db)
    .await?;

    Ok(transactions)
}
