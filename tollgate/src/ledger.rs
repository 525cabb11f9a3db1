//! The authoritative credit ledger.
//!
//! Owns every mutation of account balances and the append-only transaction
//! history. Each operation is one SQL transaction scoped to a single account;
//! cross-account ordering is deliberately unspecified. Debits are decided by
//! a compare-and-swap update, so two racing debits can never both succeed
//! against a balance that only covers one of them.

use crate::db::errors::DbError;
use crate::db::handlers::Credits;
use crate::db::models::credits::{
    AccountBalance, AccountBalanceSummary, CreditTransaction, CreditTransactionType, InitializeAccountDBRequest,
};
use crate::errors::{Error, Result};
use crate::types::AccountId;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::instrument;

/// Request to add credits to an account.
#[derive(Debug, Clone)]
pub struct GrantRequest {
    pub account_id: AccountId,
    pub amount: i64,
    pub transaction_type: CreditTransactionType,
    pub description: Option<String>,
    /// External payment correlation id. Grants carrying one are idempotent:
    /// replaying the same event never credits an account twice.
    pub payment_reference: Option<String>,
}

impl GrantRequest {
    /// An operator grant with a generated correlation id.
    pub fn manual_adjustment(account_id: AccountId, amount: i64, description: Option<String>) -> Self {
        Self {
            account_id,
            amount,
            transaction_type: CreditTransactionType::ManualAdjustment,
            description,
            payment_reference: Some(format!("manual_{}", uuid::Uuid::new_v4())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreditLedger {
    pool: SqlitePool,
}

impl CreditLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// One-time account bootstrap: balance row, trial window and the first
    /// `initial_grant` transaction in one atomic unit.
    ///
    /// At-most-once is the provisioning trigger's contract; a second call for
    /// the same account surfaces the unique violation unchanged.
    #[instrument(skip(self), err)]
    pub async fn initialize(
        &self,
        account_id: &str,
        initial_credits: i64,
        trial_ends_at: Option<DateTime<Utc>>,
    ) -> Result<AccountBalance> {
        if initial_credits < 0 {
            return Err(Error::BadRequest {
                message: "initial credits must be >= 0".to_string(),
            });
        }
        let now = Utc::now();
        let request = InitializeAccountDBRequest {
            account_id: account_id.to_string(),
            initial_credits,
            trial_ends_at: trial_ends_at.map(|t| t.timestamp()),
        };

        let mut tx = self.pool.begin().await?;
        let mut repo = Credits::new(&mut tx);
        let balance = repo.insert_account(&request, now).await?;
        if initial_credits > 0 {
            repo.append_transaction(
                account_id,
                CreditTransactionType::InitialGrant,
                initial_credits,
                initial_credits,
                Some("Welcome credits"),
                None,
                now,
            )
            .await?;
        }
        tx.commit().await.map_err(DbError::from)?;

        tracing::info!(account_id, initial_credits, "initialized account balance");
        Ok(balance)
    }

    /// Increase an account's balance and append the matching transaction.
    /// Returns the new balance.
    #[instrument(skip(self, request), fields(account_id = %request.account_id, amount = request.amount), err)]
    pub async fn grant(&self, request: &GrantRequest) -> Result<i64> {
        if request.amount <= 0 {
            return Err(Error::BadRequest {
                message: "grant amount must be positive".to_string(),
            });
        }
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        let mut repo = Credits::new(&mut tx);

        if let Some(reference) = &request.payment_reference
            && let Some(existing) = repo.find_by_payment_reference(reference).await?
        {
            tracing::info!(
                payment_reference = %reference,
                transaction_id = existing.id,
                "payment already granted, skipping duplicate"
            );
            let balance = repo.current_balance(&request.account_id).await?;
            return Ok(balance);
        }

        let new_balance = repo
            .apply_grant(&request.account_id, request.amount, now)
            .await?
            .ok_or_else(|| Error::AccountNotFound {
                account_id: request.account_id.clone(),
            })?;

        let appended = repo
            .append_transaction(
                &request.account_id,
                request.transaction_type,
                request.amount,
                new_balance,
                request.description.as_deref(),
                request.payment_reference.as_deref(),
                now,
            )
            .await;

        match appended {
            Ok(_) => {
                tx.commit().await.map_err(DbError::from)?;
                Ok(new_balance)
            }
            // Two near-simultaneous deliveries of the same payment event: the
            // loser's balance update rolls back with its transaction insert,
            // and the grant resolves to the winner's outcome.
            Err(DbError::UniqueViolation { .. }) if request.payment_reference.is_some() => {
                drop(tx);
                tracing::info!(
                    payment_reference = request.payment_reference.as_deref(),
                    "payment granted concurrently elsewhere, skipping duplicate"
                );
                self.balance(&request.account_id).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically remove credits for metered usage. Returns the new balance.
    ///
    /// An expired trial forfeits whatever balance remains (recorded as a
    /// `manual_adjustment` so the ledger still replays to the live balance),
    /// drops the trial flag and fails with [`Error::TrialExpired`]. The
    /// expiry check rides in the same transaction as the balance update, so
    /// a stale trial can never race a debit.
    pub async fn debit(&self, account_id: &str, amount: i64, description: Option<&str>) -> Result<i64> {
        self.debit_as(account_id, amount, description, CreditTransactionType::UsageDebit)
            .await
    }

    /// [`CreditLedger::debit`] with a caller-chosen transaction type, for
    /// operator removals that should read as `manual_adjustment` in the
    /// history. Balance rules are identical.
    #[instrument(skip(self), err)]
    pub async fn debit_as(
        &self,
        account_id: &str,
        amount: i64,
        description: Option<&str>,
        transaction_type: CreditTransactionType,
    ) -> Result<i64> {
        if amount <= 0 {
            return Err(Error::BadRequest {
                message: "debit amount must be positive".to_string(),
            });
        }
        let now = Utc::now();
        let now_secs = now.timestamp();

        let mut tx = self.pool.begin().await?;
        let mut repo = Credits::new(&mut tx);

        if let Some(new_balance) = repo.try_apply_debit(account_id, amount, now_secs, now).await? {
            repo.append_transaction(account_id, transaction_type, -amount, new_balance, description, None, now)
                .await?;
            tx.commit().await.map_err(DbError::from)?;
            return Ok(new_balance);
        }

        // The conditional update matched nothing; find out why, on the same
        // snapshot.
        let Some(account) = repo.get(account_id).await? else {
            return Err(Error::AccountNotFound {
                account_id: account_id.to_string(),
            });
        };

        if account.is_trial_account && account.trial_ends_at.is_some_and(|t| t <= now_secs) {
            repo.expire_trial(account_id, now).await?;
            if account.credit_balance > 0 {
                repo.append_transaction(
                    account_id,
                    CreditTransactionType::ManualAdjustment,
                    -account.credit_balance,
                    0,
                    Some("Trial expired, remaining trial credits forfeited"),
                    None,
                    now,
                )
                .await?;
            }
            tx.commit().await.map_err(DbError::from)?;
            tracing::info!(account_id, forfeited = account.credit_balance, "trial expired at debit time");
            return Err(Error::TrialExpired {
                account_id: account_id.to_string(),
            });
        }

        Err(Error::InsufficientCredits {
            required: amount,
            available: account.credit_balance,
        })
    }

    /// Current balance; 0 for accounts that were never initialized. The read
    /// path is forgiving even though the write path is strict.
    pub async fn balance(&self, account_id: &str) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        let balance = Credits::new(&mut conn).current_balance(account_id).await?;
        Ok(balance)
    }

    /// The account's full balance row, if initialized.
    pub async fn account(&self, account_id: &str) -> Result<Option<AccountBalance>> {
        let mut conn = self.pool.acquire().await?;
        let account = Credits::new(&mut conn).get(account_id).await?;
        Ok(account)
    }

    /// Transaction history, newest first.
    pub async fn list_transactions(&self, account_id: &str, skip: i64, limit: i64) -> Result<Vec<CreditTransaction>> {
        let mut conn = self.pool.acquire().await?;
        let transactions = Credits::new(&mut conn).list_for_account(account_id, skip, limit).await?;
        Ok(transactions)
    }

    /// Every account's current balance (admin view).
    pub async fn list_all_balances(&self) -> Result<Vec<AccountBalanceSummary>> {
        let mut conn = self.pool.acquire().await?;
        let balances = Credits::new(&mut conn).list_all_balances().await?;
        Ok(balances)
    }
}
