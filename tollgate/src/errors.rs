use crate::db::errors::DbError;
use crate::provider::ProviderError;
use crate::types::AccountId;
use thiserror::Error as ThisError;

/// Error taxonomy of the metering core.
///
/// `CreditLedger` and `RateLimiter` raise precisely these kinds and nothing
/// else; storage faults travel unchanged inside [`Error::Database`]. The
/// orchestrator adds no kinds of its own.
#[derive(ThisError, Debug)]
pub enum Error {
    /// Ledger operation referenced an account that was never initialized
    #[error("Account {account_id} not found")]
    AccountNotFound { account_id: AccountId },

    /// Balance too low for a debit or a pre-flight minimum check
    #[error("Insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: i64, available: i64 },

    /// Trial window passed at debit time; the remaining balance has been
    /// forfeited and the account flagged as no longer on trial
    #[error("Trial period has expired for account {account_id}")]
    TrialExpired { account_id: AccountId },

    /// Admission denied by the rate limiter
    #[error("Rate limited")]
    RateLimited { retry_after_seconds: Option<u64> },

    /// Credential pool exhausted or every key over quota. Indicates systemic
    /// capacity exhaustion, not a per-account condition
    #[error("No upstream credential available")]
    NoAvailableCredential,

    /// Opaque failure from the upstream model provider
    #[error(transparent)]
    Upstream(#[from] ProviderError),

    /// Invalid request data or business rule violation
    #[error("{message}")]
    BadRequest { message: String },

    /// Database operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Returns a user-safe error message, without leaking internal implementation details.
    ///
    /// `InsufficientCredits` and `TrialExpired` map to distinct remediations
    /// (top up vs. subscribe); capacity and infrastructure faults collapse to
    /// a generic retry message so pool state never leaks.
    pub fn user_message(&self) -> String {
        match self {
            Error::AccountNotFound { .. } => "Account not found".to_string(),
            Error::InsufficientCredits { .. } => {
                "You don't have enough credits for this request. Please top up your balance.".to_string()
            }
            Error::TrialExpired { .. } => {
                "Your trial has ended. Subscribe to keep using paid features.".to_string()
            }
            Error::RateLimited { retry_after_seconds } => match retry_after_seconds {
                Some(secs) => format!("Too many requests. Please retry in {secs} seconds."),
                None => "Daily request limit reached. Please try again tomorrow.".to_string(),
            },
            Error::BadRequest { message } => message.clone(),
            Error::NoAvailableCredential | Error::Upstream(_) | Error::Database(_) | Error::Other(_) => {
                "The service is temporarily unavailable. Please try again later.".to_string()
            }
        }
    }

    /// Whether the caller can reasonably retry after a delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::RateLimited { .. } | Error::Upstream(_))
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;

/// Lets `?` lift raw sqlx failures straight into the service error, through
/// the same categorization as the db layer.
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Database(DbError::from(err))
    }
}
