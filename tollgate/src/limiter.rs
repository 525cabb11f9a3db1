//! Sliding-window admission control, per account and platform-wide.
//!
//! Two independent counters per scope: a 60-second sliding window and a UTC
//! calendar-day window. Windows live in the database and reset lazily when an
//! access observes them expired; there is no background sweep. Thresholds come
//! from the platform-settings aggregate on every decision, so admin changes
//! take effect immediately.

use crate::db::handlers::{RateLimitWindows, Settings};
use crate::db::models::rate_limits::{utc_midnight, RateLimitWindow, MINUTE_WINDOW_SECS};
use crate::errors::{Error, Result};
use crate::types::GLOBAL_SCOPE;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::instrument;

/// Retry hint handed out when the platform-wide window is saturated. Short
/// and fixed: global pressure drains quickly and the denied account is not
/// itself at fault.
const GLOBAL_RETRY_SECS: u64 = 5;

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Remaining quota is reported per window; `None` when limiting is
    /// disabled and no quota applies.
    Allowed {
        remaining_minute: Option<i64>,
        remaining_day: Option<i64>,
    },
    /// `retry_after_seconds` is absent for day-window denials, whose reset is
    /// the next UTC midnight.
    Denied { retry_after_seconds: Option<u64> },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

/// Effective counts for a window row at `now`, applying lazy expiry.
fn effective_counts(window: Option<&RateLimitWindow>, now: i64) -> (i64, i64, i64) {
    match window {
        None => (0, 0, now),
        Some(w) => {
            let minute = if now - w.window_start >= MINUTE_WINDOW_SECS {
                0
            } else {
                w.requests_in_window
            };
            let day = if w.day_window_start < utc_midnight(now) {
                0
            } else {
                w.requests_today
            };
            (minute, day, w.window_start)
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    pool: SqlitePool,
}

impl RateLimiter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Decide whether a prospective call may proceed. Checks, in order: the
    /// account's minute window, the account's day window, then the global
    /// minute window. Denied attempts stamp the window but are not counted.
    #[instrument(skip(self), err)]
    pub async fn check_admission(&self, account_id: &str) -> Result<Admission> {
        let now = Utc::now().timestamp();
        let mut conn = self.pool.acquire().await?;

        let settings = Settings::new(&mut conn).get().await?;
        if !settings.rate_limiting_enabled {
            return Ok(Admission::Allowed {
                remaining_minute: None,
                remaining_day: None,
            });
        }

        let mut windows = RateLimitWindows::new(&mut conn);
        let account_window = windows.get(account_id).await?;
        let (minute_count, day_count, window_start) = effective_counts(account_window.as_ref(), now);

        if minute_count >= settings.per_account_per_minute {
            let retry_after = (window_start + MINUTE_WINDOW_SECS - now).max(1) as u64;
            windows.touch(account_id, now).await?;
            tracing::debug!(account_id, retry_after, "denied: account minute window full");
            return Ok(Admission::Denied {
                retry_after_seconds: Some(retry_after),
            });
        }

        if day_count >= settings.per_account_per_day {
            windows.touch(account_id, now).await?;
            tracing::debug!(account_id, "denied: account day window full");
            return Ok(Admission::Denied {
                retry_after_seconds: None,
            });
        }

        let global_window = windows.get(GLOBAL_SCOPE).await?;
        let (global_minute, _, _) = effective_counts(global_window.as_ref(), now);
        if global_minute >= settings.global_per_minute {
            windows.touch(account_id, now).await?;
            windows.touch(GLOBAL_SCOPE, now).await?;
            tracing::warn!(account_id, "denied: global minute window full");
            return Ok(Admission::Denied {
                retry_after_seconds: Some(GLOBAL_RETRY_SECS),
            });
        }

        Ok(Admission::Allowed {
            remaining_minute: Some(settings.per_account_per_minute - minute_count),
            remaining_day: Some(settings.per_account_per_day - day_count),
        })
    }

    /// Count one admitted request against the account and the global scope.
    /// Each counter bump is a single atomic statement, so parallel admitted
    /// requests never undercount.
    pub async fn record_admitted(&self, account_id: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut conn = self.pool.acquire().await?;
        let mut windows = RateLimitWindows::new(&mut conn);
        windows.increment(account_id, now).await?;
        windows.increment(GLOBAL_SCOPE, now).await?;
        Ok(())
    }

    /// Check and, when allowed, immediately record the request.
    pub async fn admit(&self, account_id: &str) -> Result<()> {
        match self.check_admission(account_id).await? {
            Admission::Allowed { .. } => {
                self.record_admitted(account_id).await?;
                Ok(())
            }
            Admission::Denied { retry_after_seconds } => Err(Error::RateLimited { retry_after_seconds }),
        }
    }

    /// Drop window rows idle longer than `max_idle_secs`. Hygiene only.
    pub async fn purge_stale(&self, max_idle_secs: i64) -> Result<u64> {
        let now = Utc::now().timestamp();
        let mut conn = self.pool.acquire().await?;
        let purged = RateLimitWindows::new(&mut conn).purge_stale(now, max_idle_secs).await?;
        if purged > 0 {
            tracing::debug!(purged, "purged stale rate-limit windows");
        }
        Ok(purged)
    }
}
