//! Database repository for rate-limit windows.
//!
//! Increments are single `INSERT .. ON CONFLICT DO UPDATE` statements with
//! CASE-based lazy resets, so concurrent admitted requests can never lose an
//! update, and an expired window is recycled by whichever request touches it
//! first.

use crate::db::{
    errors::Result,
    models::rate_limits::{utc_midnight, RateLimitWindow, MINUTE_WINDOW_SECS},
};
use sqlx::SqliteConnection;

pub struct RateLimitWindows<'c> {
    db: &'c mut SqliteConnection,
}

impl<'c> RateLimitWindows<'c> {
    pub fn new(db: &'c mut SqliteConnection) -> Self {
        Self { db }
    }

    /// Fetch the persisted window for a scope, if any request ever touched it.
    pub async fn get(&mut self, scope: &str) -> Result<Option<RateLimitWindow>> {
        let window = sqlx::query_as::<_, RateLimitWindow>(
            r#"
            SELECT scope, window_start, requests_in_window, day_window_start, requests_today, last_request_at
            FROM rate_limit_windows
            WHERE scope = ?
            "#,
        )
        .bind(scope)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(window)
    }

    /// Count one admitted request against a scope, lazily resetting whichever
    /// of the two windows has expired. Atomic per scope row.
    pub async fn increment(&mut self, scope: &str, now: i64) -> Result<()> {
        let midnight = utc_midnight(now);
        sqlx::query(
            r#"
            INSERT INTO rate_limit_windows (scope, window_start, requests_in_window, day_window_start, requests_today, last_request_at)
            VALUES (?, ?, 1, ?, 1, ?)
            ON CONFLICT (scope) DO UPDATE SET
                requests_in_window = CASE
                    WHEN excluded.last_request_at - rate_limit_windows.window_start >= ? THEN 1
                    ELSE rate_limit_windows.requests_in_window + 1
                END,
                window_start = CASE
                    WHEN excluded.last_request_at - rate_limit_windows.window_start >= ? THEN excluded.window_start
                    ELSE rate_limit_windows.window_start
                END,
                requests_today = CASE
                    WHEN rate_limit_windows.day_window_start < excluded.day_window_start THEN 1
                    ELSE rate_limit_windows.requests_today + 1
                END,
                day_window_start = CASE
                    WHEN rate_limit_windows.day_window_start < excluded.day_window_start THEN excluded.day_window_start
                    ELSE rate_limit_windows.day_window_start
                END,
                last_request_at = excluded.last_request_at
            "#,
        )
        .bind(scope)
        .bind(now)
        .bind(midnight)
        .bind(now)
        .bind(MINUTE_WINDOW_SECS)
        .bind(MINUTE_WINDOW_SECS)
        .execute(&mut *self.db)
        .await?;

        Ok(())
    }

    /// Stamp a denied attempt without counting it.
    pub async fn touch(&mut self, scope: &str, now: i64) -> Result<()> {
        sqlx::query("UPDATE rate_limit_windows SET last_request_at = ? WHERE scope = ?")
            .bind(now)
            .bind(scope)
            .execute(&mut *self.db)
            .await?;

        Ok(())
    }

    /// Delete windows idle longer than `max_idle_secs`. Storage hygiene only;
    /// correctness never depends on it because resets are lazy.
    pub async fn purge_stale(&mut self, now: i64, max_idle_secs: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_limit_windows WHERE ? - last_request_at > ?")
            .bind(now)
            .bind(max_idle_secs)
            .execute(&mut *self.db)
            .await?;

        Ok(result.rows_affected())
    }
}
