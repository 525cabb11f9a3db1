//! Database models for rate-limit windows.

use serde::{Deserialize, Serialize};

/// Persisted counters for one scope (an account id, or the reserved scope
/// `global`). All instants are epoch seconds so the window arithmetic stays
/// exact inside SQL.
///
/// A minute window is live while `now - window_start < 60`; the day window is
/// live while `day_window_start` equals the current UTC midnight. Expired
/// windows are reset lazily by the next access, never by a sweep.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RateLimitWindow {
    pub scope: String,
    pub window_start: i64,
    pub requests_in_window: i64,
    pub day_window_start: i64,
    pub requests_today: i64,
    pub last_request_at: i64,
}

/// Seconds in the sliding minute window.
pub const MINUTE_WINDOW_SECS: i64 = 60;

/// Seconds in a calendar day; day windows are anchored at UTC midnight.
pub const DAY_SECS: i64 = 86_400;

/// UTC midnight preceding `now` (both epoch seconds).
pub fn utc_midnight(now: i64) -> i64 {
    now - now.rem_euclid(DAY_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utc_midnight_truncates_to_day_start() {
        // 2024-01-02T00:00:00Z == 1704153600
        assert_eq!(utc_midnight(1_704_153_600), 1_704_153_600);
        assert_eq!(utc_midnight(1_704_153_600 + 12 * 3600 + 34), 1_704_153_600);
        assert_eq!(utc_midnight(1_704_153_600 + DAY_SECS - 1), 1_704_153_600);
        assert_eq!(utc_midnight(1_704_153_600 + DAY_SECS), 1_704_153_600 + DAY_SECS);
    }
}
