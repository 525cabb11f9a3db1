//! Upstream credential pool selection and rotation.
//!
//! Selection works on a snapshot of the pool plus the settings aggregate, and
//! publishes cursor movement through a versioned compare-and-swap on the
//! settings row; a lost race re-reads and retries. Per-key usage counters are
//! bumped by single atomic statements.
//!
//! Daily usage counters reset only through the explicit
//! [`KeyRotation::reset_daily_counters`] operation driven by an external
//! scheduler. This is deliberately asymmetric with the rate limiter's
//! lazily-resetting windows.

use crate::db::errors::DbError;
use crate::db::handlers::{ProviderKeys, Settings};
use crate::db::models::provider_keys::{
    ProviderKey, ProviderKeyCreateDBRequest, ProviderKeyDBResponse, ProviderKeyUpdateDBRequest,
};
use crate::db::models::settings::RotationStrategy;
use crate::errors::{Error, Result};
use crate::types::PoolOrdinal;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::instrument;

/// Give up on the settings CAS after this many lost races; selection under
/// real traffic wins long before.
const MAX_CAS_ATTEMPTS: u32 = 8;

/// A credential handed to the orchestrator for one upstream call.
#[derive(Debug, Clone)]
pub struct SelectedKey {
    pub key_id: i64,
    /// Rank in pool order; pass back to [`KeyRotation::on_failure`].
    pub ordinal: PoolOrdinal,
    pub display_name: String,
    pub secret_value: String,
}

impl SelectedKey {
    fn from_key(ordinal: PoolOrdinal, key: &ProviderKey) -> Self {
        Self {
            key_id: key.id,
            ordinal,
            display_name: key.display_name.clone(),
            secret_value: key.secret_value.clone(),
        }
    }
}

/// Pick a key per strategy from the active candidates, excluding keys at or
/// over their daily cap; the exclusion re-runs selection among the remainder.
fn choose<'k>(
    strategy: RotationStrategy,
    current_index: i64,
    candidates: &[(PoolOrdinal, &'k ProviderKey)],
) -> Option<(PoolOrdinal, &'k ProviderKey)> {
    let mut candidates = candidates.to_vec();
    loop {
        if candidates.is_empty() {
            return None;
        }
        let chosen = match strategy {
            RotationStrategy::RoundRobin => {
                candidates[current_index.rem_euclid(candidates.len() as i64) as usize]
            }
            RotationStrategy::Failover => candidates[0],
            RotationStrategy::UsageBased => *candidates
                .iter()
                .min_by_key(|(ordinal, key)| (key.usage_count_today, *ordinal))
                .expect("candidates is non-empty"),
        };
        if chosen.1.over_daily_limit() {
            candidates.retain(|(ordinal, _)| *ordinal != chosen.0);
            continue;
        }
        return Some(chosen);
    }
}

#[derive(Debug, Clone)]
pub struct KeyRotation {
    pool: SqlitePool,
}

impl KeyRotation {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Select a credential for the next upstream call, or `None` when every
    /// key is inactive or over quota (the caller surfaces
    /// [`Error::NoAvailableCredential`]).
    ///
    /// Round-robin indexes the active subset with the shared cursor, then
    /// advances the cursor over the *full* pool; the other strategies leave
    /// the cursor untouched.
    #[instrument(skip(self), err)]
    pub async fn select_key(&self) -> Result<Option<SelectedKey>> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut conn = self.pool.acquire().await?;
            let settings = Settings::new(&mut conn).get().await?;
            let keys = ProviderKeys::new(&mut conn).list().await?;
            if keys.is_empty() {
                return Ok(None);
            }

            let candidates: Vec<(PoolOrdinal, &ProviderKey)> =
                keys.iter().enumerate().filter(|(_, key)| key.is_active).collect();
            let Some((ordinal, key)) = choose(settings.rotation_strategy, settings.current_key_index, &candidates)
            else {
                return Ok(None);
            };
            let selected = SelectedKey::from_key(ordinal, key);

            if settings.rotation_strategy != RotationStrategy::RoundRobin {
                return Ok(Some(selected));
            }

            let next_index = (settings.current_key_index + 1).rem_euclid(keys.len() as i64);
            let won = Settings::new(&mut conn)
                .advance_key_index(next_index, settings.version, Utc::now())
                .await?;
            if won {
                return Ok(Some(selected));
            }
            // Lost the cursor race; re-read and reselect.
        }

        Err(Error::Database(DbError::Other(anyhow::anyhow!(
            "gave up advancing the rotation cursor after {MAX_CAS_ATTEMPTS} attempts"
        ))))
    }

    /// One-shot failover: reselect excluding the failed key and move the
    /// cursor to the replacement. The orchestrator decides whether to retry
    /// the call; this never loops on its own.
    #[instrument(skip(self), err)]
    pub async fn on_failure(&self, failed_ordinal: PoolOrdinal) -> Result<SelectedKey> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut conn = self.pool.acquire().await?;
            let settings = Settings::new(&mut conn).get().await?;
            let keys = ProviderKeys::new(&mut conn).list().await?;

            let candidates: Vec<(PoolOrdinal, &ProviderKey)> = keys
                .iter()
                .enumerate()
                .filter(|(ordinal, key)| key.is_active && *ordinal != failed_ordinal)
                .collect();
            let Some((ordinal, key)) = choose(settings.rotation_strategy, settings.current_key_index, &candidates)
            else {
                tracing::warn!(failed_ordinal, "no alternative credential after upstream failure");
                return Err(Error::NoAvailableCredential);
            };
            let selected = SelectedKey::from_key(ordinal, key);

            let won = Settings::new(&mut conn)
                .advance_key_index(ordinal as i64, settings.version, Utc::now())
                .await?;
            if won {
                tracing::info!(failed_ordinal, replacement = ordinal, "failed over to replacement credential");
                return Ok(selected);
            }
        }

        Err(Error::Database(DbError::Other(anyhow::anyhow!(
            "gave up moving the rotation cursor after {MAX_CAS_ATTEMPTS} attempts"
        ))))
    }

    /// Count one successful upstream call against a key.
    pub async fn record_success(&self, key_id: i64) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let updated = ProviderKeys::new(&mut conn).record_success(key_id, Utc::now()).await?;
        if !updated {
            tracing::warn!(key_id, "recorded success for a key that no longer exists");
        }
        Ok(())
    }

    /// Zero all daily counters. Driven by an external periodic trigger.
    #[instrument(skip(self), err)]
    pub async fn reset_daily_counters(&self) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        let reset = ProviderKeys::new(&mut conn).reset_daily_counters().await?;
        tracing::info!(keys = reset, "reset daily usage counters");
        Ok(reset)
    }

    // Admin surface over the pool. Secrets never leave through these.

    pub async fn list_keys(&self) -> Result<Vec<ProviderKeyDBResponse>> {
        let mut conn = self.pool.acquire().await?;
        let keys = ProviderKeys::new(&mut conn).list().await?;
        Ok(keys.into_iter().map(ProviderKeyDBResponse::from).collect())
    }

    pub async fn create_key(&self, request: &ProviderKeyCreateDBRequest) -> Result<ProviderKeyDBResponse> {
        let mut conn = self.pool.acquire().await?;
        let key = ProviderKeys::new(&mut conn).create(request, Utc::now()).await?;
        Ok(ProviderKeyDBResponse::from(key))
    }

    pub async fn update_key(&self, id: i64, request: &ProviderKeyUpdateDBRequest) -> Result<ProviderKeyDBResponse> {
        let mut conn = self.pool.acquire().await?;
        let key = ProviderKeys::new(&mut conn)
            .update(id, request)
            .await?
            .ok_or(Error::Database(DbError::NotFound))?;
        Ok(ProviderKeyDBResponse::from(key))
    }

    pub async fn delete_key(&self, id: i64) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let deleted = ProviderKeys::new(&mut conn).delete(id).await?;
        if !deleted {
            return Err(Error::Database(DbError::NotFound));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::models::settings::PlatformSettingsUpdate;
    use sqlx::SqlitePool;

    async fn seed(pool: &SqlitePool, strategy: RotationStrategy, key_count: usize) -> KeyRotation {
        let mut conn = pool.acquire().await.unwrap();
        let mut settings = Settings::new(&mut conn);
        settings
            .seed(&Config::default().platform_settings_defaults(), Utc::now())
            .await
            .unwrap();
        settings
            .apply_update(
                &PlatformSettingsUpdate {
                    rotation_strategy: Some(strategy),
                    ..Default::default()
                },
                1,
                Utc::now(),
            )
            .await
            .unwrap();

        let mut keys = ProviderKeys::new(&mut conn);
        for i in 0..key_count {
            keys.create(
                &ProviderKeyCreateDBRequest {
                    display_name: format!("key-{i}"),
                    secret_value: format!("sk-secret-{i}"),
                    is_active: true,
                    daily_limit: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        }
        KeyRotation::new(pool.clone())
    }

    async fn set_key(pool: &SqlitePool, name: &str, active: bool, used_today: i64, daily_limit: Option<i64>) {
        sqlx::query(
            "UPDATE provider_keys SET is_active = ?, usage_count_today = ?, daily_limit = ? WHERE display_name = ?",
        )
        .bind(active)
        .bind(used_today)
        .bind(daily_limit)
        .bind(name)
        .execute(pool)
        .await
        .unwrap();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn round_robin_cycles_in_pool_order(pool: SqlitePool) {
        let rotation = seed(&pool, RotationStrategy::RoundRobin, 3).await;

        let mut ordinals = Vec::new();
        for _ in 0..4 {
            ordinals.push(rotation.select_key().await.unwrap().unwrap().ordinal);
        }
        assert_eq!(ordinals, vec![0, 1, 2, 0]);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn quota_exhausted_key_is_never_selected(pool: SqlitePool) {
        let rotation = seed(&pool, RotationStrategy::RoundRobin, 3).await;
        // key-0 is at its cap, and it is the round-robin "turn".
        set_key(&pool, "key-0", true, 5, Some(5)).await;

        for _ in 0..6 {
            let selected = rotation.select_key().await.unwrap().unwrap();
            assert_ne!(selected.display_name, "key-0");
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn empty_or_exhausted_pool_yields_none(pool: SqlitePool) {
        let rotation = seed(&pool, RotationStrategy::RoundRobin, 2).await;

        assert!(rotation.select_key().await.unwrap().is_some());

        set_key(&pool, "key-0", false, 0, None).await;
        set_key(&pool, "key-1", true, 3, Some(3)).await;
        assert!(rotation.select_key().await.unwrap().is_none());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn failover_always_picks_first_active(pool: SqlitePool) {
        let rotation = seed(&pool, RotationStrategy::Failover, 3).await;
        set_key(&pool, "key-0", false, 0, None).await;

        for _ in 0..3 {
            let selected = rotation.select_key().await.unwrap().unwrap();
            assert_eq!(selected.display_name, "key-1");
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn usage_based_picks_least_used_with_pool_order_ties(pool: SqlitePool) {
        let rotation = seed(&pool, RotationStrategy::UsageBased, 3).await;
        set_key(&pool, "key-0", true, 7, None).await;
        set_key(&pool, "key-1", true, 2, None).await;
        set_key(&pool, "key-2", true, 2, None).await;

        // key-1 and key-2 tie on usage; pool order wins.
        let selected = rotation.select_key().await.unwrap().unwrap();
        assert_eq!(selected.display_name, "key-1");
    }

    #[sqlx::test]
    #[test_log::test]
    async fn record_success_bumps_counters(pool: SqlitePool) {
        let rotation = seed(&pool, RotationStrategy::Failover, 1).await;
        let selected = rotation.select_key().await.unwrap().unwrap();

        rotation.record_success(selected.key_id).await.unwrap();
        rotation.record_success(selected.key_id).await.unwrap();

        let keys = rotation.list_keys().await.unwrap();
        assert_eq!(keys[0].usage_count_today, 2);
        assert_eq!(keys[0].usage_count_total, 2);
        assert!(keys[0].last_used_at.is_some());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn reset_daily_counters_keeps_totals(pool: SqlitePool) {
        let rotation = seed(&pool, RotationStrategy::Failover, 1).await;
        let selected = rotation.select_key().await.unwrap().unwrap();
        rotation.record_success(selected.key_id).await.unwrap();

        rotation.reset_daily_counters().await.unwrap();

        let keys = rotation.list_keys().await.unwrap();
        assert_eq!(keys[0].usage_count_today, 0);
        assert_eq!(keys[0].usage_count_total, 1);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn on_failure_reselects_and_moves_cursor(pool: SqlitePool) {
        let rotation = seed(&pool, RotationStrategy::RoundRobin, 2).await;

        let replacement = rotation.on_failure(0).await.unwrap();
        assert_eq!(replacement.ordinal, 1);

        let mut conn = pool.acquire().await.unwrap();
        let settings = Settings::new(&mut conn).get().await.unwrap();
        assert_eq!(settings.current_key_index, 1);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn on_failure_with_no_alternative_is_capacity_exhaustion(pool: SqlitePool) {
        let rotation = seed(&pool, RotationStrategy::Failover, 1).await;
        let err = rotation.on_failure(0).await.unwrap_err();
        assert!(matches!(err, Error::NoAvailableCredential));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn admin_listing_never_exposes_secrets(pool: SqlitePool) {
        let rotation = seed(&pool, RotationStrategy::RoundRobin, 2).await;
        let listed = rotation.list_keys().await.unwrap();
        let as_json = serde_json::to_string(&listed).unwrap();
        assert!(!as_json.contains("sk-secret"));
    }
}
