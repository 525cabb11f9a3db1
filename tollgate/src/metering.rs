//! The metered-call orchestrator.
//!
//! Sequences one paid upstream call across the components: admission →
//! balance pre-flight → credential selection → upstream call → cost and
//! credit conversion on the *actual* reported usage → debit → usage record
//! and key bookkeeping.
//!
//! Failure placement matters more than the happy path here. An upstream
//! failure after selection charges nobody and triggers no automatic retry;
//! the caller may invoke [`crate::keypool::KeyRotation::on_failure`] and try
//! once more. A debit failure after the upstream call succeeded is the known
//! unbillable-delivery race and is logged at error severity before it
//! propagates.

use crate::db::handlers::{Settings, UsageRecords};
use crate::db::models::usage::UsageRecordCreateDBRequest;
use crate::errors::{Error, Result};
use crate::keypool::KeyRotation;
use crate::ledger::CreditLedger;
use crate::limiter::RateLimiter;
use crate::pricing::PricingEngine;
use crate::provider::{CompletionRequest, ModelProvider, ProviderError};
use crate::types::{AccountId, ModelKey};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One metered action, validated at the boundary.
#[derive(Debug, Clone)]
pub struct MeteredCallRequest {
    pub account_id: AccountId,
    pub model_key: ModelKey,
    /// Product feature tag for analytics, e.g. `"chat"`.
    pub feature: String,
    pub prompt: String,
    pub max_output_units: Option<i64>,
}

/// What the caller gets back from a successful metered call.
#[derive(Debug, Clone)]
pub struct MeteredOutcome {
    pub text: String,
    pub input_units: i64,
    pub output_units: i64,
    pub cost_basis_usd: Decimal,
    pub credits_debited: i64,
    pub new_balance: i64,
    pub duration_ms: i64,
}

#[derive(Clone)]
pub struct MeteringEngine {
    pool: sqlx::SqlitePool,
    ledger: CreditLedger,
    limiter: RateLimiter,
    keys: KeyRotation,
    pricing: Arc<PricingEngine>,
    provider: Arc<dyn ModelProvider>,
    upstream_timeout: Duration,
}

impl MeteringEngine {
    pub fn new(
        pool: sqlx::SqlitePool,
        pricing: Arc<PricingEngine>,
        provider: Arc<dyn ModelProvider>,
        upstream_timeout: Duration,
    ) -> Self {
        Self {
            ledger: CreditLedger::new(pool.clone()),
            limiter: RateLimiter::new(pool.clone()),
            keys: KeyRotation::new(pool.clone()),
            pool,
            pricing,
            provider,
            upstream_timeout,
        }
    }

    /// Run one metered call end to end.
    #[tracing::instrument(skip(self, request), fields(account_id = %request.account_id, model_key = %request.model_key))]
    pub async fn run(&self, request: &MeteredCallRequest) -> Result<MeteredOutcome> {
        self.limiter.admit(&request.account_id).await?;

        let settings = {
            let mut conn = self.pool.acquire().await?;
            Settings::new(&mut conn).get().await?
        };

        // Pre-flight: refuse before incurring any upstream cost.
        let balance = self.ledger.balance(&request.account_id).await?;
        if balance < settings.minimum_balance_for_call {
            return Err(Error::InsufficientCredits {
                required: settings.minimum_balance_for_call,
                available: balance,
            });
        }

        let key = self.keys.select_key().await?.ok_or(Error::NoAvailableCredential)?;

        let completion_request = CompletionRequest {
            model_key: request.model_key.clone(),
            prompt: request.prompt.clone(),
            max_output_units: request.max_output_units,
        };
        let started = Instant::now();
        let upstream = tokio::time::timeout(
            self.upstream_timeout,
            self.provider.complete(&key.secret_value, &completion_request),
        )
        .await;
        let output = match upstream {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                // No debit for a failed call; retry with a fresh key is the
                // caller's move via on_failure.
                tracing::warn!(key = %key.display_name, error = %e, "upstream call failed");
                return Err(Error::Upstream(e));
            }
            Err(_) => {
                tracing::warn!(key = %key.display_name, timeout_secs = self.upstream_timeout.as_secs(), "upstream call timed out");
                return Err(Error::Upstream(ProviderError::Timeout(self.upstream_timeout.as_secs())));
            }
        };
        let duration_ms = started.elapsed().as_millis() as i64;

        // Settle on actual units, never the pre-flight estimate. Both the raw
        // cost and the credit price select their tier from the same total.
        let total_units = output.input_units + output.output_units;
        let cost_basis_usd = self
            .pricing
            .raw_cost_usd(&request.model_key, output.input_units, output.output_units);
        let credits = self
            .pricing
            .credits_for_cost(&request.model_key, cost_basis_usd, settings.margin, Some(total_units));

        let new_balance = if credits > 0 {
            let description = format!("{} usage ({})", request.model_key, request.feature);
            match self.ledger.debit(&request.account_id, credits, Some(&description)).await {
                Ok(balance) => balance,
                Err(e @ (Error::InsufficientCredits { .. } | Error::TrialExpired { .. })) => {
                    // The upstream provider already billed us for this call.
                    tracing::error!(
                        account_id = %request.account_id,
                        credits,
                        error = %e,
                        "upstream call delivered but credits could not be collected"
                    );
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        } else {
            balance
        };

        self.record_usage(request, &output, cost_basis_usd, credits, duration_ms).await;
        if let Err(e) = self.keys.record_success(key.key_id).await {
            tracing::warn!(key_id = key.key_id, error = %e, "failed to update key usage counters");
        }

        Ok(MeteredOutcome {
            text: output.text,
            input_units: output.input_units,
            output_units: output.output_units,
            cost_basis_usd,
            credits_debited: credits,
            new_balance,
            duration_ms,
        })
    }

    /// Usage records are analytics, not billing; a write failure is loud but
    /// does not fail a call that was already debited.
    async fn record_usage(
        &self,
        request: &MeteredCallRequest,
        output: &crate::provider::CompletionOutput,
        cost_basis_usd: Decimal,
        credits_debited: i64,
        duration_ms: i64,
    ) {
        let record = UsageRecordCreateDBRequest {
            account_id: request.account_id.clone(),
            model_key: request.model_key.clone(),
            feature: request.feature.clone(),
            input_units: output.input_units,
            output_units: output.output_units,
            cost_basis_usd,
            credits_debited,
            duration_ms,
        };
        let result = async {
            let mut conn = self.pool.acquire().await?;
            UsageRecords::new(&mut conn).create(&record, Utc::now()).await?;
            Ok::<_, Error>(())
        }
        .await;
        if let Err(e) = result {
            tracing::error!(account_id = %request.account_id, error = %e, "billed a call but failed to write its usage record");
        }
    }

    /// The ledger this engine debits against (shared handle).
    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    /// The credential rotation manager (shared handle, for failover retries).
    pub fn keys(&self) -> &KeyRotation {
        &self.keys
    }

    /// The admission controller (shared handle).
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ModelPricingConfig, PricingConfig, TierConfig};
    use crate::db::handlers::ProviderKeys;
    use crate::db::models::provider_keys::ProviderKeyCreateDBRequest;
    use crate::db::models::settings::PlatformSettingsUpdate;
    use crate::provider::CompletionOutput;
    use async_trait::async_trait;
    use sqlx::SqlitePool;
    use std::collections::HashMap;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedProvider {
        input_units: i64,
        output_units: i64,
        fail: bool,
        delay: Option<Duration>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn ok(input_units: i64, output_units: i64) -> Self {
            Self {
                input_units,
                output_units,
                fail: false,
                delay: None,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self { fail: true, ..Self::ok(0, 0) }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::ok(10, 10)
            }
        }
    }

    #[async_trait]
    impl ModelProvider for ScriptedProvider {
        async fn complete(&self, _credential: &str, _request: &CompletionRequest) -> std::result::Result<CompletionOutput, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(ProviderError::Upstream("synthetic upstream outage".to_string()));
            }
            Ok(CompletionOutput {
                text: "generated text".to_string(),
                input_units: self.input_units,
                output_units: self.output_units,
            })
        }
    }

    /// A provider that drains the account mid-call, reproducing the race
    /// where the balance drops between pre-flight and settlement.
    struct DrainingProvider {
        ledger: CreditLedger,
        account_id: String,
    }

    #[async_trait]
    impl ModelProvider for DrainingProvider {
        async fn complete(&self, _credential: &str, _request: &CompletionRequest) -> std::result::Result<CompletionOutput, ProviderError> {
            let balance = self.ledger.balance(&self.account_id).await.unwrap();
            self.ledger
                .debit(&self.account_id, balance - 1, Some("concurrent spend"))
                .await
                .unwrap();
            Ok(CompletionOutput {
                text: "generated text".to_string(),
                input_units: 1_000,
                output_units: 500,
            })
        }
    }

    fn pricing() -> Arc<PricingEngine> {
        let mut models = HashMap::new();
        models.insert(
            "swift-large".to_string(),
            ModelPricingConfig {
                tiers: vec![TierConfig {
                    max_units: None,
                    input_per_million: Decimal::from(2),
                    output_per_million: Decimal::from(12),
                }],
            },
        );
        Arc::new(
            PricingEngine::from_config(&PricingConfig {
                default_model: "swift-large".to_string(),
                default_context_units: 4_000,
                models,
            })
            .unwrap(),
        )
    }

    async fn seed(pool: &SqlitePool, keys: usize) {
        let mut conn = pool.acquire().await.unwrap();
        Settings::new(&mut conn)
            .seed(&Config::default().platform_settings_defaults(), Utc::now())
            .await
            .unwrap();
        let mut repo = ProviderKeys::new(&mut conn);
        for i in 0..keys {
            repo.create(
                &ProviderKeyCreateDBRequest {
                    display_name: format!("key-{i}"),
                    secret_value: format!("sk-{i}"),
                    is_active: true,
                    daily_limit: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        }
    }

    fn engine(pool: &SqlitePool, provider: Arc<dyn ModelProvider>) -> MeteringEngine {
        MeteringEngine::new(pool.clone(), pricing(), provider, Duration::from_secs(5))
    }

    fn request(account_id: &str) -> MeteredCallRequest {
        MeteredCallRequest {
            account_id: account_id.to_string(),
            model_key: "swift-large".to_string(),
            feature: "chat".to_string(),
            prompt: "write a haiku about tolls".to_string(),
            max_output_units: Some(1_000),
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn metered_call_end_to_end(pool: SqlitePool) {
        seed(&pool, 1).await;
        let provider = Arc::new(ScriptedProvider::ok(1_000, 500));
        let engine = engine(&pool, provider.clone());
        engine.ledger().initialize("acct-1", 2_000, None).await.unwrap();

        let outcome = engine.run(&request("acct-1")).await.unwrap();

        // rates $2/$12 per 1M, margin 0.45: raw cost 0.008 USD, blended
        // per-1K 0.01015, ceil(0.008 / 0.01015 * 1000) = 789 credits.
        assert_eq!(outcome.cost_basis_usd, Decimal::from_str("0.008").unwrap());
        assert_eq!(outcome.credits_debited, 789);
        assert_eq!(outcome.new_balance, 2_000 - 789);
        assert_eq!(outcome.text, "generated text");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        // Ledger, usage log and key counters all reflect the call.
        assert_eq!(engine.ledger().balance("acct-1").await.unwrap(), 1_211);
        let mut conn = pool.acquire().await.unwrap();
        let usage = UsageRecords::new(&mut conn).list_for_account("acct-1", 0, 10).await.unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].credits_debited, 789);
        let keys = engine.keys().list_keys().await.unwrap();
        assert_eq!(keys[0].usage_count_today, 1);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn preflight_refuses_before_spending_upstream(pool: SqlitePool) {
        seed(&pool, 1).await;
        let provider = Arc::new(ScriptedProvider::ok(10, 10));
        let engine = engine(&pool, provider.clone());
        // Below the default minimum balance of 10.
        engine.ledger().initialize("acct-1", 5, None).await.unwrap();

        let err = engine.run(&request("acct-1")).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientCredits { required: 10, available: 5 }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn empty_pool_is_capacity_exhaustion(pool: SqlitePool) {
        seed(&pool, 0).await;
        let provider = Arc::new(ScriptedProvider::ok(10, 10));
        let engine = engine(&pool, provider.clone());
        engine.ledger().initialize("acct-1", 2_000, None).await.unwrap();

        let err = engine.run(&request("acct-1")).await.unwrap_err();
        assert!(matches!(err, Error::NoAvailableCredential));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn upstream_failure_charges_nothing(pool: SqlitePool) {
        seed(&pool, 1).await;
        let engine = engine(&pool, Arc::new(ScriptedProvider::failing()));
        engine.ledger().initialize("acct-1", 2_000, None).await.unwrap();

        let err = engine.run(&request("acct-1")).await.unwrap_err();
        assert!(matches!(err, Error::Upstream(_)));

        assert_eq!(engine.ledger().balance("acct-1").await.unwrap(), 2_000);
        let mut conn = pool.acquire().await.unwrap();
        let usage = UsageRecords::new(&mut conn).list_for_account("acct-1", 0, 10).await.unwrap();
        assert!(usage.is_empty());
        let keys = engine.keys().list_keys().await.unwrap();
        assert_eq!(keys[0].usage_count_today, 0);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn hung_upstream_call_times_out(pool: SqlitePool) {
        seed(&pool, 1).await;
        let provider = Arc::new(ScriptedProvider::slow(Duration::from_secs(60)));
        let engine = MeteringEngine::new(pool.clone(), pricing(), provider, Duration::from_millis(50));
        engine.ledger().initialize("acct-1", 2_000, None).await.unwrap();

        let err = engine.run(&request("acct-1")).await.unwrap_err();
        assert!(matches!(err, Error::Upstream(ProviderError::Timeout(_))));
        assert_eq!(engine.ledger().balance("acct-1").await.unwrap(), 2_000);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn rate_limit_denial_surfaces_before_anything_else(pool: SqlitePool) {
        seed(&pool, 1).await;
        {
            let mut conn = pool.acquire().await.unwrap();
            let mut settings = Settings::new(&mut conn);
            let version = settings.get().await.unwrap().version;
            settings
                .apply_update(
                    &PlatformSettingsUpdate {
                        per_account_per_minute: Some(1),
                        ..Default::default()
                    },
                    version,
                    Utc::now(),
                )
                .await
                .unwrap();
        }
        let provider = Arc::new(ScriptedProvider::ok(10, 10));
        let engine = engine(&pool, provider.clone());
        engine.ledger().initialize("acct-1", 2_000, None).await.unwrap();

        engine.run(&request("acct-1")).await.unwrap();
        let err = engine.run(&request("acct-1")).await.unwrap_err();
        assert!(matches!(err, Error::RateLimited { retry_after_seconds: Some(_) }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn settlement_race_is_surfaced_not_swallowed(pool: SqlitePool) {
        seed(&pool, 1).await;
        let ledger = CreditLedger::new(pool.clone());
        ledger.initialize("acct-1", 2_000, None).await.unwrap();
        let provider = Arc::new(DrainingProvider {
            ledger: ledger.clone(),
            account_id: "acct-1".to_string(),
        });
        let engine = engine(&pool, provider);

        let err = engine.run(&request("acct-1")).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientCredits { .. }));
        // The concurrent spend went through; this call collected nothing.
        assert_eq!(ledger.balance("acct-1").await.unwrap(), 1);
    }
}
