//! Typed boundary over the metering core.
//!
//! The platform's callable entry points (account-provisioning triggers,
//! payment webhooks, authenticated user requests, admin endpoints) are thin
//! external glue; this module is the contract they call into. Every operation
//! takes a tagged request struct and validates it before any component runs.
//! Authentication and authorization happen outside; nothing here checks
//! identity.

use crate::config::Config;
use crate::db::handlers::Settings;
use crate::db::models::credits::{CreditTransaction, CreditTransactionType};
use crate::db::models::provider_keys::{
    ProviderKeyCreateDBRequest, ProviderKeyDBResponse, ProviderKeyUpdateDBRequest,
};
use crate::db::models::settings::{PlatformSettings, PlatformSettingsUpdate};
use crate::errors::{Error, Result};
use crate::keypool::KeyRotation;
use crate::ledger::{CreditLedger, GrantRequest};
use crate::limiter::RateLimiter;
use crate::metering::{MeteredCallRequest, MeteredOutcome, MeteringEngine};
use crate::pricing::PricingEngine;
use crate::provider::ModelProvider;
use crate::types::AccountId;
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

const MAX_NAME_LEN: usize = 100;
const MAX_SECRET_LEN: usize = 500;
const MAX_FEATURE_LEN: usize = 100;
const MAX_DESCRIPTION_LEN: usize = 500;
const SETTINGS_UPDATE_ATTEMPTS: u32 = 8;

/// Payment-success event delivered by the (external) webhook handler. The
/// handler's own "already processed" check is the first line of defense; the
/// ledger's reference-keyed idempotency is the second.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PaymentEvent {
    pub account_id: AccountId,
    pub pack_id: String,
    pub credit_amount: i64,
    pub external_event_id: String,
}

/// Balance plus recent history for the account dashboard.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AccountSummary {
    pub account_id: AccountId,
    pub balance: i64,
    pub is_trial_account: bool,
    pub transactions: Vec<CreditTransaction>,
}

#[derive(Clone)]
pub struct Service {
    pool: SqlitePool,
    ledger: CreditLedger,
    keys: KeyRotation,
    limiter: RateLimiter,
    engine: MeteringEngine,
    pricing: Arc<PricingEngine>,
    default_page_size: i64,
    max_page_size: i64,
}

impl Service {
    pub fn new(pool: SqlitePool, config: &Config, provider: Arc<dyn ModelProvider>) -> Result<Self> {
        let pricing = Arc::new(PricingEngine::from_config(&config.pricing)?);
        let engine = MeteringEngine::new(
            pool.clone(),
            pricing.clone(),
            provider,
            Duration::from_secs(config.upstream.timeout_secs),
        );
        Ok(Self {
            ledger: CreditLedger::new(pool.clone()),
            keys: KeyRotation::new(pool.clone()),
            limiter: RateLimiter::new(pool.clone()),
            engine,
            pricing,
            default_page_size: config.credits.default_transaction_page_size,
            max_page_size: config.credits.max_transaction_page_size,
            pool,
        })
    }

    async fn settings(&self) -> Result<PlatformSettings> {
        let mut conn = self.pool.acquire().await?;
        let settings = Settings::new(&mut conn).get().await?;
        Ok(settings)
    }

    /// Account-provisioning trigger: grant the configured welcome credits and
    /// open the trial window. Must never block or fail account creation; on
    /// any failure the account simply starts at zero balance.
    pub async fn handle_account_created(&self, account_id: &str) {
        if account_id.is_empty() {
            tracing::error!("account-created event with empty account id");
            return;
        }
        let result = async {
            let settings = self.settings().await?;
            let trial_ends_at = (settings.trial_period_days > 0)
                .then(|| Utc::now() + ChronoDuration::days(settings.trial_period_days));
            self.ledger
                .initialize(account_id, settings.initial_grant_credits, trial_ends_at)
                .await
        }
        .await;
        if let Err(e) = result {
            tracing::error!(account_id, error = %e, "failed to initialize account credits, leaving balance at zero");
        }
    }

    /// Payment webhook: top up the account, keyed by the external event id so
    /// a replayed event can never double-grant.
    pub async fn handle_payment_succeeded(&self, event: &PaymentEvent) -> Result<i64> {
        if event.account_id.is_empty() || event.external_event_id.is_empty() {
            return Err(Error::BadRequest {
                message: "payment event needs an account id and an external event id".to_string(),
            });
        }
        if event.credit_amount < 1 {
            return Err(Error::BadRequest {
                message: "payment event credit amount must be >= 1".to_string(),
            });
        }

        self.ledger
            .grant(&GrantRequest {
                account_id: event.account_id.clone(),
                amount: event.credit_amount,
                transaction_type: CreditTransactionType::PurchaseTopUp,
                description: Some(format!("Credit pack {}", event.pack_id)),
                payment_reference: Some(event.external_event_id.clone()),
            })
            .await
    }

    /// Balance and recent transactions for the authenticated account.
    pub async fn account_summary(&self, account_id: &str, limit: Option<i64>) -> Result<AccountSummary> {
        let limit = limit.unwrap_or(self.default_page_size).clamp(1, self.max_page_size);
        let account = self.ledger.account(account_id).await?;
        let transactions = self.ledger.list_transactions(account_id, 0, limit).await?;
        Ok(AccountSummary {
            account_id: account_id.to_string(),
            balance: account.as_ref().map(|a| a.credit_balance).unwrap_or(0),
            is_trial_account: account.as_ref().map(|a| a.is_trial_account).unwrap_or(false),
            transactions,
        })
    }

    /// The authenticated "perform metered AI action" entry point.
    pub async fn metered_completion(&self, request: &MeteredCallRequest) -> Result<MeteredOutcome> {
        if request.account_id.is_empty() {
            return Err(Error::BadRequest {
                message: "account id must not be empty".to_string(),
            });
        }
        if !self.pricing.is_known_model(&request.model_key) {
            return Err(Error::BadRequest {
                message: format!("unknown model {:?}", request.model_key),
            });
        }
        if request.prompt.is_empty() {
            return Err(Error::BadRequest {
                message: "prompt must not be empty".to_string(),
            });
        }
        if request.feature.is_empty() || request.feature.len() > MAX_FEATURE_LEN {
            return Err(Error::BadRequest {
                message: format!("feature tag must be 1..={MAX_FEATURE_LEN} characters"),
            });
        }
        if request.max_output_units.is_some_and(|units| units < 1) {
            return Err(Error::BadRequest {
                message: "max_output_units must be >= 1 when present".to_string(),
            });
        }

        self.engine.run(request).await
    }

    /// Operator grant/removal outside the payment flow.
    pub async fn manual_adjustment(&self, account_id: &str, amount: i64, description: Option<String>) -> Result<i64> {
        if amount == 0 {
            return Err(Error::BadRequest {
                message: "adjustment amount must not be zero".to_string(),
            });
        }
        if description.as_ref().is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
            return Err(Error::BadRequest {
                message: format!("description must be at most {MAX_DESCRIPTION_LEN} characters"),
            });
        }
        if amount > 0 {
            self.ledger
                .grant(&GrantRequest::manual_adjustment(account_id.to_string(), amount, description))
                .await
        } else {
            self.ledger
                .debit_as(
                    account_id,
                    -amount,
                    description.as_deref(),
                    CreditTransactionType::ManualAdjustment,
                )
                .await
        }
    }

    // Admin surface. The caller has already passed the external "can edit"
    // authorization check; only input validity is enforced here.

    pub async fn platform_settings(&self) -> Result<PlatformSettings> {
        self.settings().await
    }

    /// Apply a partial settings update under the aggregate's versioned
    /// compare-and-swap discipline.
    pub async fn update_platform_settings(&self, update: &PlatformSettingsUpdate) -> Result<PlatformSettings> {
        validate_settings_update(update)?;

        for _ in 0..SETTINGS_UPDATE_ATTEMPTS {
            let mut conn = self.pool.acquire().await?;
            let mut settings = Settings::new(&mut conn);
            let current = settings.get().await?;
            if settings.apply_update(update, current.version, Utc::now()).await? {
                return settings.get().await.map_err(Error::from);
            }
        }
        Err(Error::Database(crate::db::errors::DbError::Other(anyhow::anyhow!(
            "gave up updating platform settings after {SETTINGS_UPDATE_ATTEMPTS} attempts"
        ))))
    }

    pub async fn list_provider_keys(&self) -> Result<Vec<ProviderKeyDBResponse>> {
        self.keys.list_keys().await
    }

    pub async fn create_provider_key(&self, request: &ProviderKeyCreateDBRequest) -> Result<ProviderKeyDBResponse> {
        if request.display_name.is_empty() || request.display_name.len() > MAX_NAME_LEN {
            return Err(Error::BadRequest {
                message: format!("display name must be 1..={MAX_NAME_LEN} characters"),
            });
        }
        if request.secret_value.is_empty() || request.secret_value.len() > MAX_SECRET_LEN {
            return Err(Error::BadRequest {
                message: format!("secret must be 1..={MAX_SECRET_LEN} characters"),
            });
        }
        if request.daily_limit.is_some_and(|limit| limit < 1) {
            return Err(Error::BadRequest {
                message: "daily limit must be >= 1 when present".to_string(),
            });
        }
        self.keys.create_key(request).await
    }

    pub async fn update_provider_key(&self, id: i64, request: &ProviderKeyUpdateDBRequest) -> Result<ProviderKeyDBResponse> {
        if request.display_name.as_ref().is_some_and(|n| n.is_empty() || n.len() > MAX_NAME_LEN) {
            return Err(Error::BadRequest {
                message: format!("display name must be 1..={MAX_NAME_LEN} characters"),
            });
        }
        if request.secret_value.as_ref().is_some_and(|s| s.is_empty() || s.len() > MAX_SECRET_LEN) {
            return Err(Error::BadRequest {
                message: format!("secret must be 1..={MAX_SECRET_LEN} characters"),
            });
        }
        if request.daily_limit.is_some_and(|limit| limit < 1) {
            return Err(Error::BadRequest {
                message: "daily limit must be >= 1 when present".to_string(),
            });
        }
        self.keys.update_key(id, request).await
    }

    pub async fn delete_provider_key(&self, id: i64) -> Result<()> {
        self.keys.delete_key(id).await
    }

    /// External scheduler hook: zero the pool's daily usage counters.
    pub async fn reset_key_usage_counters(&self) -> Result<u64> {
        self.keys.reset_daily_counters().await
    }

    /// External scheduler hook: drop rate-limit rows idle for over a day.
    pub async fn purge_stale_rate_windows(&self) -> Result<u64> {
        self.limiter.purge_stale(86_400).await
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    pub fn keys(&self) -> &KeyRotation {
        &self.keys
    }

    pub fn engine(&self) -> &MeteringEngine {
        &self.engine
    }
}

fn validate_settings_update(update: &PlatformSettingsUpdate) -> Result<()> {
    if update.margin.is_some_and(|m| m < Decimal::ZERO || m > Decimal::ONE) {
        return Err(Error::BadRequest {
            message: "margin must be within [0, 1]".to_string(),
        });
    }
    for (name, value) in [
        ("initial_grant_credits", update.initial_grant_credits),
        ("trial_period_days", update.trial_period_days),
        ("minimum_balance_for_call", update.minimum_balance_for_call),
    ] {
        if value.is_some_and(|v| v < 0) {
            return Err(Error::BadRequest {
                message: format!("{name} must be >= 0"),
            });
        }
    }
    for (name, value) in [
        ("per_account_per_minute", update.per_account_per_minute),
        ("per_account_per_day", update.per_account_per_day),
        ("global_per_minute", update.global_per_minute),
    ] {
        if value.is_some_and(|v| v < 1) {
            return Err(Error::BadRequest {
                message: format!("{name} must be >= 1"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{CompletionOutput, CompletionRequest, ProviderError};
    use async_trait::async_trait;
    use sqlx::SqlitePool;

    struct EchoProvider;

    #[async_trait]
    impl ModelProvider for EchoProvider {
        async fn complete(&self, _credential: &str, request: &CompletionRequest) -> std::result::Result<CompletionOutput, ProviderError> {
            Ok(CompletionOutput {
                text: format!("echo: {}", request.prompt),
                input_units: request.prompt.len() as i64,
                output_units: 50,
            })
        }
    }

    fn test_config() -> Config {
        use crate::config::{ModelPricingConfig, PricingConfig, TierConfig};
        use std::collections::HashMap;

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
        Config {
            pricing: PricingConfig {
                default_model: "swift-large".to_string(),
                default_context_units: 4_000,
                models,
            },
            ..Config::default()
        }
    }

    async fn service(pool: &SqlitePool) -> Service {
        let config = test_config();
        let service = Service::new(pool.clone(), &config, Arc::new(EchoProvider)).unwrap();
        let mut conn = pool.acquire().await.unwrap();
        Settings::new(&mut conn)
            .seed(&config.platform_settings_defaults(), Utc::now())
            .await
            .unwrap();
        service
    }

    fn payment(account_id: &str, amount: i64, event_id: &str) -> PaymentEvent {
        PaymentEvent {
            account_id: account_id.to_string(),
            pack_id: "pack_medium".to_string(),
            credit_amount: amount,
            external_event_id: event_id.to_string(),
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn account_creation_grants_welcome_credits_and_trial(pool: SqlitePool) {
        let service = service(&pool).await;
        service.handle_account_created("acct-1").await;

        let summary = service.account_summary("acct-1", None).await.unwrap();
        assert_eq!(summary.balance, 2_000);
        assert!(summary.is_trial_account);
        assert_eq!(summary.transactions.len(), 1);
        assert_eq!(summary.transactions[0].transaction_type, CreditTransactionType::InitialGrant);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn duplicate_account_creation_never_propagates(pool: SqlitePool) {
        let service = service(&pool).await;
        service.handle_account_created("acct-1").await;
        // The provisioning trigger may fire twice; the second is logged only.
        service.handle_account_created("acct-1").await;

        let summary = service.account_summary("acct-1", None).await.unwrap();
        assert_eq!(summary.balance, 2_000);
        assert_eq!(summary.transactions.len(), 1);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn payment_replay_grants_once(pool: SqlitePool) {
        let service = service(&pool).await;
        service.handle_account_created("acct-1").await;

        let first = service.handle_payment_succeeded(&payment("acct-1", 5_000, "evt_42")).await.unwrap();
        let second = service.handle_payment_succeeded(&payment("acct-1", 5_000, "evt_42")).await.unwrap();
        assert_eq!(first, 7_000);
        assert_eq!(second, 7_000);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn payment_event_validation(pool: SqlitePool) {
        let service = service(&pool).await;
        let err = service.handle_payment_succeeded(&payment("acct-1", 0, "evt_1")).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
        let err = service.handle_payment_succeeded(&payment("", 100, "evt_1")).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn summary_limit_is_clamped(pool: SqlitePool) {
        let service = service(&pool).await;
        service.handle_account_created("acct-1").await;
        for i in 0..5 {
            service
                .handle_payment_succeeded(&payment("acct-1", 100, &format!("evt_{i}")))
                .await
                .unwrap();
        }

        let summary = service.account_summary("acct-1", Some(3)).await.unwrap();
        assert_eq!(summary.transactions.len(), 3);
        // Absurd limits collapse to the configured cap instead of erroring.
        let summary = service.account_summary("acct-1", Some(1_000_000)).await.unwrap();
        assert_eq!(summary.transactions.len(), 6);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn metered_completion_validates_model_allow_list(pool: SqlitePool) {
        let service = service(&pool).await;
        service.handle_account_created("acct-1").await;

        let request = MeteredCallRequest {
            account_id: "acct-1".to_string(),
            model_key: "not-a-model".to_string(),
            feature: "chat".to_string(),
            prompt: "hello".to_string(),
            max_output_units: None,
        };
        let err = service.metered_completion(&request).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn metered_completion_runs_with_seeded_key(pool: SqlitePool) {
        let service = service(&pool).await;
        service.handle_account_created("acct-1").await;
        service
            .create_provider_key(&ProviderKeyCreateDBRequest {
                display_name: "primary".to_string(),
                secret_value: "sk-primary".to_string(),
                is_active: true,
                daily_limit: None,
            })
            .await
            .unwrap();

        let request = MeteredCallRequest {
            account_id: "acct-1".to_string(),
            model_key: "swift-large".to_string(),
            feature: "chat".to_string(),
            prompt: "hello".to_string(),
            max_output_units: Some(100),
        };
        let outcome = service.metered_completion(&request).await.unwrap();
        assert!(outcome.credits_debited > 0);
        assert_eq!(outcome.new_balance, 2_000 - outcome.credits_debited);
        assert!(outcome.text.starts_with("echo:"));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn settings_update_validates_and_applies(pool: SqlitePool) {
        let service = service(&pool).await;

        let err = service
            .update_platform_settings(&PlatformSettingsUpdate {
                margin: Some(Decimal::from(2)),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));

        let updated = service
            .update_platform_settings(&PlatformSettingsUpdate {
                per_account_per_minute: Some(42),
                minimum_balance_for_call: Some(25),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.per_account_per_minute, 42);
        assert_eq!(updated.minimum_balance_for_call, 25);
        assert_eq!(updated.version, 2);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn provider_key_validation(pool: SqlitePool) {
        let service = service(&pool).await;

        let err = service
            .create_provider_key(&ProviderKeyCreateDBRequest {
                display_name: String::new(),
                secret_value: "sk-x".to_string(),
                is_active: true,
                daily_limit: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));

        let err = service
            .create_provider_key(&ProviderKeyCreateDBRequest {
                display_name: "ok".to_string(),
                secret_value: "sk-x".to_string(),
                is_active: true,
                daily_limit: Some(0),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn manual_adjustment_grants_and_removes(pool: SqlitePool) {
        let service = service(&pool).await;
        service.handle_account_created("acct-1").await;

        assert_eq!(service.manual_adjustment("acct-1", 500, None).await.unwrap(), 2_500);
        assert_eq!(
            service.manual_adjustment("acct-1", -300, Some("correction".to_string())).await.unwrap(),
            2_200
        );
        assert!(matches!(
            service.manual_adjustment("acct-1", 0, None).await.unwrap_err(),
            Error::BadRequest { .. }
        ));

        // Both directions read as manual adjustments in the history.
        let summary = service.account_summary("acct-1", None).await.unwrap();
        assert_eq!(summary.transactions[0].transaction_type, CreditTransactionType::ManualAdjustment);
        assert_eq!(summary.transactions[0].amount, -300);
        assert_eq!(summary.transactions[1].transaction_type, CreditTransactionType::ManualAdjustment);
    }
}
