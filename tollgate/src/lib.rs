//! # tollgate: Credit Ledger and Usage Metering for AI Platforms
//!
//! `tollgate` is the billing-and-usage core for platforms that resell paid
//! AI-provider calls as prepaid credits. It grants welcome credits to new
//! accounts, converts variable upstream token costs into deterministic credit
//! debits through tiered pricing with a configurable margin, enforces
//! per-account and platform-wide call rates, and multiplexes calls across a
//! rotating pool of upstream credentials.
//!
//! ## Overview
//!
//! Platforms that expose AI features to end users face the same three
//! problems: every upstream call costs real money before the user pays,
//! per-user spend must be bounded without a billing round-trip in the hot
//! path, and upstream quota is attached to individual API keys rather than to
//! the platform as a whole. This crate answers all three with a single
//! authoritative store: a credit ledger with compare-and-swap debits, a
//! sliding-window rate limiter, and a credential pool with pluggable rotation
//! strategies.
//!
//! The surrounding delivery skin is not part of this crate. HTTP entry
//! points, payment-provider SDKs and authorization live in the embedding
//! application; they call into the typed operations on [`Service`] and
//! nothing else. The upstream AI provider is likewise abstracted behind the
//! [`provider::ModelProvider`] trait.
//!
//! ## Request Flow
//!
//! A metered call travels: admission check (rate limiter) → balance
//! pre-flight → credential selection → upstream call → cost computation on
//! the provider's actual usage counts → atomic debit → usage record and key
//! bookkeeping. The call is never charged when the upstream fails, and the
//! one unavoidable race (the balance dropping between pre-flight and
//! settlement) is surfaced loudly instead of swallowed.
//!
//! ## Core Components
//!
//! The **pricing engine** ([`pricing`]) is a pure library over configured
//! per-model tier tables: usage to USD, USD to credits, rounding always up.
//!
//! The **credit ledger** ([`ledger`]) owns account balances and the
//! append-only transaction history. Every mutation is one SQL transaction,
//! debits are conditional updates, and payment grants are idempotent by
//! external correlation id.
//!
//! The **rate limiter** ([`limiter`]) keeps a sliding minute window and a UTC
//! day window per account plus one global pair, persisted and lazily reset.
//!
//! The **key rotation manager** ([`keypool`]) selects upstream credentials
//! round-robin, failover-first or by usage, excludes keys over their daily
//! caps, and fails over once on demand.
//!
//! The **orchestrator** ([`metering`]) sequences one metered call across the
//! four, and [`service`] wraps everything in validated, typed entry points
//! for the embedding application.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use std::sync::Arc;
//! use tollgate::{config::{Args, Config}, Platform};
//! # struct MyProvider;
//! # #[async_trait::async_trait]
//! # impl tollgate::provider::ModelProvider for MyProvider {
//! #     async fn complete(&self, _: &str, _: &tollgate::provider::CompletionRequest)
//! #         -> Result<tollgate::provider::CompletionOutput, tollgate::provider::ProviderError> { unimplemented!() }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     tollgate::telemetry::init_telemetry();
//!     let args = Args::parse();
//!     let config = Config::load(&args)?;
//!
//!     let platform = Platform::connect(&config, Arc::new(MyProvider)).await?;
//!     let summary = platform.service().account_summary("acct-1", None).await?;
//!     println!("balance: {}", summary.balance);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod db;
pub mod errors;
pub mod keypool;
pub mod ledger;
pub mod limiter;
pub mod metering;
pub mod pricing;
pub mod provider;
pub mod service;
pub mod telemetry;
pub mod types;

use crate::config::Config;
use crate::db::handlers::{ProviderKeys, Settings};
use crate::db::models::provider_keys::ProviderKeyCreateDBRequest;
use crate::errors::Result;
use crate::provider::ModelProvider;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;

pub use crate::errors::Error;
pub use crate::service::{AccountSummary, PaymentEvent, Service};

/// A fully wired metering platform: connected pool, applied migrations,
/// seeded settings and credential pool, and the [`Service`] boundary on top.
#[derive(Clone)]
pub struct Platform {
    pool: SqlitePool,
    service: Service,
}

impl Platform {
    /// Connect to the database, run migrations, seed the platform-settings
    /// aggregate and the credential pool from configuration (first startup
    /// only), and build the service boundary.
    pub async fn connect(config: &Config, provider: Arc<dyn ModelProvider>) -> Result<Self> {
        let pool = db::connect(&config.database).await.map_err(db::errors::DbError::from)?;
        db::migrator().run(&pool).await.map_err(|e| db::errors::DbError::Other(e.into()))?;
        seed(&pool, config).await?;

        let service = Service::new(pool.clone(), config, provider)?;
        Ok(Self { pool, service })
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Write the configured bootstrap state into the database where it does not
/// exist yet: the singleton settings row, and the credential pool when empty.
/// Idempotent; later startups leave admin-edited state alone.
async fn seed(pool: &SqlitePool, config: &Config) -> Result<()> {
    let now = Utc::now();
    let mut conn = pool.acquire().await?;

    Settings::new(&mut conn).seed(&config.platform_settings_defaults(), now).await?;

    let mut keys = ProviderKeys::new(&mut conn);
    if keys.list().await?.is_empty() && !config.provider_keys.is_empty() {
        for entry in &config.provider_keys {
            keys.create(
                &ProviderKeyCreateDBRequest {
                    display_name: entry.display_name.clone(),
                    secret_value: entry.secret_value.clone(),
                    is_active: entry.is_active,
                    daily_limit: entry.daily_limit,
                },
                now,
            )
            .await?;
        }
        tracing::info!(keys = config.provider_keys.len(), "seeded credential pool from configuration");
    }

    Ok(())
}
