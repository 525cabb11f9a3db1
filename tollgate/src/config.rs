//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides. The file path defaults to `config.yaml` but can be specified
//! via the `-f` flag or the `TOLLGATE_CONFIG` environment variable.
//!
//! ## Loading Priority
//!
//! Sources are merged in order, later sources overriding earlier ones:
//!
//! 1. **YAML config file** - base configuration (default: `config.yaml`)
//! 2. **Environment variables** - variables prefixed with `TOLLGATE_`
//!
//! Nested values use double underscores, e.g.
//! `TOLLGATE_CREDITS__INITIAL_GRANT_CREDITS=2000`.
//!
//! The file supplies *bootstrap* values only: the rate-limit thresholds,
//! margin, grant sizes and the credential seed list are written into the
//! persisted platform-settings aggregate on first startup, and admin
//! operations mutate that aggregate from then on.

use clap::Parser;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::db::models::settings::{PlatformSettings, RotationStrategy};
use crate::errors::{Error, Result};

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "TOLLGATE_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting anything.
    /// Useful for CI/CD pipelines to catch config errors before deployment.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// SQLite database location and pool sizing
    pub database: DatabaseConfig,
    /// Credit system bootstrap values
    pub credits: CreditsConfig,
    /// Rate-limit threshold bootstrap values
    pub rate_limits: RateLimitsConfig,
    /// Per-model tiered rate tables
    pub pricing: PricingConfig,
    /// Credential pool seeded on first startup if the pool is empty
    pub provider_keys: Vec<ProviderKeySeed>,
    /// Upstream provider call behavior
    pub upstream: UpstreamConfig,
}

/// Database location and connection pool parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file (created if missing)
    pub path: PathBuf,
    /// How long a write waits for the database lock before failing (seconds)
    pub busy_timeout_secs: u64,
    /// Connection pool settings
    pub pool: PoolSettings,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tollgate.db"),
            busy_timeout_secs: 5,
            pool: PoolSettings::default(),
        }
    }
}

/// Individual pool configuration with the SQLx parameters that matter for
/// SQLite: reads fan out across connections, writes serialize on the
/// database's single writer.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Minimum number of idle connections to maintain
    pub min_connections: u32,
    /// Maximum time to wait for a connection (seconds)
    pub acquire_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 0,
            acquire_timeout_secs: 30,
        }
    }
}

/// Credit system bootstrap configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CreditsConfig {
    /// Credits granted to every newly provisioned account
    pub initial_grant_credits: i64,
    /// Length of the trial window for new accounts; 0 disables trials
    pub trial_period_days: i64,
    /// Minimum balance required before a metered call is attempted
    pub minimum_balance_for_call: i64,
    /// Fractional markup over raw upstream cost, in [0, 1]
    pub margin: Decimal,
    /// Default page size for transaction listings
    pub default_transaction_page_size: i64,
    /// Hard cap on transaction listing page size
    pub max_transaction_page_size: i64,
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            initial_grant_credits: 2_000,
            trial_period_days: 14,
            minimum_balance_for_call: 10,
            margin: Decimal::new(45, 2), // 0.45
            default_transaction_page_size: 50,
            max_transaction_page_size: 500,
        }
    }
}

/// Rate-limit threshold bootstrap configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitsConfig {
    /// Master switch; when false every admission check allows
    pub enabled: bool,
    /// Per-account requests allowed in a sliding 60s window
    pub per_account_per_minute: i64,
    /// Per-account requests allowed per UTC calendar day
    pub per_account_per_day: i64,
    /// Requests allowed platform-wide in a sliding 60s window
    pub global_per_minute: i64,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_account_per_minute: 10,
            per_account_per_day: 500,
            global_per_minute: 300,
        }
    }
}

/// Per-model rate tables.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PricingConfig {
    /// Fallback table for unknown model keys; must exist in `models`
    pub default_model: String,
    /// Tier-selection input assumed when a caller supplies no estimate
    pub default_context_units: i64,
    /// Rate table per model key; the key set is the caller-facing allow-list
    pub models: HashMap<String, ModelPricingConfig>,
}

/// Tier list for one model, ascending by bound, last tier unbounded.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModelPricingConfig {
    pub tiers: Vec<TierConfig>,
}

/// One pricing tier.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TierConfig {
    /// Upper unit bound, inclusive; absent on the top tier
    pub max_units: Option<i64>,
    /// USD per 1M input units
    pub input_per_million: Decimal,
    /// USD per 1M output units
    pub output_per_million: Decimal,
}

/// Credential seeded into the pool on first startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderKeySeed {
    pub display_name: String,
    pub secret_value: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub daily_limit: Option<i64>,
}

fn default_true() -> bool {
    true
}

/// Upstream provider call behavior.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Hard deadline on one upstream call, so a hung call cannot hold a
    /// credential slot indefinitely
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self { timeout_secs: 120 }
    }
}

impl Config {
    /// Load configuration from the file named in `args` plus environment
    /// overrides, then validate it.
    pub fn load(args: &Args) -> Result<Self> {
        let config: Config = Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("TOLLGATE_").split("__"))
            .extract()
            .map_err(|e| Error::BadRequest {
                message: format!("configuration error: {e}"),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Check the numeric contracts the components rely on.
    pub fn validate(&self) -> Result<()> {
        if self.credits.margin < Decimal::ZERO || self.credits.margin > Decimal::ONE {
            return Err(Error::BadRequest {
                message: "credits.margin must be within [0, 1]".to_string(),
            });
        }
        if self.credits.initial_grant_credits < 0 {
            return Err(Error::BadRequest {
                message: "credits.initial_grant_credits must be >= 0".to_string(),
            });
        }
        if self.credits.trial_period_days < 0 {
            return Err(Error::BadRequest {
                message: "credits.trial_period_days must be >= 0".to_string(),
            });
        }
        if self.credits.minimum_balance_for_call < 0 {
            return Err(Error::BadRequest {
                message: "credits.minimum_balance_for_call must be >= 0".to_string(),
            });
        }
        if self.credits.default_transaction_page_size < 1
            || self.credits.max_transaction_page_size < self.credits.default_transaction_page_size
        {
            return Err(Error::BadRequest {
                message: "credits transaction page sizes must be >= 1 and max >= default".to_string(),
            });
        }
        for (name, value) in [
            ("rate_limits.per_account_per_minute", self.rate_limits.per_account_per_minute),
            ("rate_limits.per_account_per_day", self.rate_limits.per_account_per_day),
            ("rate_limits.global_per_minute", self.rate_limits.global_per_minute),
        ] {
            if value < 1 {
                return Err(Error::BadRequest {
                    message: format!("{name} must be >= 1"),
                });
            }
        }
        if self.upstream.timeout_secs < 1 {
            return Err(Error::BadRequest {
                message: "upstream.timeout_secs must be >= 1".to_string(),
            });
        }
        for seed in &self.provider_keys {
            if seed.display_name.is_empty() || seed.secret_value.is_empty() {
                return Err(Error::BadRequest {
                    message: "provider_keys entries need a display_name and a secret_value".to_string(),
                });
            }
            if seed.daily_limit.is_some_and(|l| l < 1) {
                return Err(Error::BadRequest {
                    message: "provider_keys.daily_limit must be >= 1 when present".to_string(),
                });
            }
        }
        Ok(())
    }

    /// The settings aggregate seeded into the database on first startup.
    pub fn platform_settings_defaults(&self) -> PlatformSettings {
        PlatformSettings {
            version: 1,
            rotation_strategy: RotationStrategy::RoundRobin,
            current_key_index: 0,
            margin: self.credits.margin,
            initial_grant_credits: self.credits.initial_grant_credits,
            trial_period_days: self.credits.trial_period_days,
            minimum_balance_for_call: self.credits.minimum_balance_for_call,
            rate_limiting_enabled: self.rate_limits.enabled,
            per_account_per_minute: self.rate_limits.per_account_per_minute,
            per_account_per_day: self.rate_limits.per_account_per_day,
            global_per_minute: self.rate_limits.global_per_minute,
            updated_at: chrono::Utc::now(),
        }
    }
}
