//! Tiered pricing and credit conversion.
//!
//! Pure arithmetic over the configured rate tables: upstream token usage in,
//! USD cost out; USD cost in, platform credits out. No I/O, deterministic,
//! and safe to exercise exhaustively across tier boundaries.
//!
//! The one numeric contract that matters: price derivation and credit
//! conversion must select the tier from the *same* unit count at estimation
//! and at settlement, or the two will disagree near a tier boundary. The
//! orchestrator therefore feeds the actual total unit count into both
//! [`PricingEngine::raw_cost_usd`] and [`PricingEngine::credits_for_cost`].

use crate::config::PricingConfig;
use crate::errors::{Error, Result};
use crate::types::ModelKey;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;

/// A usage-volume bracket with its own per-1M-unit rates. `max_units: None`
/// marks the unbounded top tier.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceTier {
    pub max_units: Option<i64>,
    pub input_per_million: Decimal,
    pub output_per_million: Decimal,
}

#[derive(Debug, Clone)]
struct ModelTable {
    tiers: Vec<PriceTier>,
}

/// The pricing engine, built once from configuration.
#[derive(Debug, Clone)]
pub struct PricingEngine {
    models: HashMap<ModelKey, ModelTable>,
    default_model: ModelKey,
    default_context_units: i64,
}

impl PricingEngine {
    /// Validate the configured rate tables and build the engine.
    ///
    /// Tier lists must be non-empty, strictly ascending in their bounds, end
    /// in an unbounded tier, and carry non-negative rates. The default model
    /// must exist; it is the fallback table for unknown model keys.
    pub fn from_config(config: &PricingConfig) -> Result<Self> {
        if !config.models.contains_key(&config.default_model) {
            return Err(Error::BadRequest {
                message: format!("pricing.default_model {:?} has no rate table", config.default_model),
            });
        }
        if config.default_context_units < 1 {
            return Err(Error::BadRequest {
                message: "pricing.default_context_units must be >= 1".to_string(),
            });
        }

        let mut models = HashMap::new();
        for (model_key, table) in &config.models {
            let tiers: Vec<PriceTier> = table
                .tiers
                .iter()
                .map(|t| PriceTier {
                    max_units: t.max_units,
                    input_per_million: t.input_per_million,
                    output_per_million: t.output_per_million,
                })
                .collect();
            validate_tiers(model_key, &tiers)?;
            models.insert(model_key.clone(), ModelTable { tiers });
        }

        Ok(Self {
            models,
            default_model: config.default_model.clone(),
            default_context_units: config.default_context_units,
        })
    }

    /// Whether a model key has its own rate table (the caller-facing
    /// allow-list).
    pub fn is_known_model(&self, model_key: &str) -> bool {
        self.models.contains_key(model_key)
    }

    /// Configured model keys, for validation messages.
    pub fn model_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.models.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    fn table_for(&self, model_key: &str) -> &ModelTable {
        match self.models.get(model_key) {
            Some(table) => table,
            None => {
                tracing::warn!(model_key, default_model = %self.default_model, "unknown model key, falling back to default pricing");
                // Guaranteed present by from_config.
                &self.models[&self.default_model]
            }
        }
    }

    /// The pricing tier for a total unit volume: the first tier, in ascending
    /// bound order, whose bound is absent or covers the volume.
    pub fn tier_for(&self, model_key: &str, total_units: i64) -> &PriceTier {
        let table = self.table_for(model_key);
        table
            .tiers
            .iter()
            .find(|tier| tier.max_units.is_none_or(|max| total_units <= max))
            .expect("tier tables are validated to end in an unbounded tier")
    }

    /// Raw upstream cost in USD for actual usage, tier chosen by the total
    /// unit count.
    pub fn raw_cost_usd(&self, model_key: &str, input_units: i64, output_units: i64) -> Decimal {
        let tier = self.tier_for(model_key, input_units + output_units);
        let million = Decimal::from(1_000_000u32);
        Decimal::from(input_units) / million * tier.input_per_million
            + Decimal::from(output_units) / million * tier.output_per_million
    }

    /// Convert a USD cost into platform credits.
    ///
    /// The user-facing price per 1K units is the mean of the tier's input and
    /// output per-1K rates, scaled by `(1 + margin)`; the tier is selected by
    /// `context_units_estimate` (engine default when absent). Rounding is
    /// always up: the platform never under-charges.
    pub fn credits_for_cost(
        &self,
        model_key: &str,
        cost_usd: Decimal,
        margin: Decimal,
        context_units_estimate: Option<i64>,
    ) -> i64 {
        if cost_usd <= Decimal::ZERO {
            return 0;
        }
        let estimate = context_units_estimate.unwrap_or(self.default_context_units);
        let tier = self.tier_for(model_key, estimate);

        let blended_per_1k =
            (tier.input_per_million + tier.output_per_million) / Decimal::from(2_000u32) * (Decimal::ONE + margin);
        if blended_per_1k <= Decimal::ZERO {
            return 0;
        }

        (cost_usd / blended_per_1k * Decimal::from(1_000u32))
            .ceil()
            .to_i64()
            .unwrap_or(i64::MAX)
    }
}

fn validate_tiers(model_key: &str, tiers: &[PriceTier]) -> Result<()> {
    if tiers.is_empty() {
        return Err(Error::BadRequest {
            message: format!("pricing.models.{model_key}: at least one tier is required"),
        });
    }
    if tiers.last().is_some_and(|t| t.max_units.is_some()) {
        return Err(Error::BadRequest {
            message: format!("pricing.models.{model_key}: the last tier must be unbounded"),
        });
    }
    let mut previous: Option<i64> = None;
    for tier in tiers {
        if tier.input_per_million < Decimal::ZERO || tier.output_per_million < Decimal::ZERO {
            return Err(Error::BadRequest {
                message: format!("pricing.models.{model_key}: rates must be >= 0"),
            });
        }
        if let Some(max) = tier.max_units {
            if max < 1 {
                return Err(Error::BadRequest {
                    message: format!("pricing.models.{model_key}: tier bounds must be >= 1"),
                });
            }
            if previous.is_some_and(|p| max <= p) {
                return Err(Error::BadRequest {
                    message: format!("pricing.models.{model_key}: tier bounds must be strictly ascending"),
                });
            }
            previous = Some(max);
        }
    }
    // Only the final tier may be unbounded.
    if tiers[..tiers.len() - 1].iter().any(|t| t.max_units.is_none()) {
        return Err(Error::BadRequest {
            message: format!("pricing.models.{model_key}: only the last tier may be unbounded"),
        });
    }
    Ok(())
}
