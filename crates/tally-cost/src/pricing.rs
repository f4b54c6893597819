//! Pricing table and cost calculation.
//!
//! Rates are USD per million tokens for four categories: input, output,
//! cache write and cache read. A turn is priced once, at ingestion, with
//! whatever table the engine holds at that moment.

use crate::models::TokenCounts;
use std::collections::HashMap;
use tally_config::{FallbackPolicy, PricingConfig};
use thiserror::Error;

/// Model pricing in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelRates {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub cache_write_per_million: f64,
    pub cache_read_per_million: f64,
}

impl ModelRates {
    pub fn new(input: f64, output: f64) -> Self {
        Self {
            input_per_million: input,
            output_per_million: output,
            // Anthropic's cache multipliers: writes 1.25x input, reads 0.1x input
            cache_write_per_million: input * 1.25,
            cache_read_per_million: input * 0.1,
        }
    }

    pub fn with_cache(mut self, write: f64, read: f64) -> Self {
        self.cache_write_per_million = write;
        self.cache_read_per_million = read;
        self
    }

    /// Rates that charge nothing.
    pub fn zero() -> Self {
        Self::new(0.0, 0.0).with_cache(0.0, 0.0)
    }

    /// Calculate cost from token counts.
    pub fn calculate_cost(&self, tokens: &TokenCounts) -> f64 {
        (tokens.input_tokens as f64 * self.input_per_million
            + tokens.output_tokens as f64 * self.output_per_million
            + tokens.cache_write_tokens as f64 * self.cache_write_per_million
            + tokens.cache_read_tokens as f64 * self.cache_read_per_million)
            / 1_000_000.0
    }
}

/// Sonnet-class rates applied to models missing from the table.
pub fn default_fallback_rates() -> ModelRates {
    ModelRates::new(3.0, 15.0).with_cache(3.75, 0.30)
}

/// A model had no pricing entry; fallback rates were applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
#[error("no pricing for model '{model}', applied fallback rates")]
pub struct UnknownModelWarning {
    pub model: String,
}

/// Result of pricing one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct PricedCost {
    pub cost_usd: f64,
    pub warning: Option<UnknownModelWarning>,
}

/// Mapping from model id (or id prefix) to rates.
#[derive(Debug, Clone)]
pub struct PricingTable {
    rates: HashMap<String, ModelRates>,
    /// `None` means unknown models cost nothing
    fallback: Option<ModelRates>,
}

impl PricingTable {
    /// Built-in Claude pricing.
    pub fn builtin() -> Self {
        let opus = ModelRates::new(15.0, 75.0).with_cache(18.75, 1.50);
        let sonnet = ModelRates::new(3.0, 15.0).with_cache(3.75, 0.30);
        let haiku = ModelRates::new(0.80, 4.0).with_cache(1.0, 0.08);
        let haiku_3 = ModelRates::new(0.25, 1.25).with_cache(0.30, 0.03);

        let mut rates = HashMap::new();
        for model in [
            "claude-opus-4-6",
            "claude-opus-4-5",
            "claude-opus-4-1",
            "claude-opus-4",
            "claude-3-opus",
        ] {
            rates.insert(model.to_string(), opus);
        }
        for model in [
            "claude-sonnet-4-6",
            "claude-sonnet-4-5",
            "claude-sonnet-4",
            "claude-3-7-sonnet",
            "claude-3-5-sonnet",
        ] {
            rates.insert(model.to_string(), sonnet);
        }
        for model in ["claude-haiku-4-5", "claude-3-5-haiku"] {
            rates.insert(model.to_string(), haiku);
        }
        rates.insert("claude-3-haiku".to_string(), haiku_3);

        Self {
            rates,
            fallback: Some(default_fallback_rates()),
        }
    }

    /// A table with no entries.
    pub fn empty(fallback: Option<ModelRates>) -> Self {
        Self {
            rates: HashMap::new(),
            fallback,
        }
    }

    /// Built-in table with config overrides merged on top.
    pub fn from_config(config: &PricingConfig) -> Self {
        let mut table = Self::builtin();
        for (model, r) in &config.models {
            table.set_rates(
                model,
                ModelRates::new(r.input, r.output).with_cache(r.cache_write, r.cache_read),
            );
        }
        table.with_fallback(match config.fallback {
            FallbackPolicy::Default => Some(default_fallback_rates()),
            FallbackPolicy::Zero => None,
        })
    }

    /// Add or update pricing for a model.
    pub fn set_rates(&mut self, model: &str, rates: ModelRates) {
        self.rates.insert(model.to_string(), rates);
    }

    /// Replace the rates charged for unknown models (`None` charges nothing).
    pub fn with_fallback(mut self, fallback: Option<ModelRates>) -> Self {
        self.fallback = fallback;
        self
    }

    /// Find rates for a model: exact id first, then the longest key that
    /// prefixes the id (so dated ids like `claude-sonnet-4-5-20250929` match).
    pub fn lookup(&self, model: &str) -> Option<&ModelRates> {
        if let Some(rates) = self.rates.get(model) {
            return Some(rates);
        }
        self.rates
            .iter()
            .filter(|(key, _)| model.starts_with(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, rates)| rates)
    }

    /// Price a turn. Unknown models are priced at the fallback (or zero)
    /// and flagged with an [`UnknownModelWarning`].
    pub fn price(&self, model: &str, tokens: &TokenCounts) -> PricedCost {
        match self.lookup(model) {
            Some(rates) => PricedCost {
                cost_usd: rates.calculate_cost(tokens),
                warning: None,
            },
            None => PricedCost {
                cost_usd: self
                    .fallback
                    .map(|rates| rates.calculate_cost(tokens))
                    .unwrap_or(0.0),
                warning: Some(UnknownModelWarning {
                    model: model.to_string(),
                }),
            },
        }
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_config::RateConfig;

    const EPS: f64 = 1e-9;

    #[test]
    fn test_input_output_formula() {
        let table = PricingTable::builtin();
        let priced = table.price("claude-sonnet-4-5", &TokenCounts::new(100, 50, 0, 0));

        // 100 * 3 / 1e6 + 50 * 15 / 1e6
        assert!((priced.cost_usd - 0.00075).abs() < EPS);
        assert!(priced.warning.is_none());
    }

    #[test]
    fn test_cache_read_discount() {
        let table = PricingTable::builtin();
        let priced = table.price("claude-sonnet-4-6", &TokenCounts::new(0, 0, 0, 1_000_000));
        assert!((priced.cost_usd - 0.30).abs() < EPS);
    }

    #[test]
    fn test_all_four_categories() {
        let rates = ModelRates::new(15.0, 75.0).with_cache(18.75, 1.50);
        let cost = rates.calculate_cost(&TokenCounts::new(1_000_000, 1_000_000, 1_000_000, 1_000_000));
        assert!((cost - 110.25).abs() < EPS);
    }

    #[test]
    fn test_dated_model_uses_longest_prefix() {
        let mut table = PricingTable::empty(None);
        table.set_rates("claude-opus-4", ModelRates::new(15.0, 75.0));
        table.set_rates("claude-opus-4-5", ModelRates::new(5.0, 25.0));

        let rates = table.lookup("claude-opus-4-5-20251101").unwrap();
        assert_eq!(rates.input_per_million, 5.0);

        let rates = table.lookup("claude-opus-4-20250514").unwrap();
        assert_eq!(rates.input_per_million, 15.0);
    }

    #[test]
    fn test_unknown_model_uses_fallback_and_warns() {
        let table = PricingTable::builtin();
        let priced = table.price("gpt-9-turbo", &TokenCounts::new(1_000_000, 0, 0, 0));

        assert!((priced.cost_usd - 3.0).abs() < EPS);
        assert_eq!(
            priced.warning,
            Some(UnknownModelWarning {
                model: "gpt-9-turbo".into()
            })
        );
    }

    #[test]
    fn test_zero_fallback_policy() {
        let config = PricingConfig {
            fallback: FallbackPolicy::Zero,
            ..Default::default()
        };
        let table = PricingTable::from_config(&config);
        let priced = table.price("<synthetic>", &TokenCounts::new(500, 500, 0, 0));

        assert_eq!(priced.cost_usd, 0.0);
        assert!(priced.warning.is_some());
    }

    #[test]
    fn test_config_overrides_builtin() {
        let mut config = PricingConfig::default();
        config.models.insert(
            "claude-sonnet-4-5".into(),
            RateConfig {
                input: 6.0,
                output: 30.0,
                cache_write: 7.5,
                cache_read: 0.6,
            },
        );
        let table = PricingTable::from_config(&config);
        let priced = table.price("claude-sonnet-4-5-20250929", &TokenCounts::new(1_000_000, 0, 0, 0));
        assert!((priced.cost_usd - 6.0).abs() < EPS);

        // Untouched entries keep their built-in rates
        let opus = table.lookup("claude-opus-4-6").unwrap();
        assert_eq!(opus.input_per_million, 15.0);
    }
}
