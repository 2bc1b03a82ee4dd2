//! Per-model token prices used to estimate call cost.

use std::collections::HashMap;

use serde::Deserialize;

use crate::agent::metrics::TokenUsage;

/// USD per one million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ModelPrice {
    pub prompt_per_million: f64,
    pub completion_per_million: f64,
}

impl ModelPrice {
    pub const fn new(prompt_per_million: f64, completion_per_million: f64) -> Self {
        Self {
            prompt_per_million,
            completion_per_million,
        }
    }

    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (usage.prompt as f64 * self.prompt_per_million
            + usage.completion as f64 * self.completion_per_million)
            / 1_000_000.0
    }
}

/// Model name -> price, with a fallback for unknown models.
#[derive(Debug, Clone)]
pub struct PricingTable {
    prices: HashMap<String, ModelPrice>,
    fallback: ModelPrice,
}

impl Default for PricingTable {
    fn default() -> Self {
        let prices = [
            ("gpt-4o-mini", ModelPrice::new(0.15, 0.60)),
            ("gpt-4o", ModelPrice::new(2.50, 10.00)),
            ("gpt-4-turbo-preview", ModelPrice::new(10.00, 30.00)),
            ("gpt-4", ModelPrice::new(30.00, 60.00)),
            ("gpt-3.5-turbo", ModelPrice::new(0.50, 1.50)),
        ]
        .into_iter()
        .map(|(name, price)| (name.to_string(), price))
        .collect();

        Self {
            prices,
            fallback: ModelPrice::new(30.00, 60.00),
        }
    }
}

impl PricingTable {
    /// Add or replace entries; later entries win.
    pub fn with_overrides(mut self, overrides: &HashMap<String, ModelPrice>) -> Self {
        for (model, price) in overrides {
            self.prices.insert(model.clone(), *price);
        }
        self
    }

    pub fn price_for(&self, model: &str) -> ModelPrice {
        self.prices.get(model).copied().unwrap_or(self.fallback)
    }

    pub fn cost(&self, model: &str, usage: &TokenUsage) -> f64 {
        self.price_for(model).cost(usage)
    }
}
