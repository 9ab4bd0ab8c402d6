//! Model prices in USD per one million tokens.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::models::{ModelPrice, PricingConfig};

const BUILTIN: &[(&str, f64, f64)] = &[
    ("gpt-4o", 2.50, 10.00),
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4-turbo", 10.00, 30.00),
    ("claude-3-5-sonnet", 3.00, 15.00),
    ("claude-3-haiku", 0.25, 1.25),
    ("meta-llama/llama-3.2-3b-instruct", 0.06, 0.06),
    ("meta-llama/llama-3-8b-instruct", 0.18, 0.18),
    ("mistralai/mistral-7b-instruct", 0.20, 0.20),
    ("text-embedding-3-small", 0.02, 0.0),
    ("text-embedding-3-large", 0.13, 0.0),
];

/// Pricing lookup result for reports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceInfo {
    pub input: f64,
    pub output: f64,
    pub known: bool,
}

#[derive(Debug, Clone)]
pub struct PricingTable {
    prices: BTreeMap<String, ModelPrice>,
    fallback: ModelPrice,
}

impl PricingTable {
    pub fn builtin() -> Self {
        Self::from_config(&PricingConfig::default())
    }

    /// Built-in prices with configured entries layered on top.
    pub fn from_config(config: &PricingConfig) -> Self {
        let mut prices: BTreeMap<String, ModelPrice> = BUILTIN
            .iter()
            .map(|&(model, input, output)| (model.to_string(), ModelPrice { input, output }))
            .collect();
        prices.extend(config.models.iter().map(|(k, v)| (k.to_lowercase(), *v)));

        let fallback = config.fallback.unwrap_or_else(|| most_expensive(&prices));
        Self { prices, fallback }
    }

    /// Exact id first, then the id without its `vendor/` prefix.
    fn lookup(&self, model: &str) -> Option<ModelPrice> {
        let model = model.trim().to_lowercase();
        if let Some(price) = self.prices.get(&model) {
            return Some(*price);
        }
        model
            .rsplit_once('/')
            .and_then(|(_, name)| self.prices.get(name))
            .copied()
    }

    pub fn info(&self, model: &str) -> PriceInfo {
        match self.lookup(model) {
            Some(p) => PriceInfo {
                input: p.input,
                output: p.output,
                known: true,
            },
            None => PriceInfo {
                input: self.fallback.input,
                output: self.fallback.output,
                known: false,
            },
        }
    }

    /// Cost of one call. Unknown models are charged the fallback price.
    pub fn cost(&self, model: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        let price = self.lookup(model).unwrap_or_else(|| {
            tracing::warn!(model, "unknown model for pricing, charging fallback price");
            self.fallback
        });
        (prompt_tokens as f64 / 1_000_000.0) * price.input
            + (completion_tokens as f64 / 1_000_000.0) * price.output
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::builtin()
    }
}

fn most_expensive(prices: &BTreeMap<String, ModelPrice>) -> ModelPrice {
    prices
        .values()
        .copied()
        .max_by(|a, b| (a.input + a.output).total_cmp(&(b.input + b.output)))
        .unwrap_or(ModelPrice {
            input: 0.0,
            output: 0.0,
        })
}
