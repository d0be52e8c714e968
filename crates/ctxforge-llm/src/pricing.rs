//! Per-provider/per-model token pricing.
//!
//! Rates are data: a builtin table of common models, overlaid by any
//! `[[pricing]]` rows from config, with `[pricing_default]` for the rest.

use std::collections::HashMap;

use ctxforge_core::config::{AppConfig, PriceDefault, PriceEntry};
use ctxforge_core::types::Usage;

/// USD per 1,000 tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rate {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl Rate {
    pub const fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    pub fn cost(&self, usage: &Usage) -> f64 {
        (usage.prompt_tokens as f64 / 1000.0) * self.input_per_1k
            + (usage.completion_tokens as f64 / 1000.0) * self.output_per_1k
    }
}

const BUILTIN_RATES: &[(&str, &str, Rate)] = &[
    ("openai", "gpt-4o", Rate::new(0.0025, 0.01)),
    ("openai", "gpt-4o-mini", Rate::new(0.00015, 0.0006)),
    ("openai", "gpt-4-turbo", Rate::new(0.01, 0.03)),
    ("openai", "gpt-4", Rate::new(0.03, 0.06)),
    ("openai", "gpt-3.5-turbo", Rate::new(0.0005, 0.0015)),
    ("anthropic", "claude-3-5-sonnet-latest", Rate::new(0.003, 0.015)),
    ("anthropic", "claude-3-5-haiku-latest", Rate::new(0.0008, 0.004)),
    ("anthropic", "claude-3-opus-latest", Rate::new(0.015, 0.075)),
    ("anthropic", "claude-3-haiku-20240307", Rate::new(0.00025, 0.00125)),
];

#[derive(Debug, Clone)]
pub struct RateTable {
    rates: HashMap<(String, String), Rate>,
    default: Rate,
}

impl Default for RateTable {
    fn default() -> Self {
        Self::builtin(PriceDefault::default())
    }
}

impl RateTable {
    /// Builtin rows only.
    pub fn builtin(default: PriceDefault) -> Self {
        let rates = BUILTIN_RATES
            .iter()
            .map(|(p, m, r)| ((p.to_string(), m.to_string()), *r))
            .collect();
        Self {
            rates,
            default: Rate::new(default.input_per_1k, default.output_per_1k),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let mut table = Self::builtin(config.pricing_default);
        table.extend(&config.pricing);
        table
    }

    /// Add or replace rows.
    pub fn extend(&mut self, entries: &[PriceEntry]) {
        for e in entries {
            self.rates.insert(
                (e.provider.clone(), e.model.clone()),
                Rate::new(e.input_per_1k, e.output_per_1k),
            );
        }
    }

    /// Exact (provider, model) match, then any provider with that model,
    /// then the default pair.
    pub fn rate(&self, provider: &str, model: &str) -> Rate {
        if let Some(rate) = self.rates.get(&(provider.to_string(), model.to_string())) {
            return *rate;
        }
        let mut by_model: Vec<(&(String, String), &Rate)> =
            self.rates.iter().filter(|((_, m), _)| m == model).collect();
        by_model.sort_by(|a, b| a.0.cmp(b.0));
        by_model
            .first()
            .map(|(_, r)| **r)
            .unwrap_or(self.default)
    }

    pub fn cost(&self, provider: &str, model: &str, usage: &Usage) -> f64 {
        self.rate(provider, model).cost(usage)
    }

    pub fn default_rate(&self) -> Rate {
        self.default
    }
}
