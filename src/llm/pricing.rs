//! Per-model price table for cost accounting.
//!
//! This is process-wide, read-only state initialized once at startup: a
//! built-in default table, optionally overridden (never mutated afterward)
//! by the `LLM_QUEST_PRICES_JSON` environment variable. Lookup is pure.

use std::{collections::HashMap, sync::LazyLock};

use crate::{llm::TokenUsage, prelude::*};

/// Per-token prices for one model, in US dollars.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ModelPrice {
    pub input_cost_per_token: f64,
    pub output_cost_per_token: f64,
}

impl ModelPrice {
    pub fn cost_for(&self, usage: &TokenUsage) -> f64 {
        usage.prompt_tokens as f64 * self.input_cost_per_token
            + usage.completion_tokens as f64 * self.output_cost_per_token
    }
}

fn default_prices() -> HashMap<String, ModelPrice> {
    // Representative, intentionally approximate prices for well-known
    // models. Anything not listed here falls back to `None` (no cost
    // estimate), which is always safe -- we never guess at a price.
    [
        (
            "gpt-4o-mini",
            ModelPrice {
                input_cost_per_token: 0.15 / 1_000_000.0,
                output_cost_per_token: 0.60 / 1_000_000.0,
            },
        ),
        (
            "gpt-4o",
            ModelPrice {
                input_cost_per_token: 2.50 / 1_000_000.0,
                output_cost_per_token: 10.00 / 1_000_000.0,
            },
        ),
        (
            "claude-3-5-sonnet",
            ModelPrice {
                input_cost_per_token: 3.00 / 1_000_000.0,
                output_cost_per_token: 15.00 / 1_000_000.0,
            },
        ),
        (
            "claude-3-5-haiku",
            ModelPrice {
                input_cost_per_token: 0.80 / 1_000_000.0,
                output_cost_per_token: 4.00 / 1_000_000.0,
            },
        ),
        (
            "gemini-1.5-flash",
            ModelPrice {
                input_cost_per_token: 0.075 / 1_000_000.0,
                output_cost_per_token: 0.30 / 1_000_000.0,
            },
        ),
        (
            "deepseek-chat",
            ModelPrice {
                input_cost_per_token: 0.27 / 1_000_000.0,
                output_cost_per_token: 1.10 / 1_000_000.0,
            },
        ),
    ]
    .into_iter()
    .map(|(model, price)| (model.to_owned(), price))
    .collect()
}

fn load_price_overrides() -> HashMap<String, ModelPrice> {
    let Ok(raw) = std::env::var("LLM_QUEST_PRICES_JSON") else {
        return HashMap::new();
    };
    match serde_json::from_str::<HashMap<String, ModelPrice>>(&raw) {
        Ok(overrides) => overrides,
        Err(e) => {
            warn!("ignoring malformed LLM_QUEST_PRICES_JSON: {e}");
            HashMap::new()
        }
    }
}

fn build_price_table() -> HashMap<String, ModelPrice> {
    let mut table = default_prices();
    table.extend(load_price_overrides());
    table
}

static PRICE_TABLE: LazyLock<HashMap<String, ModelPrice>> = LazyLock::new(build_price_table);

/// Look up the price for a (bare, provider-less) model name.
pub fn price_for_model(model: &str) -> Option<ModelPrice> {
    PRICE_TABLE.get(model).copied()
}

/// Estimate the cost in USD of a call, if we have pricing data for the
/// model. Returns `None` rather than guessing when the model is unknown.
pub fn estimate_cost(model: &str, usage: &TokenUsage) -> Option<f64> {
    price_for_model(model).map(|price| price.cost_for(usage))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_has_a_price() {
        let price = price_for_model("gpt-4o-mini").expect("known model");
        assert!(price.input_cost_per_token > 0.0);
    }

    #[test]
    fn unknown_model_has_no_price() {
        assert!(price_for_model("not-a-real-model-xyz").is_none());
    }

    #[test]
    fn cost_is_proportional_to_usage() {
        let price = ModelPrice {
            input_cost_per_token: 0.01,
            output_cost_per_token: 0.02,
        };
        let usage = TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 50,
        };
        assert_eq!(price.cost_for(&usage), 100.0 * 0.01 + 50.0 * 0.02);
    }
}
