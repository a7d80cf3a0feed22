use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::provider::ProviderId;

/// USD price per one million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPricing {
    pub input_per_1m: Decimal,
    pub output_per_1m: Decimal,
}

impl ModelPricing {
    fn from_cents(input: i64, output: i64) -> Self {
        Self {
            input_per_1m: Decimal::new(input, 2),
            output_per_1m: Decimal::new(output, 2),
        }
    }

    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> Decimal {
        let million = Decimal::from(1_000_000);
        let input = Decimal::from(input_tokens) * self.input_per_1m / million;
        let output = Decimal::from(output_tokens) * self.output_per_1m / million;
        input + output
    }
}

// (model, input cents per 1M, output cents per 1M)
const ANTHROPIC_PRICES: &[(&str, i64, i64)] = &[
    ("claude-3-5-sonnet-20241022", 300, 1500),
    ("claude-3-5-haiku-20241022", 80, 400),
    ("claude-3-opus-20240229", 1500, 7500),
    ("claude-3-haiku-20240307", 25, 125),
];

const OPENAI_PRICES: &[(&str, i64, i64)] = &[
    ("gpt-4o", 250, 1000),
    ("gpt-4o-mini", 15, 60),
    ("gpt-4-turbo", 1000, 3000),
    ("gpt-3.5-turbo", 50, 150),
];

fn table(provider: ProviderId) -> &'static [(&'static str, i64, i64)] {
    match provider {
        ProviderId::Anthropic => ANTHROPIC_PRICES,
        ProviderId::OpenAI => OPENAI_PRICES,
    }
}

pub fn default_model(provider: ProviderId) -> &'static str {
    match provider {
        ProviderId::Anthropic => "claude-3-5-sonnet-20241022",
        ProviderId::OpenAI => "gpt-4o-mini",
    }
}

/// Exact match first, then the longest listed name that prefixes a dated
/// snapshot (`gpt-4o-mini-2024-07-18` prices as `gpt-4o-mini`).
pub fn lookup(provider: ProviderId, model: &str) -> Option<ModelPricing> {
    let prices = table(provider);
    prices
        .iter()
        .find(|(name, _, _)| *name == model)
        .or_else(|| {
            prices
                .iter()
                .filter(|(name, _, _)| {
                    model
                        .strip_prefix(name)
                        .is_some_and(|rest| rest.starts_with('-'))
                })
                .max_by_key(|(name, _, _)| name.len())
        })
        .map(|(_, input, output)| ModelPricing::from_cents(*input, *output))
}

pub fn models_for(provider: ProviderId) -> Vec<String> {
    table(provider).iter().map(|(name, _, _)| name.to_string()).collect()
}

/// Price-table lookup. Unknown models cost nothing rather than failing.
pub fn calculate_cost(
    provider: ProviderId,
    model: &str,
    input_tokens: u32,
    output_tokens: u32,
) -> Decimal {
    match lookup(provider, model) {
        Some(pricing) => pricing.cost(input_tokens, output_tokens),
        None => {
            warn!("Unknown model for cost calculation: {}:{}", provider, model);
            Decimal::ZERO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_tokens_cost_nothing() {
        for provider in ProviderId::ALL {
            for model in models_for(provider) {
                assert_eq!(calculate_cost(provider, &model, 0, 0), Decimal::ZERO);
            }
        }
    }

    #[test]
    fn test_unknown_model_costs_zero() {
        assert_eq!(calculate_cost(ProviderId::OpenAI, "gpt-99", 1_000, 1_000), Decimal::ZERO);
        assert_eq!(calculate_cost(ProviderId::Anthropic, "", u32::MAX, u32::MAX), Decimal::ZERO);
    }

    #[test]
    fn test_cost_calculation() {
        // 1M input at $3 + 1M output at $15
        let cost = calculate_cost(ProviderId::Anthropic, "claude-3-5-sonnet-20241022", 1_000_000, 1_000_000);
        assert_eq!(cost, Decimal::from(18));

        let cost = calculate_cost(ProviderId::OpenAI, "gpt-4o-mini", 1_000, 500);
        assert_eq!(cost, Decimal::new(45, 5));
    }

    #[test]
    fn test_dated_snapshot_uses_base_price() {
        assert_eq!(
            lookup(ProviderId::OpenAI, "gpt-4o-mini-2024-07-18"),
            lookup(ProviderId::OpenAI, "gpt-4o-mini")
        );
        assert_eq!(
            lookup(ProviderId::OpenAI, "gpt-4o-2024-08-06"),
            lookup(ProviderId::OpenAI, "gpt-4o")
        );
        assert!(lookup(ProviderId::OpenAI, "gpt-4ox").is_none());
    }

    #[test]
    fn test_default_models_are_priced() {
        for provider in ProviderId::ALL {
            assert!(lookup(provider, default_model(provider)).is_some());
        }
    }
}
