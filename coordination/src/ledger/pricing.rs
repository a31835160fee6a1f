//! Static model price table for cost estimation.

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

const fn price(input_per_million: f64, output_per_million: f64) -> ModelPrice {
    ModelPrice {
        input_per_million,
        output_per_million,
    }
}

/// Known models. Dated variants (`gpt-4o-2024-08-06`) resolve through the
/// longest matching prefix, so `gpt-4o-mini` must not be shadowed by `gpt-4o`.
const PRICES: &[(&str, ModelPrice)] = &[
    ("gpt-4o", price(2.50, 10.00)),
    ("gpt-4o-mini", price(0.15, 0.60)),
    ("gpt-4.1", price(2.00, 8.00)),
    ("gpt-4.1-mini", price(0.40, 1.60)),
    ("gpt-4.1-nano", price(0.10, 0.40)),
    ("o3-mini", price(1.10, 4.40)),
    ("claude-3-5-sonnet", price(3.00, 15.00)),
    ("claude-3-5-haiku", price(0.80, 4.00)),
    ("claude-3-opus", price(15.00, 75.00)),
];

/// Strip a provider prefix: `openai/gpt-4o` → `gpt-4o`.
fn normalize(model: &str) -> &str {
    model.rsplit('/').next().unwrap_or(model).trim()
}

/// Price for `model`, if known.
pub fn price_for(model: &str) -> Option<ModelPrice> {
    let model = normalize(model);
    PRICES
        .iter()
        .filter(|(name, _)| model.starts_with(name))
        .max_by_key(|(name, _)| name.len())
        .map(|(_, price)| *price)
}

/// Estimated cost in USD. Unpriced models cost zero.
pub fn estimate_cost_usd(model: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
    match price_for(model) {
        Some(p) => {
            (prompt_tokens as f64 * p.input_per_million
                + completion_tokens as f64 * p.output_per_million)
                / 1_000_000.0
        }
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_prefix_wins() {
        assert_eq!(price_for("gpt-4o-mini-2024-07-18"), Some(price(0.15, 0.60)));
        assert_eq!(price_for("gpt-4o-2024-08-06"), Some(price(2.50, 10.00)));
    }

    #[test]
    fn test_provider_prefix_stripped() {
        assert_eq!(price_for("openai/gpt-4.1-mini"), price_for("gpt-4.1-mini"));
        assert!(price_for("openai/gpt-4.1-mini").is_some());
    }

    #[test]
    fn test_unpriced_model_costs_nothing() {
        assert_eq!(price_for("local-llama"), None);
        assert_eq!(estimate_cost_usd("local-llama", 1_000, 1_000), 0.0);
    }

    #[test]
    fn test_cost_arithmetic() {
        let cost = estimate_cost_usd("gpt-4o", 1_000_000, 1_000_000);
        assert!((cost - 12.5).abs() < 1e-9);
    }
}
