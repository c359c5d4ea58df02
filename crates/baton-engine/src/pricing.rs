//! Cost estimation for model tiers.
//!
//! When a provider reports token usage without a cost figure, the engine
//! estimates USD spend from a per-tier price table so limit enforcement
//! still observes it. Estimates are conservative; a provider-reported cost
//! always takes precedence.

use baton_types::llm::TokenUsage;
use baton_types::workflow::ModelTier;

/// Per-tier pricing in USD per million tokens.
struct TierPricing {
    tier: ModelTier,
    input_cost_per_million: f64,
    output_cost_per_million: f64,
}

const TIER_PRICING: [TierPricing; 3] = [
    TierPricing {
        tier: ModelTier::Fast,
        input_cost_per_million: 0.25,
        output_cost_per_million: 1.25,
    },
    TierPricing {
        tier: ModelTier::Balanced,
        input_cost_per_million: 3.0,
        output_cost_per_million: 15.0,
    },
    TierPricing {
        tier: ModelTier::Strategic,
        input_cost_per_million: 15.0,
        output_cost_per_million: 75.0,
    },
];

/// Estimate the cost of a completion in USD from its token usage.
pub fn estimate_cost(usage: &TokenUsage, tier: ModelTier) -> f64 {
    let entry = TIER_PRICING
        .iter()
        .find(|entry| entry.tier == tier)
        .expect("every tier has a pricing entry");
    compute_cost(
        usage.input_tokens,
        usage.output_tokens,
        entry.input_cost_per_million,
        entry.output_cost_per_million,
    )
}

fn compute_cost(
    input_tokens: u64,
    output_tokens: u64,
    input_cost_per_million: f64,
    output_cost_per_million: f64,
) -> f64 {
    let input_cost = (input_tokens as f64 / 1_000_000.0) * input_cost_per_million;
    let output_cost = (output_tokens as f64 / 1_000_000.0) * output_cost_per_million;
    input_cost + output_cost
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_tier_cost() {
        // balanced: $3.00 input, $15.00 output per million
        let usage = TokenUsage::new(1_000_000, 100_000);
        let cost = estimate_cost(&usage, ModelTier::Balanced);
        assert!((cost - 4.50).abs() < 1e-9, "expected ~$4.50, got ${cost}");
    }

    #[test]
    fn fast_tier_is_cheapest() {
        let usage = TokenUsage::new(1_000_000, 1_000_000);
        let fast = estimate_cost(&usage, ModelTier::Fast);
        let balanced = estimate_cost(&usage, ModelTier::Balanced);
        let strategic = estimate_cost(&usage, ModelTier::Strategic);
        assert!(fast < balanced);
        assert!(balanced < strategic);
    }

    #[test]
    fn zero_usage_costs_nothing() {
        let cost = estimate_cost(&TokenUsage::default(), ModelTier::Strategic);
        assert_eq!(cost, 0.0);
    }
}
