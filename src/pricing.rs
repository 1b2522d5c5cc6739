use crate::model_registry::ModelDescriptor;
use bigdecimal::BigDecimal;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

impl TokenUsage {
    pub fn new(input_tokens: i64, output_tokens: i64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Billable units of one turn beyond the token counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Surcharges {
    pub tool_calls: i64,
    pub images: i64,
}

/// Cost of a turn in cents. Token rates are dollars per token, so they are scaled by 100.
/// The result is never rounded.
pub fn turn_cost(model: &ModelDescriptor, usage: TokenUsage, surcharges: Surcharges) -> BigDecimal {
    let pricing = &model.pricing;
    let hundred = BigDecimal::from(100);

    let input = BigDecimal::from(usage.input_tokens) * &pricing.input_cost_per_token * &hundred;
    let output = BigDecimal::from(usage.output_tokens) * &pricing.output_cost_per_token * &hundred;
    let tools = BigDecimal::from(surcharges.tool_calls) * &pricing.tool_call_cost_in_cents;
    let images = BigDecimal::from(surcharges.images) * &pricing.image_cost_in_cents;

    let mut cost = input + output + tools + images;
    if model.is_bot() {
        cost += &pricing.api_cost_in_cents;
    }
    cost.normalized()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_registry::ModelRegistry;
    use std::str::FromStr;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[test]
    fn test_gpt4o_azure_example() {
        let registry = ModelRegistry::builtin();
        let model = registry.get("gpt-4o-azure").unwrap();
        let cost = turn_cost(model, TokenUsage::new(100, 500), Surcharges::default());
        assert_eq!(cost, dec("0.525"));
        assert_eq!(dec("100") - &cost, dec("99.475"));
    }

    #[test]
    fn test_image_surcharge_added() {
        let registry = ModelRegistry::builtin();
        let model = registry.get("gpt-4o-azure").unwrap();
        let cost = turn_cost(
            model,
            TokenUsage::new(100, 500),
            Surcharges {
                tool_calls: 1,
                images: 1,
            },
        );
        assert_eq!(cost, dec("4.525"));
    }

    #[test]
    fn test_bot_flat_cost_plus_tokens() {
        let registry = ModelRegistry::builtin();
        let youtube = registry.get("youtube-summarizer").unwrap();
        let cost = turn_cost(youtube, TokenUsage::new(1000, 200), Surcharges::default());
        // 1000 * 1.5e-7 * 100 + 200 * 6e-7 * 100 + 1
        assert_eq!(cost, dec("1.027"));

        let citations = registry.get("citation-finder").unwrap();
        assert_eq!(
            turn_cost(citations, TokenUsage::default(), Surcharges::default()),
            dec("0.5")
        );
    }

    #[test]
    fn test_small_turn_is_not_rounded() {
        let registry = ModelRegistry::builtin();
        let model = registry.get("gemini-2.0-flash").unwrap();
        let cost = turn_cost(model, TokenUsage::new(3, 1), Surcharges::default());
        // 3 * 1e-7 * 100 + 1 * 4e-7 * 100
        assert_eq!(cost, dec("0.00007"));
    }

    #[test]
    fn test_usage_accumulates() {
        let mut total = TokenUsage::default();
        total += TokenUsage::new(10, 5);
        total += TokenUsage::new(7, 3);
        assert_eq!(total, TokenUsage::new(17, 8));
    }
}
