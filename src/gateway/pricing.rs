//! Model pricing registry.
//!
//! Costs are in nanodollars (1e-9 USD) per token, keyed by model id without
//! the provider prefix.

use std::collections::HashMap;
use std::sync::OnceLock;

use super::types::{ModelSpec, TokenUsage};

/// Pricing information for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPricing {
    /// Cost per input token in nanodollars.
    pub input_nanos_per_token: i64,
    /// Cost per output token in nanodollars.
    pub output_nanos_per_token: i64,
}

impl ModelPricing {
    const fn new(input: i64, output: i64) -> Self {
        Self {
            input_nanos_per_token: input,
            output_nanos_per_token: output,
        }
    }

    /// Calculate cost for a request.
    pub fn calculate_cost(&self, input_tokens: u32, output_tokens: u32) -> i64 {
        (input_tokens as i64) * self.input_nanos_per_token
            + (output_tokens as i64) * self.output_nanos_per_token
    }
}

// =============================================================================
// PRICING DATA
// =============================================================================

// $/1M tokens == nanodollars/token.
const FREE: ModelPricing = ModelPricing::new(0, 0);
// Used for models missing from the table; roughly a mid-tier model.
const DEFAULT: ModelPricing = ModelPricing::new(1_000, 5_000);

static PRICING_MAP: OnceLock<HashMap<&'static str, ModelPricing>> = OnceLock::new();

fn init_pricing() -> HashMap<&'static str, ModelPricing> {
    let mut map = HashMap::new();

    // OpenAI
    map.insert("gpt-4o", ModelPricing::new(2_500, 10_000));
    map.insert("gpt-4o-mini", ModelPricing::new(150, 600));
    map.insert("gpt-4.1", ModelPricing::new(2_000, 8_000));
    map.insert("gpt-4.1-mini", ModelPricing::new(400, 1_600));
    map.insert("gpt-4.1-nano", ModelPricing::new(100, 400));
    map.insert("gpt-5-mini", ModelPricing::new(250, 2_000));
    map.insert("o3-mini", ModelPricing::new(1_100, 4_400));

    // Anthropic
    map.insert("claude-3-5-haiku-20241022", ModelPricing::new(800, 4_000));
    map.insert("claude-3-5-haiku-latest", ModelPricing::new(800, 4_000));
    map.insert("claude-3-5-sonnet-20241022", ModelPricing::new(3_000, 15_000));
    map.insert("claude-3-7-sonnet-latest", ModelPricing::new(3_000, 15_000));
    map.insert("claude-sonnet-4-20250514", ModelPricing::new(3_000, 15_000));

    // Google
    map.insert("gemini-2.0-flash", ModelPricing::new(100, 400));
    map.insert("gemini-2.0-flash-lite", ModelPricing::new(75, 300));
    map.insert("gemini-2.5-flash", ModelPricing::new(300, 2_500));
    map.insert("gemini-2.5-pro", ModelPricing::new(1_250, 10_000));

    // xAI
    map.insert("grok-3-mini", ModelPricing::new(300, 500));
    map.insert("grok-3", ModelPricing::new(3_000, 15_000));

    map
}

/// Get pricing for a model id.
pub fn get_pricing(model_id: &str) -> Option<ModelPricing> {
    let map = PRICING_MAP.get_or_init(init_pricing);
    map.get(model_id).copied()
}

/// Pricing for a model spec: mock models and `:free` routes cost nothing,
/// unknown models fall back to a default rate.
pub fn pricing_for(spec: &ModelSpec) -> ModelPricing {
    if spec.provider() == "mock" || spec.model().ends_with(":free") {
        return FREE;
    }
    let bare = spec.model().rsplit('/').next().unwrap_or(spec.model());
    get_pricing(spec.model())
        .or_else(|| get_pricing(bare))
        .unwrap_or(DEFAULT)
}

/// Calculate chat cost in nanodollars.
pub fn chat_cost(spec: &ModelSpec, usage: &TokenUsage) -> i64 {
    let (input, output) = usage.split();
    pricing_for(spec).calculate_cost(input, output)
}

pub fn nanodollars_to_usd(nanos: i64) -> f64 {
    nanos as f64 / 1_000_000_000.0
}
