//! Core types for the provider gateway.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::ProviderError;

// =============================================================================
// MODEL SPEC
// =============================================================================

/// One LLM endpoint, parsed from a `provider:model` string.
///
/// Serializes as the same `provider:model` string so results files stay
/// readable and comparable with plain string equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelSpec {
    provider: String,
    model: String,
}

impl ModelSpec {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }

    /// Parse `provider:model`. Only the first `:` separates the halves, so
    /// model ids such as `meta-llama/llama-3.1-8b-instruct:free` survive.
    pub fn parse(raw: &str) -> Result<Self, ProviderError> {
        let (provider, model) = raw.trim().split_once(':').ok_or_else(|| {
            ProviderError::config(format!("model spec '{raw}' must look like provider:model"))
        })?;
        let provider = provider.trim();
        let model = model.trim();
        if provider.is_empty() || model.is_empty() {
            return Err(ProviderError::config(format!(
                "model spec '{raw}' has an empty provider or model"
            )));
        }
        Ok(Self::new(provider.to_ascii_lowercase(), model))
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// The `provider:model` key used throughout results files.
    pub fn key(&self) -> String {
        format!("{}:{}", self.provider, self.model)
    }
}

impl fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.model)
    }
}

impl FromStr for ModelSpec {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ModelSpec {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.key())
    }
}

impl<'de> Deserialize<'de> for ModelSpec {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ModelSpec::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// MODE
// =============================================================================

/// Which family of provider clients backs a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Deterministic offline client, no network.
    Mock,
    /// Direct provider endpoints with the caller's own API keys.
    Free,
    /// Every provider routed through one OpenRouter key.
    Pro,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Mock => "mock",
            Mode::Free => "free",
            Mode::Pro => "pro",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(Mode::Mock),
            "free" => Ok(Mode::Free),
            "pro" => Ok(Mode::Pro),
            other => Err(ProviderError::config(format!(
                "unknown mode '{other}' (expected mock, free or pro)"
            ))),
        }
    }
}

// =============================================================================
// COMPLETION TYPES
// =============================================================================

/// Token accounting for one provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u32>,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens: Some(input_tokens),
            output_tokens: Some(output_tokens),
            total_tokens: input_tokens.saturating_add(output_tokens),
        }
    }

    pub fn total_only(total_tokens: u32) -> Self {
        Self {
            input_tokens: None,
            output_tokens: None,
            total_tokens,
        }
    }

    /// Input/output split, halving the total when only a total is known.
    pub fn split(&self) -> (u32, u32) {
        match (self.input_tokens, self.output_tokens) {
            (Some(i), Some(o)) => (i, o),
            _ => {
                let half = self.total_tokens / 2;
                (half, self.total_tokens - half)
            }
        }
    }
}

/// Fully streamed response from one provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Concatenated text of every streamed chunk.
    pub content: String,
    /// Wall-clock time from request to final chunk.
    pub response_time_ms: u64,
    /// Token usage, when the provider reports it.
    pub token_usage: Option<TokenUsage>,
}

/// Rough token estimate used when a provider omits usage: 1 token ≈ 4 chars.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_spec_parses_and_round_trips_through_json() {
        let spec = ModelSpec::parse("OpenAI:gpt-4o-mini").unwrap();
        assert_eq!(spec.provider(), "openai");
        assert_eq!(spec.model(), "gpt-4o-mini");
        assert_eq!(spec.key(), "openai:gpt-4o-mini");

        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, "\"openai:gpt-4o-mini\"");
        let back: ModelSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn model_spec_keeps_colons_inside_model_id() {
        let spec = ModelSpec::parse("openrouter:meta-llama/llama-3.1-8b-instruct:free").unwrap();
        assert_eq!(spec.model(), "meta-llama/llama-3.1-8b-instruct:free");
    }

    #[test]
    fn model_spec_rejects_missing_halves() {
        assert!(ModelSpec::parse("gpt-4o").is_err());
        assert!(ModelSpec::parse(":gpt-4o").is_err());
        assert!(ModelSpec::parse("openai:").is_err());
    }

    #[test]
    fn token_usage_split_halves_unknown_totals() {
        assert_eq!(TokenUsage::new(10, 30).split(), (10, 30));
        assert_eq!(TokenUsage::total_only(11).split(), (5, 6));
    }
}
