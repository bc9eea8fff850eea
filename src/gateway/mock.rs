//! Deterministic offline provider client used by `--mode mock` and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use super::error::{ErrorContext, ProviderError};
use super::types::{estimate_tokens, Completion, TokenUsage};
use super::{ChunkSink, ProviderClient};

static CHOICE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*\(?([A-J])[\).:]\s+\S").expect("valid regex"));

#[derive(Debug, Clone)]
enum Scripted {
    Reply(String),
    Fail(String),
    RateLimit,
}

/// Offline client whose answers depend only on (model, prompt).
///
/// Scripted replies and failures can be registered per model for tests.
#[derive(Debug, Default)]
pub struct MockClient {
    scripted: HashMap<String, Scripted>,
    latency: Duration,
    calls: AtomicUsize,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `content` for `model`.
    pub fn with_response(mut self, model: impl Into<String>, content: impl Into<String>) -> Self {
        self.scripted
            .insert(model.into(), Scripted::Reply(content.into()));
        self
    }

    /// Always fail for `model` with a provider error carrying `message`.
    pub fn with_failure(mut self, model: impl Into<String>, message: impl Into<String>) -> Self {
        self.scripted
            .insert(model.into(), Scripted::Fail(message.into()));
        self
    }

    /// Always fail for `model` with an HTTP 429.
    pub fn with_rate_limit(mut self, model: impl Into<String>) -> Self {
        self.scripted.insert(model.into(), Scripted::RateLimit);
        self
    }

    /// Simulated time per call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of `stream_response` calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn synthesize(model: &str, prompt: &str) -> String {
        let digest = blake3::hash(format!("{model}\n{prompt}").as_bytes());
        let bytes = digest.as_bytes();
        let seed = u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]);

        let letters: Vec<&str> = CHOICE_LINE
            .captures_iter(prompt)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();

        if !letters.is_empty() {
            let pick = letters[(seed % letters.len() as u64) as usize];
            return format!(
                "Weighing each option against the question, the best supported choice is {pick}.\n\nThe answer is ({pick})"
            );
        }

        let value = seed % 100;
        format!("Working through the problem step by step gives a final value.\n#### {value}")
    }
}

#[async_trait]
impl ProviderClient for MockClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn stream_response(
        &self,
        prompt: &str,
        model: &str,
        on_chunk: ChunkSink<'_>,
    ) -> Result<Completion, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let content = match self.scripted.get(model) {
            Some(Scripted::Reply(content)) => content.clone(),
            Some(Scripted::Fail(message)) => {
                return Err(ProviderError::provider("mock", message.clone(), false));
            }
            Some(Scripted::RateLimit) => {
                return Err(ProviderError::rate_limited(
                    "mock",
                    Duration::from_millis(0),
                    ErrorContext::new().with_status(429),
                ));
            }
            None => Self::synthesize(model, prompt),
        };

        for line in content.split_inclusive('\n') {
            on_chunk(line);
        }

        Ok(Completion {
            token_usage: Some(TokenUsage::new(
                estimate_tokens(prompt),
                estimate_tokens(&content),
            )),
            content,
            response_time_ms: self.latency.as_millis() as u64,
        })
    }

    async fn list_available_text_models(&self) -> Result<Vec<String>, ProviderError> {
        let mut models: Vec<String> = vec![
            "mock-alpha".into(),
            "mock-beta".into(),
            "mock-gamma".into(),
        ];
        for model in self.scripted.keys() {
            if !models.contains(model) {
                models.push(model.clone());
            }
        }
        models.sort();
        Ok(models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::discard_chunk;

    #[tokio::test]
    async fn synthesized_answers_are_deterministic_per_model_and_prompt() {
        let client = MockClient::new();
        let a = client.complete("What is 2+2?", "mock-alpha").await.unwrap();
        let b = client.complete("What is 2+2?", "mock-alpha").await.unwrap();
        assert_eq!(a.content, b.content);
        assert!(a.content.contains("####"));
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn multiple_choice_prompts_get_a_listed_letter() {
        let client = MockClient::new();
        let prompt = "Which planet is largest?\nA) Mars\nB) Jupiter\nC) Venus\nD) Earth";
        let reply = client.stream_response(prompt, "mock-beta", &discard_chunk).await.unwrap();
        let letter = crate::evaluation::parsers::extract_choice_letter(&reply.content).unwrap();
        assert!(["A", "B", "C", "D"].contains(&letter.as_str()));
    }

    #[tokio::test]
    async fn scripted_failures_surface_as_errors() {
        let client = MockClient::new()
            .with_failure("broken", "boom")
            .with_rate_limit("throttled");
        assert!(client.complete("hi", "broken").await.is_err());
        let err = client.complete("hi", "throttled").await.unwrap_err();
        assert!(err.is_rate_limit());
    }
}
