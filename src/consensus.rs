//! Consensus generation: reduce an ensemble's responses to one answer.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::ensemble::ProviderResponse;
use crate::evaluation::extract_choice_letter;
use crate::gateway::{Completion, ModelSpec, ProviderClient, ProviderError, TokenUsage};
use crate::limiter::ConcurrencyLimiter;

const ELO_START: f64 = 1500.0;
const ELO_K: f64 = 32.0;

/// One strategy's consensus answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusResult {
    pub strategy: String,
    pub content: String,
    /// `provider:model` of the summarizer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summarizer: Option<String>,
    pub response_time_ms: u64,
    /// Summarizer tokens spent on this strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusStrategy {
    /// Synthesize one answer from every response.
    Standard,
    /// Report the answer most responses agree on.
    Majority,
    /// Rank responses by pairwise judgement.
    Elo,
}

impl ConsensusStrategy {
    pub const ALL: [ConsensusStrategy; 3] = [
        ConsensusStrategy::Standard,
        ConsensusStrategy::Majority,
        ConsensusStrategy::Elo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsensusStrategy::Standard => "standard",
            ConsensusStrategy::Majority => "majority",
            ConsensusStrategy::Elo => "elo",
        }
    }
}

impl fmt::Display for ConsensusStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsensusStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(ConsensusStrategy::Standard),
            "majority" => Ok(ConsensusStrategy::Majority),
            "elo" => Ok(ConsensusStrategy::Elo),
            other => Err(format!(
                "unknown consensus strategy '{other}' (expected standard, majority or elo)"
            )),
        }
    }
}

/// The model that writes consensus answers.
#[derive(Clone)]
pub struct Summarizer {
    pub spec: ModelSpec,
    pub client: Arc<dyn ProviderClient>,
    /// Model id as the client expects it.
    pub model_id: String,
}

#[async_trait]
pub trait ConsensusGenerator: Send + Sync {
    /// Produce one result per strategy. Failures are recorded in
    /// `ConsensusResult::error`, never returned.
    async fn generate_consensus(
        &self,
        strategies: &[String],
        prompt: &str,
        responses: &[ProviderResponse],
        summarizer: &Summarizer,
    ) -> BTreeMap<String, ConsensusResult>;
}

/// Consensus written by a summarizer model.
#[derive(Default)]
pub struct LlmConsensusGenerator {
    limiter: Option<Arc<ConcurrencyLimiter>>,
}

impl LlmConsensusGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route summarizer calls through the shared limiter.
    pub fn with_limiter(mut self, limiter: Arc<ConcurrencyLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    async fn ask(&self, summarizer: &Summarizer, prompt: &str) -> Result<Completion, ProviderError> {
        let call = summarizer.client.complete(prompt, &summarizer.model_id);
        match &self.limiter {
            Some(limiter) => limiter.run(call).await,
            None => call.await,
        }
    }

    async fn run_strategy(
        &self,
        strategy: ConsensusStrategy,
        prompt: &str,
        answers: &[&ProviderResponse],
        summarizer: &Summarizer,
    ) -> Result<(String, Option<TokenUsage>), ProviderError> {
        let request = match strategy {
            ConsensusStrategy::Standard => synthesis_prompt(prompt, answers),
            ConsensusStrategy::Majority => majority_prompt(prompt, answers),
            ConsensusStrategy::Elo => return self.elo(prompt, answers, summarizer).await,
        };
        let reply = self.ask(summarizer, &request).await?;
        Ok((reply.content, reply.token_usage))
    }

    async fn elo(
        &self,
        prompt: &str,
        answers: &[&ProviderResponse],
        summarizer: &Summarizer,
    ) -> Result<(String, Option<TokenUsage>), ProviderError> {
        let mut ratings = vec![ELO_START; answers.len()];
        let mut usage: Option<TokenUsage> = None;
        for i in 0..answers.len() {
            for j in (i + 1)..answers.len() {
                let request = pairwise_prompt(prompt, &answers[i].content, &answers[j].content);
                let verdict = self.ask(summarizer, &request).await?;
                usage = add_usage(usage, verdict.token_usage);
                let score_i = match extract_choice_letter(&verdict.content).as_deref() {
                    Some("A") => 1.0,
                    Some("B") => 0.0,
                    _ => 0.5,
                };
                let (a, b) = elo_update(ratings[i], ratings[j], score_i);
                ratings[i] = a;
                ratings[j] = b;
            }
        }

        let mut best = 0;
        for (idx, rating) in ratings.iter().enumerate() {
            if *rating > ratings[best] {
                best = idx;
            }
        }
        Ok((answers[best].content.clone(), usage))
    }
}

#[async_trait]
impl ConsensusGenerator for LlmConsensusGenerator {
    async fn generate_consensus(
        &self,
        strategies: &[String],
        prompt: &str,
        responses: &[ProviderResponse],
        summarizer: &Summarizer,
    ) -> BTreeMap<String, ConsensusResult> {
        let answers: Vec<&ProviderResponse> = responses.iter().filter(|r| !r.is_error()).collect();
        let summarizer_key = summarizer.spec.key();

        let runs = strategies.iter().map(|name| {
            let answers = &answers;
            let summarizer_key = summarizer_key.clone();
            async move {
                let started = Instant::now();
                let outcome = match name.parse::<ConsensusStrategy>() {
                    Err(err) => Err(err),
                    Ok(_) if answers.is_empty() => Err("no successful responses to combine".to_string()),
                    Ok(strategy) => self
                        .run_strategy(strategy, prompt, answers, summarizer)
                        .await
                        .map_err(|e| e.to_string()),
                };
                let response_time_ms = started.elapsed().as_millis() as u64;
                let result = match outcome {
                    Ok((content, token_usage)) => ConsensusResult {
                        strategy: name.clone(),
                        content,
                        summarizer: Some(summarizer_key),
                        response_time_ms,
                        token_usage,
                        error: None,
                    },
                    Err(error) => {
                        tracing::warn!(strategy = %name, error = %error, "consensus failed");
                        ConsensusResult {
                            strategy: name.clone(),
                            content: String::new(),
                            summarizer: Some(summarizer_key),
                            response_time_ms,
                            token_usage: None,
                            error: Some(error),
                        }
                    }
                };
                (name.clone(), result)
            }
        });

        join_all(runs).await.into_iter().collect()
    }
}

fn add_usage(total: Option<TokenUsage>, next: Option<TokenUsage>) -> Option<TokenUsage> {
    match (total, next) {
        (Some(a), Some(b)) => {
            let (ai, ao) = a.split();
            let (bi, bo) = b.split();
            Some(TokenUsage::new(ai.saturating_add(bi), ao.saturating_add(bo)))
        }
        (a, b) => a.or(b),
    }
}

/// Elo update for one game; `score_a` is 1 for an A win, 0.5 for a draw.
pub fn elo_update(rating_a: f64, rating_b: f64, score_a: f64) -> (f64, f64) {
    let expected_a = 1.0 / (1.0 + 10f64.powf((rating_b - rating_a) / 400.0));
    let delta = ELO_K * (score_a - expected_a);
    (rating_a + delta, rating_b - delta)
}

fn numbered_responses(answers: &[&ProviderResponse]) -> String {
    answers
        .iter()
        .enumerate()
        .map(|(idx, r)| format!("### Response {} ({})\n{}\n", idx + 1, r.key(), r.content.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

const KEEP_FORMAT: &str = "End with the final answer in the same format the responses use \
(for example `#### <number>` or `The answer is (X)`).";

fn synthesis_prompt(prompt: &str, answers: &[&ProviderResponse]) -> String {
    format!(
        "Several assistants answered the question below. Combine their reasoning into the single \
         best answer, correcting any mistakes.\n\n## Question\n{prompt}\n\n## Responses\n{}\n{KEEP_FORMAT}",
        numbered_responses(answers)
    )
}

fn majority_prompt(prompt: &str, answers: &[&ProviderResponse]) -> String {
    format!(
        "Several assistants answered the question below. Identify the final answer that most of \
         them agree on and report it, even if you would answer differently.\n\n## Question\n{prompt}\n\n\
         ## Responses\n{}\n{KEEP_FORMAT}",
        numbered_responses(answers)
    )
}

fn pairwise_prompt(prompt: &str, a: &str, b: &str) -> String {
    format!(
        "Compare two answers to the question below and decide which one is more likely correct.\n\n\
         ## Question\n{prompt}\n\n## Answer A\n{}\n\n## Answer B\n{}\n\n\
         Reply with `Answer: A` or `Answer: B`.",
        a.trim(),
        b.trim()
    )
}
