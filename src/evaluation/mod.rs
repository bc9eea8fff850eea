//! Scoring responses against ground truth.

pub mod evaluators;
pub mod parsers;
pub mod self_consistency;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::consensus::ConsensusResult;
use crate::ensemble::ProviderResponse;

pub use evaluators::{
    build_evaluator, ChoiceEvaluator, Evaluator, EvaluatorKind, LlmJudgeEvaluator,
    NumericEvaluator,
};
pub use parsers::{extract_choice_letter, extract_numeric_answer, normalize_answer};
pub use self_consistency::{majority_answer, self_consistency, SelfConsistencyResult};

/// Outcome of scoring one response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub correct: bool,
    pub expected: String,
    pub predicted: Option<String>,
}

/// Per-question evaluation of every non-errored response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptEvaluation {
    pub evaluator: String,
    pub ground_truth: String,
    /// Correct / evaluated over model responses; 0 when nothing was evaluated.
    pub accuracy: f64,
    pub results: BTreeMap<String, EvaluationResult>,
    /// Consensus outputs scored with the same evaluator, keyed by strategy.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub strategy_results: BTreeMap<String, EvaluationResult>,
}

/// Assign a key to every non-errored response, in input order.
///
/// The first occurrence of a `provider:model` is unsuffixed; later ones get
/// `#2`, `#3`, ... Errored responses map to `None`.
pub fn response_keys(responses: &[ProviderResponse]) -> Vec<Option<String>> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    responses
        .iter()
        .map(|response| {
            if response.is_error() {
                return None;
            }
            let base = response.key();
            let count = seen.entry(base.clone()).or_insert(0);
            *count += 1;
            Some(if *count == 1 {
                base
            } else {
                format!("{base}#{count}")
            })
        })
        .collect()
}

/// Strip a `#N` duplicate suffix from a response key.
pub fn base_key(key: &str) -> &str {
    match key.rsplit_once('#') {
        Some((base, n)) if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) => base,
        _ => key,
    }
}

/// Score every non-errored response. Returns `None` when there is no
/// evaluator or the ground truth is empty.
pub async fn evaluate_responses(
    evaluator: Option<&dyn Evaluator>,
    responses: &[ProviderResponse],
    ground_truth: &str,
    prompt: &str,
) -> Option<PromptEvaluation> {
    let evaluator = evaluator?;
    if ground_truth.trim().is_empty() {
        return None;
    }

    let mut results = BTreeMap::new();
    for (response, key) in responses.iter().zip(response_keys(responses)) {
        let Some(key) = key else {
            continue;
        };
        let result = evaluator
            .evaluate(&response.content, ground_truth, prompt)
            .await;
        results.insert(key, result);
    }

    let correct = results.values().filter(|r| r.correct).count();
    let accuracy = if results.is_empty() {
        0.0
    } else {
        correct as f64 / results.len() as f64
    };

    Some(PromptEvaluation {
        evaluator: evaluator.name().to_string(),
        ground_truth: ground_truth.to_string(),
        accuracy,
        results,
        strategy_results: BTreeMap::new(),
    })
}

/// Score each successful consensus output.
pub async fn evaluate_consensus(
    evaluator: &dyn Evaluator,
    consensus: &BTreeMap<String, ConsensusResult>,
    ground_truth: &str,
    prompt: &str,
) -> BTreeMap<String, EvaluationResult> {
    let mut out = BTreeMap::new();
    for (strategy, result) in consensus {
        if result.error.is_some() {
            continue;
        }
        let scored = evaluator.evaluate(&result.content, ground_truth, prompt).await;
        out.insert(strategy.clone(), scored);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(provider: &str, model: &str, content: &str) -> ProviderResponse {
        ProviderResponse::success(provider, model, content, 10, None)
    }

    fn failed(provider: &str, model: &str) -> ProviderResponse {
        ProviderResponse::failure(provider, model, "boom", 10)
    }

    #[test]
    fn duplicate_models_get_sequential_suffixes() {
        let responses = vec![
            ok("openai", "gpt", "a"),
            ok("anthropic", "claude", "b"),
            ok("openai", "gpt", "c"),
            failed("openai", "gpt"),
            ok("openai", "gpt", "d"),
        ];
        let keys = response_keys(&responses);
        assert_eq!(
            keys,
            vec![
                Some("openai:gpt".to_string()),
                Some("anthropic:claude".to_string()),
                Some("openai:gpt#2".to_string()),
                None,
                Some("openai:gpt#3".to_string()),
            ]
        );
        assert_eq!(base_key("openai:gpt#3"), "openai:gpt");
        assert_eq!(base_key("openrouter:x/y#beta"), "openrouter:x/y#beta");
    }

    #[tokio::test]
    async fn accuracy_counts_only_successful_responses() {
        let responses = vec![
            ok("mock", "a", "#### 4"),
            failed("mock", "b"),
            ok("mock", "c", "#### 5"),
        ];
        let eval = evaluate_responses(Some(&NumericEvaluator), &responses, "4", "2+2?")
            .await
            .unwrap();
        assert_eq!(eval.results.len(), 2);
        assert!((eval.accuracy - 0.5).abs() < 1e-12);
        assert!(eval.results["mock:a"].correct);
        assert!(!eval.results["mock:c"].correct);
    }

    #[tokio::test]
    async fn all_errored_responses_yield_zero_accuracy() {
        let responses = vec![failed("mock", "a"), failed("mock", "b")];
        let eval = evaluate_responses(Some(&NumericEvaluator), &responses, "4", "q")
            .await
            .unwrap();
        assert_eq!(eval.accuracy, 0.0);
        assert!(eval.results.is_empty());
    }

    #[tokio::test]
    async fn skipped_without_evaluator_or_ground_truth() {
        let responses = vec![ok("mock", "a", "4")];
        assert!(evaluate_responses(None, &responses, "4", "q").await.is_none());
        assert!(evaluate_responses(Some(&NumericEvaluator), &responses, "  ", "q")
            .await
            .is_none());
    }
}
