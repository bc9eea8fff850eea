//! Correctness scorers for single responses.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use super::parsers::{extract_choice_letter, extract_numeric_answer, numbers_match};
use super::EvaluationResult;
use crate::gateway::{ProviderClient, ProviderError};

/// Scores one response against ground truth.
#[async_trait]
pub trait Evaluator: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluate(&self, content: &str, ground_truth: &str, prompt: &str) -> EvaluationResult;
}

/// Which evaluator a dataset (or `--evaluator`) asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluatorKind {
    Numeric,
    Choice,
    Judge,
    None,
}

impl EvaluatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluatorKind::Numeric => "numeric",
            EvaluatorKind::Choice => "choice",
            EvaluatorKind::Judge => "judge",
            EvaluatorKind::None => "none",
        }
    }
}

impl fmt::Display for EvaluatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvaluatorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "numeric" => Ok(EvaluatorKind::Numeric),
            "choice" | "mc" => Ok(EvaluatorKind::Choice),
            "judge" | "llm-judge" => Ok(EvaluatorKind::Judge),
            "none" => Ok(EvaluatorKind::None),
            other => Err(format!(
                "unknown evaluator '{other}' (expected numeric, choice, judge or none)"
            )),
        }
    }
}

/// Build the evaluator for `kind`. The judge needs a client and model;
/// `None` yields no evaluator.
pub fn build_evaluator(
    kind: EvaluatorKind,
    judge: Option<(Arc<dyn ProviderClient>, String)>,
) -> Result<Option<Arc<dyn Evaluator>>, ProviderError> {
    let evaluator: Arc<dyn Evaluator> = match kind {
        EvaluatorKind::Numeric => Arc::new(NumericEvaluator),
        EvaluatorKind::Choice => Arc::new(ChoiceEvaluator),
        EvaluatorKind::Judge => {
            let (client, model) = judge.ok_or_else(|| {
                ProviderError::config("the judge evaluator needs a judge model")
            })?;
            Arc::new(LlmJudgeEvaluator::new(client, model))
        }
        EvaluatorKind::None => return Ok(None),
    };
    Ok(Some(evaluator))
}

/// GSM8K-style numeric answers.
#[derive(Debug, Clone, Copy, Default)]
pub struct NumericEvaluator;

#[async_trait]
impl Evaluator for NumericEvaluator {
    fn name(&self) -> &str {
        "numeric"
    }

    async fn evaluate(&self, content: &str, ground_truth: &str, _prompt: &str) -> EvaluationResult {
        let expected = extract_numeric_answer(ground_truth)
            .unwrap_or_else(|| ground_truth.trim().replace(',', ""));
        let predicted = extract_numeric_answer(content);
        let correct = predicted
            .as_deref()
            .is_some_and(|p| numbers_match(p, &expected));
        EvaluationResult {
            correct,
            expected,
            predicted,
        }
    }
}

/// Multiple-choice letters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChoiceEvaluator;

fn expected_letter(ground_truth: &str) -> String {
    extract_choice_letter(ground_truth).unwrap_or_else(|| ground_truth.trim().to_ascii_uppercase())
}

#[async_trait]
impl Evaluator for ChoiceEvaluator {
    fn name(&self) -> &str {
        "choice"
    }

    async fn evaluate(&self, content: &str, ground_truth: &str, _prompt: &str) -> EvaluationResult {
        let expected = expected_letter(ground_truth);
        let predicted = extract_choice_letter(content);
        EvaluationResult {
            correct: predicted.as_deref() == Some(expected.as_str()),
            expected,
            predicted,
        }
    }
}

/// Asks a judge model which choice a verbose response intended.
///
/// Falls back to regex extraction when the judge call fails or its reply
/// has no letter.
pub struct LlmJudgeEvaluator {
    client: Arc<dyn ProviderClient>,
    model: String,
}

impl LlmJudgeEvaluator {
    pub fn new(client: Arc<dyn ProviderClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    fn judge_prompt(prompt: &str, content: &str) -> String {
        format!(
            "You are grading a multiple-choice answer.\n\n\
             QUESTION:\n{prompt}\n\n\
             RESPONSE:\n{content}\n\n\
             Which option letter does the response choose? Reply with the single letter only, \
             or NONE if it does not choose one."
        )
    }
}

#[async_trait]
impl Evaluator for LlmJudgeEvaluator {
    fn name(&self) -> &str {
        "judge"
    }

    async fn evaluate(&self, content: &str, ground_truth: &str, prompt: &str) -> EvaluationResult {
        let expected = expected_letter(ground_truth);
        let judged = match self
            .client
            .complete(&Self::judge_prompt(prompt, content), &self.model)
            .await
        {
            Ok(reply) => extract_choice_letter(&reply.content),
            Err(err) => {
                tracing::warn!(model = %self.model, error = %err, "judge call failed; using regex extraction");
                None
            }
        };
        let predicted = judged.or_else(|| extract_choice_letter(content));
        EvaluationResult {
            correct: predicted.as_deref() == Some(expected.as_str()),
            expected,
            predicted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockClient;

    #[tokio::test]
    async fn numeric_evaluator_reads_gsm8k_ground_truth() {
        let out = NumericEvaluator
            .evaluate("so the total is 1,200", "Some reasoning\n#### 1200", "q")
            .await;
        assert!(out.correct);
        assert_eq!(out.expected, "1200");
        assert_eq!(out.predicted.as_deref(), Some("1200"));
    }

    #[tokio::test]
    async fn choice_evaluator_compares_letters() {
        let out = ChoiceEvaluator.evaluate("The answer is (c)", "C", "q").await;
        assert!(out.correct);
        let out = ChoiceEvaluator.evaluate("no idea", "C", "q").await;
        assert!(!out.correct);
        assert_eq!(out.predicted, None);
    }

    #[tokio::test]
    async fn judge_uses_the_judge_reply() {
        let client = Arc::new(MockClient::new().with_response("judge", "B"));
        let judge = LlmJudgeEvaluator::new(client, "judge");
        let out = judge
            .evaluate("After a long digression I lean towards the second one", "B", "q")
            .await;
        assert!(out.correct);
    }

    #[tokio::test]
    async fn judge_failure_falls_back_to_regex() {
        let client = Arc::new(MockClient::new().with_failure("judge", "down"));
        let judge = LlmJudgeEvaluator::new(client, "judge");
        let out = judge.evaluate("The answer is (A)", "A", "q").await;
        assert!(out.correct);
    }

    #[test]
    fn evaluator_kind_parses_aliases() {
        assert_eq!("MC".parse::<EvaluatorKind>().unwrap(), EvaluatorKind::Choice);
        assert!("fuzzy".parse::<EvaluatorKind>().is_err());
        assert!(build_evaluator(EvaluatorKind::Judge, None).is_err());
        assert!(build_evaluator(EvaluatorKind::None, None).unwrap().is_none());
    }
}
