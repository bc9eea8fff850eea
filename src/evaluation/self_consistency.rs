//! Majority voting over repeated samples of the same model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{base_key, response_keys, PromptEvaluation};
use crate::ensemble::ProviderResponse;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfConsistencyResult {
    /// Majority answer, `None` when no sample produced one.
    pub answer: Option<String>,
    pub votes: usize,
    pub samples: usize,
    /// `None` when there is no ground truth to compare with.
    pub correct: Option<bool>,
}

/// Most frequent answer (exact match after trim) and its vote count.
///
/// Ties go to the answer seen first.
pub fn majority_answer<'a, I>(answers: I) -> Option<(String, usize)>
where
    I: IntoIterator<Item = &'a str>,
{
    // Vec keeps insertion order, which decides ties.
    let mut tally: Vec<(String, usize)> = Vec::new();
    for answer in answers {
        let answer = answer.trim();
        if answer.is_empty() {
            continue;
        }
        match tally.iter_mut().find(|(seen, _)| seen == answer) {
            Some((_, count)) => *count += 1,
            None => tally.push((answer.to_string(), 1)),
        }
    }

    let mut best: Option<(String, usize)> = None;
    for (answer, count) in tally {
        if best.as_ref().map_or(true, |(_, top)| count > *top) {
            best = Some((answer, count));
        }
    }
    best
}

/// Per-model majority vote across `provider:model`, `provider:model#2`, ...
///
/// With an evaluation, votes are cast with the extracted predictions and the
/// majority is checked against the expected answer (case-insensitive).
/// Without one, raw trimmed content is voted on and `correct` is `None`.
pub fn self_consistency(
    responses: &[ProviderResponse],
    evaluation: Option<&PromptEvaluation>,
) -> BTreeMap<String, SelfConsistencyResult> {
    let mut grouped: Vec<(String, Vec<Option<String>>)> = Vec::new();
    let mut expected: BTreeMap<String, String> = BTreeMap::new();

    for (response, key) in responses.iter().zip(response_keys(responses)) {
        let Some(key) = key else {
            continue;
        };
        let base = base_key(&key).to_string();
        let answer = match evaluation {
            Some(eval) => eval.results.get(&key).and_then(|r| {
                expected
                    .entry(base.clone())
                    .or_insert_with(|| r.expected.clone());
                r.predicted.clone()
            }),
            None => Some(response.content.clone()),
        };
        match grouped.iter_mut().find(|(b, _)| *b == base) {
            Some((_, answers)) => answers.push(answer),
            None => grouped.push((base, vec![answer])),
        }
    }

    grouped
        .into_iter()
        .map(|(base, answers)| {
            let samples = answers.len();
            let majority = majority_answer(answers.iter().flatten().map(String::as_str));
            let correct = evaluation.map(|_| {
                match (&majority, expected.get(&base)) {
                    (Some((answer, _)), Some(exp)) => answer.eq_ignore_ascii_case(exp.trim()),
                    _ => false,
                }
            });
            let (answer, votes) = match majority {
                Some((answer, votes)) => (Some(answer), votes),
                None => (None, 0),
            };
            (
                base,
                SelfConsistencyResult {
                    answer,
                    votes,
                    samples,
                    correct,
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::{evaluate_responses, NumericEvaluator};

    #[test]
    fn majority_prefers_first_seen_on_ties() {
        assert_eq!(
            majority_answer(["b", "a", "a", "b"]),
            Some(("b".to_string(), 2))
        );
        assert_eq!(
            majority_answer([" 7", "8", "7 "]),
            Some(("7".to_string(), 2))
        );
        assert_eq!(majority_answer(["", "  "]), None);
    }

    #[tokio::test]
    async fn groups_duplicate_runs_of_one_model() {
        let responses = vec![
            ProviderResponse::success("mock", "a", "#### 4", 1, None),
            ProviderResponse::success("mock", "b", "#### 9", 1, None),
            ProviderResponse::success("mock", "a", "#### 5", 1, None),
            ProviderResponse::success("mock", "a", "#### 4", 1, None),
        ];
        let eval = evaluate_responses(Some(&NumericEvaluator), &responses, "4", "q")
            .await
            .unwrap();
        let sc = self_consistency(&responses, Some(&eval));

        let a = &sc["mock:a"];
        assert_eq!(a.answer.as_deref(), Some("4"));
        assert_eq!((a.votes, a.samples), (2, 3));
        assert_eq!(a.correct, Some(true));
        assert_eq!(sc["mock:b"].correct, Some(false));
    }

    #[test]
    fn without_evaluation_correctness_is_unknown() {
        let responses = vec![
            ProviderResponse::success("mock", "a", "Paris", 1, None),
            ProviderResponse::success("mock", "a", "Paris ", 1, None),
        ];
        let sc = self_consistency(&responses, None);
        assert_eq!(sc["mock:a"].answer.as_deref(), Some("Paris"));
        assert_eq!(sc["mock:a"].correct, None);
    }
}
