//! Golden-baseline regression detection.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::benchmark::BenchmarkResultsFile;
use crate::pinning::GoldenDataset;

use super::{compare_pair, predictor_outcomes, AnalysisOptions, PairComparison};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegressionCheck {
    pub dataset: String,
    pub predictor: String,
    /// Baseline first, current second.
    pub comparison: PairComparison,
    pub regressed: bool,
}

fn golden_outcomes(golden: &GoldenDataset) -> BTreeMap<String, BTreeMap<String, bool>> {
    let mut out: BTreeMap<String, BTreeMap<String, bool>> = BTreeMap::new();
    for result in &golden.results {
        for (key, correct) in result.model_correct.iter().chain(&result.strategy_correct) {
            out.entry(key.clone())
                .or_default()
                .insert(result.question_id.clone(), *correct);
        }
    }
    out
}

/// Compare every predictor present in both the baseline and the current
/// run. A predictor regresses when its accuracy dropped and McNemar's
/// p-value is below `threshold`.
pub fn check_regressions(
    golden: &GoldenDataset,
    current: &BenchmarkResultsFile,
    threshold: f64,
) -> Vec<RegressionCheck> {
    let options = AnalysisOptions {
        significance_threshold: threshold,
        ..AnalysisOptions::default()
    };
    let baseline = golden_outcomes(golden);
    let (models, strategies) = predictor_outcomes(current);

    let mut checks = Vec::new();
    for (predictor, before) in &baseline {
        let Some(after) = models.get(predictor).or_else(|| strategies.get(predictor)) else {
            tracing::warn!(
                dataset = %golden.dataset,
                predictor = %predictor,
                "predictor missing from current run"
            );
            continue;
        };
        let comparison = compare_pair(predictor, predictor, before, after, &options);
        let regressed = comparison.second_accuracy < comparison.first_accuracy
            && comparison.mcnemar.p_value < threshold;
        if regressed {
            tracing::error!(
                dataset = %golden.dataset,
                predictor = %predictor,
                before = comparison.first_accuracy,
                after = comparison.second_accuracy,
                p_value = comparison.mcnemar.p_value,
                "accuracy regression"
            );
        }
        checks.push(RegressionCheck {
            dataset: golden.dataset.clone(),
            predictor: predictor.clone(),
            comparison,
            regressed,
        });
    }
    checks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmark::{PromptRunResult, ResultsKind};
    use crate::evaluation::{EvaluationResult, PromptEvaluation};
    use crate::gateway::{ModelSpec, Mode};
    use crate::pinning::GoldenQuestionResult;

    fn current(correct: impl Fn(usize) -> bool, n: usize) -> BenchmarkResultsFile {
        let mut file = BenchmarkResultsFile::new(
            ResultsKind::Benchmark,
            "gsm8k",
            Mode::Mock,
            vec![ModelSpec::new("mock", "a")],
            vec![],
            n,
        );
        for i in 0..n {
            let mut results = BTreeMap::new();
            results.insert(
                "mock:a".to_string(),
                EvaluationResult {
                    correct: correct(i),
                    expected: "1".into(),
                    predicted: Some("1".into()),
                },
            );
            file.runs.push(PromptRunResult {
                question_id: format!("q{i}"),
                prompt: String::new(),
                ground_truth: "1".into(),
                category: None,
                difficulty: None,
                responses: vec![],
                consensus: BTreeMap::new(),
                evaluation: Some(PromptEvaluation {
                    evaluator: "numeric".into(),
                    ground_truth: "1".into(),
                    accuracy: 0.0,
                    results,
                    strategy_results: BTreeMap::new(),
                }),
                self_consistency: BTreeMap::new(),
            });
        }
        file
    }

    fn golden(n: usize) -> GoldenDataset {
        GoldenDataset {
            dataset: "gsm8k".into(),
            question_ids: (0..n).map(|i| format!("q{i}")).collect(),
            results: (0..n)
                .map(|i| GoldenQuestionResult {
                    question_id: format!("q{i}"),
                    model_correct: [("mock:a".to_string(), true)].into_iter().collect(),
                    strategy_correct: BTreeMap::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn large_significant_drop_is_a_regression() {
        let checks = check_regressions(&golden(20), &current(|i| i >= 15, 20), 0.05);
        assert_eq!(checks.len(), 1);
        assert!(checks[0].regressed);
        assert_eq!(checks[0].comparison.mcnemar.b, 15);
    }

    #[test]
    fn small_drop_is_not_significant() {
        let checks = check_regressions(&golden(20), &current(|i| i != 0, 20), 0.05);
        assert!(!checks[0].regressed);
    }

    #[test]
    fn unchanged_run_never_regresses() {
        let checks = check_regressions(&golden(10), &current(|_| true, 10), 0.05);
        assert!(!checks[0].regressed);
        assert_eq!(checks[0].comparison.mcnemar.p_value, 1.0);
    }
}
