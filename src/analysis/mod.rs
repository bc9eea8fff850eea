//! Analysis engine: turns a completed results file into accuracy tables,
//! significance tests, agreement calibration, breakdowns and cost.

pub mod regression;
pub mod report;
pub mod stats;

use std::collections::BTreeMap;

use serde::Serialize;

use crate::benchmark::{BenchmarkResultsFile, PromptRunResult};
use crate::evaluation::{majority_answer, normalize_answer};
use crate::gateway::{chat_cost, nanodollars_to_usd, ModelSpec, Mode};

pub use regression::{check_regressions, RegressionCheck};
pub use report::render_markdown;
pub use stats::{bootstrap_delta, mcnemar, BootstrapResult, McNemarResult, StatConfig};

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("cannot compare runs of different datasets ('{0}' vs '{1}')")]
    DatasetMismatch(String, String),
    #[error("results file has no evaluated questions")]
    NothingEvaluated,
}

#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    pub stats: StatConfig,
    /// Strategy used for lift, recovery and notable examples; defaults to
    /// the first strategy in the file.
    pub primary_strategy: Option<String>,
    pub significance_threshold: f64,
    pub max_examples: usize,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            stats: StatConfig::default(),
            primary_strategy: None,
            significance_threshold: 0.05,
            max_examples: 5,
        }
    }
}

// =============================================================================
// SUMMARY TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccuracyRow {
    pub name: String,
    pub correct: usize,
    pub total: usize,
    pub percentage: f64,
}

impl AccuracyRow {
    fn new(name: impl Into<String>, correct: usize, total: usize) -> Self {
        Self {
            name: name.into(),
            correct,
            total,
            percentage: percentage(correct, total),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairComparison {
    pub first: String,
    pub second: String,
    /// Questions both predictors were scored on.
    pub questions: usize,
    pub first_accuracy: f64,
    pub second_accuracy: f64,
    pub mcnemar: McNemarResult,
    pub bootstrap: BootstrapResult,
    pub significant: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationBucket {
    pub bucket: String,
    pub questions: usize,
    /// Share of model responses in this bucket that were correct.
    pub model_accuracy: f64,
    /// Share of questions where the modal answer was correct.
    pub modal_accuracy: f64,
    pub strategy_accuracy: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakdownRow {
    pub group: String,
    pub questions: usize,
    pub best_model: Option<String>,
    pub best_model_accuracy: f64,
    pub strategy_accuracy: Option<f64>,
    pub lift: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiversityHeatmap {
    pub models: Vec<String>,
    /// `agreement[i][j]`; `None` when the pair never both answered.
    pub agreement: Vec<Vec<Option<f64>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RightAnswerStats {
    pub strategy: String,
    /// Questions where at least one model was individually correct.
    pub questions_with_correct_model: usize,
    pub recovered: usize,
    pub missed: usize,
    /// No model was correct but the strategy was.
    pub ensemble_only: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotableExample {
    pub question_id: String,
    pub prompt: String,
    pub expected: String,
    pub strategy_prediction: Option<String>,
    pub models_correct: usize,
    pub models_total: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotableExamples {
    pub strategy: Option<String>,
    /// Strategy right while most models were wrong.
    pub strategy_wins: Vec<NotableExample>,
    /// Strategy wrong while most models were right.
    pub strategy_losses: Vec<NotableExample>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostRow {
    pub name: String,
    pub questions: usize,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub avg_tokens_per_question: f64,
    pub avg_cost_per_question: f64,
}

impl CostRow {
    fn new(name: impl Into<String>, questions: usize, tokens: u64, nanos: i64) -> Self {
        let per = |v: f64| if questions == 0 { 0.0 } else { v / questions as f64 };
        let cost_usd = nanodollars_to_usd(nanos);
        Self {
            name: name.into(),
            questions,
            total_tokens: tokens,
            cost_usd,
            avg_tokens_per_question: per(tokens as f64),
            avg_cost_per_question: per(cost_usd),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostSummary {
    pub models: Vec<CostRow>,
    /// Each strategy: the full ensemble plus its summarizer calls.
    pub strategies: Vec<CostRow>,
    pub total_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSummary {
    pub dataset: String,
    pub mode: Mode,
    pub total_questions: usize,
    pub evaluated_questions: usize,
    pub model_accuracy: Vec<AccuracyRow>,
    pub strategy_accuracy: Vec<AccuracyRow>,
    pub self_consistency: Vec<AccuracyRow>,
    pub comparisons: Vec<PairComparison>,
    pub calibration: Vec<CalibrationBucket>,
    pub right_answer: Option<RightAnswerStats>,
    pub diversity: DiversityHeatmap,
    pub category_breakdown: Vec<BreakdownRow>,
    pub difficulty_breakdown: Vec<BreakdownRow>,
    pub notable_examples: NotableExamples,
    pub cost: CostSummary,
}

// =============================================================================
// OUTCOMES
// =============================================================================

/// Correctness per predictor, keyed by question id.
pub type Outcomes = BTreeMap<String, BTreeMap<String, bool>>;

/// Model-response and strategy outcomes of every evaluated run.
pub fn predictor_outcomes(file: &BenchmarkResultsFile) -> (Outcomes, Outcomes) {
    let mut models: Outcomes = BTreeMap::new();
    let mut strategies: Outcomes = BTreeMap::new();
    for run in &file.runs {
        let Some(eval) = &run.evaluation else {
            continue;
        };
        for (key, result) in &eval.results {
            models
                .entry(key.clone())
                .or_default()
                .insert(run.question_id.clone(), result.correct);
        }
        for (strategy, result) in &eval.strategy_results {
            strategies
                .entry(strategy.clone())
                .or_default()
                .insert(run.question_id.clone(), result.correct);
        }
    }
    (models, strategies)
}

/// Aligned outcomes on the questions both predictors were scored on.
pub fn paired(a: &BTreeMap<String, bool>, b: &BTreeMap<String, bool>) -> (Vec<bool>, Vec<bool>) {
    a.iter()
        .filter_map(|(qid, x)| b.get(qid).map(|y| (*x, *y)))
        .unzip()
}

pub fn compare_pair(
    first: &str,
    second: &str,
    a: &BTreeMap<String, bool>,
    b: &BTreeMap<String, bool>,
    options: &AnalysisOptions,
) -> PairComparison {
    let (xs, ys) = paired(a, b);
    let mcnemar = mcnemar(&xs, &ys);
    PairComparison {
        first: first.to_string(),
        second: second.to_string(),
        questions: xs.len(),
        first_accuracy: share(&xs),
        second_accuracy: share(&ys),
        mcnemar,
        bootstrap: bootstrap_delta(&xs, &ys, &options.stats),
        significant: mcnemar.p_value < options.significance_threshold,
    }
}

fn share(outcomes: &[bool]) -> f64 {
    if outcomes.is_empty() {
        0.0
    } else {
        outcomes.iter().filter(|x| **x).count() as f64 / outcomes.len() as f64
    }
}

fn percentage(correct: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        correct as f64 * 100.0 / total as f64
    }
}

fn accuracy_rows(outcomes: &Outcomes, order: &[String]) -> Vec<AccuracyRow> {
    order
        .iter()
        .filter_map(|name| {
            let by_question = outcomes.get(name)?;
            let correct = by_question.values().filter(|c| **c).count();
            Some(AccuracyRow::new(name.clone(), correct, by_question.len()))
        })
        .collect()
}

// =============================================================================
// ANALYSIS
// =============================================================================

pub fn analyze(
    file: &BenchmarkResultsFile,
    options: &AnalysisOptions,
) -> Result<AnalysisSummary, AnalysisError> {
    let evaluated: Vec<&PromptRunResult> =
        file.runs.iter().filter(|r| r.evaluation.is_some()).collect();
    if evaluated.is_empty() {
        return Err(AnalysisError::NothingEvaluated);
    }

    let (model_outcomes, strategy_outcomes) = predictor_outcomes(file);
    let model_names: Vec<String> = model_outcomes.keys().cloned().collect();
    // File order first, then anything only present in the runs.
    let mut strategy_names: Vec<String> = file
        .strategies
        .iter()
        .filter(|s| strategy_outcomes.contains_key(*s))
        .cloned()
        .collect();
    for name in strategy_outcomes.keys() {
        if !strategy_names.contains(name) {
            strategy_names.push(name.clone());
        }
    }

    let primary = options
        .primary_strategy
        .clone()
        .filter(|s| strategy_outcomes.contains_key(s))
        .or_else(|| strategy_names.first().cloned());

    let mut predictors: Vec<(&String, &BTreeMap<String, bool>)> = Vec::new();
    for name in &model_names {
        predictors.push((name, &model_outcomes[name]));
    }
    for name in &strategy_names {
        predictors.push((name, &strategy_outcomes[name]));
    }
    let mut comparisons = Vec::new();
    for i in 0..predictors.len() {
        for j in (i + 1)..predictors.len() {
            let (first, a) = predictors[i];
            let (second, b) = predictors[j];
            comparisons.push(compare_pair(first, second, a, b, options));
        }
    }

    Ok(AnalysisSummary {
        dataset: file.dataset.clone(),
        mode: file.mode,
        total_questions: file.runs.len(),
        evaluated_questions: evaluated.len(),
        model_accuracy: accuracy_rows(&model_outcomes, &model_names),
        strategy_accuracy: accuracy_rows(&strategy_outcomes, &strategy_names),
        self_consistency: self_consistency_rows(&evaluated),
        comparisons,
        calibration: calibration(&evaluated, primary.as_deref()),
        right_answer: primary.as_deref().map(|s| right_answer(&evaluated, s)),
        diversity: diversity(&evaluated, &model_names),
        category_breakdown: breakdown(&evaluated, primary.as_deref(), |r| r.category.clone()),
        difficulty_breakdown: breakdown(&evaluated, primary.as_deref(), |r| r.difficulty.clone()),
        notable_examples: notable_examples(&evaluated, primary.as_deref(), options.max_examples),
        cost: cost(file),
    })
}

/// Compare the predictors two results files share, question by question.
pub fn compare_files(
    a: &BenchmarkResultsFile,
    b: &BenchmarkResultsFile,
    options: &AnalysisOptions,
) -> Result<Vec<PairComparison>, AnalysisError> {
    if a.dataset != b.dataset {
        return Err(AnalysisError::DatasetMismatch(a.dataset.clone(), b.dataset.clone()));
    }
    let (a_models, a_strategies) = predictor_outcomes(a);
    let (b_models, b_strategies) = predictor_outcomes(b);

    let mut out = Vec::new();
    for (a_side, b_side) in [(&a_models, &b_models), (&a_strategies, &b_strategies)] {
        for (name, a_outcomes) in a_side {
            if let Some(b_outcomes) = b_side.get(name) {
                out.push(compare_pair(
                    &format!("A {name}"),
                    &format!("B {name}"),
                    a_outcomes,
                    b_outcomes,
                    options,
                ));
            }
        }
    }
    Ok(out)
}

fn self_consistency_rows(runs: &[&PromptRunResult]) -> Vec<AccuracyRow> {
    let mut tally: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    for run in runs {
        for (key, sc) in &run.self_consistency {
            if let Some(correct) = sc.correct {
                let entry = tally.entry(key.clone()).or_default();
                entry.1 += 1;
                if correct {
                    entry.0 += 1;
                }
            }
        }
    }
    tally
        .into_iter()
        .map(|(key, (correct, total))| AccuracyRow::new(key, correct, total))
        .collect()
}

fn strategy_correct(run: &PromptRunResult, strategy: Option<&str>) -> Option<bool> {
    let eval = run.evaluation.as_ref()?;
    eval.strategy_results.get(strategy?).map(|r| r.correct)
}

fn model_tally(run: &PromptRunResult) -> (usize, usize) {
    run.evaluation
        .as_ref()
        .map(|eval| {
            let correct = eval.results.values().filter(|r| r.correct).count();
            (correct, eval.results.len())
        })
        .unwrap_or_default()
}

const BUCKETS: [&str; 4] = ["unanimous", "high", "medium", "low"];

fn bucket_for(share: f64) -> &'static str {
    if share >= 1.0 - 1e-9 {
        "unanimous"
    } else if share >= 0.75 {
        "high"
    } else if share >= 0.5 {
        "medium"
    } else {
        "low"
    }
}

fn calibration(runs: &[&PromptRunResult], strategy: Option<&str>) -> Vec<CalibrationBucket> {
    #[derive(Default)]
    struct Acc {
        questions: usize,
        model_correct: usize,
        model_total: usize,
        modal_correct: usize,
        strategy_correct: usize,
        strategy_total: usize,
    }

    let mut buckets: BTreeMap<&'static str, Acc> = BTreeMap::new();
    for run in runs {
        let Some(eval) = &run.evaluation else {
            continue;
        };
        let predictions: Vec<String> = eval
            .results
            .values()
            .filter_map(|r| r.predicted.as_deref().map(normalize_answer))
            .collect();
        let Some((modal, votes)) = majority_answer(predictions.iter().map(String::as_str)) else {
            continue;
        };
        let expected = eval
            .results
            .values()
            .next()
            .map(|r| normalize_answer(&r.expected))
            .unwrap_or_default();

        let acc = buckets
            .entry(bucket_for(votes as f64 / predictions.len() as f64))
            .or_default();
        let (correct, total) = model_tally(run);
        acc.questions += 1;
        acc.model_correct += correct;
        acc.model_total += total;
        if modal == expected {
            acc.modal_correct += 1;
        }
        if let Some(ok) = strategy_correct(run, strategy) {
            acc.strategy_total += 1;
            if ok {
                acc.strategy_correct += 1;
            }
        }
    }

    BUCKETS
        .iter()
        .filter_map(|name| {
            let acc = buckets.get(name)?;
            Some(CalibrationBucket {
                bucket: name.to_string(),
                questions: acc.questions,
                model_accuracy: ratio(acc.model_correct, acc.model_total),
                modal_accuracy: ratio(acc.modal_correct, acc.questions),
                strategy_accuracy: (acc.strategy_total > 0)
                    .then(|| ratio(acc.strategy_correct, acc.strategy_total)),
            })
        })
        .collect()
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

fn right_answer(runs: &[&PromptRunResult], strategy: &str) -> RightAnswerStats {
    let mut stats = RightAnswerStats {
        strategy: strategy.to_string(),
        questions_with_correct_model: 0,
        recovered: 0,
        missed: 0,
        ensemble_only: 0,
    };
    for run in runs {
        let Some(strategy_ok) = strategy_correct(run, Some(strategy)) else {
            continue;
        };
        let (correct, _) = model_tally(run);
        match (correct > 0, strategy_ok) {
            (true, true) => {
                stats.questions_with_correct_model += 1;
                stats.recovered += 1;
            }
            (true, false) => {
                stats.questions_with_correct_model += 1;
                stats.missed += 1;
            }
            (false, true) => stats.ensemble_only += 1,
            (false, false) => {}
        }
    }
    stats
}

fn diversity(runs: &[&PromptRunResult], models: &[String]) -> DiversityHeatmap {
    let n = models.len();
    let mut agree = vec![vec![0usize; n]; n];
    let mut both = vec![vec![0usize; n]; n];

    for run in runs {
        let Some(eval) = &run.evaluation else {
            continue;
        };
        let predictions: Vec<Option<String>> = models
            .iter()
            .map(|m| {
                eval.results
                    .get(m)
                    .and_then(|r| r.predicted.as_deref())
                    .map(normalize_answer)
            })
            .collect();
        for i in 0..n {
            for j in (i + 1)..n {
                if let (Some(a), Some(b)) = (&predictions[i], &predictions[j]) {
                    both[i][j] += 1;
                    if a == b {
                        agree[i][j] += 1;
                    }
                }
            }
        }
    }

    let agreement = (0..n)
        .map(|i| {
            (0..n)
                .map(|j| {
                    if i == j {
                        return Some(1.0);
                    }
                    let (lo, hi) = if i < j { (i, j) } else { (j, i) };
                    (both[lo][hi] > 0).then(|| ratio(agree[lo][hi], both[lo][hi]))
                })
                .collect()
        })
        .collect();

    DiversityHeatmap {
        models: models.to_vec(),
        agreement,
    }
}

fn breakdown<F>(runs: &[&PromptRunResult], strategy: Option<&str>, group_of: F) -> Vec<BreakdownRow>
where
    F: Fn(&PromptRunResult) -> Option<String>,
{
    let mut groups: BTreeMap<String, Vec<&PromptRunResult>> = BTreeMap::new();
    for run in runs {
        if let Some(group) = group_of(*run) {
            groups.entry(group).or_default().push(*run);
        }
    }

    groups
        .into_iter()
        .map(|(group, members)| {
            let mut per_model: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
            let mut strategy_tally = (0usize, 0usize);
            for run in &members {
                if let Some(eval) = &run.evaluation {
                    for (key, result) in &eval.results {
                        let entry = per_model.entry(key.as_str()).or_default();
                        entry.1 += 1;
                        if result.correct {
                            entry.0 += 1;
                        }
                    }
                }
                if let Some(ok) = strategy_correct(run, strategy) {
                    strategy_tally.1 += 1;
                    if ok {
                        strategy_tally.0 += 1;
                    }
                }
            }

            let mut best: Option<(&str, f64)> = None;
            for (model, (correct, total)) in &per_model {
                let acc = ratio(*correct, *total);
                if best.map_or(true, |(_, top)| acc > top) {
                    best = Some((*model, acc));
                }
            }
            let best_model_accuracy = best.map(|(_, acc)| acc).unwrap_or(0.0);
            let strategy_accuracy =
                (strategy_tally.1 > 0).then(|| ratio(strategy_tally.0, strategy_tally.1));

            BreakdownRow {
                group,
                questions: members.len(),
                best_model: best.map(|(m, _)| m.to_string()),
                best_model_accuracy,
                strategy_accuracy,
                lift: strategy_accuracy.map(|s| s - best_model_accuracy),
            }
        })
        .collect()
}

fn notable_examples(
    runs: &[&PromptRunResult],
    strategy: Option<&str>,
    limit: usize,
) -> NotableExamples {
    let Some(strategy) = strategy else {
        return NotableExamples::default();
    };
    let mut out = NotableExamples {
        strategy: Some(strategy.to_string()),
        ..Default::default()
    };

    for run in runs {
        let Some(eval) = &run.evaluation else {
            continue;
        };
        let Some(result) = eval.strategy_results.get(strategy) else {
            continue;
        };
        let (correct, total) = model_tally(run);
        if total == 0 {
            continue;
        }
        let example = || NotableExample {
            question_id: run.question_id.clone(),
            prompt: excerpt(&run.prompt, 160),
            expected: result.expected.clone(),
            strategy_prediction: result.predicted.clone(),
            models_correct: correct,
            models_total: total,
        };
        if result.correct && correct * 2 < total && out.strategy_wins.len() < limit {
            out.strategy_wins.push(example());
        } else if !result.correct && correct * 2 > total && out.strategy_losses.len() < limit {
            out.strategy_losses.push(example());
        }
    }
    out
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut cut: String = flat.chars().take(max_chars).collect();
    cut.push('…');
    cut
}

fn cost(file: &BenchmarkResultsFile) -> CostSummary {
    #[derive(Default)]
    struct Acc {
        questions: usize,
        tokens: u64,
        nanos: i64,
    }

    let mut models: BTreeMap<String, Acc> = BTreeMap::new();
    let mut strategies: BTreeMap<String, Acc> = BTreeMap::new();
    let mut ensemble_total: i64 = 0;

    for run in &file.runs {
        let mut run_tokens = 0u64;
        let mut run_nanos = 0i64;
        let mut seen_in_run: Vec<String> = Vec::new();
        for response in &run.responses {
            let Some(usage) = &response.token_usage else {
                continue;
            };
            let key = response.key();
            let nanos = chat_cost(&response.spec(), usage);
            let acc = models.entry(key.clone()).or_default();
            if !seen_in_run.contains(&key) {
                acc.questions += 1;
                seen_in_run.push(key);
            }
            acc.tokens += u64::from(usage.total_tokens);
            acc.nanos += nanos;
            run_tokens += u64::from(usage.total_tokens);
            run_nanos += nanos;
        }
        ensemble_total += run_nanos;

        for (name, result) in &run.consensus {
            if result.error.is_some() {
                continue;
            }
            let (tokens, nanos) = match (&result.token_usage, &result.summarizer) {
                (Some(usage), Some(summarizer)) => {
                    let nanos = ModelSpec::parse(summarizer)
                        .map(|spec| chat_cost(&spec, usage))
                        .unwrap_or(0);
                    (u64::from(usage.total_tokens), nanos)
                }
                _ => (0, 0),
            };
            let acc = strategies.entry(name.clone()).or_default();
            acc.questions += 1;
            acc.tokens += run_tokens + tokens;
            acc.nanos += run_nanos + nanos;
            ensemble_total += nanos;
        }
    }

    let rows = |map: BTreeMap<String, Acc>| -> Vec<CostRow> {
        map.into_iter()
            .map(|(name, acc)| CostRow::new(name, acc.questions, acc.tokens, acc.nanos))
            .collect()
    };
    CostSummary {
        models: rows(models),
        strategies: rows(strategies),
        total_usd: nanodollars_to_usd(ensemble_total),
    }
}
