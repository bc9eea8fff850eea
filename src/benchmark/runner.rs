//! Per-question pipeline: generate, consensus, evaluate, persist.

use std::path::Path;
use std::sync::Arc;

use super::resume::{assert_valid_resumed_output, RunParameters};
use super::{BenchmarkError, BenchmarkResultsFile, PromptRunResult, ResultsKind};
use crate::consensus::{ConsensusGenerator, Summarizer};
use crate::datasets::BenchmarkQuestion;
use crate::ensemble::{EnsembleRunner, ProviderResponse};
use crate::evaluation::{evaluate_consensus, evaluate_responses, self_consistency, Evaluator};
use crate::gateway::ModelSpec;

/// What one benchmark invocation runs.
#[derive(Debug, Clone)]
pub struct BenchmarkConfig {
    pub kind: ResultsKind,
    pub dataset: String,
    pub models: Vec<ModelSpec>,
    pub strategies: Vec<String>,
    /// Explicit summarizer; defaults to the first successful responder.
    pub summarizer: Option<ModelSpec>,
    /// Samples per model inside each ensemble (self-consistency when > 1).
    pub runs_per_model: usize,
    pub sample_size: usize,
}

impl BenchmarkConfig {
    /// The ensemble for one question: each model repeated `runs_per_model`
    /// times, models kept adjacent.
    pub fn ensemble_specs(&self) -> Vec<ModelSpec> {
        let runs = self.runs_per_model.max(1);
        self.models
            .iter()
            .flat_map(|spec| std::iter::repeat(spec.clone()).take(runs))
            .collect()
    }
}

/// Reported after every question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub question_id: String,
    pub skipped: bool,
}

pub struct BenchmarkRunner {
    ensemble: EnsembleRunner,
    consensus: Arc<dyn ConsensusGenerator>,
    evaluator: Option<Arc<dyn Evaluator>>,
}

impl BenchmarkRunner {
    pub fn new(ensemble: EnsembleRunner, consensus: Arc<dyn ConsensusGenerator>) -> Self {
        Self {
            ensemble,
            consensus,
            evaluator: None,
        }
    }

    pub fn with_evaluator(mut self, evaluator: Option<Arc<dyn Evaluator>>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Run every question not already in `output`, rewriting the file after
    /// each one. Provider failures are recorded; only I/O and resume
    /// mismatches stop the run.
    pub async fn run<P>(
        &self,
        config: &BenchmarkConfig,
        questions: &[BenchmarkQuestion],
        output: &Path,
        mut on_progress: P,
    ) -> Result<BenchmarkResultsFile, BenchmarkError>
    where
        P: FnMut(&Progress),
    {
        let mode = self.ensemble.registry().mode();
        let mut file = match BenchmarkResultsFile::load_if_exists(output)? {
            Some(existing) => {
                let params = RunParameters {
                    dataset: config.dataset.clone(),
                    mode,
                    models: config.models.clone(),
                    strategies: config.strategies.clone(),
                    sample_size: config.sample_size,
                    runs_per_model: config.runs_per_model,
                };
                assert_valid_resumed_output(output, &existing, &params)?;
                tracing::info!(
                    path = %output.display(),
                    existing = existing.runs.len(),
                    "resuming results file"
                );
                existing
            }
            None => BenchmarkResultsFile::new(
                config.kind,
                config.dataset.clone(),
                mode,
                config.models.clone(),
                config.strategies.clone(),
                config.sample_size,
            )
            .with_runs_per_model(config.runs_per_model),
        };

        let total = questions.len();
        for (idx, question) in questions.iter().enumerate() {
            let skipped = file.has_run(&question.id, &question.prompt);
            if skipped {
                tracing::info!(question = %question.id, "skipping question with existing run");
            } else {
                let run = self.run_question(config, question).await;
                file.runs.push(run);
                file.touch();
                file.save(output)?;
            }
            on_progress(&Progress {
                completed: idx + 1,
                total,
                question_id: question.id.clone(),
                skipped,
            });
        }

        if !output.exists() {
            // Nothing new ran (e.g. an empty sample); still leave a file behind.
            file.save(output)?;
        }
        Ok(file)
    }

    /// Generate, combine and score one question. Never fails: provider
    /// problems end up in the returned record.
    pub async fn run_question(
        &self,
        config: &BenchmarkConfig,
        question: &BenchmarkQuestion,
    ) -> PromptRunResult {
        let specs = config.ensemble_specs();
        let responses = self.ensemble.run(&question.prompt, &specs).await;

        let consensus = match self.summarizer(config, &responses) {
            Some(summarizer) if !config.strategies.is_empty() => {
                self.consensus
                    .generate_consensus(&config.strategies, &question.prompt, &responses, &summarizer)
                    .await
            }
            _ => Default::default(),
        };

        let evaluator = self.evaluator.as_deref();
        let mut evaluation =
            evaluate_responses(evaluator, &responses, &question.ground_truth, &question.prompt)
                .await;
        if let (Some(eval), Some(evaluator)) = (evaluation.as_mut(), evaluator) {
            eval.strategy_results =
                evaluate_consensus(evaluator, &consensus, &question.ground_truth, &question.prompt)
                    .await;
        }

        let self_consistency = if config.runs_per_model > 1 {
            self_consistency(&responses, evaluation.as_ref())
        } else {
            Default::default()
        };

        PromptRunResult {
            question_id: question.id.clone(),
            prompt: question.prompt.clone(),
            ground_truth: question.ground_truth.clone(),
            category: question.category.clone(),
            difficulty: question.difficulty.clone(),
            responses,
            consensus,
            evaluation,
            self_consistency,
        }
    }

    fn summarizer(
        &self,
        config: &BenchmarkConfig,
        responses: &[ProviderResponse],
    ) -> Option<Summarizer> {
        let spec = match &config.summarizer {
            Some(spec) => spec.clone(),
            None => responses.iter().find(|r| !r.is_error())?.spec(),
        };
        match self.ensemble.registry().resolve(&spec) {
            Ok(resolved) => Some(Summarizer {
                spec,
                client: resolved.client,
                model_id: resolved.model_id,
            }),
            Err(err) => {
                tracing::warn!(summarizer = %spec, error = %err, "cannot resolve summarizer; skipping consensus");
                None
            }
        }
    }
}
