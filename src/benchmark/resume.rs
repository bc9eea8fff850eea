//! Guard against resuming into an incompatible results file.

use std::collections::BTreeSet;
use std::path::Path;

use super::{BenchmarkError, BenchmarkResultsFile};
use crate::gateway::{ModelSpec, Mode};

/// The parameters a results file must share with the invocation resuming it.
#[derive(Debug, Clone)]
pub struct RunParameters {
    pub dataset: String,
    pub mode: Mode,
    pub models: Vec<ModelSpec>,
    pub strategies: Vec<String>,
    pub sample_size: usize,
    pub runs_per_model: usize,
}

fn model_set(models: &[ModelSpec]) -> BTreeSet<String> {
    models.iter().map(ModelSpec::key).collect()
}

fn strategy_set(strategies: &[String]) -> BTreeSet<String> {
    strategies.iter().map(|s| s.trim().to_ascii_lowercase()).collect()
}

fn fmt_set(set: &BTreeSet<String>) -> String {
    format!("[{}]", set.iter().cloned().collect::<Vec<_>>().join(", "))
}

/// Fails with every mismatched field when `existing` was produced with
/// different parameters. Models and strategies compare as sets.
pub fn assert_valid_resumed_output(
    path: &Path,
    existing: &BenchmarkResultsFile,
    params: &RunParameters,
) -> Result<(), BenchmarkError> {
    let mut mismatches = Vec::new();

    if existing.dataset != params.dataset {
        mismatches.push(format!(
            "dataset: file has '{}', run uses '{}'",
            existing.dataset, params.dataset
        ));
    }
    if existing.mode != params.mode {
        mismatches.push(format!(
            "mode: file has '{}', run uses '{}'",
            existing.mode, params.mode
        ));
    }

    let (file_models, run_models) = (model_set(&existing.models), model_set(&params.models));
    if file_models != run_models {
        mismatches.push(format!(
            "models: file has {}, run uses {}",
            fmt_set(&file_models),
            fmt_set(&run_models)
        ));
    }

    let (file_strategies, run_strategies) = (
        strategy_set(&existing.strategies),
        strategy_set(&params.strategies),
    );
    if file_strategies != run_strategies {
        mismatches.push(format!(
            "strategies: file has {}, run uses {}",
            fmt_set(&file_strategies),
            fmt_set(&run_strategies)
        ));
    }

    if existing.sample_size != params.sample_size {
        mismatches.push(format!(
            "sampleSize: file has {}, run uses {}",
            existing.sample_size, params.sample_size
        ));
    }
    if existing.runs_per_model != params.runs_per_model.max(1) {
        mismatches.push(format!(
            "runsPerModel: file has {}, run uses {}",
            existing.runs_per_model, params.runs_per_model
        ));
    }

    if mismatches.is_empty() {
        Ok(())
    } else {
        Err(BenchmarkError::ResumeMismatch {
            path: path.to_path_buf(),
            mismatches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmark::ResultsKind;

    fn file() -> BenchmarkResultsFile {
        BenchmarkResultsFile::new(
            ResultsKind::Benchmark,
            "gsm8k",
            Mode::Mock,
            vec![ModelSpec::new("mock", "a"), ModelSpec::new("mock", "b")],
            vec!["standard".into(), "majority".into()],
            10,
        )
    }

    fn params() -> RunParameters {
        RunParameters {
            dataset: "gsm8k".into(),
            mode: Mode::Mock,
            models: vec![ModelSpec::new("mock", "b"), ModelSpec::new("mock", "a")],
            strategies: vec!["majority".into(), "standard".into()],
            sample_size: 10,
            runs_per_model: 1,
        }
    }

    #[test]
    fn matching_parameters_in_any_order_are_accepted() {
        assert!(assert_valid_resumed_output(Path::new("out.json"), &file(), &params()).is_ok());
    }

    #[test]
    fn every_mismatched_field_is_reported() {
        let mut p = params();
        p.dataset = "gpqa".into();
        p.mode = Mode::Free;
        p.models.pop();
        p.strategies = vec!["elo".into()];
        p.sample_size = 20;

        let err = assert_valid_resumed_output(Path::new("out.json"), &file(), &p).unwrap_err();
        let BenchmarkError::ResumeMismatch { mismatches, .. } = &err else {
            panic!("unexpected error {err}");
        };
        assert_eq!(mismatches.len(), 5);
        let message = err.to_string();
        for field in ["dataset", "mode", "models", "strategies", "sampleSize"] {
            assert!(message.contains(field), "{message}");
        }
    }

    #[test]
    fn each_single_field_difference_is_fatal() {
        let cases: Vec<Box<dyn Fn(&mut RunParameters)>> = vec![
            Box::new(|p| p.dataset = "truthfulqa".into()),
            Box::new(|p| p.mode = Mode::Pro),
            Box::new(|p| p.models.push(ModelSpec::new("mock", "c"))),
            Box::new(|p| p.strategies.push("elo".into())),
            Box::new(|p| p.sample_size = 11),
        ];
        for mutate in cases {
            let mut p = params();
            mutate(&mut p);
            assert!(assert_valid_resumed_output(Path::new("o.json"), &file(), &p).is_err());
        }
    }
}
