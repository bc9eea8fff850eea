//! On-disk results format.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::BenchmarkError;
use crate::consensus::ConsensusResult;
use crate::ensemble::ProviderResponse;
use crate::evaluation::{PromptEvaluation, SelfConsistencyResult};
use crate::gateway::{ModelSpec, Mode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultsKind {
    Benchmark,
    Baseline,
}

impl ResultsKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultsKind::Benchmark => "benchmark",
            ResultsKind::Baseline => "baseline",
        }
    }
}

/// Everything recorded for one question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptRunResult {
    pub question_id: String,
    pub prompt: String,
    pub ground_truth: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    pub responses: Vec<ProviderResponse>,
    #[serde(default)]
    pub consensus: BTreeMap<String, ConsensusResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<PromptEvaluation>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub self_consistency: BTreeMap<String, SelfConsistencyResult>,
}

fn one() -> usize {
    1
}

fn is_one(n: &usize) -> bool {
    *n == 1
}

/// A benchmark or baseline run, rewritten after every question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkResultsFile {
    #[serde(rename = "type")]
    pub kind: ResultsKind,
    pub dataset: String,
    pub mode: Mode,
    pub models: Vec<ModelSpec>,
    pub strategies: Vec<String>,
    pub sample_size: usize,
    /// Samples per model inside each ensemble.
    #[serde(default = "one", skip_serializing_if = "is_one")]
    pub runs_per_model: usize,
    pub created_at: String,
    pub updated_at: String,
    pub runs: Vec<PromptRunResult>,
}

impl BenchmarkResultsFile {
    pub fn new(
        kind: ResultsKind,
        dataset: impl Into<String>,
        mode: Mode,
        models: Vec<ModelSpec>,
        strategies: Vec<String>,
        sample_size: usize,
    ) -> Self {
        let now = now_rfc3339();
        Self {
            kind,
            dataset: dataset.into(),
            mode,
            models,
            strategies,
            sample_size,
            runs_per_model: 1,
            created_at: now.clone(),
            updated_at: now,
            runs: Vec::new(),
        }
    }

    pub fn with_runs_per_model(mut self, runs: usize) -> Self {
        self.runs_per_model = runs.max(1);
        self
    }

    pub fn load(path: &Path) -> Result<Self, BenchmarkError> {
        let raw = std::fs::read_to_string(path).map_err(|source| BenchmarkError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| BenchmarkError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `None` when the file does not exist yet.
    pub fn load_if_exists(path: &Path) -> Result<Option<Self>, BenchmarkError> {
        if !path.exists() {
            return Ok(None);
        }
        Self::load(path).map(Some)
    }

    /// Rewrite the whole file. Writes a sibling temp file first and renames
    /// it over the target, so a crash never leaves a truncated file.
    pub fn save(&self, path: &Path) -> Result<(), BenchmarkError> {
        let io_err = |source| BenchmarkError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)
    }

    pub fn touch(&mut self) {
        self.updated_at = now_rfc3339();
    }

    /// Whether `question_id` or the exact `prompt` already has a run.
    pub fn has_run(&self, question_id: &str, prompt: &str) -> bool {
        self.runs
            .iter()
            .any(|run| run.question_id == question_id || run.prompt == prompt)
    }
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_file_uses_camel_case_and_type_tag() {
        let file = BenchmarkResultsFile::new(
            ResultsKind::Baseline,
            "gsm8k",
            Mode::Mock,
            vec![ModelSpec::new("mock", "a")],
            vec![],
            5,
        );
        let json = serde_json::to_value(&file).unwrap();
        assert_eq!(json["type"], "baseline");
        assert_eq!(json["sampleSize"], 5);
        assert_eq!(json["models"][0], "mock:a");
        assert!(json.get("runsPerModel").is_none());

        let back: BenchmarkResultsFile = serde_json::from_value(json).unwrap();
        assert_eq!(back, file);
    }

    #[test]
    fn save_round_trips_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.json");
        let mut file = BenchmarkResultsFile::new(
            ResultsKind::Benchmark,
            "gsm8k",
            Mode::Mock,
            vec![ModelSpec::new("mock", "a")],
            vec!["majority".into()],
            1,
        );
        file.runs.push(PromptRunResult {
            question_id: "q1".into(),
            prompt: "2+2?".into(),
            ground_truth: "4".into(),
            category: None,
            difficulty: Some("easy".into()),
            responses: vec![ProviderResponse::success("mock", "a", "#### 4", 3, None)],
            consensus: BTreeMap::new(),
            evaluation: None,
            self_consistency: BTreeMap::new(),
        });
        file.save(&path).unwrap();

        let loaded = BenchmarkResultsFile::load(&path).unwrap();
        assert_eq!(loaded, file);
        assert!(loaded.has_run("q1", "other"));
        assert!(loaded.has_run("other", "2+2?"));
        assert!(!loaded.has_run("q2", "3+3?"));
        assert!(!dir.path().join("nested/out.json.tmp").exists());
    }
}
