//! Evaluation tiers: which datasets, models and strategies a run covers.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::gateway::ModelSpec;

#[derive(Debug, thiserror::Error)]
pub enum TierError {
    #[error("unknown tier '{0}' (expected quick, ci, full or a JSON file)")]
    Unknown(String),
    #[error("cannot read tier file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid tier file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierDataset {
    pub name: String,
    pub sample_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierConfig {
    pub name: String,
    pub datasets: Vec<TierDataset>,
    pub models: Vec<ModelSpec>,
    #[serde(default)]
    pub strategies: Vec<String>,
    #[serde(default = "default_runs")]
    pub runs: usize,
    #[serde(default)]
    pub request_delay_ms: u64,
    #[serde(default = "default_significance")]
    pub significance_threshold: f64,
    #[serde(default)]
    pub summarizer: Option<ModelSpec>,
}

fn default_runs() -> usize {
    1
}

fn default_significance() -> f64 {
    0.05
}

fn datasets(entries: &[(&str, usize)]) -> Vec<TierDataset> {
    entries
        .iter()
        .map(|(name, sample_size)| TierDataset {
            name: name.to_string(),
            sample_size: *sample_size,
        })
        .collect()
}

fn models(entries: &[(&str, &str)]) -> Vec<ModelSpec> {
    entries
        .iter()
        .map(|(provider, model)| ModelSpec::new(*provider, *model))
        .collect()
}

impl TierConfig {
    pub const PRESETS: [&'static str; 3] = ["quick", "ci", "full"];

    pub fn preset(name: &str) -> Option<Self> {
        let tier = match name.trim().to_ascii_lowercase().as_str() {
            "quick" => Self {
                name: "quick".into(),
                datasets: datasets(&[("gsm8k", 10), ("truthfulqa", 10)]),
                models: models(&[("mock", "mock-alpha"), ("mock", "mock-beta"), ("mock", "mock-gamma")]),
                strategies: vec!["majority".into()],
                runs: 1,
                request_delay_ms: 0,
                significance_threshold: 0.05,
                summarizer: None,
            },
            "ci" => Self {
                name: "ci".into(),
                datasets: datasets(&[("gsm8k", 20), ("gpqa", 20)]),
                models: models(&[
                    ("openai", "gpt-4o-mini"),
                    ("anthropic", "claude-3-5-haiku-latest"),
                    ("google", "gemini-2.0-flash"),
                ]),
                strategies: vec!["standard".into(), "majority".into()],
                runs: 1,
                request_delay_ms: 250,
                significance_threshold: 0.05,
                summarizer: Some(ModelSpec::new("openai", "gpt-4o-mini")),
            },
            "full" => Self {
                name: "full".into(),
                datasets: datasets(&[("gsm8k", 100), ("truthfulqa", 100), ("gpqa", 100)]),
                models: models(&[
                    ("openai", "gpt-4.1-mini"),
                    ("anthropic", "claude-3-5-haiku-latest"),
                    ("google", "gemini-2.5-flash"),
                    ("xai", "grok-3-mini"),
                ]),
                strategies: vec!["standard".into(), "majority".into(), "elo".into()],
                runs: 1,
                request_delay_ms: 500,
                significance_threshold: 0.05,
                summarizer: Some(ModelSpec::new("openai", "gpt-4.1-mini")),
            },
            _ => return None,
        };
        Some(tier)
    }

    /// A preset name or the path of a JSON tier file.
    pub fn load(name_or_path: &str) -> Result<Self, TierError> {
        if let Some(tier) = Self::preset(name_or_path) {
            return Ok(tier);
        }
        let path = Path::new(name_or_path);
        if !path.is_file() {
            return Err(TierError::Unknown(name_or_path.to_string()));
        }
        let raw = std::fs::read_to_string(path).map_err(|source| TierError::Io {
            path: name_or_path.to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| TierError::Parse {
            path: name_or_path.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_exist() {
        for name in TierConfig::PRESETS {
            let tier = TierConfig::preset(name).unwrap();
            assert_eq!(tier.name, name);
            assert!(!tier.datasets.is_empty());
            assert!(!tier.models.is_empty());
        }
        assert!(TierConfig::preset("nightly").is_none());
    }

    #[test]
    fn tier_files_fill_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tier.json");
        std::fs::write(
            &path,
            r#"{"name": "local", "datasets": [{"name": "gsm8k", "sampleSize": 3}], "models": ["mock:a"]}"#,
        )
        .unwrap();
        let tier = TierConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(tier.runs, 1);
        assert_eq!(tier.significance_threshold, 0.05);
        assert_eq!(tier.models[0].key(), "mock:a");
        assert!(matches!(TierConfig::load("nope"), Err(TierError::Unknown(_))));
    }
}
