//! Benchmark datasets: registry, record parsing and the local cache.

pub mod checksum;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use checksum::{
    checksum_path, sha256_hex, verify_cache_integrity, write_checksum, write_with_checksum,
    CacheIntegrity,
};

use crate::evaluation::{extract_numeric_answer, EvaluatorKind};

/// One benchmark item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkQuestion {
    pub id: String,
    pub prompt: String,
    /// Empty means the question is not scored.
    #[serde(default)]
    pub ground_truth: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse dataset '{name}': {message}")]
    Parse { name: String, message: String },
    #[error("download failed: {0}")]
    Download(#[from] reqwest::Error),
    #[error("download of {url} returned HTTP {status}")]
    DownloadStatus { url: String, status: u16 },
    #[error("checksum mismatch for cached dataset {} (corrupted or tampered; delete it to re-fetch)", .path.display())]
    ChecksumMismatch { path: PathBuf },
    #[error("dataset '{name}' is not cached at {} and has no download source", .path.display())]
    NotCached { name: String, path: PathBuf },
    #[error("dataset '{name}' contains duplicate question id '{id}'")]
    DuplicateId { name: String, id: String },
    #[error("dataset '{0}' has no questions")]
    Empty(String),
}

/// A named dataset the loader knows how to find.
#[derive(Debug, Clone, Copy)]
pub struct DatasetSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub evaluator: EvaluatorKind,
    pub source_url: Option<&'static str>,
}

pub const GSM8K: DatasetSpec = DatasetSpec {
    name: "gsm8k",
    description: "Grade-school math word problems, numeric answers",
    evaluator: EvaluatorKind::Numeric,
    source_url: Some(
        "https://raw.githubusercontent.com/openai/grade-school-math/master/grade_school_math/data/test.jsonl",
    ),
};

pub const TRUTHFULQA: DatasetSpec = DatasetSpec {
    name: "truthfulqa",
    description: "TruthfulQA multiple choice (MC1)",
    evaluator: EvaluatorKind::Choice,
    source_url: None,
};

pub const GPQA: DatasetSpec = DatasetSpec {
    name: "gpqa",
    description: "Graduate-level science multiple choice",
    evaluator: EvaluatorKind::Choice,
    source_url: None,
};

pub static REGISTRY: [DatasetSpec; 3] = [GSM8K, TRUTHFULQA, GPQA];

pub fn lookup(name: &str) -> Option<&'static DatasetSpec> {
    let name = name.trim().to_ascii_lowercase();
    REGISTRY.iter().find(|spec| spec.name == name)
}

/// Evaluator for a dataset alias or path; files default to numeric unless
/// their questions look like multiple choice.
pub fn default_evaluator(name: &str, questions: &[BenchmarkQuestion]) -> EvaluatorKind {
    if let Some(spec) = lookup(name) {
        return spec.evaluator;
    }
    let lettered = questions
        .iter()
        .filter(|q| {
            let gt = q.ground_truth.trim();
            gt.len() == 1 && gt.chars().all(|c| c.is_ascii_alphabetic())
        })
        .count();
    if !questions.is_empty() && lettered * 2 > questions.len() {
        EvaluatorKind::Choice
    } else {
        EvaluatorKind::Numeric
    }
}

/// Loaded dataset plus where it came from.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub name: String,
    pub questions: Vec<BenchmarkQuestion>,
    pub evaluator: EvaluatorKind,
}

impl Dataset {
    /// The first `n` questions in dataset order.
    pub fn sample(&self, n: usize) -> Vec<BenchmarkQuestion> {
        self.questions.iter().take(n).cloned().collect()
    }
}

/// Resolves dataset aliases and paths, maintaining the checksummed cache.
#[derive(Debug, Clone)]
pub struct DatasetLoader {
    cache_dir: PathBuf,
    client: reqwest::Client,
    sources: HashMap<String, String>,
}

impl DatasetLoader {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self {
            cache_dir: cache_dir.into(),
            client,
            sources: HashMap::new(),
        }
    }

    pub fn default_cache_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("EVAL_DATASET_CACHE_DIR") {
            return PathBuf::from(dir);
        }
        PathBuf::from(".eval-cache/datasets")
    }

    /// Override (or add) the download source for an alias.
    pub fn with_source(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.sources.insert(name.into(), url.into());
        self
    }

    pub fn cache_path(&self, name: &str) -> PathBuf {
        self.cache_dir.join(format!("{name}.json"))
    }

    fn source_for(&self, name: &str) -> Option<String> {
        self.sources
            .get(name)
            .cloned()
            .or_else(|| lookup(name).and_then(|s| s.source_url).map(str::to_string))
    }

    /// Load an alias (through the cache) or a JSON/JSONL file path.
    pub async fn load(&self, name_or_path: &str) -> Result<Dataset, DatasetError> {
        let as_path = Path::new(name_or_path);
        let is_alias = lookup(name_or_path).is_some() || self.sources.contains_key(name_or_path);
        if !is_alias && as_path.is_file() {
            let name = as_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| name_or_path.to_string());
            let raw = read(as_path)?;
            let questions = parse_questions(&name, &raw)?;
            let evaluator = default_evaluator(&name, &questions);
            return Ok(Dataset {
                name,
                questions,
                evaluator,
            });
        }

        let name = name_or_path.trim().to_ascii_lowercase();
        let questions = self.load_cached(&name).await?;
        let evaluator = default_evaluator(&name, &questions);
        Ok(Dataset {
            name,
            questions,
            evaluator,
        })
    }

    async fn load_cached(&self, name: &str) -> Result<Vec<BenchmarkQuestion>, DatasetError> {
        let path = self.cache_path(name);
        let state = verify_cache_integrity(&path).map_err(|source| DatasetError::Io {
            path: path.clone(),
            source,
        })?;
        let source = self.source_for(name);

        match (state, source) {
            (CacheIntegrity::Valid, _) => parse_questions(name, &read(&path)?),
            (state, Some(url)) => {
                if state == CacheIntegrity::Mismatch {
                    tracing::error!(path = %path.display(), "dataset checksum mismatch; re-downloading");
                } else {
                    tracing::info!(dataset = name, state = state.as_str(), url = %url, "downloading dataset");
                }
                self.download(name, &url, &path).await
            }
            (CacheIntegrity::Mismatch, None) => {
                tracing::error!(path = %path.display(), "dataset checksum mismatch");
                Err(DatasetError::ChecksumMismatch { path })
            }
            (CacheIntegrity::NoChecksum, None) => {
                tracing::warn!(path = %path.display(), "cached dataset has no checksum; recording one now");
                write_checksum(&path).map_err(|source| DatasetError::Io {
                    path: path.clone(),
                    source,
                })?;
                parse_questions(name, &read(&path)?)
            }
            (CacheIntegrity::Missing, None) => Err(DatasetError::NotCached {
                name: name.to_string(),
                path,
            }),
        }
    }

    async fn download(
        &self,
        name: &str,
        url: &str,
        path: &Path,
    ) -> Result<Vec<BenchmarkQuestion>, DatasetError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DatasetError::DownloadStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.text().await?;
        let questions = parse_questions(name, &body)?;

        let normalized = serde_json::to_string_pretty(&questions).map_err(|e| DatasetError::Parse {
            name: name.to_string(),
            message: e.to_string(),
        })?;
        write_with_checksum(path, &normalized).map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(questions)
    }
}

fn read(path: &Path) -> Result<String, DatasetError> {
    std::fs::read_to_string(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// =============================================================================
// RECORD PARSING
// =============================================================================

/// Parse a JSON array or JSONL body into questions.
pub fn parse_questions(name: &str, raw: &str) -> Result<Vec<BenchmarkQuestion>, DatasetError> {
    let parse_err = |message: String| DatasetError::Parse {
        name: name.to_string(),
        message,
    };

    let trimmed = raw.trim_start();
    let records: Vec<Value> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).map_err(|e| parse_err(e.to_string()))?
    } else {
        trimmed
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line).map_err(|e| parse_err(format!("line {}: {e}", n + 1)))
            })
            .collect::<Result<_, _>>()?
    };

    let mut seen = HashSet::new();
    let mut questions = Vec::with_capacity(records.len());
    for (idx, record) in records.iter().enumerate() {
        let question = parse_record(name, idx, record)
            .ok_or_else(|| parse_err(format!("record {idx} has no recognizable shape")))?;
        if !seen.insert(question.id.clone()) {
            return Err(DatasetError::DuplicateId {
                name: name.to_string(),
                id: question.id,
            });
        }
        questions.push(question);
    }

    if questions.is_empty() {
        return Err(DatasetError::Empty(name.to_string()));
    }
    Ok(questions)
}

fn str_field<'a>(record: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| record.get(*k).and_then(Value::as_str))
}

fn id_field(record: &Value) -> Option<String> {
    match record.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_record(name: &str, idx: usize, record: &Value) -> Option<BenchmarkQuestion> {
    let id = id_field(record).unwrap_or_else(|| format!("{name}-{idx}"));
    let category = str_field(record, &["category", "subject"]).map(str::to_string);
    let difficulty = str_field(record, &["difficulty", "level"]).map(str::to_string);

    // Native shape.
    if let Some(prompt) = str_field(record, &["prompt"]) {
        let ground_truth = str_field(record, &["groundTruth", "ground_truth"]).unwrap_or_default();
        return Some(BenchmarkQuestion {
            id,
            prompt: prompt.to_string(),
            ground_truth: ground_truth.to_string(),
            category,
            difficulty,
        });
    }

    let question = str_field(record, &["question", "Question"])?;

    // Multiple choice.
    if let Some((choices, answer)) = multiple_choice(record) {
        return Some(BenchmarkQuestion {
            id,
            prompt: render_choices(question, &choices),
            ground_truth: answer,
            category,
            difficulty,
        });
    }

    // GSM8K, or any question/answer pair.
    let answer = str_field(record, &["answer", "Answer"]).unwrap_or_default();
    let ground_truth = if answer.contains("####") {
        extract_numeric_answer(answer).unwrap_or_default()
    } else {
        answer.trim().to_string()
    };
    Some(BenchmarkQuestion {
        id,
        prompt: question.to_string(),
        ground_truth,
        category,
        difficulty,
    })
}

/// Choices and the correct letter from `choices`/`options` + `answer`, or a
/// TruthfulQA `mc1_targets` block.
fn multiple_choice(record: &Value) -> Option<(Vec<String>, String)> {
    if let Some(targets) = record.get("mc1_targets") {
        let choices = string_array(targets.get("choices")?)?;
        let labels = targets.get("labels")?.as_array()?;
        let correct = labels.iter().position(|l| l.as_i64() == Some(1))?;
        return Some((choices, letter_for(correct)?));
    }

    let choices = ["choices", "options"]
        .iter()
        .find_map(|k| record.get(*k).and_then(string_array))?;
    let answer = ["answer", "label", "correct"]
        .iter()
        .find_map(|k| record.get(*k))?;
    let letter = match answer {
        Value::Number(n) => letter_for(n.as_u64()? as usize)?,
        Value::String(s) => {
            let s = s.trim();
            if s.len() == 1 && s.chars().all(|c| c.is_ascii_alphabetic()) {
                s.to_ascii_uppercase()
            } else if let Ok(index) = s.parse::<usize>() {
                letter_for(index)?
            } else {
                letter_for(choices.iter().position(|c| c.trim() == s)?)?
            }
        }
        _ => return None,
    };
    Some((choices, letter))
}

fn string_array(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}

fn letter_for(index: usize) -> Option<String> {
    (index < 26).then(|| char::from(b'A' + index as u8).to_string())
}

/// Lettered multiple-choice prompt.
pub fn render_choices(question: &str, choices: &[String]) -> String {
    let mut prompt = question.trim().to_string();
    prompt.push_str("\n\n");
    for (idx, choice) in choices.iter().enumerate() {
        let letter = char::from(b'A' + (idx as u8).min(25));
        prompt.push_str(&format!("{letter}) {}\n", choice.trim()));
    }
    prompt.push_str("\nAnswer with the letter of the correct option, e.g. \"The answer is (A)\".");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gsm8k_jsonl_and_synthesizes_ids() {
        let raw = [
            serde_json::json!({
                "question": "Tom has 3 apples and buys 2,000 more.",
                "answer": "3 + 2000 = 2003\n#### 2,003",
            }),
            serde_json::json!({"question": "What is 1+1?", "answer": "#### 2"}),
        ]
        .iter()
        .map(|line| format!("{line}\n"))
        .collect::<String>();
        let questions = parse_questions("gsm8k", &raw).unwrap();
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0].id, "gsm8k-0");
        assert_eq!(questions[0].ground_truth, "2003");
        assert_eq!(questions[1].id, "gsm8k-1");
    }

    #[test]
    fn parses_multiple_choice_shapes() {
        let raw = r#"[
            {"id": "q1", "question": "Largest planet?", "choices": ["Mars", "Jupiter"], "answer": 1},
            {"id": "q2", "question": "Red planet?", "options": ["Mars", "Venus"], "answer": "a", "subject": "astronomy"},
            {"question": "Is the sky green?", "mc1_targets": {"choices": ["No", "Yes"], "labels": [1, 0]}}
        ]"#;
        let questions = parse_questions("mc", raw).unwrap();
        assert_eq!(questions[0].ground_truth, "B");
        assert!(questions[0].prompt.contains("A) Mars\nB) Jupiter"));
        assert_eq!(questions[1].ground_truth, "A");
        assert_eq!(questions[1].category.as_deref(), Some("astronomy"));
        assert_eq!(questions[2].ground_truth, "A");
        assert_eq!(questions[2].id, "mc-2");
        assert_eq!(default_evaluator("mc", &questions), EvaluatorKind::Choice);
    }

    #[test]
    fn native_records_round_trip() {
        let q = BenchmarkQuestion {
            id: "x".into(),
            prompt: "2+2?".into(),
            ground_truth: "4".into(),
            category: None,
            difficulty: Some("easy".into()),
        };
        let raw = serde_json::to_string(&vec![q.clone()]).unwrap();
        assert_eq!(parse_questions("native", &raw).unwrap(), vec![q]);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let raw = r#"[{"id": "a", "prompt": "1"}, {"id": "a", "prompt": "2"}]"#;
        let err = parse_questions("dup", raw).unwrap_err();
        assert!(matches!(err, DatasetError::DuplicateId { id, .. } if id == "a"));
    }

    #[tokio::test]
    async fn cache_mismatch_without_source_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let loader = DatasetLoader::new(dir.path());
        let path = loader.cache_path("gpqa");
        write_with_checksum(&path, r#"[{"id": "g1", "prompt": "p", "groundTruth": "A"}]"#).unwrap();

        let loaded = loader.load("gpqa").await.unwrap();
        assert_eq!(loaded.questions.len(), 1);
        assert_eq!(loaded.evaluator, EvaluatorKind::Choice);

        std::fs::write(&path, r#"[{"id": "g1", "prompt": "p", "groundTruth": "B"}]"#).unwrap();
        let err = loader.load("gpqa").await.unwrap_err();
        assert!(matches!(err, DatasetError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn unchecksummed_cache_gets_a_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let loader = DatasetLoader::new(dir.path());
        let path = loader.cache_path("truthfulqa");
        std::fs::write(&path, r#"[{"id": "t1", "prompt": "p", "groundTruth": "A"}]"#).unwrap();

        loader.load("truthfulqa").await.unwrap();
        assert_eq!(verify_cache_integrity(&path).unwrap(), CacheIntegrity::Valid);
    }

    #[tokio::test]
    async fn missing_cache_without_source_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = DatasetLoader::new(dir.path()).load("gpqa").await.unwrap_err();
        assert!(matches!(err, DatasetError::NotCached { .. }));
    }
}
