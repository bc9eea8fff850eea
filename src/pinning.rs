//! Reproducible question subsets for golden baselines.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::benchmark::BenchmarkResultsFile;
use crate::datasets::{BenchmarkQuestion, DatasetError, DatasetLoader};
use crate::tiers::TierConfig;

pub const GOLDEN_BASELINE_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum PinningError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(
        "dataset '{dataset}' no longer contains pinned question(s) {}; the upstream data changed, regenerate the baseline",
        .missing.join(", ")
    )]
    MissingQuestions { dataset: String, missing: Vec<String> },
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid baseline file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// mulberry32: a tiny 32-bit PRNG whose streams are identical on every
/// platform for a given seed.
#[derive(Debug, Clone)]
pub struct Mulberry32 {
    state: u32,
}

impl Mulberry32 {
    pub fn new(seed: u32) -> Self {
        Self { state: seed }
    }

    pub fn next_u32(&mut self) -> u32 {
        self.state = self.state.wrapping_add(0x6D2B_79F5);
        let mut t = self.state;
        t = (t ^ (t >> 15)).wrapping_mul(t | 1);
        t ^= t.wrapping_add((t ^ (t >> 7)).wrapping_mul(t | 61));
        t ^ (t >> 14)
    }

    /// Uniform in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        f64::from(self.next_u32()) / 4_294_967_296.0
    }
}

/// Fisher-Yates shuffle driven by mulberry32.
pub fn seeded_shuffle<T>(items: &mut [T], seed: u32) {
    let mut rng = Mulberry32::new(seed);
    for i in (1..items.len()).rev() {
        let j = (rng.next_f64() * (i + 1) as f64) as usize;
        items.swap(i, j);
    }
}

/// Shuffle (seeded when `seed` is set) and keep the first `sample_size`.
pub fn pin_questions(
    questions: &[BenchmarkQuestion],
    sample_size: usize,
    seed: Option<u32>,
) -> Vec<BenchmarkQuestion> {
    let mut shuffled = questions.to_vec();
    match seed {
        Some(seed) => seeded_shuffle(&mut shuffled, seed),
        None => shuffled.shuffle(&mut rand::thread_rng()),
    }
    shuffled.truncate(sample_size.min(questions.len()));
    shuffled
}

/// Pinned questions of one dataset.
#[derive(Debug, Clone)]
pub struct PinnedDataset {
    pub dataset: String,
    pub questions: Vec<BenchmarkQuestion>,
}

/// Load every dataset of `tier` and pin its sample.
pub async fn pin_questions_for_baseline(
    tier: &TierConfig,
    seed: Option<u32>,
    loader: &DatasetLoader,
) -> Result<Vec<PinnedDataset>, PinningError> {
    let mut pinned = Vec::with_capacity(tier.datasets.len());
    for entry in &tier.datasets {
        let dataset = loader.load(&entry.name).await?;
        let questions = pin_questions(&dataset.questions, entry.sample_size, seed);
        tracing::info!(
            dataset = %entry.name,
            pinned = questions.len(),
            available = dataset.questions.len(),
            "pinned baseline questions"
        );
        pinned.push(PinnedDataset {
            dataset: entry.name.clone(),
            questions,
        });
    }
    Ok(pinned)
}

/// Select `ids` from `questions` in `ids` order. Any absent id is an error.
pub fn select_pinned(
    dataset: &str,
    questions: &[BenchmarkQuestion],
    ids: &[String],
) -> Result<Vec<BenchmarkQuestion>, PinningError> {
    let by_id: HashMap<&str, &BenchmarkQuestion> =
        questions.iter().map(|q| (q.id.as_str(), q)).collect();
    let missing: Vec<String> = ids
        .iter()
        .filter(|id| !by_id.contains_key(id.as_str()))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(PinningError::MissingQuestions {
            dataset: dataset.to_string(),
            missing,
        });
    }
    Ok(ids
        .iter()
        .filter_map(|id| by_id.get(id.as_str()).map(|q| (*q).clone()))
        .collect())
}

/// Reload each baseline dataset and select exactly its pinned questions.
pub async fn load_pinned_questions(
    baseline: &GoldenBaselineFile,
    loader: &DatasetLoader,
) -> Result<Vec<PinnedDataset>, PinningError> {
    let mut pinned = Vec::with_capacity(baseline.datasets.len());
    for golden in &baseline.datasets {
        let dataset = loader.load(&golden.dataset).await?;
        let questions = select_pinned(&golden.dataset, &dataset.questions, &golden.question_ids)?;
        pinned.push(PinnedDataset {
            dataset: golden.dataset.clone(),
            questions,
        });
    }
    Ok(pinned)
}

// =============================================================================
// GOLDEN BASELINE FILE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoldenQuestionResult {
    pub question_id: String,
    pub model_correct: BTreeMap<String, bool>,
    #[serde(default)]
    pub strategy_correct: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoldenDataset {
    pub dataset: String,
    pub question_ids: Vec<String>,
    #[serde(default)]
    pub results: Vec<GoldenQuestionResult>,
}

impl GoldenDataset {
    /// Expected results for the pinned ids, taken from a completed run.
    /// Questions the run did not evaluate get no entry.
    pub fn from_results(question_ids: Vec<String>, file: &BenchmarkResultsFile) -> Self {
        let results = question_ids
            .iter()
            .filter_map(|id| file.runs.iter().find(|run| &run.question_id == id))
            .filter_map(|run| {
                let eval = run.evaluation.as_ref()?;
                Some(GoldenQuestionResult {
                    question_id: run.question_id.clone(),
                    model_correct: eval
                        .results
                        .iter()
                        .map(|(key, r)| (key.clone(), r.correct))
                        .collect(),
                    strategy_correct: eval
                        .strategy_results
                        .iter()
                        .map(|(key, r)| (key.clone(), r.correct))
                        .collect(),
                })
            })
            .collect();
        Self {
            dataset: file.dataset.clone(),
            question_ids,
            results,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoldenBaselineFile {
    pub version: u32,
    pub tier: String,
    #[serde(default)]
    pub seed: Option<u32>,
    pub created_at: String,
    pub datasets: Vec<GoldenDataset>,
}

impl GoldenBaselineFile {
    pub fn new(tier: impl Into<String>, seed: Option<u32>) -> Self {
        Self {
            version: GOLDEN_BASELINE_VERSION,
            tier: tier.into(),
            seed,
            created_at: chrono::Utc::now().to_rfc3339(),
            datasets: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, PinningError> {
        let raw = std::fs::read_to_string(path).map_err(|source| PinningError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| PinningError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), PinningError> {
        let io_err = |source| PinningError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| PinningError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn questions(n: usize) -> Vec<BenchmarkQuestion> {
        (0..n)
            .map(|i| BenchmarkQuestion {
                id: format!("q{i}"),
                prompt: format!("prompt {i}"),
                ground_truth: i.to_string(),
                category: None,
                difficulty: None,
            })
            .collect()
    }

    #[test]
    fn mulberry32_matches_reference_stream() {
        let mut rng = Mulberry32::new(42);
        assert_eq!(rng.next_u32(), 2_581_720_956);
        assert_eq!(rng.next_u32(), 1_925_393_290);
        assert_eq!(rng.next_u32(), 3_661_312_704);
    }

    #[test]
    fn seeded_shuffle_is_stable() {
        let mut items: Vec<u32> = (0..10).collect();
        seeded_shuffle(&mut items, 42);
        assert_eq!(items, vec![0, 7, 3, 5, 2, 1, 8, 9, 4, 6]);
    }

    #[test]
    fn same_seed_pins_the_same_questions() {
        let all = questions(50);
        let a = pin_questions(&all, 10, Some(42));
        let b = pin_questions(&all, 10, Some(42));
        assert_eq!(a, b);
        assert_eq!(a.len(), 10);
        assert_ne!(pin_questions(&all, 10, Some(7)), a);
        assert_eq!(pin_questions(&all, 500, Some(1)).len(), 50);
    }

    #[test]
    fn pinned_selection_keeps_baseline_order_and_fails_on_missing() {
        let all = questions(5);
        let ids = vec!["q3".to_string(), "q0".to_string()];
        let picked = select_pinned("d", &all, &ids).unwrap();
        assert_eq!(picked[0].id, "q3");
        assert_eq!(picked[1].id, "q0");

        let ids = vec!["q1".to_string(), "gone".to_string()];
        let err = select_pinned("d", &all, &ids).unwrap_err();
        assert!(matches!(&err, PinningError::MissingQuestions { missing, .. } if missing == &["gone"]));
        assert!(err.to_string().contains("gone"));
    }

    #[tokio::test]
    async fn pinning_a_tier_is_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        let loader = DatasetLoader::new(dir.path());
        let raw = serde_json::to_string(&questions(30)).unwrap();
        crate::datasets::write_with_checksum(&loader.cache_path("gpqa"), &raw).unwrap();

        let mut tier = TierConfig::preset("ci").unwrap();
        tier.datasets.retain(|d| d.name == "gpqa");
        tier.datasets[0].sample_size = 8;

        let a = pin_questions_for_baseline(&tier, Some(42), &loader).await.unwrap();
        let b = pin_questions_for_baseline(&tier, Some(42), &loader).await.unwrap();
        let ids = |p: &[PinnedDataset]| p[0].questions.iter().map(|q| q.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&a), ids(&b));
        assert_eq!(ids(&a).len(), 8);

        let mut baseline = GoldenBaselineFile::new("ci", Some(42));
        baseline.datasets.push(GoldenDataset {
            dataset: "gpqa".into(),
            question_ids: ids(&a),
            results: vec![],
        });
        let reloaded = load_pinned_questions(&baseline, &loader).await.unwrap();
        assert_eq!(ids(&reloaded), ids(&a));
    }
}
