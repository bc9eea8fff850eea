//! Benchmark runs and their results files.

pub mod resume;
pub mod runner;
pub mod types;

use std::path::PathBuf;

pub use resume::{assert_valid_resumed_output, RunParameters};
pub use runner::{BenchmarkConfig, BenchmarkRunner, Progress};
pub use types::{BenchmarkResultsFile, PromptRunResult, ResultsKind};

#[derive(Debug, thiserror::Error)]
pub enum BenchmarkError {
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid results file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot serialize results: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("cannot resume {}: {}", .path.display(), .mismatches.join("; "))]
    ResumeMismatch {
        path: PathBuf,
        mismatches: Vec<String>,
    },
}
