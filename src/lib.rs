#![forbid(unsafe_code)]

//! # ensemble-eval
//!
//! Benchmark several LLMs side by side on question datasets. Each question is
//! fanned out to an ensemble of `provider:model` specs under an adaptive
//! (AIMD) concurrency limit, combined with consensus strategies, scored by an
//! evaluator and appended to a resumable JSON results file. The analysis
//! engine turns results files into paired significance tests, agreement
//! calibration, breakdowns and cost tables.

pub mod analysis;
pub mod benchmark;
pub mod cache;
pub mod consensus;
pub mod datasets;
pub mod ensemble;
pub mod evaluation;
pub mod gateway;
pub mod limiter;
pub mod pinning;
pub mod tiers;

pub use analysis::{analyze, compare_files, render_markdown, AnalysisOptions, AnalysisSummary};
pub use benchmark::{BenchmarkConfig, BenchmarkResultsFile, BenchmarkRunner, ResultsKind};
pub use cache::{ResponseCache, SqliteResponseCache};
pub use consensus::{ConsensusGenerator, ConsensusResult, LlmConsensusGenerator};
pub use datasets::{BenchmarkQuestion, DatasetLoader};
pub use ensemble::{EnsembleRunner, ProviderResponse};
pub use gateway::{ModelSpec, Mode, ProviderClient, ProviderError, ProviderRegistry};
pub use limiter::{ConcurrencyLimiter, LimiterConfig};
