#![forbid(unsafe_code)]

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ensemble_eval::analysis::{
    self, check_regressions, compare_files, render_markdown, report::render_comparisons,
    AnalysisOptions,
};
use ensemble_eval::benchmark::{
    BenchmarkConfig, BenchmarkResultsFile, BenchmarkRunner, Progress, ResultsKind,
};
use ensemble_eval::cache::{ResponseCache, SqliteResponseCache};
use ensemble_eval::consensus::{ConsensusStrategy, LlmConsensusGenerator};
use ensemble_eval::datasets::{default_evaluator, BenchmarkQuestion, DatasetLoader};
use ensemble_eval::ensemble::EnsembleRunner;
use ensemble_eval::evaluation::{build_evaluator, EvaluatorKind};
use ensemble_eval::gateway::{GatewayConfig, ModelSpec, Mode, ProviderRegistry};
use ensemble_eval::limiter::{ConcurrencyLimiter, LimiterConfig};
use ensemble_eval::pinning::{
    load_pinned_questions, pin_questions_for_baseline, GoldenBaselineFile, GoldenDataset,
    PinnedDataset,
};
use ensemble_eval::tiers::TierConfig;

type CliResult<T> = Result<T, Box<dyn Error>>;

#[derive(Parser)]
#[command(name = "ensemble-eval", version, about = "Multi-model LLM benchmark runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// How requests reach providers.
#[derive(Args, Clone, Debug)]
struct EngineArgs {
    /// mock (offline), free (own API keys) or pro (OpenRouter)
    #[arg(long, default_value = "mock")]
    mode: Mode,
    /// Initial concurrency of the adaptive limiter
    #[arg(long)]
    concurrency: Option<usize>,
    /// Reuse cached provider responses
    #[arg(long, overrides_with = "no_cache")]
    cache: bool,
    #[arg(long = "no-cache", overrides_with = "cache")]
    no_cache: bool,
    /// Fan each question out to every model at once (default)
    #[arg(long, overrides_with = "no_parallel")]
    parallel: bool,
    /// Query models one after another
    #[arg(long = "no-parallel", overrides_with = "parallel")]
    no_parallel: bool,
    /// Delay between requests in milliseconds
    #[arg(long)]
    request_delay_ms: Option<u64>,
}

#[derive(Args, Clone, Debug)]
struct RunArgs {
    /// Model as provider:model; repeat or comma-separate
    #[arg(long = "model", value_delimiter = ',')]
    models: Vec<String>,
    /// Number of questions to run
    #[arg(long, default_value_t = 10)]
    samples: usize,
    /// Consensus strategies: standard, majority, elo
    #[arg(long, value_delimiter = ',', default_value = "majority")]
    strategies: Vec<String>,
    /// Summarizer model; defaults to the first model that answered
    #[arg(long)]
    summarizer: Option<String>,
    /// numeric, choice, judge or none; defaults per dataset
    #[arg(long)]
    evaluator: Option<String>,
    /// Judge model for --evaluator judge
    #[arg(long)]
    judge: Option<String>,
    /// Samples per model (self-consistency when > 1)
    #[arg(long, default_value_t = 1)]
    runs: usize,
    /// Results file (resumed when it exists)
    #[arg(long)]
    output: Option<PathBuf>,
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Run models and consensus strategies over a dataset sample
    Benchmark {
        /// Dataset alias (gsm8k, truthfulqa, gpqa) or JSON/JSONL path
        dataset: String,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Run models alone (no consensus) over a dataset sample
    Baseline {
        dataset: String,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Run the quick tier and print its reports
    QuickEval {
        #[arg(long, default_value = "results")]
        output_dir: PathBuf,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Run every dataset of a tier
    Run {
        /// Preset (quick, ci, full) or tier JSON file
        #[arg(long, default_value = "quick")]
        tier: String,
        #[arg(long, default_value = "results")]
        output_dir: PathBuf,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Analyze a results file
    Analyze {
        file: PathBuf,
        /// md or json
        #[arg(long, default_value = "md")]
        format: String,
        #[arg(long, default_value_t = 0.05)]
        significance: f64,
        /// Strategy used for lift and notable examples
        #[arg(long)]
        strategy: Option<String>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Compare the shared predictors of two results files
    Compare {
        a: PathBuf,
        b: PathBuf,
        #[arg(long, default_value = "md")]
        format: String,
        #[arg(long, default_value_t = 0.05)]
        significance: f64,
    },
    /// Pin a tier's questions, run them and write a golden baseline
    UpdateBaseline {
        #[arg(long, default_value = "ci")]
        tier: String,
        #[arg(long)]
        out: PathBuf,
        /// Seed for reproducible pinning
        #[arg(long)]
        seed: Option<u32>,
        #[arg(long, default_value = "results")]
        output_dir: PathBuf,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Rerun a golden baseline; exits 1 on a significant regression
    CiEval {
        #[arg(long)]
        baseline: PathBuf,
        /// Overrides the tier's significance threshold
        #[arg(long)]
        significance: Option<f64>,
        #[arg(long, default_value = "results")]
        output_dir: PathBuf,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Export the response cache to JSONL
    CacheExport {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Prune the response cache (by age and/or size)
    CachePrune {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        max_age_days: Option<u64>,
        #[arg(long)]
        max_rows: Option<usize>,
    },
}

// =============================================================================
// SESSION
// =============================================================================

/// Provider clients, limiter and cache shared by every run of one command.
struct Session {
    registry: ProviderRegistry,
    limiter: Arc<ConcurrencyLimiter>,
    cache: Option<Arc<dyn ResponseCache>>,
    parallel: bool,
    request_delay: Duration,
}

impl Session {
    fn new(engine: &EngineArgs, default_delay_ms: u64) -> CliResult<Self> {
        let mut config = LimiterConfig::default();
        if let Some(initial) = engine.concurrency {
            config = config.with_initial(initial);
        }
        let limiter = Arc::new(ConcurrencyLimiter::new(config));
        let registry =
            ProviderRegistry::from_env(engine.mode, GatewayConfig::default(), Some(limiter.clone()))?;

        let cache: Option<Arc<dyn ResponseCache>> = if engine.cache && !engine.no_cache {
            let path = SqliteResponseCache::default_path();
            tracing::info!(path = %path.display(), "response cache enabled");
            Some(Arc::new(SqliteResponseCache::new(path)?))
        } else {
            None
        };

        Ok(Self {
            registry,
            limiter,
            cache,
            parallel: !engine.no_parallel,
            request_delay: Duration::from_millis(engine.request_delay_ms.unwrap_or(default_delay_ms)),
        })
    }

    fn runner(&self, evaluator: EvaluatorKind, judge: Option<&ModelSpec>) -> CliResult<BenchmarkRunner> {
        let judge = match (evaluator, judge) {
            (EvaluatorKind::Judge, Some(spec)) => {
                let resolved = self.registry.resolve(spec)?;
                Some((resolved.client, resolved.model_id))
            }
            _ => None,
        };
        let evaluator = build_evaluator(evaluator, judge)?;

        let mut ensemble = EnsembleRunner::new(self.registry.clone(), self.limiter.clone())
            .with_request_delay(self.request_delay)
            .with_parallel(self.parallel);
        if let Some(cache) = &self.cache {
            ensemble = ensemble.with_cache(cache.clone());
        }
        let consensus = Arc::new(LlmConsensusGenerator::new().with_limiter(self.limiter.clone()));
        Ok(BenchmarkRunner::new(ensemble, consensus).with_evaluator(evaluator))
    }
}

async fn run_benchmark(
    session: &Session,
    config: &BenchmarkConfig,
    questions: &[BenchmarkQuestion],
    evaluator: EvaluatorKind,
    judge: Option<&ModelSpec>,
    output: &Path,
) -> CliResult<BenchmarkResultsFile> {
    let mut specs = config.models.clone();
    specs.extend(config.summarizer.clone());
    session.registry.ensure_resolvable(&specs)?;

    let runner = session.runner(evaluator, judge)?;
    tracing::info!(
        dataset = %config.dataset,
        questions = questions.len(),
        models = config.models.len(),
        evaluator = %evaluator,
        output = %output.display(),
        "starting benchmark"
    );
    let file = runner
        .run(config, questions, output, |p: &Progress| {
            tracing::info!(
                completed = p.completed,
                total = p.total,
                question = %p.question_id,
                skipped = p.skipped,
                "progress"
            );
        })
        .await?;
    Ok(file)
}

/// Run each dataset of `tier` into its own results file. `fresh` stamps the
/// file names so earlier runs are never resumed.
async fn run_tier(
    tier: &TierConfig,
    sets: &[PinnedDataset],
    engine: &EngineArgs,
    output_dir: &Path,
    fresh: bool,
) -> CliResult<Vec<BenchmarkResultsFile>> {
    let session = Session::new(engine, tier.request_delay_ms)?;
    let judge = tier.summarizer.clone().or_else(|| tier.models.first().cloned());
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.6fZ").to_string();

    let mut files = Vec::with_capacity(sets.len());
    for set in sets {
        let config = BenchmarkConfig {
            kind: ResultsKind::Benchmark,
            dataset: set.dataset.clone(),
            models: tier.models.clone(),
            strategies: tier.strategies.clone(),
            summarizer: tier.summarizer.clone(),
            runs_per_model: tier.runs.max(1),
            sample_size: set.questions.len(),
        };
        let name = if fresh {
            format!("{}-{}-{}.json", tier.name, set.dataset, stamp)
        } else {
            format!("{}-{}.json", tier.name, set.dataset)
        };
        let evaluator = default_evaluator(&set.dataset, &set.questions);
        let file = run_benchmark(
            &session,
            &config,
            &set.questions,
            evaluator,
            judge.as_ref(),
            &output_dir.join(name),
        )
        .await?;
        files.push(file);
    }
    Ok(files)
}

async fn sample_tier(tier: &TierConfig, loader: &DatasetLoader) -> CliResult<Vec<PinnedDataset>> {
    let mut sets = Vec::with_capacity(tier.datasets.len());
    for entry in &tier.datasets {
        let dataset = loader.load(&entry.name).await?;
        sets.push(PinnedDataset {
            questions: dataset.sample(entry.sample_size),
            dataset: dataset.name,
        });
    }
    Ok(sets)
}

// =============================================================================
// HELPERS
// =============================================================================

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_models(raw: &[String]) -> CliResult<Vec<ModelSpec>> {
    if raw.is_empty() {
        let quick = TierConfig::preset("quick").ok_or("quick tier missing")?;
        return Ok(quick.models);
    }
    Ok(raw
        .iter()
        .map(|m| ModelSpec::parse(m))
        .collect::<Result<Vec<_>, _>>()?)
}

fn parse_strategies(raw: &[String]) -> CliResult<Vec<String>> {
    let mut out = Vec::with_capacity(raw.len());
    for name in raw.iter().filter(|s| !s.trim().is_empty()) {
        let strategy: ConsensusStrategy = name.parse()?;
        let name = strategy.as_str().to_string();
        if !out.contains(&name) {
            out.push(name);
        }
    }
    Ok(out)
}

fn parse_spec(raw: Option<&str>) -> CliResult<Option<ModelSpec>> {
    Ok(raw.map(ModelSpec::parse).transpose()?)
}

fn emit(text: &str, out: Option<&Path>) -> CliResult<()> {
    match out {
        Some(path) => {
            std::fs::write(path, text)?;
            eprintln!("wrote {}", path.display());
        }
        None => println!("{text}"),
    }
    Ok(())
}

fn print_accuracy(file: &BenchmarkResultsFile) {
    let (models, strategies) = analysis::predictor_outcomes(file);
    for (name, outcomes) in models.iter().chain(&strategies) {
        let correct = outcomes.values().filter(|c| **c).count();
        println!("{name}: {correct}/{} correct", outcomes.len());
    }
}

async fn benchmark_command(kind: ResultsKind, dataset_arg: &str, args: &RunArgs) -> CliResult<()> {
    let loader = DatasetLoader::new(DatasetLoader::default_cache_dir());
    let dataset = loader.load(dataset_arg).await?;

    let models = parse_models(&args.models)?;
    let strategies = match kind {
        ResultsKind::Baseline => Vec::new(),
        ResultsKind::Benchmark => parse_strategies(&args.strategies)?,
    };
    let summarizer = parse_spec(args.summarizer.as_deref())?;
    let evaluator = match &args.evaluator {
        Some(raw) => raw.parse::<EvaluatorKind>()?,
        None => dataset.evaluator,
    };
    let judge = parse_spec(args.judge.as_deref())?
        .or_else(|| summarizer.clone())
        .or_else(|| models.first().cloned());

    let questions = dataset.sample(args.samples);
    if questions.len() < args.samples {
        tracing::warn!(
            dataset = %dataset.name,
            requested = args.samples,
            available = questions.len(),
            "dataset smaller than requested sample"
        );
    }
    let output = args.output.clone().unwrap_or_else(|| {
        PathBuf::from("results").join(format!("{}-{}.json", kind.as_str(), dataset.name))
    });
    let config = BenchmarkConfig {
        kind,
        dataset: dataset.name.clone(),
        models,
        strategies,
        summarizer,
        runs_per_model: args.runs.max(1),
        sample_size: args.samples,
    };

    let session = Session::new(&args.engine, 0)?;
    let file = run_benchmark(&session, &config, &questions, evaluator, judge.as_ref(), &output).await?;
    println!("{} questions in {}", file.runs.len(), output.display());
    print_accuracy(&file);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Benchmark { dataset, run } => {
            benchmark_command(ResultsKind::Benchmark, &dataset, &run).await?;
        }
        Commands::Baseline { dataset, run } => {
            benchmark_command(ResultsKind::Baseline, &dataset, &run).await?;
        }
        Commands::QuickEval { output_dir, engine } => {
            let tier = TierConfig::preset("quick").ok_or("quick tier missing")?;
            let loader = DatasetLoader::new(DatasetLoader::default_cache_dir());
            let sets = sample_tier(&tier, &loader).await?;
            let files = run_tier(&tier, &sets, &engine, &output_dir, false).await?;
            for file in &files {
                let summary = analysis::analyze(file, &AnalysisOptions::default())?;
                println!("{}", render_markdown(&summary));
            }
        }
        Commands::Run {
            tier,
            output_dir,
            engine,
        } => {
            let tier = TierConfig::load(&tier)?;
            let loader = DatasetLoader::new(DatasetLoader::default_cache_dir());
            let sets = sample_tier(&tier, &loader).await?;
            let files = run_tier(&tier, &sets, &engine, &output_dir, false).await?;
            for file in &files {
                println!("## {}", file.dataset);
                print_accuracy(file);
            }
        }
        Commands::Analyze {
            file,
            format,
            significance,
            strategy,
            out,
        } => {
            let results = BenchmarkResultsFile::load(&file)?;
            let options = AnalysisOptions {
                primary_strategy: strategy,
                significance_threshold: significance,
                ..AnalysisOptions::default()
            };
            let summary = analysis::analyze(&results, &options)?;
            let rendered = match format.as_str() {
                "md" | "markdown" => render_markdown(&summary),
                "json" => serde_json::to_string_pretty(&summary)?,
                other => return Err(format!("unknown format '{other}' (expected md or json)").into()),
            };
            emit(&rendered, out.as_deref())?;
        }
        Commands::Compare {
            a,
            b,
            format,
            significance,
        } => {
            let first = BenchmarkResultsFile::load(&a)?;
            let second = BenchmarkResultsFile::load(&b)?;
            let options = AnalysisOptions {
                significance_threshold: significance,
                ..AnalysisOptions::default()
            };
            let comparisons = compare_files(&first, &second, &options)?;
            let rendered = match format.as_str() {
                "md" | "markdown" => {
                    let mut out = format!(
                        "# Comparison: {}\n\n- A: {}\n- B: {}\n\n",
                        first.dataset,
                        a.display(),
                        b.display()
                    );
                    render_comparisons(&mut out, &comparisons);
                    out
                }
                "json" => serde_json::to_string_pretty(&comparisons)?,
                other => return Err(format!("unknown format '{other}' (expected md or json)").into()),
            };
            emit(&rendered, None)?;
        }
        Commands::UpdateBaseline {
            tier: tier_arg,
            out,
            seed,
            output_dir,
            engine,
        } => {
            let tier = TierConfig::load(&tier_arg)?;
            let loader = DatasetLoader::new(DatasetLoader::default_cache_dir());
            let pinned = pin_questions_for_baseline(&tier, seed, &loader).await?;
            let files = run_tier(&tier, &pinned, &engine, &output_dir, true).await?;

            let mut baseline = GoldenBaselineFile::new(tier_arg, seed);
            for (set, file) in pinned.iter().zip(&files) {
                let ids = set.questions.iter().map(|q| q.id.clone()).collect();
                baseline.datasets.push(GoldenDataset::from_results(ids, file));
            }
            baseline.save(&out)?;
            println!(
                "pinned {} questions across {} datasets into {}",
                baseline.datasets.iter().map(|d| d.question_ids.len()).sum::<usize>(),
                baseline.datasets.len(),
                out.display()
            );
        }
        Commands::CiEval {
            baseline,
            significance,
            output_dir,
            engine,
        } => {
            let golden = GoldenBaselineFile::load(&baseline)?;
            let tier = TierConfig::load(&golden.tier)?;
            let threshold = significance.unwrap_or(tier.significance_threshold);
            let loader = DatasetLoader::new(DatasetLoader::default_cache_dir());
            let pinned = load_pinned_questions(&golden, &loader).await?;
            let files = run_tier(&tier, &pinned, &engine, &output_dir, true).await?;

            let mut regressions = 0usize;
            for (dataset, file) in golden.datasets.iter().zip(&files) {
                for check in check_regressions(dataset, file, threshold) {
                    let cmp = &check.comparison;
                    println!(
                        "{} {}: {:.1}% -> {:.1}% (p = {:.4}){}",
                        check.dataset,
                        check.predictor,
                        cmp.first_accuracy * 100.0,
                        cmp.second_accuracy * 100.0,
                        cmp.mcnemar.p_value,
                        if check.regressed { " REGRESSION" } else { "" }
                    );
                    if check.regressed {
                        regressions += 1;
                    }
                }
            }
            if regressions > 0 {
                eprintln!("{regressions} regression(s) at p < {threshold}");
                std::process::exit(1);
            }
            println!("no regressions");
        }
        Commands::CacheExport { db, out } => {
            let path = db.unwrap_or_else(SqliteResponseCache::default_path);
            let cache = SqliteResponseCache::new(path)?;
            let rows = cache.export_jsonl(&out).await?;
            println!("exported {rows} rows to {}", out.display());
        }
        Commands::CachePrune {
            db,
            max_age_days,
            max_rows,
        } => {
            if max_age_days.is_none() && max_rows.is_none() {
                return Err("cache-prune requires --max-age-days and/or --max-rows".into());
            }
            if matches!(max_rows, Some(0)) {
                return Err("--max-rows must be >= 1".into());
            }
            let path = db.unwrap_or_else(SqliteResponseCache::default_path);
            let cache = SqliteResponseCache::new(path)?;
            let _lock = cache.lock_exclusive()?;
            let stats = cache.prune(max_age_days, max_rows).await?;
            println!(
                "pruned {} rows; {} rows remain",
                stats.deleted, stats.remaining
            );
        }
    }

    Ok(())
}
