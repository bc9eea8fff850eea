use std::sync::Arc;

use ensemble_eval::analysis::check_regressions;
use ensemble_eval::benchmark::{BenchmarkConfig, BenchmarkRunner, Progress, ResultsKind};
use ensemble_eval::consensus::LlmConsensusGenerator;
use ensemble_eval::datasets::{
    checksum_path, verify_cache_integrity, write_with_checksum, BenchmarkQuestion, CacheIntegrity,
    DatasetLoader,
};
use ensemble_eval::ensemble::EnsembleRunner;
use ensemble_eval::evaluation::NumericEvaluator;
use ensemble_eval::gateway::{MockClient, ModelSpec, Mode, ProviderRegistry};
use ensemble_eval::limiter::ConcurrencyLimiter;
use ensemble_eval::pinning::{
    load_pinned_questions, pin_questions_for_baseline, GoldenBaselineFile, GoldenDataset,
    PinningError,
};
use ensemble_eval::tiers::{TierConfig, TierDataset};
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn gsm8k_jsonl(n: usize) -> String {
    (0..n)
        .map(|i| {
            serde_json::json!({
                "question": format!("What is {i} + 1?"),
                "answer": format!("{i} + 1 = {}\n#### {}", i + 1, i + 1),
            })
            .to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[tokio::test]
async fn dataset_download_is_cached_and_verified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/arith.jsonl"))
        .respond_with(ResponseTemplate::new(200).set_body_string(gsm8k_jsonl(12)))
        .expect(2)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let loader = DatasetLoader::new(dir.path())
        .with_source("arith", format!("{}/arith.jsonl", server.uri()));

    let first = loader.load("arith").await.unwrap();
    assert_eq!(first.questions.len(), 12);
    assert_eq!(first.questions[3].id, "arith-3");
    assert_eq!(first.questions[3].ground_truth, "4");

    let cached = loader.cache_path("arith");
    assert!(checksum_path(&cached).exists());
    assert_eq!(verify_cache_integrity(&cached).unwrap(), CacheIntegrity::Valid);

    // Served from the cache: no second request yet.
    let again = loader.load("arith").await.unwrap();
    assert_eq!(again.questions, first.questions);

    // Tampering invalidates the cache and forces a fresh download.
    std::fs::write(&cached, "[]").unwrap();
    assert_eq!(verify_cache_integrity(&cached).unwrap(), CacheIntegrity::Mismatch);
    let repaired = loader.load("arith").await.unwrap();
    assert_eq!(repaired.questions, first.questions);
    assert_eq!(verify_cache_integrity(&cached).unwrap(), CacheIntegrity::Valid);
}

fn tier() -> TierConfig {
    TierConfig {
        name: "local".into(),
        datasets: vec![TierDataset {
            name: "arith".into(),
            sample_size: 5,
        }],
        models: vec![ModelSpec::new("mock", "right"), ModelSpec::new("mock", "noisy")],
        strategies: vec!["majority".into()],
        runs: 1,
        request_delay_ms: 0,
        significance_threshold: 0.05,
        summarizer: Some(ModelSpec::new("mock", "right")),
    }
}

fn runner() -> BenchmarkRunner {
    let client = Arc::new(MockClient::new().with_response("right", "#### 1"));
    let limiter = Arc::new(ConcurrencyLimiter::default());
    let ensemble = EnsembleRunner::new(ProviderRegistry::single(Mode::Mock, client), limiter);
    BenchmarkRunner::new(ensemble, Arc::new(LlmConsensusGenerator::new()))
        .with_evaluator(Some(Arc::new(NumericEvaluator)))
}

fn questions(n: usize) -> Vec<BenchmarkQuestion> {
    (0..n)
        .map(|i| BenchmarkQuestion {
            id: format!("arith-{i}"),
            prompt: format!("What is {i} + 1?"),
            ground_truth: "1".into(),
            category: None,
            difficulty: None,
        })
        .collect()
}

#[tokio::test]
async fn golden_baseline_round_trip_and_regression_check() {
    let dir = tempdir().unwrap();
    let loader = DatasetLoader::new(dir.path().join("datasets"));
    let raw = serde_json::to_string(&questions(20)).unwrap();
    write_with_checksum(&loader.cache_path("arith"), &raw).unwrap();

    let tier = tier();
    let pinned = pin_questions_for_baseline(&tier, Some(1234), &loader).await.unwrap();
    assert_eq!(pinned.len(), 1);
    let ids: Vec<String> = pinned[0].questions.iter().map(|q| q.id.clone()).collect();
    assert_eq!(ids.len(), 5);

    let config = BenchmarkConfig {
        kind: ResultsKind::Benchmark,
        dataset: "arith".into(),
        models: tier.models.clone(),
        strategies: tier.strategies.clone(),
        summarizer: tier.summarizer.clone(),
        runs_per_model: 1,
        sample_size: 5,
    };
    let results = runner()
        .run(&config, &pinned[0].questions, &dir.path().join("run.json"), |_: &Progress| {})
        .await
        .unwrap();

    let mut baseline = GoldenBaselineFile::new("local", Some(1234));
    baseline
        .datasets
        .push(GoldenDataset::from_results(ids.clone(), &results));
    let baseline_path = dir.path().join("golden.json");
    baseline.save(&baseline_path).unwrap();

    let loaded = GoldenBaselineFile::load(&baseline_path).unwrap();
    assert_eq!(loaded, baseline);
    assert_eq!(loaded.datasets[0].results.len(), 5);
    assert!(loaded.datasets[0].results.iter().all(|r| r.model_correct["mock:right"]));

    let reloaded = load_pinned_questions(&loaded, &loader).await.unwrap();
    let reloaded_ids: Vec<String> = reloaded[0].questions.iter().map(|q| q.id.clone()).collect();
    assert_eq!(reloaded_ids, ids);

    let checks = check_regressions(&loaded.datasets[0], &results, 0.05);
    assert!(checks.iter().any(|c| c.predictor == "mock:right"));
    assert!(checks.iter().any(|c| c.predictor == "majority"));
    assert!(checks.iter().all(|c| !c.regressed));
}

#[tokio::test]
async fn pinned_questions_missing_upstream_fail_loudly() {
    let dir = tempdir().unwrap();
    let loader = DatasetLoader::new(dir.path());
    write_with_checksum(
        &loader.cache_path("arith"),
        &serde_json::to_string(&questions(3)).unwrap(),
    )
    .unwrap();

    let mut baseline = GoldenBaselineFile::new("local", None);
    baseline.datasets.push(GoldenDataset {
        dataset: "arith".into(),
        question_ids: vec!["arith-2".into(), "arith-17".into()],
        results: vec![],
    });

    let err = load_pinned_questions(&baseline, &loader).await.unwrap_err();
    match err {
        PinningError::MissingQuestions { dataset, missing } => {
            assert_eq!(dataset, "arith");
            assert_eq!(missing, vec!["arith-17".to_string()]);
        }
        other => panic!("expected missing questions, got {other:?}"),
    }
}
