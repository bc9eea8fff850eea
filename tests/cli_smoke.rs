use std::path::Path;
use std::process::{Command, Output};

use tempfile::tempdir;

fn cli(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ensemble-eval"))
        .current_dir(dir)
        .env("EVAL_DATASET_CACHE_DIR", dir.join("datasets"))
        .env("RUST_LOG", "warn")
        .args(args)
        .output()
        .unwrap()
}

fn write_dataset(dir: &Path) {
    let questions = serde_json::json!([
        {"id": "a1", "prompt": "What is 2 + 2?", "groundTruth": "4", "category": "add"},
        {"id": "a2", "prompt": "What is 3 + 5?", "groundTruth": "8", "category": "add"},
        {"id": "m1", "prompt": "What is 6 * 7?", "groundTruth": "42", "category": "mul"}
    ]);
    std::fs::write(dir.join("mini.json"), questions.to_string()).unwrap();
}

#[test]
fn cli_benchmark_analyze_and_compare_in_mock_mode() {
    let dir = tempdir().unwrap();
    write_dataset(dir.path());

    let out = cli(
        dir.path(),
        &[
            "benchmark",
            "mini.json",
            "--model",
            "mock:alpha,mock:beta,mock:gamma",
            "--samples",
            "3",
            "--strategies",
            "majority,standard",
            "--no-parallel",
            "--output",
            "run.json",
        ],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let raw = std::fs::read_to_string(dir.path().join("run.json")).unwrap();
    let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(v["type"], "benchmark");
    assert_eq!(v["dataset"], "mini");
    assert_eq!(v["mode"], "mock");
    assert_eq!(v["runs"].as_array().unwrap().len(), 3);
    assert_eq!(v.pointer("/runs/0/questionId").unwrap(), "a1");
    assert_eq!(v.pointer("/runs/0/responses").unwrap().as_array().unwrap().len(), 3);
    assert!(v.pointer("/runs/0/consensus/standard").is_some());
    assert!(v.pointer("/runs/0/evaluation/strategyResults/majority").is_some());

    // Rerunning resumes and changes nothing.
    let again = cli(
        dir.path(),
        &[
            "benchmark",
            "mini.json",
            "--model",
            "mock:gamma,mock:alpha,mock:beta",
            "--samples",
            "3",
            "--strategies",
            "standard,majority",
            "--output",
            "run.json",
        ],
    );
    assert!(again.status.success(), "{}", String::from_utf8_lossy(&again.stderr));
    let v2: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("run.json")).unwrap())
            .unwrap();
    assert_eq!(v2["runs"], v["runs"]);

    let analyze = cli(
        dir.path(),
        &["analyze", "run.json", "--format", "json", "--out", "analysis.json"],
    );
    assert!(analyze.status.success(), "{}", String::from_utf8_lossy(&analyze.stderr));
    let summary: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("analysis.json")).unwrap())
            .unwrap();
    assert_eq!(summary["modelAccuracy"].as_array().unwrap().len(), 3);
    assert_eq!(summary["evaluatedQuestions"], 3);
    assert!(summary["comparisons"].as_array().unwrap().len() >= 3);

    let markdown = cli(dir.path(), &["analyze", "run.json"]);
    assert!(markdown.status.success());
    let text = String::from_utf8_lossy(&markdown.stdout);
    assert!(text.contains("# Ensemble Analysis: mini"));
    let accuracy = text.find("## Accuracy").unwrap();
    let cost = text.find("## Cost").unwrap();
    assert!(accuracy < cost);

    let compare = cli(dir.path(), &["compare", "run.json", "run.json"]);
    assert!(compare.status.success());
    assert!(String::from_utf8_lossy(&compare.stdout).contains("# Comparison: mini"));
}

#[test]
fn cli_resume_mismatch_is_fatal() {
    let dir = tempdir().unwrap();
    write_dataset(dir.path());

    let first = cli(
        dir.path(),
        &["baseline", "mini.json", "--model", "mock:alpha", "--samples", "2", "--output", "b.json"],
    );
    assert!(first.status.success(), "{}", String::from_utf8_lossy(&first.stderr));
    let v: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("b.json")).unwrap()).unwrap();
    assert_eq!(v["type"], "baseline");
    assert!(v["strategies"].as_array().unwrap().is_empty());

    let second = cli(
        dir.path(),
        &["baseline", "mini.json", "--model", "mock:beta", "--samples", "2", "--output", "b.json"],
    );
    assert!(!second.status.success());
    assert!(String::from_utf8_lossy(&second.stderr).contains("models"));
}

#[test]
fn cli_rejects_unknown_strategy_and_format() {
    let dir = tempdir().unwrap();
    write_dataset(dir.path());

    let out = cli(dir.path(), &["benchmark", "mini.json", "--strategies", "borda"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("borda"));

    let out = cli(dir.path(), &["analyze", "missing.json", "--format", "json"]);
    assert!(!out.status.success());
}

fn write_tier(dir: &Path) {
    // Mock answers are below 100, so every model misses these.
    let questions: Vec<_> = (0..10)
        .map(|i| {
            serde_json::json!({
                "id": format!("big-{i}"),
                "prompt": format!("What is {} + 1000?", i),
                "groundTruth": (1000 + i).to_string(),
            })
        })
        .collect();
    std::fs::write(dir.join("big.json"), serde_json::Value::from(questions).to_string()).unwrap();

    let tier = serde_json::json!({
        "name": "local",
        "datasets": [{"name": "big.json", "sampleSize": 10}],
        "models": ["mock:alpha"],
    });
    std::fs::write(dir.join("tier.json"), tier.to_string()).unwrap();
}

#[test]
fn cli_golden_baseline_flags_significant_regressions() {
    let dir = tempdir().unwrap();
    write_tier(dir.path());

    let pinned = cli(
        dir.path(),
        &["update-baseline", "--tier", "tier.json", "--out", "golden.json", "--seed", "7"],
    );
    assert!(pinned.status.success(), "{}", String::from_utf8_lossy(&pinned.stderr));
    let golden: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("golden.json")).unwrap())
            .unwrap();
    assert_eq!(golden["tier"], "tier.json");
    assert_eq!(golden["seed"], 7);
    assert_eq!(golden.pointer("/datasets/0/questionIds").unwrap().as_array().unwrap().len(), 10);
    let results = golden.pointer("/datasets/0/results").unwrap().as_array().unwrap();
    assert_eq!(results.len(), 10);
    assert!(results.iter().all(|r| r["modelCorrect"]["mock:alpha"] == false));

    let steady = cli(dir.path(), &["ci-eval", "--baseline", "golden.json"]);
    assert!(steady.status.success(), "{}", String::from_utf8_lossy(&steady.stderr));
    assert!(String::from_utf8_lossy(&steady.stdout).contains("no regressions"));

    // A baseline where the model was always right makes the rerun a regression.
    let mut inflated = golden.clone();
    for result in inflated["datasets"][0]["results"].as_array_mut().unwrap() {
        result["modelCorrect"]["mock:alpha"] = serde_json::Value::Bool(true);
    }
    std::fs::write(dir.path().join("inflated.json"), inflated.to_string()).unwrap();

    let regressed = cli(dir.path(), &["ci-eval", "--baseline", "inflated.json"]);
    assert_eq!(regressed.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&regressed.stdout).contains("REGRESSION"));
}
