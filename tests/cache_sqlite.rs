use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ensemble_eval::cache::{CachedResponse, ResponseCache, ResponseCacheKey, SqliteResponseCache};
use ensemble_eval::ensemble::EnsembleRunner;
use ensemble_eval::gateway::{
    ChunkSink, Completion, MockClient, ModelSpec, Mode, ProviderClient, ProviderError,
    ProviderRegistry, TokenUsage,
};
use ensemble_eval::limiter::{ConcurrencyLimiter, LimiterConfig};
use tempfile::tempdir;

#[derive(Debug, serde::Deserialize)]
struct ExportRow {
    key_hash: String,
    provider: String,
    model: String,
    content: String,
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
    total_tokens: Option<u32>,
    hit_count: i64,
}

#[tokio::test]
async fn sqlite_cache_put_get_and_export_increments_hit_count() {
    let dir = tempdir().unwrap();
    let cache = SqliteResponseCache::new(dir.path().join("cache.sqlite")).unwrap();

    let key = ResponseCacheKey::new("openai", "gpt-4o-mini", "What is 2 + 2?");
    let value = CachedResponse {
        content: "#### 4".to_string(),
        response_time_ms: 120,
        token_usage: Some(TokenUsage::new(7, 3)),
    };

    assert!(cache.get(&key).await.unwrap().is_none());
    cache.put(&key, &value).await.unwrap();

    let hit = cache.get(&key).await.unwrap().unwrap();
    assert_eq!(hit, value);
    let _ = cache.get(&key).await.unwrap().unwrap();

    let other = ResponseCacheKey::new("openai", "gpt-4o-mini", "What is 3 + 3?");
    assert!(cache.get(&other).await.unwrap().is_none());

    let export_path = dir.path().join("export.jsonl");
    let exported = cache.export_jsonl(&export_path).await.unwrap();
    assert_eq!(exported, 1);

    let raw = std::fs::read_to_string(&export_path).unwrap();
    let rows: Vec<ExportRow> = raw
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let row = rows.into_iter().find(|r| r.key_hash == key.key_hash).unwrap();
    assert_eq!(row.provider, "openai");
    assert_eq!(row.model, "gpt-4o-mini");
    assert_eq!(row.content, "#### 4");
    assert_eq!(row.input_tokens, Some(7));
    assert_eq!(row.output_tokens, Some(3));
    assert_eq!(row.total_tokens, Some(10));
    assert_eq!(row.hit_count, 2);
}

#[tokio::test]
async fn sqlite_cache_prune_by_rows() {
    let dir = tempdir().unwrap();
    let cache = SqliteResponseCache::new(dir.path().join("cache.sqlite")).unwrap();
    for i in 0..5 {
        let key = ResponseCacheKey::new("mock", "a", &format!("prompt {i}"));
        let value = CachedResponse {
            content: format!("answer {i}"),
            response_time_ms: 1,
            token_usage: None,
        };
        cache.put(&key, &value).await.unwrap();
    }

    let _lock = cache.lock_exclusive().unwrap();
    let stats = cache.prune(None, Some(2)).await.unwrap();
    assert_eq!(stats.deleted, 3);
    assert_eq!(stats.remaining, 2);

    let stats = cache.prune(Some(30), None).await.unwrap();
    assert_eq!(stats.deleted, 0);
    assert_eq!(stats.remaining, 2);
}

#[tokio::test]
async fn ensemble_reuses_cached_responses() {
    let dir = tempdir().unwrap();
    let cache = Arc::new(SqliteResponseCache::new(dir.path().join("cache.sqlite")).unwrap());
    let mock = Arc::new(MockClient::new().with_failure("broken", "boom"));
    let registry = ProviderRegistry::single(Mode::Mock, mock.clone());
    let limiter = Arc::new(ConcurrencyLimiter::new(LimiterConfig::default()));
    let runner = EnsembleRunner::new(registry, limiter).with_cache(cache.clone());

    let models = vec![ModelSpec::new("mock", "a"), ModelSpec::new("mock", "broken")];
    let first = runner.run("What is 2 + 2?", &models).await;
    assert_eq!(mock.calls(), 2);
    assert!(first[1].is_error());

    let second = runner.run("What is 2 + 2?", &models).await;
    // Only the failing model is asked again; errors are never cached.
    assert_eq!(mock.calls(), 3);
    assert_eq!(second[0].content, first[0].content);
    assert_eq!(second[0].token_usage, first[0].token_usage);
    assert!(second[1].is_error());
}

/// Answers "sample N" on the N-th call.
#[derive(Default)]
struct CountingClient {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl ProviderClient for CountingClient {
    fn name(&self) -> &str {
        "counting"
    }

    async fn stream_response(
        &self,
        _prompt: &str,
        _model: &str,
        _on_chunk: ChunkSink<'_>,
    ) -> Result<Completion, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Completion {
            content: format!("sample {n}"),
            response_time_ms: 1,
            token_usage: None,
        })
    }

    async fn list_available_text_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(vec!["a".into()])
    }
}

#[tokio::test]
async fn repeated_samples_of_one_model_are_cached_separately() {
    let dir = tempdir().unwrap();
    let cache = Arc::new(SqliteResponseCache::new(dir.path().join("cache.sqlite")).unwrap());
    let client = Arc::new(CountingClient::default());
    let registry = ProviderRegistry::single(Mode::Mock, client.clone());
    let runner = EnsembleRunner::new(registry, Arc::new(ConcurrencyLimiter::default()))
        .with_parallel(false)
        .with_cache(cache);

    let models = vec![ModelSpec::new("mock", "a"); 3];
    let first: Vec<_> = runner
        .run("Pick a number.", &models)
        .await
        .into_iter()
        .map(|r| r.content)
        .collect();
    assert_eq!(first, vec!["sample 1", "sample 2", "sample 3"]);
    assert_eq!(client.calls.load(Ordering::SeqCst), 3);

    let second: Vec<_> = runner
        .run("Pick a number.", &models)
        .await
        .into_iter()
        .map(|r| r.content)
        .collect();
    assert_eq!(second, first);
    assert_eq!(client.calls.load(Ordering::SeqCst), 3);
}
