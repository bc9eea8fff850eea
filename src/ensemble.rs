//! Ensemble runner: one prompt fanned out to many models.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use crate::cache::{CachedResponse, ResponseCache, ResponseCacheKey};
use crate::gateway::{discard_chunk, ModelSpec, ProviderRegistry, TokenUsage};
use crate::limiter::ConcurrencyLimiter;

/// One model's answer to one prompt, or the error that replaced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderResponse {
    pub provider: String,
    pub model: String,
    pub content: String,
    pub response_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProviderResponse {
    pub fn success(
        provider: impl Into<String>,
        model: impl Into<String>,
        content: impl Into<String>,
        response_time_ms: u64,
        token_usage: Option<TokenUsage>,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            content: content.into(),
            response_time_ms,
            token_usage,
            error: None,
        }
    }

    pub fn failure(
        provider: impl Into<String>,
        model: impl Into<String>,
        error: impl Into<String>,
        response_time_ms: u64,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            content: String::new(),
            response_time_ms,
            token_usage: None,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.provider, self.model)
    }

    pub fn spec(&self) -> ModelSpec {
        ModelSpec::new(self.provider.clone(), self.model.clone())
    }
}

/// Fans a prompt out to every model spec through the shared limiter.
///
/// Output order always matches input order. A failing model becomes a
/// response with `error` set; it never fails the batch.
#[derive(Clone)]
pub struct EnsembleRunner {
    registry: ProviderRegistry,
    limiter: Arc<ConcurrencyLimiter>,
    request_delay: Duration,
    parallel: bool,
    cache: Option<Arc<dyn ResponseCache>>,
}

impl EnsembleRunner {
    pub fn new(registry: ProviderRegistry, limiter: Arc<ConcurrencyLimiter>) -> Self {
        Self {
            registry,
            limiter,
            request_delay: Duration::ZERO,
            parallel: true,
            cache: None,
        }
    }

    /// Stagger request starts by `delay` each.
    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    /// `false` issues requests one at a time.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn limiter(&self) -> &Arc<ConcurrencyLimiter> {
        &self.limiter
    }

    pub async fn run(&self, prompt: &str, specs: &[ModelSpec]) -> Vec<ProviderResponse> {
        let width = if self.parallel { specs.len().max(1) } else { 1 };
        let delay = self.request_delay;
        let parallel = self.parallel;

        stream::iter(specs.iter().enumerate())
            .map(|(idx, spec)| async move {
                if idx > 0 && !delay.is_zero() {
                    // Sequential runs already wait for the previous request.
                    let wait = if parallel { delay * idx as u32 } else { delay };
                    tokio::time::sleep(wait).await;
                }
                let sample = 1 + specs[..idx].iter().filter(|s| *s == spec).count();
                self.fetch(prompt, spec, sample).await
            })
            .buffered(width)
            .collect()
            .await
    }

    /// `sample` counts earlier occurrences of `spec` in the same ensemble, so
    /// repeated runs of one model are cached independently.
    async fn fetch(&self, prompt: &str, spec: &ModelSpec, sample: usize) -> ProviderResponse {
        let cache_key =
            ResponseCacheKey::new(spec.provider(), spec.model(), prompt).with_sample(sample);
        if let Some(cache) = &self.cache {
            match cache.get(&cache_key).await {
                Ok(Some(hit)) => {
                    tracing::debug!(model = %spec, "response cache hit");
                    return ProviderResponse::success(
                        spec.provider(),
                        spec.model(),
                        hit.content,
                        hit.response_time_ms,
                        hit.token_usage,
                    );
                }
                Ok(None) => {}
                Err(err) => tracing::warn!(model = %spec, error = %err, "response cache read failed"),
            }
        }

        let started = Instant::now();
        let resolved = match self.registry.resolve(spec) {
            Ok(resolved) => resolved,
            Err(err) => {
                tracing::warn!(model = %spec, error = %err, "no client for model");
                return ProviderResponse::failure(spec.provider(), spec.model(), err.to_string(), 0);
            }
        };

        let outcome = self
            .limiter
            .run(
                resolved
                    .client
                    .stream_response(prompt, &resolved.model_id, &discard_chunk),
            )
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(completion) => {
                let response_time_ms = if completion.response_time_ms > 0 {
                    completion.response_time_ms
                } else {
                    elapsed_ms
                };
                if let Some(cache) = &self.cache {
                    let entry = CachedResponse {
                        content: completion.content.clone(),
                        response_time_ms,
                        token_usage: completion.token_usage,
                    };
                    if let Err(err) = cache.put(&cache_key, &entry).await {
                        tracing::warn!(model = %spec, error = %err, "response cache write failed");
                    }
                }
                ProviderResponse::success(
                    spec.provider(),
                    spec.model(),
                    completion.content,
                    response_time_ms,
                    completion.token_usage,
                )
            }
            Err(err) => {
                tracing::warn!(model = %spec, error = %err, "provider call failed");
                ProviderResponse::failure(spec.provider(), spec.model(), err.to_string(), elapsed_ms)
            }
        }
    }
}
