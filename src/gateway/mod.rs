//! Provider gateway: the narrow interface the benchmark core uses to talk to
//! LLM providers, plus the concrete clients selected by [`Mode`].

pub mod error;
pub mod mock;
pub mod openai_compat;
pub mod pricing;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::limiter::ConcurrencyLimiter;

pub use error::{ErrorContext, ProviderError};
pub use mock::MockClient;
pub use openai_compat::OpenAiCompatAdapter;
pub use pricing::*;
pub use types::*;

/// Receives each streamed text delta as it arrives.
pub type ChunkSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Chunk sink for callers that only want the final text.
pub fn discard_chunk(_chunk: &str) {}

/// One provider's text-generation capability.
#[async_trait::async_trait]
pub trait ProviderClient: Send + Sync {
    /// Short client name used in logs.
    fn name(&self) -> &str;

    /// Stream one completion for `prompt`, reporting deltas to `on_chunk` and
    /// returning the full text, timing and token usage.
    async fn stream_response(
        &self,
        prompt: &str,
        model: &str,
        on_chunk: ChunkSink<'_>,
    ) -> Result<Completion, ProviderError>;

    /// Text-generation model ids this client can serve.
    async fn list_available_text_models(&self) -> Result<Vec<String>, ProviderError>;

    /// Convenience wrapper that discards streamed chunks.
    async fn complete(&self, prompt: &str, model: &str) -> Result<Completion, ProviderError> {
        self.stream_response(prompt, model, &discard_chunk).await
    }
}

// =============================================================================
// RETRIES
// =============================================================================

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

/// Wraps a client with exponential-backoff retries for retryable errors.
///
/// Every rate-limit error observed before a retry is reported to the shared
/// limiter so concurrency backs off even when the retry later succeeds.
pub struct RetryingClient<C: ProviderClient> {
    inner: C,
    config: GatewayConfig,
    limiter: Option<Arc<ConcurrencyLimiter>>,
}

impl<C: ProviderClient> RetryingClient<C> {
    pub fn new(inner: C, config: GatewayConfig) -> Self {
        Self {
            inner,
            config,
            limiter: None,
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<ConcurrencyLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }
}

#[async_trait::async_trait]
impl<C: ProviderClient> ProviderClient for RetryingClient<C> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn stream_response(
        &self,
        prompt: &str,
        model: &str,
        on_chunk: ChunkSink<'_>,
    ) -> Result<Completion, ProviderError> {
        let mut attempt = 0;
        loop {
            match self.inner.stream_response(prompt, model, on_chunk).await {
                Ok(completion) => return Ok(completion),
                Err(err) => {
                    if !err.is_retryable() || attempt >= self.config.max_retries {
                        return Err(err);
                    }
                    if err.is_rate_limit() {
                        if let Some(limiter) = &self.limiter {
                            limiter.notify_rate_limit();
                        }
                    }

                    let delay = retry_delay(&err, self.config.retry_base_delay, attempt);
                    tracing::debug!(
                        client = self.inner.name(),
                        model,
                        attempt,
                        error = %err,
                        "retrying provider call"
                    );
                    attempt += 1;
                    sleep(delay).await;
                }
            }
        }
    }

    async fn list_available_text_models(&self) -> Result<Vec<String>, ProviderError> {
        self.inner.list_available_text_models().await
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u32.pow(attempt.min(5));
    base * multiplier
}

/// Exponential backoff, never shorter than the provider's `Retry-After`.
fn retry_delay(err: &ProviderError, base: Duration, attempt: u32) -> Duration {
    let backoff = backoff_delay(base, attempt);
    err.retry_after().map_or(backoff, |wait| wait.max(backoff))
}

// =============================================================================
// REGISTRY
// =============================================================================

/// A model spec resolved to the client that serves it and the model id that
/// client expects.
#[derive(Clone)]
pub struct ResolvedModel {
    pub client: Arc<dyn ProviderClient>,
    pub model_id: String,
}

/// Maps provider identifiers to clients for one [`Mode`].
#[derive(Clone)]
pub struct ProviderRegistry {
    mode: Mode,
    clients: HashMap<String, Arc<dyn ProviderClient>>,
    /// Serves every provider that has no dedicated client (mock and pro mode).
    fallback: Option<Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            clients: HashMap::new(),
            fallback: None,
        }
    }

    /// Registry whose every provider is served by `client`.
    pub fn single(mode: Mode, client: Arc<dyn ProviderClient>) -> Self {
        Self {
            mode,
            clients: HashMap::new(),
            fallback: Some(client),
        }
    }

    pub fn with_client(mut self, provider: impl Into<String>, client: Arc<dyn ProviderClient>) -> Self {
        self.clients.insert(provider.into(), client);
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Build the clients for `mode` from environment variables.
    pub fn from_env(
        mode: Mode,
        config: GatewayConfig,
        limiter: Option<Arc<ConcurrencyLimiter>>,
    ) -> Result<Self, ProviderError> {
        let wrap = |adapter: OpenAiCompatAdapter| -> Arc<dyn ProviderClient> {
            let client = RetryingClient::new(adapter, config.clone());
            match &limiter {
                Some(l) => Arc::new(client.with_limiter(l.clone())),
                None => Arc::new(client),
            }
        };

        match mode {
            Mode::Mock => Ok(Self::single(mode, Arc::new(MockClient::new()))),
            Mode::Free => {
                let mut registry = Self::new(mode);
                for endpoint in openai_compat::KNOWN_ENDPOINTS {
                    if let Some(adapter) = OpenAiCompatAdapter::from_env(endpoint)? {
                        registry = registry.with_client(endpoint.provider, wrap(adapter));
                    }
                }
                Ok(registry)
            }
            Mode::Pro => {
                let adapter = OpenAiCompatAdapter::from_env(&openai_compat::OPENROUTER)?
                    .ok_or_else(|| ProviderError::config("OPENROUTER_API_KEY not set"))?;
                Ok(Self::single(mode, wrap(adapter)))
            }
        }
    }

    /// Resolve `spec` to a client. In pro mode the model id becomes the
    /// OpenRouter route `provider/model`.
    pub fn resolve(&self, spec: &ModelSpec) -> Result<ResolvedModel, ProviderError> {
        if let Some(client) = self.clients.get(spec.provider()) {
            return Ok(ResolvedModel {
                client: client.clone(),
                model_id: spec.model().to_string(),
            });
        }

        let client = self
            .fallback
            .clone()
            .ok_or_else(|| ProviderError::UnknownProvider(spec.provider().to_string()))?;

        let model_id = match self.mode {
            Mode::Pro => openrouter_route(spec),
            Mode::Mock | Mode::Free => spec.model().to_string(),
        };
        Ok(ResolvedModel { client, model_id })
    }

    /// Fail fast when any spec has no client (e.g. a missing API key).
    pub fn ensure_resolvable(&self, specs: &[ModelSpec]) -> Result<(), ProviderError> {
        for spec in specs {
            self.resolve(spec)?;
        }
        Ok(())
    }
}

fn openrouter_route(spec: &ModelSpec) -> String {
    if spec.provider() == "openrouter" || spec.model().contains('/') {
        return spec.model().to_string();
    }
    let vendor = match spec.provider() {
        "xai" => "x-ai",
        other => other,
    };
    format!("{vendor}/{}", spec.model())
}
