//! Streaming adapter for OpenAI-compatible chat completion endpoints.
//!
//! OpenAI, Anthropic, Google (Gemini), xAI and OpenRouter all expose a
//! `/chat/completions` endpoint that speaks the same server-sent-event
//! protocol, so one adapter covers every provider in `free` and `pro` mode.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::types::{estimate_tokens, Completion, TokenUsage};
use super::{ChunkSink, ProviderClient};

/// Maximum allowed response content length (1MB).
const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

/// Maximum allowed input characters (~125k tokens).
const MAX_INPUT_CHARS: usize = 500_000;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Static description of a provider endpoint.
#[derive(Debug, Clone, Copy)]
pub struct ProviderEndpoint {
    pub provider: &'static str,
    pub default_base_url: &'static str,
    pub api_key_vars: &'static [&'static str],
    pub base_url_var: &'static str,
}

pub const OPENAI: ProviderEndpoint = ProviderEndpoint {
    provider: "openai",
    default_base_url: "https://api.openai.com/v1",
    api_key_vars: &["OPENAI_API_KEY"],
    base_url_var: "OPENAI_BASE_URL",
};

pub const ANTHROPIC: ProviderEndpoint = ProviderEndpoint {
    provider: "anthropic",
    default_base_url: "https://api.anthropic.com/v1",
    api_key_vars: &["ANTHROPIC_API_KEY"],
    base_url_var: "ANTHROPIC_BASE_URL",
};

pub const GOOGLE: ProviderEndpoint = ProviderEndpoint {
    provider: "google",
    default_base_url: "https://generativelanguage.googleapis.com/v1beta/openai",
    api_key_vars: &["GOOGLE_API_KEY", "GEMINI_API_KEY"],
    base_url_var: "GOOGLE_BASE_URL",
};

pub const XAI: ProviderEndpoint = ProviderEndpoint {
    provider: "xai",
    default_base_url: "https://api.x.ai/v1",
    api_key_vars: &["XAI_API_KEY"],
    base_url_var: "XAI_BASE_URL",
};

pub const OPENROUTER: ProviderEndpoint = ProviderEndpoint {
    provider: "openrouter",
    default_base_url: "https://openrouter.ai/api/v1",
    api_key_vars: &["OPENROUTER_API_KEY"],
    base_url_var: "OPENROUTER_BASE_URL",
};

pub const KNOWN_ENDPOINTS: &[ProviderEndpoint] = &[OPENAI, ANTHROPIC, GOOGLE, XAI, OPENROUTER];

/// OpenAI-compatible chat completions adapter.
#[derive(Debug, Clone)]
pub struct OpenAiCompatAdapter {
    provider: String,
    client: reqwest::Client,
    base_url: String,
    temperature: f32,
    max_tokens: Option<u32>,
}

impl OpenAiCompatAdapter {
    /// Create from environment variables. Returns `Ok(None)` when no API key
    /// is set for the endpoint.
    pub fn from_env(endpoint: &ProviderEndpoint) -> Result<Option<Self>, ProviderError> {
        let api_key = endpoint
            .api_key_vars
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()));
        let Some(api_key) = api_key else {
            return Ok(None);
        };

        let base_url = std::env::var(endpoint.base_url_var)
            .unwrap_or_else(|_| endpoint.default_base_url.to_string());

        let timeout = std::env::var("EVAL_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        Self::with_config(endpoint.provider, api_key, base_url, timeout).map(Some)
    }

    /// Create with custom configuration.
    pub fn with_config(
        provider: impl Into<String>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let auth_value = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ProviderError::config("Invalid API key format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            provider: provider.into(),
            client,
            base_url,
            temperature: 0.0,
            max_tokens: None,
        })
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn models_url(&self) -> String {
        format!("{}/models", self.base_url)
    }

    /// Extract request ID from response headers.
    fn extract_request_id(headers: &HeaderMap) -> Option<String> {
        headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    fn retry_after(headers: &HeaderMap) -> Duration {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(60))
    }

    /// Map a non-2xx response to a typed error.
    fn status_error(
        &self,
        status: u16,
        body: &str,
        ctx: ErrorContext,
        retry_after: Duration,
    ) -> ProviderError {
        let parsed = serde_json::from_str::<ErrorEnvelope>(body)
            .ok()
            .and_then(|e| e.error);
        let (message, ctx) = match parsed {
            Some(error) => {
                let ctx = match error.code {
                    Some(serde_json::Value::String(code)) => ctx.with_code(code),
                    Some(code) => ctx.with_code(code.to_string()),
                    None => ctx,
                };
                (error.message.unwrap_or_default(), ctx)
            }
            None => (format!("HTTP {status}"), ctx),
        };

        if status == 429 {
            return ProviderError::rate_limited(self.provider.clone(), retry_after, ctx);
        }
        ProviderError::provider_with_context(self.provider.clone(), message, status >= 500, ctx)
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: [ApiMessage<'a>; 1],
    temperature: f32,
    stream: bool,
    stream_options: StreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: Option<Delta>,
}

#[derive(Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    code: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

/// Accumulates SSE `data:` payloads into content + usage.
#[derive(Default)]
struct SseState {
    /// Undecoded bytes after the last newline; may end mid-codepoint.
    pending: Vec<u8>,
    content: String,
    usage: Option<TokenUsage>,
    done: bool,
}

impl SseState {
    /// Feed raw bytes; emits content deltas through `on_chunk`.
    fn feed(
        &mut self,
        provider: &str,
        bytes: &[u8],
        on_chunk: ChunkSink<'_>,
    ) -> Result<(), ProviderError> {
        self.pending.extend_from_slice(bytes);
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            self.handle_line(provider, line.trim(), on_chunk)?;
        }
        Ok(())
    }

    fn finish(&mut self, provider: &str, on_chunk: ChunkSink<'_>) -> Result<(), ProviderError> {
        let rest = std::mem::take(&mut self.pending);
        let rest = String::from_utf8_lossy(&rest);
        self.handle_line(provider, rest.trim(), on_chunk)
    }

    fn handle_line(
        &mut self,
        provider: &str,
        line: &str,
        on_chunk: ChunkSink<'_>,
    ) -> Result<(), ProviderError> {
        if self.done {
            return Ok(());
        }
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(());
        };
        let data = data.trim();
        if data == "[DONE]" {
            self.done = true;
            return Ok(());
        }
        if data.is_empty() {
            return Ok(());
        }

        let chunk: StreamChunk = serde_json::from_str(data).map_err(|e| {
            ProviderError::provider(provider, format!("Invalid stream chunk: {e}"), false)
        })?;

        if let Some(error) = chunk.error {
            let message = error.message.unwrap_or_default();
            let rate_limited = message.to_lowercase().contains("rate limit");
            return Err(ProviderError::provider(provider, message, rate_limited));
        }

        for choice in chunk.choices {
            if let Some(text) = choice.delta.and_then(|d| d.content) {
                if text.is_empty() {
                    continue;
                }
                if self.content.len() + text.len() > MAX_RESPONSE_LEN {
                    return Err(ProviderError::provider(
                        provider,
                        format!("Response too large: {} bytes", self.content.len() + text.len()),
                        false,
                    ));
                }
                on_chunk(&text);
                self.content.push_str(&text);
            }
        }

        if let Some(usage) = chunk.usage {
            let input = usage.prompt_tokens.unwrap_or(0);
            let output = usage.completion_tokens.unwrap_or(0);
            self.usage = Some(match (usage.prompt_tokens, usage.completion_tokens) {
                (None, None) => TokenUsage::total_only(usage.total_tokens.unwrap_or(0)),
                _ => TokenUsage::new(input, output),
            });
        }
        Ok(())
    }
}

// =============================================================================
// PROVIDER CLIENT IMPL
// =============================================================================

#[async_trait]
impl ProviderClient for OpenAiCompatAdapter {
    fn name(&self) -> &str {
        &self.provider
    }

    async fn stream_response(
        &self,
        prompt: &str,
        model: &str,
        on_chunk: ChunkSink<'_>,
    ) -> Result<Completion, ProviderError> {
        if prompt.len() > MAX_INPUT_CHARS {
            return Err(ProviderError::invalid_request(format!(
                "Input too large: {} chars (max {MAX_INPUT_CHARS})",
                prompt.len()
            )));
        }

        let start = Instant::now();

        let api_req = ChatApiRequest {
            model,
            messages: [ApiMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.temperature,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
            max_tokens: self.max_tokens,
        };

        let mut response = self
            .client
            .post(self.chat_url())
            .json(&api_req)
            .send()
            .await?;

        let status = response.status();
        let request_id = Self::extract_request_id(response.headers());

        let ctx = ErrorContext::new().with_status(status.as_u16());
        let ctx = if let Some(id) = &request_id {
            ctx.with_request_id(id)
        } else {
            ctx
        };

        if !status.is_success() {
            let retry_after = Self::retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(self.status_error(status.as_u16(), &body, ctx, retry_after));
        }

        let mut state = SseState::default();
        while let Some(chunk) = response.chunk().await? {
            state.feed(&self.provider, &chunk, on_chunk)?;
            if state.done {
                break;
            }
        }
        state.finish(&self.provider, on_chunk)?;

        let content = state.content;
        let token_usage = state.usage.or_else(|| {
            Some(TokenUsage::new(estimate_tokens(prompt), estimate_tokens(&content)))
        });

        Ok(Completion {
            content,
            response_time_ms: start.elapsed().as_millis() as u64,
            token_usage,
        })
    }

    async fn list_available_text_models(&self) -> Result<Vec<String>, ProviderError> {
        let response = self.client.get(self.models_url()).send().await?;
        let status = response.status();
        if !status.is_success() {
            let ctx = ErrorContext::new().with_status(status.as_u16());
            let retry_after = Self::retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(self.status_error(status.as_u16(), &body, ctx, retry_after));
        }
        let list: ModelList = response.json().await?;
        let mut ids: Vec<String> = list
            .data
            .into_iter()
            .map(|m| m.id)
            .filter(|id| !is_non_text_model(id))
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// Embedding, audio and image models share the `/models` listing.
fn is_non_text_model(id: &str) -> bool {
    const MARKERS: &[&str] = &[
        "embedding", "whisper", "tts", "dall-e", "imagen", "moderation", "audio", "realtime",
    ];
    let lower = id.to_lowercase();
    MARKERS.iter().any(|m| lower.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::discard_chunk;
    use std::sync::Mutex;

    #[test]
    fn sse_state_handles_split_lines_and_usage() {
        let seen = Mutex::new(Vec::new());
        let sink = |s: &str| seen.lock().unwrap().push(s.to_string());
        let mut state = SseState::default();

        state
            .feed("openai", b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\nda", &sink)
            .unwrap();
        state
            .feed("openai", b"ta: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n", &sink)
            .unwrap();
        state
            .feed(
                "openai",
                b"data: {\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2}}\ndata: [DONE]\n",
                &sink,
            )
            .unwrap();
        state.finish("openai", &sink).unwrap();

        assert_eq!(state.content, "Hello");
        assert_eq!(*seen.lock().unwrap(), vec!["Hel", "lo"]);
        assert_eq!(state.usage, Some(TokenUsage::new(3, 2)));
        assert!(state.done);
    }

    #[test]
    fn sse_state_keeps_codepoints_split_across_chunks() {
        let frame = "data: {\"choices\":[{\"delta\":{\"content\":\"café au lait: 42\"}}]}\n".as_bytes();
        // Split between the two bytes of 'é'.
        let split = frame.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut state = SseState::default();

        state.feed("openai", &frame[..split], &discard_chunk).unwrap();
        state.feed("openai", &frame[split..], &discard_chunk).unwrap();
        state.finish("openai", &discard_chunk).unwrap();

        assert_eq!(state.content, "café au lait: 42");
    }

    #[test]
    fn non_text_models_are_filtered() {
        assert!(is_non_text_model("text-embedding-3-large"));
        assert!(is_non_text_model("whisper-1"));
        assert!(!is_non_text_model("gpt-4o-mini"));
    }
}
