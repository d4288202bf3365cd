//! Provider invocation capability and built-in backends
//!
//! The dispatch core consumes exactly one capability from its environment:
//! [`ProviderInvoker::invoke`]. Everything that actually talks to a model
//! lives behind it, so the core can be driven by HTTP clients, local models
//! or test doubles interchangeably.
//!
//! Built-in implementations:
//! - [`EchoInvoker`]: returns the prompt, for demos and smoke tests
//! - [`OpenAiInvoker`]: OpenAI chat completions
//! - [`AnthropicInvoker`]: Anthropic messages API
//! - [`GeminiInvoker`]: Google Gemini `generateContent`
//! - [`BackendInvoker`]: routes each descriptor to one of the above by its
//!   [`Backend`](crate::provider::Backend)
//!
//! ## Environment Variables
//!
//! - `OPENAI_API_KEY`: required by `OpenAiInvoker::from_env`
//! - `ANTHROPIC_API_KEY`: required by `AnthropicInvoker::from_env`
//! - `GEMINI_API_KEY`: required by `GeminiInvoker::from_env`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::provider::{
    Backend, ChatMessage, FailureKind, Payload, ProviderDescriptor, ProviderFailure, ProviderReply,
};
use crate::DispatchError;

/// Performs the actual call to one backend.
///
/// Implementations must be thread-safe (Send + Sync) for use across tasks.
/// The trait is object-safe to allow dynamic dispatch via
/// `Arc<dyn ProviderInvoker>`.
///
/// Implementations should honour `timeout`, but the dispatcher does not rely
/// on it: the returned future is dropped once the timeout elapses or the
/// caller cancels.
#[async_trait]
pub trait ProviderInvoker: Send + Sync {
    /// Send `payload` to the backend described by `descriptor`.
    async fn invoke(
        &self,
        descriptor: &ProviderDescriptor,
        payload: &Payload,
        timeout: Duration,
    ) -> Result<ProviderReply, ProviderFailure>;
}

// ============================================================================
// Classification helpers
// ============================================================================

/// Map an HTTP status to a failure kind.
///
/// 401/403 are auth, 429 is load shedding, 408/504 are timeouts, other 5xx
/// are transient and every other non-success status is permanent.
pub fn classify_status(status: StatusCode) -> FailureKind {
    match status.as_u16() {
        401 | 403 => FailureKind::AuthError,
        429 => FailureKind::RateLimited,
        408 | 504 => FailureKind::Timeout,
        500..=599 => FailureKind::TransientError,
        _ => FailureKind::PermanentError,
    }
}

/// Map a transport-level `reqwest` error to a failure kind.
pub fn classify_transport(error: &reqwest::Error) -> FailureKind {
    if error.is_timeout() {
        FailureKind::Timeout
    } else if error.is_decode() {
        FailureKind::PermanentError
    } else if let Some(status) = error.status() {
        classify_status(status)
    } else {
        FailureKind::TransientError
    }
}

const ERROR_BODY_LIMIT: usize = 200;

/// Send a prepared request and decode a JSON success body.
async fn send_json<T: DeserializeOwned>(
    backend: &str,
    request: reqwest::RequestBuilder,
) -> Result<T, ProviderFailure> {
    let response = request.send().await.map_err(|e| {
        ProviderFailure::new(classify_transport(&e), format!("{backend} request failed: {e}"))
    })?;

    let status = response.status();
    if !status.is_success() {
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > ERROR_BODY_LIMIT {
            let mut cut = ERROR_BODY_LIMIT;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        return Err(ProviderFailure::new(
            classify_status(status),
            format!("{backend} API error {status}: {body}"),
        ));
    }

    response.json::<T>().await.map_err(|e| {
        ProviderFailure::permanent(format!("{backend} response could not be parsed: {e}"))
    })
}

fn api_key_from_env(var: &str) -> Result<String, DispatchError> {
    match std::env::var(var) {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ => Err(DispatchError::ConfigError(format!(
            "{var} environment variable not set"
        ))),
    }
}

// ============================================================================
// Echo Invoker (Testing)
// ============================================================================

/// Echo backend for demos and smoke tests.
///
/// Returns the payload text as the reply and reports one token per word.
pub struct EchoInvoker {
    /// Simulated latency.
    pub delay: Duration,
}

impl EchoInvoker {
    /// Echo with a 10 ms simulated latency.
    pub fn new() -> Self {
        Self {
            delay: Duration::from_millis(10),
        }
    }

    /// Echo with a custom simulated latency.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for EchoInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderInvoker for EchoInvoker {
    async fn invoke(
        &self,
        _descriptor: &ProviderDescriptor,
        payload: &Payload,
        _timeout: Duration,
    ) -> Result<ProviderReply, ProviderFailure> {
        tokio::time::sleep(self.delay).await;
        let text = payload.to_text();
        let tokens = text.split_whitespace().count() as u32;
        Ok(ProviderReply::text(text).with_tokens(tokens))
    }
}

// ============================================================================
// Backend router
// ============================================================================

/// Routes each descriptor to the invoker registered for its backend.
#[derive(Default, Clone)]
pub struct BackendInvoker {
    backends: HashMap<Backend, Arc<dyn ProviderInvoker>>,
}

impl std::fmt::Debug for BackendInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&str> = self.backends.keys().map(|b| b.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("BackendInvoker").field("backends", &kinds).finish()
    }
}

impl BackendInvoker {
    /// Router with no backends.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `invoker` for `backend`, replacing any previous one.
    pub fn with(mut self, backend: Backend, invoker: Arc<dyn ProviderInvoker>) -> Self {
        self.backends.insert(backend, invoker);
        self
    }

    /// Echo plus every HTTP backend whose API key is present in the environment.
    pub fn from_env() -> Self {
        let mut router = Self::new().with(Backend::Echo, Arc::new(EchoInvoker::new()));
        match OpenAiInvoker::from_env() {
            Ok(inv) => router = router.with(Backend::OpenAi, Arc::new(inv)),
            Err(e) => debug!(error = %e, "invoker: OpenAI backend unavailable"),
        }
        match AnthropicInvoker::from_env() {
            Ok(inv) => router = router.with(Backend::Anthropic, Arc::new(inv)),
            Err(e) => debug!(error = %e, "invoker: Anthropic backend unavailable"),
        }
        match GeminiInvoker::from_env() {
            Ok(inv) => router = router.with(Backend::Gemini, Arc::new(inv)),
            Err(e) => debug!(error = %e, "invoker: Gemini backend unavailable"),
        }
        router
    }

    /// Whether a backend is wired up.
    pub fn supports(&self, backend: Backend) -> bool {
        self.backends.contains_key(&backend)
    }
}

#[async_trait]
impl ProviderInvoker for BackendInvoker {
    async fn invoke(
        &self,
        descriptor: &ProviderDescriptor,
        payload: &Payload,
        timeout: Duration,
    ) -> Result<ProviderReply, ProviderFailure> {
        match self.backends.get(&descriptor.backend) {
            Some(invoker) => invoker.invoke(descriptor, payload, timeout).await,
            None => Err(ProviderFailure::permanent(format!(
                "no invoker registered for backend '{}'",
                descriptor.backend.as_str()
            ))),
        }
    }
}

// ============================================================================
// OpenAI Invoker
// ============================================================================

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    completion_tokens: u32,
}

/// OpenAI chat completions backend.
///
/// ## Example
///
/// ```no_run
/// use tokio_provider_dispatch::invoker::OpenAiInvoker;
///
/// let invoker = OpenAiInvoker::from_env()?;
/// # Ok::<(), tokio_provider_dispatch::DispatchError>(())
/// ```
pub struct OpenAiInvoker {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl OpenAiInvoker {
    /// Create with an explicit API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            default_model: "gpt-4o-mini".to_string(),
        }
    }

    /// Create from `OPENAI_API_KEY`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::ConfigError`] if the variable is unset or empty.
    pub fn from_env() -> Result<Self, DispatchError> {
        Ok(Self::new(api_key_from_env("OPENAI_API_KEY")?))
    }

    /// Point at a different API root (proxies, compatible servers, tests).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Model used when the descriptor names none.
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }
}

#[async_trait]
impl ProviderInvoker for OpenAiInvoker {
    async fn invoke(
        &self,
        descriptor: &ProviderDescriptor,
        payload: &Payload,
        timeout: Duration,
    ) -> Result<ProviderReply, ProviderFailure> {
        let messages = payload.to_messages();
        let request = OpenAiRequest {
            model: descriptor.model.as_deref().unwrap_or(&self.default_model),
            messages: &messages,
            max_tokens: descriptor.max_tokens_limit,
        };

        let builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(&request);
        let response: OpenAiResponse = send_json("OpenAI", builder).await?;

        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderFailure::transient("no choices in OpenAI response"))?;

        Ok(ProviderReply {
            text,
            tokens: response.usage.map(|u| u.completion_tokens),
        })
    }
}

// ============================================================================
// Anthropic Invoker
// ============================================================================

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<&'a ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicBlock {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    output_tokens: u32,
}

/// Anthropic messages API backend.
pub struct AnthropicInvoker {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl AnthropicInvoker {
    /// Create with an explicit API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com/v1".to_string(),
            default_model: "claude-3-5-haiku-latest".to_string(),
        }
    }

    /// Create from `ANTHROPIC_API_KEY`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::ConfigError`] if the variable is unset or empty.
    pub fn from_env() -> Result<Self, DispatchError> {
        Ok(Self::new(api_key_from_env("ANTHROPIC_API_KEY")?))
    }

    /// Point at a different API root.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Model used when the descriptor names none.
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }
}

#[async_trait]
impl ProviderInvoker for AnthropicInvoker {
    async fn invoke(
        &self,
        descriptor: &ProviderDescriptor,
        payload: &Payload,
        timeout: Duration,
    ) -> Result<ProviderReply, ProviderFailure> {
        let transcript = payload.to_messages();
        let (system, turns): (Vec<&ChatMessage>, Vec<&ChatMessage>) =
            transcript.iter().partition(|m| m.role == "system");
        let system = if system.is_empty() {
            None
        } else {
            Some(
                system
                    .iter()
                    .map(|m| m.content.as_str())
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        };

        let request = AnthropicRequest {
            model: descriptor.model.as_deref().unwrap_or(&self.default_model),
            max_tokens: descriptor.max_tokens_limit,
            system,
            messages: turns,
        };

        let builder = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .timeout(timeout)
            .json(&request);
        let response: AnthropicResponse = send_json("Anthropic", builder).await?;

        let text: String = response
            .content
            .into_iter()
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");

        Ok(ProviderReply {
            text,
            tokens: response.usage.map(|u| u.output_tokens),
        })
    }
}

// ============================================================================
// Gemini Invoker
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    candidates_token_count: Option<u32>,
}

/// Google Gemini `generateContent` backend.
pub struct GeminiInvoker {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl GeminiInvoker {
    /// Create with an explicit API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            default_model: "gemini-1.5-flash".to_string(),
        }
    }

    /// Create from `GEMINI_API_KEY`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::ConfigError`] if the variable is unset or empty.
    pub fn from_env() -> Result<Self, DispatchError> {
        Ok(Self::new(api_key_from_env("GEMINI_API_KEY")?))
    }

    /// Point at a different API root.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Model used when the descriptor names none.
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }
}

fn gemini_text(text: &str) -> Vec<GeminiPart> {
    vec![GeminiPart {
        text: Some(text.to_string()),
    }]
}

#[async_trait]
impl ProviderInvoker for GeminiInvoker {
    async fn invoke(
        &self,
        descriptor: &ProviderDescriptor,
        payload: &Payload,
        timeout: Duration,
    ) -> Result<ProviderReply, ProviderFailure> {
        let mut system_lines = Vec::new();
        let mut contents = Vec::new();
        for message in payload.to_messages() {
            match message.role.as_str() {
                "system" => system_lines.push(message.content),
                "assistant" => contents.push(GeminiContent {
                    role: Some("model".to_string()),
                    parts: gemini_text(&message.content),
                }),
                _ => contents.push(GeminiContent {
                    role: Some("user".to_string()),
                    parts: gemini_text(&message.content),
                }),
            }
        }
        let system_instruction = if system_lines.is_empty() {
            None
        } else {
            Some(GeminiContent {
                role: None,
                parts: gemini_text(&system_lines.join("\n")),
            })
        };

        let request = GeminiRequest {
            contents,
            system_instruction,
            generation_config: GeminiGenerationConfig {
                max_output_tokens: descriptor.max_tokens_limit,
            },
        };

        let model = descriptor.model.as_deref().unwrap_or(&self.default_model);
        let builder = self
            .client
            .post(format!("{}/models/{}:generateContent", self.base_url, model))
            .header("x-goog-api-key", &self.api_key)
            .timeout(timeout)
            .json(&request);
        let response: GeminiResponse = send_json("Gemini", builder).await?;

        let text = response
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .ok_or_else(|| ProviderFailure::transient("no candidates in Gemini response"))?;

        Ok(ProviderReply {
            text,
            tokens: response.usage_metadata.and_then(|u| u.candidates_token_count),
        })
    }
}
