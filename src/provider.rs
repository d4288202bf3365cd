//! Provider descriptors and the values that flow through a single attempt.
//!
//! A [`ProviderDescriptor`] names one backend endpoint together with its
//! operational ceilings. Descriptors are immutable once registered; the
//! registry hands out clones, never references into its own storage.
//!
//! The attempt vocabulary lives here too: the opaque [`Payload`] a caller
//! submits, the [`ProviderReply`] a backend returns, and the
//! [`FailureKind`] taxonomy every per-attempt failure is classified into.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default per-provider timeout: 30 seconds.
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

/// Default per-provider token ceiling.
pub const DEFAULT_MAX_TOKENS_LIMIT: u32 = 1024;

/// Which built-in invoker serves a provider.
///
/// `External` providers are served by whatever invoker the host injects;
/// [`BackendInvoker`](crate::invoker::BackendInvoker) rejects them.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// OpenAI chat completions API.
    #[serde(rename = "openai")]
    OpenAi,
    /// Anthropic messages API.
    Anthropic,
    /// Google Gemini `generateContent` API.
    Gemini,
    /// Local echo backend for demos and smoke tests.
    Echo,
    /// Served by a caller-supplied invoker.
    #[default]
    External,
}

impl Backend {
    /// Stable lowercase label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Echo => "echo",
            Self::External => "external",
        }
    }
}

/// Identifies one backend endpoint, its capabilities and limits.
///
/// Lower `priority` is tried first when health is tied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderDescriptor {
    /// Unique provider name, e.g. `"openai"`.
    pub id: String,
    /// Ordering hint; lower wins ties.
    pub priority: i32,
    /// Largest token count a reply may report before it is rejected.
    pub max_tokens_limit: u32,
    /// Hard ceiling on a single attempt against this provider.
    pub timeout: Duration,
    /// Built-in invoker that serves this provider.
    pub backend: Backend,
    /// Model name passed to the backend. `None` uses the backend default.
    pub model: Option<String>,
}

impl ProviderDescriptor {
    /// Create a descriptor with default limits and the `External` backend.
    pub fn new(id: impl Into<String>, priority: i32) -> Self {
        Self {
            id: id.into(),
            priority,
            max_tokens_limit: DEFAULT_MAX_TOKENS_LIMIT,
            timeout: DEFAULT_PROVIDER_TIMEOUT,
            backend: Backend::External,
            model: None,
        }
    }

    /// Set the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the reply token ceiling.
    pub fn with_max_tokens_limit(mut self, limit: u32) -> Self {
        self.max_tokens_limit = limit;
        self
    }

    /// Select the built-in backend.
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Set the model name sent to the backend.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// One chat turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `"system"`, `"user"` or `"assistant"`.
    pub role: String,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// A `user` message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// A `system` message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

/// Request data handed to a provider. The dispatch core never inspects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    /// A single prompt string.
    Prompt(String),
    /// A chat transcript.
    Messages(Vec<ChatMessage>),
}

impl Payload {
    /// Normalise into a chat transcript.
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        match self {
            Self::Prompt(text) => vec![ChatMessage::user(text.clone())],
            Self::Messages(messages) => messages.clone(),
        }
    }

    /// Flatten to plain text, one message per line.
    pub fn to_text(&self) -> String {
        match self {
            Self::Prompt(text) => text.clone(),
            Self::Messages(messages) => messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::Prompt(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::Prompt(value)
    }
}

/// A backend's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderReply {
    /// Generated text.
    pub text: String,
    /// Tokens the backend reports having generated, when it says.
    pub tokens: Option<u32>,
}

impl ProviderReply {
    /// Reply with text only.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tokens: None,
        }
    }

    /// Attach a reported token count.
    pub fn with_tokens(mut self, tokens: u32) -> Self {
        self.tokens = Some(tokens);
        self
    }
}

/// Why a single attempt did not yield a usable result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The attempt exceeded its computed timeout.
    Timeout,
    /// The backend shed load.
    RateLimited,
    /// Credentials were rejected.
    AuthError,
    /// Retryable backend or network failure.
    TransientError,
    /// The request can never succeed against this backend.
    PermanentError,
    /// The caller abandoned the request mid-attempt.
    Cancelled,
}

impl FailureKind {
    /// Stable lowercase label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::AuthError => "auth_error",
            Self::TransientError => "transient_error",
            Self::PermanentError => "permanent_error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether another try against the same provider could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::TransientError)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified per-attempt failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailure {
    /// Classification.
    pub kind: FailureKind,
    /// Human-readable detail.
    pub message: String,
}

impl ProviderFailure {
    /// Build a failure of any kind.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for [`FailureKind::TransientError`].
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::TransientError, message)
    }

    /// Shorthand for [`FailureKind::PermanentError`].
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::PermanentError, message)
    }
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ProviderFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_builder_sets_fields() {
        let d = ProviderDescriptor::new("openai", 1)
            .with_timeout(Duration::from_millis(250))
            .with_max_tokens_limit(64)
            .with_backend(Backend::OpenAi)
            .with_model("gpt-4o-mini");
        assert_eq!(d.id, "openai");
        assert_eq!(d.priority, 1);
        assert_eq!(d.timeout, Duration::from_millis(250));
        assert_eq!(d.max_tokens_limit, 64);
        assert_eq!(d.backend, Backend::OpenAi);
        assert_eq!(d.model.as_deref(), Some("gpt-4o-mini"));
    }

    #[test]
    fn test_descriptor_defaults() {
        let d = ProviderDescriptor::new("x", 0);
        assert_eq!(d.timeout, DEFAULT_PROVIDER_TIMEOUT);
        assert_eq!(d.max_tokens_limit, DEFAULT_MAX_TOKENS_LIMIT);
        assert_eq!(d.backend, Backend::External);
        assert!(d.model.is_none());
    }

    #[test]
    fn test_payload_prompt_to_messages_is_single_user_turn() {
        let p = Payload::from("hello");
        assert_eq!(p.to_messages(), vec![ChatMessage::user("hello")]);
        assert_eq!(p.to_text(), "hello");
    }

    #[test]
    fn test_payload_messages_to_text_joins_lines() {
        let p = Payload::Messages(vec![ChatMessage::system("be brief"), ChatMessage::user("hi")]);
        assert_eq!(p.to_text(), "be brief\nhi");
    }

    #[test]
    fn test_only_timeout_and_transient_are_retryable() {
        assert!(FailureKind::Timeout.is_retryable());
        assert!(FailureKind::TransientError.is_retryable());
        assert!(!FailureKind::RateLimited.is_retryable());
        assert!(!FailureKind::AuthError.is_retryable());
        assert!(!FailureKind::PermanentError.is_retryable());
        assert!(!FailureKind::Cancelled.is_retryable());
    }

    #[test]
    fn test_failure_kind_serializes_to_snake_case() {
        let json = serde_json::to_string(&FailureKind::RateLimited).expect("test: serialize");
        assert_eq!(json, "\"rate_limited\"");
    }

    #[test]
    fn test_backend_deserializes_from_snake_case() {
        let b: Backend = serde_json::from_str("\"openai\"").expect("test: deserialize");
        assert_eq!(b, Backend::OpenAi);
        assert_eq!(b.as_str(), "openai");
    }

    #[test]
    fn test_provider_failure_display_includes_kind() {
        let f = ProviderFailure::transient("connection reset");
        assert_eq!(f.to_string(), "transient_error: connection reset");
    }
}
