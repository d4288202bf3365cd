//! # tokio-provider-dispatch
//!
//! Health-aware fallback dispatch across interchangeable AI provider
//! backends, built on Tokio.
//!
//! ## Architecture
//!
//! ```text
//! caller → Dispatcher::submit
//!            ├─ DispatchPolicy::next_candidates  (registry × health snapshot)
//!            ├─ ProviderInvoker::invoke          (under a hard timeout)
//!            ├─ HealthTracker::record            (before the next candidate)
//!            └─ Success | Exhausted
//! ```
//!
//! Providers are tried one at a time. Each outcome updates that provider's
//! health record; repeated failures open its circuit so later requests skip
//! it until a single probe succeeds after the cooldown.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![warn(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod dispatcher;
pub mod health;
pub mod invoker;
pub mod metrics;
pub mod policy;
pub mod provider;
pub mod registry;
pub mod retry;

// Re-exports for convenience
pub use dispatcher::{AttemptRecord, Constraints, DispatchOutcome, Dispatcher, RequestEnvelope};
pub use health::{AttemptOutcome, HealthConfig, HealthState, HealthTracker, HealthView};
pub use invoker::{
    AnthropicInvoker, BackendInvoker, EchoInvoker, GeminiInvoker, OpenAiInvoker, ProviderInvoker,
};
pub use policy::{DispatchPolicy, PolicyConfig};
pub use provider::{
    Backend, ChatMessage, FailureKind, Payload, ProviderDescriptor, ProviderFailure, ProviderReply,
};
pub use registry::ProviderRegistry;
pub use retry::RetryPolicy;

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`DispatchError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Example
///
/// ```no_run
/// # use tokio_provider_dispatch::{init_tracing, DispatchError};
/// # fn example() -> Result<(), DispatchError> {
/// init_tracing()?;
/// # Ok(()) }
/// ```
pub fn init_tracing() -> Result<(), DispatchError> {
    init_tracing_with_default("pretty")
}

/// Like [`init_tracing`], but falls back to `default_format` when
/// `LOG_FORMAT` is unset (e.g. the config file's `log_format`).
///
/// # Errors
///
/// Returns [`DispatchError::Other`] if the global subscriber has already
/// been set.
pub fn init_tracing_with_default(default_format: &str) -> Result<(), DispatchError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| default_format.to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| DispatchError::Other(format!("tracing init failed: {e}")))
}

/// Request- and registry-level errors.
///
/// Individual provider failures never appear here on their own; they are
/// collected into the [`AttemptRecord`] trail.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// `submit` was called with an empty registry. No provider was called.
    #[error("no providers configured")]
    NoProvidersConfigured,

    /// A provider with this id is already registered.
    #[error("duplicate provider: {0}")]
    DuplicateProvider(String),

    /// No provider with this id is registered.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// Every eligible candidate failed.
    #[error("all providers exhausted after {} attempt(s)", attempts.len())]
    Exhausted {
        /// Every provider tried, in order.
        attempts: Vec<AttemptRecord>,
    },

    /// The caller cancelled the request.
    #[error("request cancelled after {} attempt(s)", attempts.len())]
    Cancelled {
        /// Providers tried before cancellation; the last entry is `Cancelled`
        /// if an attempt was in flight.
        attempts: Vec<AttemptRecord>,
    },

    /// A configuration value is missing or invalid (e.g., missing env var).
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

impl From<config::validation::ConfigError> for DispatchError {
    fn from(e: config::validation::ConfigError) -> Self {
        Self::ConfigError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_config_error_display_includes_message() {
        let err = DispatchError::ConfigError("OPENAI_API_KEY not set".to_string());
        assert!(err.to_string().contains("OPENAI_API_KEY not set"));
    }

    #[test]
    fn test_exhausted_display_counts_attempts() {
        let record = AttemptRecord {
            provider_id: "a".to_string(),
            failure: FailureKind::Timeout,
            tries: 1,
            latency: Duration::from_millis(50),
            message: "no reply within 50 ms".to_string(),
        };
        let err = DispatchError::Exhausted {
            attempts: vec![record.clone(), AttemptRecord {
                provider_id: "b".to_string(),
                ..record
            }],
        };
        assert_eq!(err.to_string(), "all providers exhausted after 2 attempt(s)");
    }

    #[test]
    fn test_loader_error_converts_to_config_error() {
        let err: DispatchError = config::validation::ConfigError::Validation("bad".into()).into();
        assert!(matches!(err, DispatchError::ConfigError(ref m) if m.contains("bad")));
    }

    #[test]
    fn test_init_tracing_second_call_returns_err() {
        // The first call may fail too if another test installed a subscriber.
        let _ = init_tracing();
        let result = init_tracing();
        assert!(result.is_err(), "double init must return Err, not panic");
    }
}
