//! # Declarative Dispatch Configuration
//!
//! ## Responsibility
//! Parse, validate, and hot-reload TOML dispatch configuration files: the
//! provider list, health and circuit-breaker tunables, the same-provider
//! retry schedule and logging format.
//! ```text
//! provider-dispatch --config dispatch.toml --health
//! ```
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `DispatchConfig`
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Hot-reloadable: file changes are detected and validated before applying
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Applying a config to a running dispatcher (that belongs to `dispatcher`)
//! - Reading API keys (that belongs to `invoker`)

pub mod loader;
pub mod validation;
pub mod watcher;

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::health::HealthConfig;
use crate::policy::PolicyConfig;
use crate::provider::{Backend, ProviderDescriptor, DEFAULT_MAX_TOKENS_LIMIT};
use crate::retry::{RetryPolicy, RetryStrategy};
use crate::DispatchError;

// ── Default value functions ──────────────────────────────────────────────

fn default_name() -> String {
    "default".to_string()
}

/// Default circuit threshold: 3 consecutive strikes.
fn default_failure_threshold() -> u32 {
    3
}

/// Default circuit cooldown: 30 seconds.
fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_ewma_alpha() -> f64 {
    0.3
}

fn default_latency_noise_ms() -> u64 {
    50
}

/// Default tries per provider: 1 (no same-provider retry).
fn default_tries_per_provider() -> u32 {
    1
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    2_000
}

/// Default provider timeout: 30 seconds.
fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_tokens_limit() -> u32 {
    DEFAULT_MAX_TOKENS_LIMIT
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a dispatcher instance.
///
/// Every section except `providers` may be omitted and falls back to its
/// documented defaults.
///
/// # Example
///
/// ```toml
/// [dispatch]
/// name = "production"
///
/// [[providers]]
/// id = "openai"
/// priority = 1
/// backend = "openai"
/// model = "gpt-4o-mini"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DispatchConfig {
    /// Dispatcher identity and request-level limits.
    #[serde(default)]
    pub dispatch: DispatchSection,
    /// Health tracking and circuit breaking.
    #[serde(default)]
    pub health: HealthSection,
    /// Same-provider retry schedule.
    #[serde(default)]
    pub retry: RetrySection,
    /// Logging.
    #[serde(default)]
    pub observability: ObservabilityConfig,
    /// Providers, in registration order.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// Dispatcher identity and request-level limits.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DispatchSection {
    /// Human-readable name used in logs.
    #[serde(default = "default_name")]
    pub name: String,
    /// Providers tried per request. Omitted means every registered provider.
    #[serde(default)]
    pub max_attempts: Option<usize>,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            max_attempts: None,
        }
    }
}

/// Health tracking and circuit-breaker tunables.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct HealthSection {
    /// Consecutive strikes that open a provider's circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Milliseconds an open circuit waits before allowing one probe.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// EWMA weight of the newest latency sample, in `(0, 1]`.
    #[serde(default = "default_ewma_alpha")]
    pub ewma_alpha: f64,
    /// Latency differences below this many ms do not reorder providers.
    #[serde(default = "default_latency_noise_ms")]
    pub latency_noise_ms: u64,
    /// Whether `rate_limited` failures count toward the threshold.
    #[serde(default)]
    pub rate_limit_counts_as_strike: bool,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
            ewma_alpha: default_ewma_alpha(),
            latency_noise_ms: default_latency_noise_ms(),
            rate_limit_counts_as_strike: false,
        }
    }
}

/// Backoff shape for same-provider retries.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyKind {
    /// Same delay every time.
    Fixed,
    /// Delay doubles up to `max_delay_ms`.
    #[default]
    Exponential,
    /// Delay grows by `base_delay_ms` each time.
    Linear,
}

/// Same-provider retry schedule.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RetrySection {
    /// Total tries per provider per request; 1 disables retrying.
    #[serde(default = "default_tries_per_provider")]
    pub tries_per_provider: u32,
    /// Backoff shape.
    #[serde(default)]
    pub strategy: RetryStrategyKind,
    /// First retry delay in ms. Must be ≤ `max_delay_ms`.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Cap on exponential delays in ms.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Add up to 25% random jitter.
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            tries_per_provider: default_tries_per_provider(),
            strategy: RetryStrategyKind::default(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: false,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ObservabilityConfig {
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable, colorized log output.
    #[default]
    Pretty,
    /// Structured JSON log output for machine consumption.
    Json,
}

impl LogFormat {
    /// Value understood by the `LOG_FORMAT` environment variable.
    pub fn as_env_value(&self) -> &'static str {
        match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

/// One `[[providers]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ProviderConfig {
    /// Unique provider name.
    pub id: String,
    /// Lower is tried first when health is tied.
    #[serde(default)]
    pub priority: i32,
    /// Built-in invoker that serves it.
    #[serde(default)]
    pub backend: Backend,
    /// Model name; omitted uses the backend default.
    #[serde(default)]
    pub model: Option<String>,
    /// Hard ceiling on one attempt, in ms.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Largest token count a reply may report.
    #[serde(default = "default_max_tokens_limit")]
    pub max_tokens_limit: u32,
}

impl ProviderConfig {
    /// Convert to a registry descriptor.
    pub fn to_descriptor(&self) -> ProviderDescriptor {
        let descriptor = ProviderDescriptor::new(self.id.clone(), self.priority)
            .with_backend(self.backend)
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_max_tokens_limit(self.max_tokens_limit);
        match &self.model {
            Some(model) => descriptor.with_model(model.clone()),
            None => descriptor,
        }
    }
}

impl DispatchConfig {
    /// Descriptors for every configured provider, in file order.
    pub fn provider_descriptors(&self) -> Vec<ProviderDescriptor> {
        self.providers.iter().map(ProviderConfig::to_descriptor).collect()
    }

    /// Health tracker tunables.
    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            failure_threshold: self.health.failure_threshold,
            cooldown: Duration::from_millis(self.health.cooldown_ms),
            ewma_alpha: self.health.ewma_alpha,
            latency_noise: Duration::from_millis(self.health.latency_noise_ms),
            rate_limit_counts_as_strike: self.health.rate_limit_counts_as_strike,
        }
    }

    /// Dispatch policy tunables.
    pub fn policy_config(&self) -> PolicyConfig {
        let r = &self.retry;
        let base = Duration::from_millis(r.base_delay_ms);
        let strategy = match r.strategy {
            RetryStrategyKind::Fixed => RetryStrategy::Fixed(base),
            RetryStrategyKind::Exponential => RetryStrategy::Exponential {
                initial_delay: base,
                max_delay: Duration::from_millis(r.max_delay_ms),
                multiplier: 2.0,
            },
            RetryStrategyKind::Linear => RetryStrategy::Linear {
                initial_delay: base,
                increment: base,
            },
        };
        PolicyConfig {
            max_attempts: self.dispatch.max_attempts,
            retry: RetryPolicy {
                tries_per_provider: r.tries_per_provider,
                strategy,
                jitter: r.jitter,
            },
        }
    }

    /// Run validation and fold every violation into one error.
    ///
    /// # Errors
    ///
    /// [`DispatchError::ConfigError`] listing every violation, one per line.
    pub fn check(&self) -> Result<(), DispatchError> {
        validation::validate(self).map_err(|errors| {
            DispatchError::ConfigError(
                errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        })
    }
}

/// Export the JSON Schema for `DispatchConfig`.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(DispatchConfig);
    serde_json::to_string_pretty(&schema)
}
