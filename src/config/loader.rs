//! Configuration file loading.
//!
//! ## Responsibility
//! Read a TOML file from disk, parse it into a [`DispatchConfig`], and run
//! validation before returning.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - I/O errors and parse errors are distinguished in the error type
//! - File path is included in every error message
//!
//! ## NOT Responsible For
//! - Hot-reloading on file changes (that belongs to `watcher`)
//! - Defining the config schema (that belongs to `mod.rs`)

use std::path::Path;

use super::validation::{self, ConfigError};
use super::DispatchConfig;

/// Load a [`DispatchConfig`] from a TOML file.
///
/// # Errors
///
/// - `ConfigError::Io` if the file cannot be read.
/// - `ConfigError::Parse` if the TOML is malformed.
/// - `ConfigError::Validation` if semantic constraints are violated.
///
/// # Example
///
/// ```rust,ignore
/// use tokio_provider_dispatch::config::loader::load_from_file;
/// use std::path::Path;
///
/// let config = load_from_file(Path::new("dispatch.toml"))?;
/// println!("Loaded {} providers", config.providers.len());
/// ```
pub fn load_from_file(path: &Path) -> Result<DispatchConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Load a [`DispatchConfig`] from a TOML string.
///
/// `source_name` identifies the source in error messages.
///
/// # Errors
///
/// - `ConfigError::Parse` if the TOML is malformed.
/// - `ConfigError::Validation` if semantic constraints are violated.
pub fn load_from_str(content: &str, source_name: &str) -> Result<DispatchConfig, ConfigError> {
    let config: DispatchConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    validation::validate(&config).map_err(|errors| {
        ConfigError::Validation(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    })?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogFormat, RetryStrategyKind};
    use crate::provider::Backend;
    use std::io::Write;

    const VALID_TOML: &str = r#"
[dispatch]
name = "test"
max_attempts = 2

[health]
failure_threshold = 4
cooldown_ms = 1000

[retry]
tries_per_provider = 2
strategy = "fixed"
base_delay_ms = 10

[observability]
log_format = "json"

[[providers]]
id = "openai"
priority = 1
backend = "openai"
model = "gpt-4o-mini"
timeout_ms = 5000

[[providers]]
id = "local"
priority = 2
backend = "echo"
"#;

    #[test]
    fn test_load_from_str_valid_toml_succeeds() {
        let config = load_from_str(VALID_TOML, "test.toml").expect("test: valid config");
        assert_eq!(config.dispatch.name, "test");
        assert_eq!(config.dispatch.max_attempts, Some(2));
        assert_eq!(config.health.failure_threshold, 4);
        assert_eq!(config.health.cooldown_ms, 1000);
        // unspecified fields take defaults
        assert_eq!(config.health.latency_noise_ms, 50);
        assert_eq!(config.retry.strategy, RetryStrategyKind::Fixed);
        assert_eq!(config.observability.log_format, LogFormat::Json);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].backend, Backend::OpenAi);
        assert_eq!(config.providers[1].timeout_ms, 30_000);
        assert_eq!(config.providers[1].max_tokens_limit, 1024);
    }

    #[test]
    fn test_load_from_str_minimal_toml_uses_defaults() {
        let config = load_from_str("[[providers]]\nid = \"a\"\n", "min.toml")
            .expect("test: minimal config");
        assert_eq!(config.dispatch.name, "default");
        assert_eq!(config.retry.tries_per_provider, 1);
        assert_eq!(config.providers[0].backend, Backend::External);
    }

    #[test]
    fn test_load_from_str_invalid_toml_returns_parse_error() {
        let result = load_from_str("not valid [[[", "bad.toml");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_load_from_str_unknown_backend_returns_parse_error() {
        let toml = "[[providers]]\nid = \"a\"\nbackend = \"carrier_pigeon\"\n";
        let result = load_from_str(toml, "bad.toml");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_load_from_str_validation_failure_returns_validation_error() {
        let toml = r#"
[health]
failure_threshold = 0

[[providers]]
id = "a"

[[providers]]
id = "a"
"#;
        let err = load_from_str(toml, "dup.toml").unwrap_err();
        let ConfigError::Validation(msg) = err else {
            panic!("expected Validation, got {err:?}");
        };
        assert!(msg.contains("health.failure_threshold"));
        assert!(msg.contains("duplicate provider id"));
    }

    #[test]
    fn test_load_from_str_source_name_appears_in_error() {
        let err = load_from_str("[[[", "my-config.toml").unwrap_err();
        assert!(err.to_string().contains("my-config.toml"));
    }

    #[test]
    fn test_load_from_file_valid_toml_succeeds() {
        let mut file = tempfile::NamedTempFile::new().expect("test: tempfile");
        file.write_all(VALID_TOML.as_bytes()).expect("test: write");
        let config = load_from_file(file.path()).expect("test: load");
        assert_eq!(config.providers.len(), 2);
    }

    #[test]
    fn test_load_from_file_missing_file_returns_io_error() {
        let result = load_from_file(Path::new("/nonexistent/path/dispatch.toml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
