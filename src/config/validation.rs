//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`DispatchConfig`] that cannot
//! be expressed through the type system alone (range checks, uniqueness,
//! cross-field invariants).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use std::collections::HashSet;

use super::DispatchConfig;

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "retry.base_delay_ms").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: impl Into<String>, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Validate all semantic constraints on a [`DispatchConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Errors
///
/// `Err(Vec<ConfigError>)` with every violation found.
pub fn validate(config: &DispatchConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Dispatch section ─────────────────────────────────────────────
    if config.dispatch.name.trim().is_empty() {
        errors.push(invalid("dispatch.name", "", "name must not be empty"));
    }
    if config.dispatch.max_attempts == Some(0) {
        errors.push(invalid("dispatch.max_attempts", 0, "must be at least 1"));
    }

    // ── Health / circuit breaker ─────────────────────────────────────
    if config.health.failure_threshold == 0 {
        errors.push(invalid("health.failure_threshold", 0, "must be at least 1"));
    }
    if config.health.cooldown_ms == 0 {
        errors.push(invalid("health.cooldown_ms", 0, "must be at least 1ms"));
    }
    let alpha = config.health.ewma_alpha;
    if !(alpha > 0.0 && alpha <= 1.0) {
        errors.push(invalid("health.ewma_alpha", alpha, "must be in (0.0, 1.0]"));
    }

    // ── Retry ────────────────────────────────────────────────────────
    if config.retry.tries_per_provider == 0 {
        errors.push(invalid("retry.tries_per_provider", 0, "must be at least 1"));
    }
    if config.retry.base_delay_ms > config.retry.max_delay_ms {
        errors.push(invalid(
            "retry.base_delay_ms",
            config.retry.base_delay_ms,
            "must be \u{2264} max_delay_ms",
        ));
    }

    // ── Providers ────────────────────────────────────────────────────
    let mut seen = HashSet::new();
    for (i, p) in config.providers.iter().enumerate() {
        if p.id.trim().is_empty() {
            errors.push(invalid(format!("providers[{i}].id"), "", "id must not be empty"));
        } else if !seen.insert(p.id.as_str()) {
            errors.push(invalid(
                format!("providers[{i}].id"),
                &p.id,
                "duplicate provider id",
            ));
        }
        if p.timeout_ms == 0 {
            errors.push(invalid(
                format!("providers[{i}].timeout_ms"),
                0,
                "timeout must be at least 1ms",
            ));
        }
        if p.max_tokens_limit == 0 {
            errors.push(invalid(
                format!("providers[{i}].max_tokens_limit"),
                0,
                "must be at least 1",
            ));
        }
        if matches!(&p.model, Some(m) if m.trim().is_empty()) {
            errors.push(invalid(
                format!("providers[{i}].model"),
                "",
                "model name must not be empty when given",
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
