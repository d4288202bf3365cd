//! Prometheus metrics for the dispatch core.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The helper functions
//! (`record_attempt`, `record_request`, …) are no-ops if `init_metrics` was
//! never called, so dispatch is always safe to run and observability simply
//! degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `dispatch_requests_total` | Counter | `outcome` |
//! | `dispatch_attempts_total` | Counter | `provider`, `result` |
//! | `dispatch_attempt_duration_seconds` | Histogram | `provider` |
//! | `dispatch_circuit_state` | Gauge | `provider` |

use crate::DispatchError;
use prometheus::{
    core::Collector, CounterVec, Encoder, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the dispatcher, bundled together so they can be
/// stored in a single [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Finished requests by outcome.
    pub requests_total: CounterVec,
    /// Attempts by provider and result.
    pub attempts_total: CounterVec,
    /// Attempt latency per provider.
    pub attempt_duration: HistogramVec,
    /// Circuit state per provider (0 healthy, 1 degraded, 2 open).
    pub circuit_state: IntGaugeVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn build_metrics(prefix: &str) -> Result<Metrics, DispatchError> {
    let init_err = |e: prometheus::Error| DispatchError::Other(format!("metrics init failed: {e}"));
    let reg_err =
        |e: prometheus::Error| DispatchError::Other(format!("metrics registration failed: {e}"));

    let registry = Registry::new();

    let requests_total = CounterVec::new(
        Opts::new(
            format!("{prefix}_requests_total"),
            "Dispatched requests by final outcome",
        ),
        &["outcome"],
    )
    .map_err(init_err)?;
    registry
        .register(Box::new(requests_total.clone()))
        .map_err(reg_err)?;

    let attempts_total = CounterVec::new(
        Opts::new(
            format!("{prefix}_attempts_total"),
            "Provider attempts by result",
        ),
        &["provider", "result"],
    )
    .map_err(init_err)?;
    registry
        .register(Box::new(attempts_total.clone()))
        .map_err(reg_err)?;

    let attempt_duration = HistogramVec::new(
        HistogramOpts::new(
            format!("{prefix}_attempt_duration_seconds"),
            "Wall time of a single provider attempt",
        ),
        &["provider"],
    )
    .map_err(init_err)?;
    registry
        .register(Box::new(attempt_duration.clone()))
        .map_err(reg_err)?;

    let circuit_state = IntGaugeVec::new(
        Opts::new(
            format!("{prefix}_circuit_state"),
            "Circuit state per provider (0 healthy, 1 degraded, 2 open)",
        ),
        &["provider"],
    )
    .map_err(init_err)?;
    registry
        .register(Box::new(circuit_state.clone()))
        .map_err(reg_err)?;

    Ok(Metrics {
        registry,
        requests_total,
        attempts_total,
        attempt_duration,
        circuit_state,
    })
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`DispatchError::Other`] if metric construction or registry
/// registration fails.
pub fn init_metrics() -> Result<(), DispatchError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let built = build_metrics("dispatch")?;
    // Racing initialisers build identical descriptors; the first one wins.
    let _ = METRICS.set(built);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

impl Metrics {
    fn record_attempt(&self, provider: &str, result: &str, latency: Duration) {
        if let Ok(c) = self
            .attempts_total
            .get_metric_with_label_values(&[provider, result])
        {
            c.inc();
        }
        if let Ok(h) = self.attempt_duration.get_metric_with_label_values(&[provider]) {
            h.observe(latency.as_secs_f64());
        }
    }

    fn record_request(&self, outcome: &str) {
        if let Ok(c) = self.requests_total.get_metric_with_label_values(&[outcome]) {
            c.inc();
        }
    }

    fn set_circuit_state(&self, provider: &str, state: i64) {
        if let Ok(g) = self.circuit_state.get_metric_with_label_values(&[provider]) {
            g.set(state);
        }
    }
}

/// Count one attempt and observe its latency.
///
/// `result` is `"ok"` or a failure-kind label. No-op before [`init_metrics`].
pub fn record_attempt(provider: &str, result: &str, latency: Duration) {
    if let Some(m) = metrics() {
        m.record_attempt(provider, result, latency);
    }
}

/// Count one finished request (`success`, `exhausted` or `cancelled`).
pub fn record_request(outcome: &str) {
    if let Some(m) = metrics() {
        m.record_request(outcome);
    }
}

/// Publish a provider's circuit state.
pub fn set_circuit_state(provider: &str, state: i64) {
    if let Some(m) = metrics() {
        m.set_circuit_state(provider, state);
    }
}

/// Encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
pub fn gather() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    encode(&m.registry)
}

fn encode(registry: &Registry) -> String {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Attempt counters keyed by `"provider:result"`.
///
/// Empty if metrics have not been initialised.
pub fn attempt_counts() -> BTreeMap<String, u64> {
    metrics().map_or_else(BTreeMap::new, |m| counts_of(&m.attempts_total))
}

fn counts_of(vec: &CounterVec) -> BTreeMap<String, u64> {
    let mut out = BTreeMap::new();
    for family in vec.collect() {
        for metric in family.get_metric() {
            let label = |name: &str| {
                metric
                    .get_label()
                    .iter()
                    .find(|l| l.get_name() == name)
                    .map_or("unknown", |l| l.get_value())
                    .to_string()
            };
            let key = format!("{}:{}", label("provider"), label("result"));
            out.insert(key, metric.get_counter().get_value() as u64);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // The global OnceLock cannot be reset between tests, so exact-value
    // checks run against a local bundle.
    fn local() -> Metrics {
        build_metrics("t").expect("test: local metrics")
    }

    #[test]
    fn test_init_metrics_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok(), "second call must be a no-op");
    }

    #[test]
    fn test_record_attempt_counts_by_provider_and_result() {
        let m = local();
        m.record_attempt("a", "ok", Duration::from_millis(10));
        m.record_attempt("a", "ok", Duration::from_millis(12));
        m.record_attempt("a", "timeout", Duration::from_millis(50));

        let counts = counts_of(&m.attempts_total);
        assert_eq!(counts.get("a:ok"), Some(&2));
        assert_eq!(counts.get("a:timeout"), Some(&1));
    }

    #[test]
    fn test_circuit_state_gauge_overwrites() {
        let m = local();
        m.set_circuit_state("a", 2);
        m.set_circuit_state("a", 0);
        let g = m
            .circuit_state
            .get_metric_with_label_values(&["a"])
            .expect("test: gauge");
        assert_eq!(g.get(), 0);
    }

    #[test]
    fn test_encode_contains_metric_names() {
        let m = local();
        m.record_request("success");
        m.record_attempt("b", "ok", Duration::from_millis(1));
        let text = encode(&m.registry);
        assert!(text.contains("t_requests_total"));
        assert!(text.contains("t_attempts_total"));
        assert!(text.contains("t_attempt_duration_seconds"));
    }

    #[test]
    fn test_helpers_do_not_panic_without_labels_seen() {
        record_attempt("never-seen", "ok", Duration::ZERO);
        record_request("success");
        set_circuit_state("never-seen", 1);
        let _ = gather();
    }
}
