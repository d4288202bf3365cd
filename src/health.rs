//! Health Tracker
//!
//! Rolling success/failure/latency bookkeeping per provider, plus the
//! circuit breaker that keeps known-bad backends out of candidate lists.
//!
//! ## States
//! - **Healthy**: last attempt succeeded (or none recorded yet)
//! - **Degraded**: some consecutive failures, still below the threshold
//! - **CircuitOpen**: `consecutive_failures >= failure_threshold`; excluded
//!   until `cooldown` has elapsed, then exactly one probe is let through
//!
//! ## Concurrency
//! Each provider's [`HealthRecord`] sits behind its own mutex, so updates
//! for one provider never block another and counters are never lost.
//! Ranking reads go through [`HealthSnapshot`], a cloned point-in-time view
//! that may already be stale when it is used.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::metrics;
use crate::provider::{FailureKind, ProviderDescriptor};

/// Tunables for the health tracker and circuit breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthConfig {
    /// Consecutive strikes that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit stays closed to traffic before a probe.
    pub cooldown: Duration,
    /// EWMA weight given to the newest latency sample.
    pub ewma_alpha: f64,
    /// Latency differences below this are treated as ties.
    pub latency_noise: Duration,
    /// Whether `RateLimited` counts toward `failure_threshold`.
    pub rate_limit_counts_as_strike: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            ewma_alpha: 0.3,
            latency_noise: Duration::from_millis(50),
            rate_limit_counts_as_strike: false,
        }
    }
}

/// Coarse health classification of one provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Normal operation.
    #[default]
    Healthy,
    /// Failing, but below the circuit threshold.
    Degraded,
    /// Excluded from dispatch until cooldown elapses.
    CircuitOpen,
}

impl HealthState {
    /// Numeric encoding for the circuit-state gauge.
    pub fn as_gauge(&self) -> i64 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::CircuitOpen => 2,
        }
    }
}

/// What happened on one attempt, as reported by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttemptOutcome {
    /// `true` if the attempt produced a usable reply.
    pub ok: bool,
    /// Wall time the attempt took.
    pub latency: Duration,
    /// Classification when `ok` is `false`.
    pub failure_kind: Option<FailureKind>,
}

impl AttemptOutcome {
    /// A usable reply.
    pub fn success(latency: Duration) -> Self {
        Self {
            ok: true,
            latency,
            failure_kind: None,
        }
    }

    /// A classified failure.
    pub fn failure(kind: FailureKind, latency: Duration) -> Self {
        Self {
            ok: false,
            latency,
            failure_kind: Some(kind),
        }
    }
}

/// Per-provider health bookkeeping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthRecord {
    /// Attempts that produced a usable reply.
    pub success_count: u64,
    /// Attempts that failed, cancellations excluded.
    pub failure_count: u64,
    /// Strikes since the last success.
    pub consecutive_failures: u32,
    /// Failures classified as `RateLimited`.
    pub rate_limited_count: u64,
    /// Attempts abandoned by the caller.
    pub cancelled_count: u64,
    /// Latency of the most recent completed attempt.
    pub last_latency: Option<Duration>,
    /// Exponentially weighted moving average of successful latencies.
    pub ewma_latency: Option<Duration>,
    /// Current classification.
    pub state: HealthState,
    /// Monotonic instant the circuit (re)opened.
    pub open_since: Option<Instant>,
    /// Wall-clock time the circuit (re)opened, for reporting.
    pub opened_at: Option<DateTime<Utc>>,
    /// A probe has been handed out and has not settled yet.
    pub probe_in_flight: bool,
}

/// Whether a provider may be tried right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// Normal candidate.
    Eligible,
    /// Circuit open and cooled down; may be tried as the single probe.
    Probe,
    /// Not to be tried.
    Excluded,
}

/// Ranking inputs for an eligible provider.
///
/// Scores are not ordered on their own: latencies closer than
/// `latency_noise` tie, which is not transitive. `DispatchPolicy` groups
/// candidates around the fastest member of each group instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderScore {
    /// EWMA latency; `None` until the first success.
    pub ewma_latency: Option<Duration>,
    /// Descriptor priority.
    pub priority: i32,
    /// Set when the candidate is a circuit probe.
    pub probe: bool,
}

impl ProviderScore {
    /// Latency used for ranking. Unknown latency ranks with the fastest.
    pub fn latency_key(&self) -> Duration {
        self.ewma_latency.unwrap_or(Duration::ZERO)
    }
}

impl HealthRecord {
    /// Eligibility at `now` under `config`.
    pub fn eligibility(&self, config: &HealthConfig, now: Instant) -> Eligibility {
        match self.state {
            HealthState::Healthy | HealthState::Degraded => Eligibility::Eligible,
            HealthState::CircuitOpen => {
                if self.probe_in_flight {
                    return Eligibility::Excluded;
                }
                match self.open_since {
                    Some(since) if now.saturating_duration_since(since) > config.cooldown => {
                        Eligibility::Probe
                    }
                    Some(_) => Eligibility::Excluded,
                    // Open without a timestamp only happens via manual edits; allow a probe.
                    None => Eligibility::Probe,
                }
            }
        }
    }

    /// Ranking key, or `None` when the provider is excluded.
    pub fn score(
        &self,
        descriptor: &ProviderDescriptor,
        config: &HealthConfig,
        now: Instant,
    ) -> Option<ProviderScore> {
        let probe = match self.eligibility(config, now) {
            Eligibility::Excluded => return None,
            Eligibility::Probe => true,
            Eligibility::Eligible => false,
        };
        Some(ProviderScore {
            ewma_latency: self.ewma_latency,
            priority: descriptor.priority,
            probe,
        })
    }

    fn update_ewma(&mut self, latency: Duration, alpha: f64) {
        let next = match self.ewma_latency {
            None => latency,
            Some(prev) => {
                let secs = alpha * latency.as_secs_f64() + (1.0 - alpha) * prev.as_secs_f64();
                Duration::from_secs_f64(secs.max(0.0))
            }
        };
        self.ewma_latency = Some(next);
    }

    fn open_circuit(&mut self, now: Instant) {
        self.state = HealthState::CircuitOpen;
        self.open_since = Some(now);
        self.opened_at = Some(Utc::now());
        self.probe_in_flight = false;
    }

    /// Fold one outcome into the record. `probe` marks the settled probe.
    fn apply(
        &mut self,
        provider_id: &str,
        outcome: &AttemptOutcome,
        probe: bool,
        config: &HealthConfig,
        now: Instant,
    ) {
        if outcome.ok {
            self.success_count += 1;
            self.consecutive_failures = 0;
            self.last_latency = Some(outcome.latency);
            self.update_ewma(outcome.latency, config.ewma_alpha);

            match self.state {
                HealthState::CircuitOpen if probe => {
                    self.state = HealthState::Healthy;
                    self.open_since = None;
                    self.opened_at = None;
                    self.probe_in_flight = false;
                    info!(provider = %provider_id, "health: probe succeeded, closing circuit");
                }
                // A straggler that started before the circuit opened does not close it.
                HealthState::CircuitOpen => {}
                _ => self.state = HealthState::Healthy,
            }
            return;
        }

        let kind = outcome.failure_kind.unwrap_or(FailureKind::TransientError);

        if kind == FailureKind::Cancelled {
            self.cancelled_count += 1;
            if probe {
                self.probe_in_flight = false;
            }
            debug!(provider = %provider_id, "health: cancelled attempt recorded without strike");
            return;
        }

        self.failure_count += 1;
        self.last_latency = Some(outcome.latency);
        if kind == FailureKind::RateLimited {
            self.rate_limited_count += 1;
        }

        let strike = kind != FailureKind::RateLimited || config.rate_limit_counts_as_strike;
        if !strike {
            if probe {
                // An inconclusive probe still uses up this cooldown cycle.
                self.open_circuit(now);
            }
            debug!(provider = %provider_id, "health: rate limit recorded without strike");
            return;
        }

        self.consecutive_failures += 1;

        match self.state {
            HealthState::CircuitOpen => {
                if probe {
                    self.open_circuit(now);
                    warn!(
                        provider = %provider_id,
                        failure = %kind,
                        "health: probe failed, reopening circuit"
                    );
                }
            }
            _ if self.consecutive_failures >= config.failure_threshold => {
                self.open_circuit(now);
                warn!(
                    provider = %provider_id,
                    consecutive_failures = self.consecutive_failures,
                    threshold = config.failure_threshold,
                    "health: opening circuit (threshold reached)"
                );
            }
            _ => {
                self.state = HealthState::Degraded;
            }
        }
    }
}

/// Serializable view of a [`HealthRecord`] for CLI and observability output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthView {
    /// Current classification.
    pub state: HealthState,
    /// Successful attempts.
    pub success_count: u64,
    /// Failed attempts.
    pub failure_count: u64,
    /// Strikes since the last success.
    pub consecutive_failures: u32,
    /// Rate-limited attempts.
    pub rate_limited_count: u64,
    /// Cancelled attempts.
    pub cancelled_count: u64,
    /// Most recent latency in milliseconds.
    pub last_latency_ms: Option<f64>,
    /// EWMA latency in milliseconds.
    pub ewma_latency_ms: Option<f64>,
    /// When the circuit last opened.
    pub opened_at: Option<DateTime<Utc>>,
    /// A probe is currently outstanding.
    pub probe_in_flight: bool,
}

impl From<&HealthRecord> for HealthView {
    fn from(r: &HealthRecord) -> Self {
        Self {
            state: r.state,
            success_count: r.success_count,
            failure_count: r.failure_count,
            consecutive_failures: r.consecutive_failures,
            rate_limited_count: r.rate_limited_count,
            cancelled_count: r.cancelled_count,
            last_latency_ms: r.last_latency.map(|d| d.as_secs_f64() * 1000.0),
            ewma_latency_ms: r.ewma_latency.map(|d| d.as_secs_f64() * 1000.0),
            opened_at: r.opened_at,
            probe_in_flight: r.probe_in_flight,
        }
    }
}

/// Point-in-time copy of every record, used for candidate ordering.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    records: HashMap<String, HealthRecord>,
    config: HealthConfig,
    taken_at: Instant,
}

impl HealthSnapshot {
    /// Build a snapshot from explicit parts.
    pub fn new(records: HashMap<String, HealthRecord>, config: HealthConfig, taken_at: Instant) -> Self {
        Self {
            records,
            config,
            taken_at,
        }
    }

    /// Record for `id`; a fresh default record if none exists yet.
    pub fn record(&self, id: &str) -> HealthRecord {
        self.records.get(id).cloned().unwrap_or_default()
    }

    /// Eligibility of `id` at snapshot time.
    pub fn eligibility(&self, id: &str) -> Eligibility {
        match self.records.get(id) {
            Some(r) => r.eligibility(&self.config, self.taken_at),
            None => Eligibility::Eligible,
        }
    }

    /// Ranking key for `descriptor`, or `None` if excluded.
    pub fn score(&self, descriptor: &ProviderDescriptor) -> Option<ProviderScore> {
        match self.records.get(&descriptor.id) {
            Some(r) => r.score(descriptor, &self.config, self.taken_at),
            None => HealthRecord::default().score(descriptor, &self.config, self.taken_at),
        }
    }

    /// Configuration in force when the snapshot was taken.
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }
}

/// Exclusive right to send the single probe for an open circuit.
///
/// Dropping an unsettled guard (e.g. because the caller abandoned the
/// request) releases the probe slot without recording a strike.
#[derive(Debug)]
pub struct ProbeGuard {
    provider_id: String,
    slot: Arc<Mutex<HealthRecord>>,
    armed: bool,
}

impl ProbeGuard {
    /// Provider this probe is for.
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        if self.armed {
            self.slot.lock().probe_in_flight = false;
            debug!(provider = %self.provider_id, "health: unsettled probe released");
        }
    }
}

/// Owns one [`HealthRecord`] per provider.
#[derive(Debug, Default)]
pub struct HealthTracker {
    records: DashMap<String, Arc<Mutex<HealthRecord>>>,
    config: RwLock<HealthConfig>,
}

impl HealthTracker {
    /// Create a tracker with the given tunables.
    pub fn new(config: HealthConfig) -> Self {
        Self {
            records: DashMap::new(),
            config: RwLock::new(config),
        }
    }

    /// Current tunables.
    pub fn config(&self) -> HealthConfig {
        self.config.read().clone()
    }

    /// Replace tunables. Existing records are kept.
    pub fn set_config(&self, config: HealthConfig) {
        *self.config.write() = config;
    }

    /// Record slot for `id`, created on first use.
    fn slot(&self, id: &str) -> Arc<Mutex<HealthRecord>> {
        if let Some(existing) = self.records.get(id) {
            return Arc::clone(existing.value());
        }
        Arc::clone(self.records.entry(id.to_string()).or_default().value())
    }

    /// Fold a non-probe outcome into `provider_id`'s record.
    ///
    /// Returns the state after the update.
    pub fn record(&self, provider_id: &str, outcome: AttemptOutcome) -> HealthState {
        self.apply(provider_id, &self.slot(provider_id), &outcome, false)
    }

    /// Settle a probe with its outcome, consuming the guard.
    pub fn record_probe(&self, mut guard: ProbeGuard, outcome: AttemptOutcome) -> HealthState {
        guard.armed = false;
        let slot = Arc::clone(&guard.slot);
        self.apply(&guard.provider_id, &slot, &outcome, true)
    }

    fn apply(
        &self,
        provider_id: &str,
        slot: &Arc<Mutex<HealthRecord>>,
        outcome: &AttemptOutcome,
        probe: bool,
    ) -> HealthState {
        let config = self.config();
        let state = {
            let mut record = slot.lock();
            record.apply(provider_id, outcome, probe, &config, Instant::now());
            record.state
        };
        metrics::set_circuit_state(provider_id, state.as_gauge());
        state
    }

    /// Try to take the single probe slot for an open, cooled-down circuit.
    ///
    /// Returns `None` if the circuit is not open, still cooling down, or a
    /// probe is already outstanding.
    pub fn try_claim_probe(&self, provider_id: &str) -> Option<ProbeGuard> {
        let config = self.config();
        let slot = self.slot(provider_id);
        {
            let mut record = slot.lock();
            if record.eligibility(&config, Instant::now()) != Eligibility::Probe {
                return None;
            }
            record.probe_in_flight = true;
        }
        info!(provider = %provider_id, "health: cooldown elapsed, probe claimed");
        Some(ProbeGuard {
            provider_id: provider_id.to_string(),
            slot,
            armed: true,
        })
    }

    /// Ranking key for `descriptor` right now, or `None` if excluded.
    ///
    /// Read-only: asking about an unknown provider does not create a record.
    pub fn score(&self, descriptor: &ProviderDescriptor) -> Option<ProviderScore> {
        let config = self.config();
        self.record_of(&descriptor.id)
            .score(descriptor, &config, Instant::now())
    }

    /// Current state of one provider.
    pub fn state(&self, provider_id: &str) -> HealthState {
        self.records
            .get(provider_id)
            .map(|slot| Arc::clone(slot.value()))
            .map(|slot| slot.lock().state)
            .unwrap_or_default()
    }

    /// Clone of one provider's record (default if never used).
    pub fn record_of(&self, provider_id: &str) -> HealthRecord {
        self.records
            .get(provider_id)
            .map(|slot| Arc::clone(slot.value()))
            .map(|slot| slot.lock().clone())
            .unwrap_or_default()
    }

    /// Point-in-time copy of every record.
    pub fn snapshot(&self) -> HealthSnapshot {
        let slots: Vec<(String, Arc<Mutex<HealthRecord>>)> = self
            .records
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        let records = slots
            .into_iter()
            .map(|(id, slot)| {
                let record = slot.lock().clone();
                (id, record)
            })
            .collect();
        HealthSnapshot::new(records, self.config(), Instant::now())
    }

    /// Serializable views for `ids`; providers never used report defaults.
    pub fn views<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> BTreeMap<String, HealthView> {
        ids.into_iter()
            .map(|id| (id.to_string(), HealthView::from(&self.record_of(id))))
            .collect()
    }

    /// Operator action: forget everything about one provider.
    pub fn reset(&self, provider_id: &str) {
        if let Some(slot) = self.records.get(provider_id).map(|s| Arc::clone(s.value())) {
            *slot.lock() = HealthRecord::default();
        }
        metrics::set_circuit_state(provider_id, HealthState::Healthy.as_gauge());
        info!(provider = %provider_id, "health: record reset by operator");
    }

    /// Operator action: forget everything about every provider.
    pub fn reset_all(&self) {
        let ids: Vec<String> = self.records.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.reset(&id);
        }
    }
}
