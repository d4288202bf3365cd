//! Dispatcher façade
//!
//! ## Responsibility
//! Accept one request, walk the candidates produced by the dispatch policy
//! one at a time, invoke each under a hard timeout, report every outcome to
//! the health tracker before picking the next candidate, and return the first
//! usable reply or the full failure trail.
//!
//! ## Per-request state machine
//! ```text
//! START → TRY_NEXT → SUCCESS
//!             ↓
//!       RECORD_FAILURE → TRY_NEXT (retry same provider or next candidate)
//!             ↓
//!     NO_MORE_CANDIDATES → EXHAUSTED
//! ```
//!
//! ## Guarantees
//! - Per-attempt failures never escape as errors; they become [`AttemptRecord`]s.
//! - The invoker's future is dropped once its timeout elapses or the caller
//!   cancels; the invoker's own timeout handling is not trusted.
//! - Cancelled attempts are recorded as `Cancelled`, never as strikes.
//! - No provider appears twice in one request's trail.
//!
//! ## NOT Responsible For
//! - Ranking (that belongs to `policy`)
//! - Circuit transitions (that belongs to `health`)

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::health::{AttemptOutcome, HealthState, HealthTracker, HealthView, ProbeGuard};
use crate::invoker::ProviderInvoker;
use crate::metrics;
use crate::policy::{AttemptDecision, Candidate, DispatchPolicy};
use crate::provider::{FailureKind, Payload, ProviderDescriptor, ProviderFailure, ProviderReply};
use crate::registry::ProviderRegistry;
use crate::DispatchError;

/// Caller-supplied predicate deciding whether a reply is usable.
pub type Validator = Arc<dyn Fn(&ProviderReply) -> bool + Send + Sync>;

/// Optional per-request limits.
#[derive(Clone, Default)]
pub struct Constraints {
    /// Upper bound on every attempt's timeout for this request.
    pub timeout_override: Option<Duration>,
    /// Upper bound on distinct providers tried for this request.
    pub max_attempts: Option<usize>,
    validator: Option<Validator>,
}

impl fmt::Debug for Constraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Constraints")
            .field("timeout_override", &self.timeout_override)
            .field("max_attempts", &self.max_attempts)
            .field("validator", &self.validator.as_ref().map(|_| "custom"))
            .finish()
    }
}

impl Constraints {
    /// Cap every attempt's timeout.
    pub fn with_timeout_override(mut self, timeout: Duration) -> Self {
        self.timeout_override = Some(timeout);
        self
    }

    /// Cap the number of providers tried. `0` is treated as `1`.
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Replace the default "non-empty text" validity check.
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&ProviderReply) -> bool + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Whether `reply` passes the validity check.
    pub fn is_usable(&self, reply: &ProviderReply) -> bool {
        match &self.validator {
            Some(validator) => validator(reply),
            None => !reply.text.trim().is_empty(),
        }
    }
}

/// One request as submitted by a caller.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    /// Correlation id carried through logs.
    pub request_id: Uuid,
    /// Opaque data handed to the provider.
    pub payload: Payload,
    /// Optional limits.
    pub constraints: Constraints,
}

impl RequestEnvelope {
    /// Envelope with a fresh request id and no constraints.
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            payload: payload.into(),
            constraints: Constraints::default(),
        }
    }

    /// Attach constraints.
    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }
}

/// One provider's contribution to a request's failure trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    /// Provider that was tried.
    pub provider_id: String,
    /// Classification of its final try.
    pub failure: FailureKind,
    /// Tries made against this provider in this request.
    pub tries: u32,
    /// Wall time of its final try.
    pub latency: Duration,
    /// Detail of its final failure.
    pub message: String,
}

/// Terminal result of [`Dispatcher::submit`].
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// A provider produced a usable reply.
    Success {
        /// Provider that answered.
        provider_id: String,
        /// Its reply.
        reply: ProviderReply,
        /// Wall time of the successful try.
        latency: Duration,
        /// Providers that failed before it, in order.
        attempts: Vec<AttemptRecord>,
    },
    /// Every eligible candidate failed, or none was eligible.
    Exhausted {
        /// Every provider tried, in order.
        attempts: Vec<AttemptRecord>,
    },
}

impl DispatchOutcome {
    /// `true` for [`DispatchOutcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The failure trail, for either variant.
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            Self::Success { attempts, .. } | Self::Exhausted { attempts } => attempts,
        }
    }

    /// Provider that answered, if any.
    pub fn provider_id(&self) -> Option<&str> {
        match self {
            Self::Success { provider_id, .. } => Some(provider_id),
            Self::Exhausted { .. } => None,
        }
    }

    /// Convert to a `Result` so callers can use `?`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Exhausted`] carrying the trail.
    pub fn into_result(self) -> Result<ProviderReply, DispatchError> {
        match self {
            Self::Success { reply, .. } => Ok(reply),
            Self::Exhausted { attempts } => Err(DispatchError::Exhausted { attempts }),
        }
    }
}

/// Public entry point: submit requests, read health.
///
/// Safe to share across tasks (`Arc<Dispatcher>`); each `submit` runs its own
/// sequential loop.
///
/// ## Example
///
/// ```no_run
/// use std::sync::Arc;
/// use tokio_provider_dispatch::{
///     Dispatcher, EchoInvoker, HealthConfig, HealthTracker, ProviderDescriptor,
///     ProviderRegistry, RequestEnvelope,
/// };
///
/// # async fn example() -> Result<(), tokio_provider_dispatch::DispatchError> {
/// let registry = Arc::new(ProviderRegistry::with_providers([
///     ProviderDescriptor::new("primary", 1),
///     ProviderDescriptor::new("backup", 2),
/// ])?);
/// let health = Arc::new(HealthTracker::new(HealthConfig::default()));
/// let dispatcher = Dispatcher::new(registry, health, Arc::new(EchoInvoker::new()));
///
/// let reply = dispatcher.submit(RequestEnvelope::new("hello")).await?.into_result()?;
/// println!("{}", reply.text);
/// # Ok(()) }
/// ```
pub struct Dispatcher {
    registry: Arc<ProviderRegistry>,
    health: Arc<HealthTracker>,
    policy: RwLock<DispatchPolicy>,
    invoker: Arc<dyn ProviderInvoker>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("providers", &self.registry.len())
            .field("policy", &*self.policy.read())
            .finish()
    }
}

/// Why a single provider's loop ended without success.
enum ProviderEnd {
    Failed(AttemptRecord),
    Cancelled(AttemptRecord),
}

impl Dispatcher {
    /// Build a dispatcher with the default policy.
    pub fn new(
        registry: Arc<ProviderRegistry>,
        health: Arc<HealthTracker>,
        invoker: Arc<dyn ProviderInvoker>,
    ) -> Self {
        Self {
            registry,
            health,
            policy: RwLock::new(DispatchPolicy::default()),
            invoker,
        }
    }

    /// Replace the policy at construction time.
    pub fn with_policy(self, policy: DispatchPolicy) -> Self {
        *self.policy.write() = policy;
        self
    }

    /// Build registry, tracker and policy from a validated config.
    ///
    /// # Errors
    ///
    /// [`DispatchError::ConfigError`] if the config fails validation,
    /// [`DispatchError::DuplicateProvider`] if ids repeat.
    pub fn from_config(
        config: &DispatchConfig,
        invoker: Arc<dyn ProviderInvoker>,
    ) -> Result<Self, DispatchError> {
        config.check()?;
        let registry = Arc::new(ProviderRegistry::with_providers(config.provider_descriptors())?);
        let health = Arc::new(HealthTracker::new(config.health_config()));
        Ok(Self::new(registry, health, invoker)
            .with_policy(DispatchPolicy::new(config.policy_config())))
    }

    /// The provider registry.
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// The health tracker.
    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    /// Copy of the current policy.
    pub fn policy(&self) -> DispatchPolicy {
        self.policy.read().clone()
    }

    /// Swap in a reloaded configuration.
    ///
    /// The registry is replaced in one step, health and policy tunables are
    /// replaced, existing health records are kept. Requests already in flight
    /// finish against the snapshot they started with. Nothing is applied if
    /// the config is rejected.
    ///
    /// # Errors
    ///
    /// [`DispatchError::ConfigError`] or [`DispatchError::DuplicateProvider`].
    pub fn apply_config(&self, config: &DispatchConfig) -> Result<(), DispatchError> {
        config.check()?;
        self.registry.replace_all(config.provider_descriptors())?;
        self.health.set_config(config.health_config());
        *self.policy.write() = DispatchPolicy::new(config.policy_config());
        info!(
            name = %config.dispatch.name,
            providers = self.registry.len(),
            "dispatcher: configuration applied"
        );
        Ok(())
    }

    /// Health view of every registered provider.
    ///
    /// Two calls with no intervening `submit` return identical data.
    pub fn health_snapshot(&self) -> BTreeMap<String, HealthView> {
        let providers = self.registry.list();
        self.health.views(providers.iter().map(|d| d.id.as_str()))
    }

    /// Dispatch one request.
    ///
    /// # Errors
    ///
    /// [`DispatchError::NoProvidersConfigured`] if the registry is empty; no
    /// provider is called. Exhaustion is reported as
    /// `Ok(DispatchOutcome::Exhausted)`.
    pub async fn submit(&self, envelope: RequestEnvelope) -> Result<DispatchOutcome, DispatchError> {
        self.submit_with_cancel(envelope, CancellationToken::new())
            .await
    }

    /// Dispatch one request, abandoning it when `cancel` fires.
    ///
    /// Dropping the returned future has the same effect on provider health
    /// as cancelling: an outstanding probe slot is released and no strike is
    /// recorded.
    ///
    /// # Errors
    ///
    /// [`DispatchError::NoProvidersConfigured`] if the registry is empty,
    /// [`DispatchError::Cancelled`] with the trail so far if `cancel` fired.
    pub async fn submit_with_cancel(
        &self,
        envelope: RequestEnvelope,
        cancel: CancellationToken,
    ) -> Result<DispatchOutcome, DispatchError> {
        let providers = self.registry.list();
        if providers.is_empty() {
            warn!(request_id = %envelope.request_id, "dispatcher: no providers configured");
            return Err(DispatchError::NoProvidersConfigured);
        }

        let policy = self.policy();
        let budget = policy.attempt_budget(providers.len(), envelope.constraints.max_attempts);
        let mut tried: HashSet<String> = HashSet::new();
        let mut trail: Vec<AttemptRecord> = Vec::new();

        debug!(
            request_id = %envelope.request_id,
            providers = providers.len(),
            budget,
            "dispatcher: request started"
        );

        while tried.len() < budget {
            if cancel.is_cancelled() {
                return Err(self.cancelled(&envelope, trail));
            }

            let candidates = policy.next_candidates(&providers, &self.health.snapshot(), &tried);
            let Some((candidate, probe)) = self.claim(candidates) else {
                break;
            };
            tried.insert(candidate.descriptor.id.clone());

            match self
                .run_provider(&policy, &envelope, &candidate.descriptor, probe, &cancel)
                .await
            {
                Ok((reply, latency)) => {
                    metrics::record_request("success");
                    info!(
                        request_id = %envelope.request_id,
                        provider = %candidate.descriptor.id,
                        latency_ms = latency.as_millis() as u64,
                        failed_before = trail.len(),
                        "dispatcher: request succeeded"
                    );
                    return Ok(DispatchOutcome::Success {
                        provider_id: candidate.descriptor.id,
                        reply,
                        latency,
                        attempts: trail,
                    });
                }
                Err(ProviderEnd::Failed(record)) => trail.push(record),
                Err(ProviderEnd::Cancelled(record)) => {
                    trail.push(record);
                    return Err(self.cancelled(&envelope, trail));
                }
            }
        }

        metrics::record_request("exhausted");
        warn!(
            request_id = %envelope.request_id,
            attempts = trail.len(),
            "dispatcher: all candidates exhausted"
        );
        Ok(DispatchOutcome::Exhausted { attempts: trail })
    }

    fn cancelled(&self, envelope: &RequestEnvelope, attempts: Vec<AttemptRecord>) -> DispatchError {
        metrics::record_request("cancelled");
        info!(
            request_id = %envelope.request_id,
            attempts = attempts.len(),
            "dispatcher: request cancelled by caller"
        );
        DispatchError::Cancelled { attempts }
    }

    /// First candidate that can be taken right now. Probe candidates whose
    /// slot was taken by a concurrent request are skipped.
    fn claim(&self, candidates: Vec<Candidate>) -> Option<(Candidate, Option<ProbeGuard>)> {
        for candidate in candidates {
            if !candidate.probe {
                return Some((candidate, None));
            }
            match self.health.try_claim_probe(&candidate.descriptor.id) {
                Some(guard) => return Some((candidate, Some(guard))),
                None => debug!(
                    provider = %candidate.descriptor.id,
                    "dispatcher: probe slot already taken, skipping"
                ),
            }
        }
        None
    }

    /// All tries against one provider.
    async fn run_provider(
        &self,
        policy: &DispatchPolicy,
        envelope: &RequestEnvelope,
        descriptor: &ProviderDescriptor,
        mut probe: Option<ProbeGuard>,
        cancel: &CancellationToken,
    ) -> Result<(ProviderReply, Duration), ProviderEnd> {
        let timeout = policy.attempt_timeout(descriptor, envelope.constraints.timeout_override);
        let mut tries: u32 = 0;

        loop {
            tries += 1;
            debug!(
                request_id = %envelope.request_id,
                provider = %descriptor.id,
                try_number = tries,
                probe = probe.is_some(),
                timeout_ms = timeout.as_millis() as u64,
                "dispatcher: attempt started"
            );

            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                r = tokio::time::timeout(
                    timeout,
                    self.invoker.invoke(descriptor, &envelope.payload, timeout),
                ) => Some(r),
            };
            let latency = started.elapsed();

            let attempt = match result {
                None => {
                    self.record(descriptor, &mut probe, AttemptOutcome::failure(FailureKind::Cancelled, latency));
                    metrics::record_attempt(&descriptor.id, FailureKind::Cancelled.as_str(), latency);
                    return Err(ProviderEnd::Cancelled(AttemptRecord {
                        provider_id: descriptor.id.clone(),
                        failure: FailureKind::Cancelled,
                        tries,
                        latency,
                        message: "cancelled by caller".to_string(),
                    }));
                }
                Some(Err(_elapsed)) => Err(ProviderFailure::new(
                    FailureKind::Timeout,
                    format!("no reply within {} ms", timeout.as_millis()),
                )),
                Some(Ok(reply)) => {
                    reply.and_then(|r| check_reply(descriptor, &envelope.constraints, r))
                }
            };

            let failure = match attempt {
                Ok(reply) => {
                    self.record(descriptor, &mut probe, AttemptOutcome::success(latency));
                    metrics::record_attempt(&descriptor.id, "ok", latency);
                    return Ok((reply, latency));
                }
                Err(failure) => failure,
            };

            let state = self.record(
                descriptor,
                &mut probe,
                AttemptOutcome::failure(failure.kind, latency),
            );
            metrics::record_attempt(&descriptor.id, failure.kind.as_str(), latency);
            warn!(
                request_id = %envelope.request_id,
                provider = %descriptor.id,
                failure = %failure.kind,
                try_number = tries,
                latency_ms = latency.as_millis() as u64,
                error = %failure.message,
                "dispatcher: attempt failed"
            );

            let record = AttemptRecord {
                provider_id: descriptor.id.clone(),
                failure: failure.kind,
                tries,
                latency,
                message: failure.message,
            };

            match policy.after_failure(record.failure, tries, state) {
                AttemptDecision::NextProvider => return Err(ProviderEnd::Failed(record)),
                AttemptDecision::RetrySameProvider { delay } => {
                    debug!(
                        provider = %descriptor.id,
                        delay_ms = delay.as_millis() as u64,
                        "dispatcher: retrying same provider"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return Err(ProviderEnd::Cancelled(AttemptRecord {
                                failure: FailureKind::Cancelled,
                                message: "cancelled by caller during retry backoff".to_string(),
                                ..record
                            }));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Report one try. A held probe guard is settled by the first report.
    fn record(
        &self,
        descriptor: &ProviderDescriptor,
        probe: &mut Option<ProbeGuard>,
        outcome: AttemptOutcome,
    ) -> HealthState {
        match probe.take() {
            Some(guard) => self.health.record_probe(guard, outcome),
            None => self.health.record(&descriptor.id, outcome),
        }
    }
}

/// Apply the token ceiling and the validity check to a raw reply.
fn check_reply(
    descriptor: &ProviderDescriptor,
    constraints: &Constraints,
    reply: ProviderReply,
) -> Result<ProviderReply, ProviderFailure> {
    if let Some(tokens) = reply.tokens {
        if tokens > descriptor.max_tokens_limit {
            return Err(ProviderFailure::permanent(format!(
                "token limit exceeded: {tokens} > {}",
                descriptor.max_tokens_limit
            )));
        }
    }
    if !constraints.is_usable(&reply) {
        return Err(ProviderFailure::transient("reply rejected by validity check"));
    }
    Ok(reply)
}
