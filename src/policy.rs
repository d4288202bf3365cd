//! Dispatch Policy
//!
//! ## Responsibility
//! Turn a registry snapshot plus a health snapshot into the ordered list of
//! providers a request should try next, compute per-attempt timeouts and the
//! attempt budget, and decide what to do after a failed try.
//!
//! ## Guarantees
//! - Pure: every decision is a function of its arguments, no hidden state.
//! - Providers already tried in this request are never offered again.
//! - Open circuits are offered only once cooled down, flagged as probes.
//! - Ordering is deterministic. Candidates are grouped by EWMA latency, a
//!   group holding every provider within `latency_noise` of its fastest
//!   member; groups run fastest first, and inside a group priority then
//!   registry order decide.
//!
//! ## NOT Responsible For
//! - Claiming the probe slot (that belongs to `health`)
//! - Invoking providers or enforcing timeouts (that belongs to `dispatcher`)

use std::collections::HashSet;
use std::time::Duration;

use crate::health::{HealthSnapshot, HealthState, ProviderScore};
use crate::provider::{FailureKind, ProviderDescriptor};
use crate::retry::RetryPolicy;

/// Tunables for the dispatch policy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyConfig {
    /// Providers tried per request. `None` means every registered provider.
    pub max_attempts: Option<usize>,
    /// Same-provider retry schedule.
    pub retry: RetryPolicy,
}

/// One provider offered for the next attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// The provider.
    pub descriptor: ProviderDescriptor,
    /// Circuit is open and this would be its single probe.
    pub probe: bool,
    /// Ranking key that placed it here.
    pub score: ProviderScore,
}

/// What to do after a failed try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptDecision {
    /// Wait, then try the same provider again.
    RetrySameProvider {
        /// Backoff before the next try.
        delay: Duration,
    },
    /// Give up on this provider for the rest of the request.
    NextProvider,
}

/// Orders candidates and applies timeout, budget and retry rules.
#[derive(Debug, Clone, Default)]
pub struct DispatchPolicy {
    config: PolicyConfig,
}

impl DispatchPolicy {
    /// Create a policy.
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    /// Current tunables.
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Ordered candidates, excluding `already_tried` and excluded circuits.
    pub fn next_candidates(
        &self,
        registry: &[ProviderDescriptor],
        health: &HealthSnapshot,
        already_tried: &HashSet<String>,
    ) -> Vec<Candidate> {
        let mut ranked: Vec<(ProviderScore, usize, &ProviderDescriptor)> = registry
            .iter()
            .enumerate()
            .filter(|(_, d)| !already_tried.contains(&d.id))
            .filter_map(|(index, d)| health.score(d).map(|score| (score, index, d)))
            .collect();

        ranked.sort_by_key(|(score, index, _)| (score.latency_key(), *index));

        // Latency differences below the noise threshold are jitter: group
        // around each group's fastest member so priority decides inside it.
        let noise = health.config().latency_noise;
        let mut group = 0usize;
        let mut fastest: Option<Duration> = None;
        let mut grouped: Vec<(usize, ProviderScore, usize, &ProviderDescriptor)> =
            Vec::with_capacity(ranked.len());
        for (score, index, d) in ranked {
            let latency = score.latency_key();
            match fastest {
                Some(anchor) if latency.saturating_sub(anchor) < noise => {}
                Some(_) => {
                    group += 1;
                    fastest = Some(latency);
                }
                None => fastest = Some(latency),
            }
            grouped.push((group, score, index, d));
        }
        grouped.sort_by_key(|(group, score, index, _)| (*group, score.priority, *index));

        grouped
            .into_iter()
            .map(|(_, score, _, d)| Candidate {
                descriptor: d.clone(),
                probe: score.probe,
                score,
            })
            .collect()
    }

    /// `min(provider.timeout, timeout_override ?? provider.timeout)`.
    pub fn attempt_timeout(
        &self,
        descriptor: &ProviderDescriptor,
        timeout_override: Option<Duration>,
    ) -> Duration {
        timeout_override
            .map(|t| t.min(descriptor.timeout))
            .unwrap_or(descriptor.timeout)
    }

    /// Number of distinct providers a request may try.
    ///
    /// The caller's limit wins over the configured one; neither can exceed
    /// the number of registered providers. A limit of `0` is raised to `1`.
    pub fn attempt_budget(&self, registered: usize, request_limit: Option<usize>) -> usize {
        request_limit
            .or(self.config.max_attempts)
            .unwrap_or(registered)
            .max(1)
            .min(registered)
    }

    /// Decide what follows a failed try.
    ///
    /// `tries` is the number of tries made against this provider so far in
    /// this request; `state_after` is its health state after recording the
    /// failure.
    pub fn after_failure(
        &self,
        kind: FailureKind,
        tries: u32,
        state_after: HealthState,
    ) -> AttemptDecision {
        if state_after == HealthState::CircuitOpen {
            return AttemptDecision::NextProvider;
        }
        if self.config.retry.should_retry(kind, tries) {
            AttemptDecision::RetrySameProvider {
                delay: self.config.retry.delay_for(tries),
            }
        } else {
            AttemptDecision::NextProvider
        }
    }
}
