//! # Circuit Breaker Behavior Under 50 Rapid Requests
//!
//! Sends 50 rapid requests through the dispatcher with a primary provider
//! that fails for a stretch of calls and a fallback that always answers,
//! logging the primary's health after every batch of 10.
//!
//! Documents the exact request at which the circuit opens and the
//! Healthy → Degraded → CircuitOpen → (probe) → Healthy transitions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_provider_dispatch::health::{HealthConfig, HealthState, HealthTracker};
use tokio_provider_dispatch::{
    Dispatcher, Payload, ProviderDescriptor, ProviderFailure, ProviderInvoker, ProviderRegistry,
    ProviderReply, RequestEnvelope,
};

/// Primary fails on calls `fail_from..recover_at`; every other provider
/// always succeeds.
struct SimulatedProvider {
    primary_calls: AtomicUsize,
    fail_from: usize,
    recover_at: usize,
}

impl SimulatedProvider {
    fn new(fail_from: usize, recover_at: usize) -> Self {
        Self {
            primary_calls: AtomicUsize::new(0),
            fail_from,
            recover_at,
        }
    }
}

#[async_trait]
impl ProviderInvoker for SimulatedProvider {
    async fn invoke(
        &self,
        descriptor: &ProviderDescriptor,
        _payload: &Payload,
        _timeout: Duration,
    ) -> Result<ProviderReply, ProviderFailure> {
        if descriptor.id != "primary" {
            return Ok(ProviderReply::text("fallback response"));
        }
        let n = self.primary_calls.fetch_add(1, Ordering::SeqCst);
        if n >= self.fail_from && n < self.recover_at {
            Err(ProviderFailure::transient(format!(
                "simulated failure at call {n}"
            )))
        } else {
            Ok(ProviderReply::text(format!("primary response for call {n}")))
        }
    }
}

/// Result log entry for each request.
#[derive(Debug)]
struct RequestLog {
    index: usize,
    served_by: String,
    failed_before: usize,
    primary_state: HealthState,
    consecutive_failures: u32,
}

/// Primary's health after each batch of 10.
#[derive(Debug)]
struct BatchSnapshot {
    batch: usize,
    requests_completed: usize,
    primary_state: HealthState,
    successes: u64,
    failures: u64,
    elapsed_ms: u128,
}

#[tokio::test]
async fn test_50_rapid_requests_circuit_breaker_behavior() {
    // threshold=3 strikes, 200ms cooldown
    let health = Arc::new(HealthTracker::new(HealthConfig {
        failure_threshold: 3,
        cooldown: Duration::from_millis(200),
        ..HealthConfig::default()
    }));
    let registry = ProviderRegistry::with_providers([
        ProviderDescriptor::new("primary", 1),
        ProviderDescriptor::new("fallback", 2),
    ])
    .expect("test: registry");

    // Primary fails on calls 8, 9 and 10, then recovers.
    let sim = Arc::new(SimulatedProvider::new(8, 11));
    let dispatcher = Dispatcher::new(
        Arc::new(registry),
        Arc::clone(&health),
        Arc::clone(&sim) as Arc<dyn ProviderInvoker>,
    );

    let start = Instant::now();
    let mut logs: Vec<RequestLog> = Vec::with_capacity(50);
    let mut snapshots: Vec<BatchSnapshot> = Vec::new();
    let mut open_detected_at: Option<usize> = None;

    for i in 0..50 {
        let outcome = dispatcher
            .submit(RequestEnvelope::new(format!("request {i}")))
            .await
            .expect("test: submit");
        assert!(outcome.is_success(), "request {i} should be served");

        let record = health.record_of("primary");
        if record.state == HealthState::CircuitOpen && open_detected_at.is_none() {
            open_detected_at = Some(i);
        }

        logs.push(RequestLog {
            index: i,
            served_by: outcome.provider_id().unwrap_or("-").to_string(),
            failed_before: outcome.attempts().len(),
            primary_state: record.state,
            consecutive_failures: record.consecutive_failures,
        });

        if (i + 1) % 10 == 0 {
            snapshots.push(BatchSnapshot {
                batch: (i + 1) / 10,
                requests_completed: i + 1,
                primary_state: record.state,
                successes: record.success_count,
                failures: record.failure_count,
                elapsed_ms: start.elapsed().as_millis(),
            });
        }

        // After batch 3, wait out the cooldown so the next request probes.
        if i == 29 && health.state("primary") == HealthState::CircuitOpen {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    let total_elapsed = start.elapsed();

    // ─── Assertions ─────────────────────────────────────────────────────
    // Third consecutive failure (request 10) opens the circuit.
    assert_eq!(open_detected_at, Some(10));
    assert_eq!(logs[8].primary_state, HealthState::Degraded);

    // While open, primary is not contacted at all.
    for log in &logs[11..30] {
        assert_eq!(log.served_by, "fallback");
        assert_eq!(log.failed_before, 0, "request {} tried primary", log.index);
    }

    // Request 30 is the probe; it succeeds and closes the circuit.
    assert_eq!(logs[30].served_by, "primary");
    assert_eq!(logs[30].primary_state, HealthState::Healthy);
    for log in &logs[30..] {
        assert_eq!(log.served_by, "primary");
    }

    // 8 ok + 3 failed + 1 probe + 19 after recovery
    assert_eq!(sim.primary_calls.load(Ordering::SeqCst), 31);
    let fallback_served = logs.iter().filter(|l| l.served_by == "fallback").count();
    assert_eq!(fallback_served, 22);

    // ─── Print report ───────────────────────────────────────────────────
    println!("\n========================================================================");
    println!("CIRCUIT BREAKER BEHAVIOR REPORT - 50 RAPID REQUESTS");
    println!("========================================================================\n");

    println!("Configuration:");
    println!("  failure_threshold: 3");
    println!("  cooldown:          200ms");
    println!("  primary fails on calls 8..10 (3 failures injected)\n");

    println!("Circuit opened at: request #{}", open_detected_at.unwrap_or(0));
    println!(
        "Total elapsed: {:.1}ms\n",
        total_elapsed.as_secs_f64() * 1000.0
    );

    println!("─── Batch Snapshots (every 10 requests) ───\n");
    for snap in &snapshots {
        println!(
            "  Batch {}: requests={}, primary={:?}, successes={}, failures={}, elapsed={}ms",
            snap.batch,
            snap.requests_completed,
            snap.primary_state,
            snap.successes,
            snap.failures,
            snap.elapsed_ms,
        );
    }

    println!("\n─── Per-Request Detail ───\n");
    for log in &logs {
        let marker = match log.primary_state {
            HealthState::Healthy => "HEALTHY ",
            HealthState::Degraded => "DEGRADED",
            HealthState::CircuitOpen => "OPEN    ",
        };
        println!(
            "  [{:02}] {marker} | strikes={} | served_by={} after {} failure(s)",
            log.index, log.consecutive_failures, log.served_by, log.failed_before,
        );
    }
}
