//! Config-driven construction, live reconfiguration, and metrics export.

use std::sync::Arc;
use std::time::Duration;

use tokio_provider_dispatch::config::loader::load_from_str;
use tokio_provider_dispatch::config::watcher::ConfigWatcher;
use tokio_provider_dispatch::{
    metrics, Backend, BackendInvoker, DispatchError, Dispatcher, EchoInvoker, FailureKind,
    HealthState, RequestEnvelope,
};

const BASE_TOML: &str = r#"
[dispatch]
name = "reload-test"

[health]
failure_threshold = 2
cooldown_ms = 60000

[[providers]]
id = "unwired"
priority = 1
backend = "external"

[[providers]]
id = "echo-a"
priority = 2
backend = "echo"

[[providers]]
id = "echo-b"
priority = 3
backend = "echo"
"#;

fn echo_router() -> Arc<BackendInvoker> {
    Arc::new(BackendInvoker::new().with(
        Backend::Echo,
        Arc::new(EchoInvoker::with_delay(Duration::from_millis(1))),
    ))
}

fn dispatcher_from(toml: &str) -> Dispatcher {
    let config = load_from_str(toml, "test.toml").expect("test: config");
    Dispatcher::from_config(&config, echo_router()).expect("test: dispatcher")
}

#[tokio::test]
async fn test_from_config_routes_by_backend() {
    let dispatcher = dispatcher_from(BASE_TOML);

    let outcome = dispatcher
        .submit(RequestEnvelope::new("ping"))
        .await
        .expect("test: submit");
    assert_eq!(outcome.provider_id(), Some("echo-a"));

    // No invoker for `external`: a permanent failure, then the next provider.
    let trail = outcome.attempts();
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].provider_id, "unwired");
    assert_eq!(trail[0].failure, FailureKind::PermanentError);
    assert!(trail[0].message.contains("external"));
}

#[tokio::test]
async fn test_configured_threshold_opens_circuit() {
    let dispatcher = dispatcher_from(BASE_TOML);
    for _ in 0..2 {
        dispatcher
            .submit(RequestEnvelope::new("ping"))
            .await
            .expect("test: submit");
    }
    assert_eq!(
        dispatcher.health().state("unwired"),
        HealthState::CircuitOpen
    );
}

#[tokio::test]
async fn test_apply_config_swaps_registry_and_keeps_history() {
    let dispatcher = dispatcher_from(BASE_TOML);
    dispatcher
        .submit(RequestEnvelope::new("ping"))
        .await
        .expect("test: submit");

    let reduced = load_from_str(
        r#"
[dispatch]
name = "reduced"
max_attempts = 1

[[providers]]
id = "echo-b"
priority = 1
backend = "echo"
"#,
        "reduced.toml",
    )
    .expect("test: reduced config");
    dispatcher.apply_config(&reduced).expect("test: apply");

    let snapshot = dispatcher.health_snapshot();
    assert_eq!(snapshot.keys().collect::<Vec<_>>(), vec!["echo-b"]);
    assert_eq!(dispatcher.policy().config().max_attempts, Some(1));

    let outcome = dispatcher
        .submit(RequestEnvelope::new("ping"))
        .await
        .expect("test: submit");
    assert_eq!(outcome.provider_id(), Some("echo-b"));

    // Records survive removal; re-adding a provider restores its history.
    dispatcher.apply_config(&load_from_str(BASE_TOML, "base.toml").expect("test: base"))
        .expect("test: re-apply");
    assert_eq!(dispatcher.health_snapshot()["echo-a"].success_count, 1);
}

#[tokio::test]
async fn test_apply_invalid_config_changes_nothing() {
    let dispatcher = dispatcher_from(BASE_TOML);
    let mut bad = load_from_str(BASE_TOML, "base.toml").expect("test: config");
    bad.health.failure_threshold = 0;
    bad.providers.truncate(1);

    let err = dispatcher.apply_config(&bad).expect_err("test: rejected");
    assert!(matches!(err, DispatchError::ConfigError(ref m) if m.contains("failure_threshold")));
    assert_eq!(dispatcher.registry().len(), 3);
    assert_eq!(dispatcher.health().config().failure_threshold, 2);
}

#[tokio::test]
async fn test_empty_provider_list_loads_but_cannot_dispatch() {
    let dispatcher = dispatcher_from("[dispatch]\nname = \"empty\"\n");
    let err = dispatcher
        .submit(RequestEnvelope::new("ping"))
        .await
        .expect_err("test: empty registry");
    assert!(matches!(err, DispatchError::NoProvidersConfigured));
}

#[tokio::test]
async fn test_watcher_applies_file_edits_to_dispatcher() {
    let dir = tempfile::tempdir().expect("test: tempdir");
    let path = dir.path().join("dispatch.toml");
    std::fs::write(&path, BASE_TOML).expect("test: write");

    let dispatcher = Arc::new(dispatcher_from(BASE_TOML));
    let (watcher, _rx) = ConfigWatcher::new(path.clone()).expect("test: watcher");
    let _applier = watcher.apply_to(Arc::clone(&dispatcher));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let edited = BASE_TOML.replace(
        "[[providers]]\nid = \"unwired\"\npriority = 1\nbackend = \"external\"\n",
        "",
    );
    std::fs::write(&path, edited).expect("test: rewrite");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while dispatcher.registry().len() != 2 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(dispatcher.registry().len(), 2);
    assert!(dispatcher.registry().get("unwired").is_err());
}

#[tokio::test]
async fn test_metrics_count_attempts_per_provider() {
    metrics::init_metrics().expect("test: metrics");
    let config = load_from_str(
        r#"
[[providers]]
id = "metrics-echo"
backend = "echo"
"#,
        "metrics.toml",
    )
    .expect("test: config");
    let dispatcher = Dispatcher::from_config(&config, echo_router()).expect("test: dispatcher");

    for _ in 0..3 {
        dispatcher
            .submit(RequestEnvelope::new("ping"))
            .await
            .expect("test: submit");
    }

    let counts = metrics::attempt_counts();
    assert_eq!(counts.get("metrics-echo:ok"), Some(&3));
    let text = metrics::gather();
    assert!(text.contains("dispatch_attempts_total"));
    assert!(text.contains("metrics-echo"));
}
