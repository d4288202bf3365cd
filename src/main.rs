//! # provider-dispatch CLI
//!
//! Submits prompts through the dispatcher and reports provider health.
//!
//! ## Usage
//!
//! ```bash
//! # Built-in demo config: an OpenAI provider falling back to a local echo
//! cargo run -- --prompt "What is the capital of France?"
//!
//! # Ten requests against a config file, then the health report
//! cargo run -- --config dispatch.toml --prompt "hello" --requests 10 --health
//!
//! # Print the config JSON schema
//! cargo run -- --schema
//! ```
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json`: structured JSON output (overrides the config file)
//! - `RUST_LOG=info`: log level filter
//! - `OPENAI_API_KEY`, `ANTHROPIC_API_KEY`, `GEMINI_API_KEY`: enable HTTP backends

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_provider_dispatch::config::{self, loader, watcher::ConfigWatcher, DispatchConfig};
use tokio_provider_dispatch::{
    init_tracing_with_default, metrics, BackendInvoker, Constraints, DispatchError,
    DispatchOutcome, Dispatcher, RequestEnvelope,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

const DEMO_CONFIG: &str = r#"
[dispatch]
name = "demo"

[health]
cooldown_ms = 5000

[[providers]]
id = "openai"
priority = 1
backend = "openai"
model = "gpt-4o-mini"
timeout_ms = 10000

[[providers]]
id = "local-echo"
priority = 2
backend = "echo"
timeout_ms = 1000
"#;

/// Parsed CLI arguments.
struct Args {
    /// Config file; `None` uses the built-in demo config.
    config: Option<PathBuf>,
    /// Prompt to submit.
    prompt: Option<String>,
    /// Times to submit the prompt.
    requests: usize,
    /// Per-request timeout override.
    timeout_ms: Option<u64>,
    /// Print the health snapshot at the end.
    health: bool,
    /// Print Prometheus metrics at the end.
    metrics: bool,
    /// Reload the config file while running.
    watch: bool,
    /// Print the JSON schema and exit.
    schema: bool,
}

/// Parse command-line arguments manually (no external arg parser dependency).
fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        config: None,
        prompt: None,
        requests: 1,
        timeout_ms: None,
        health: false,
        metrics: false,
        watch: false,
        schema: false,
    };

    let mut i = 1;
    while i < args.len() {
        let value = |i: usize, flag: &str| -> Result<String, String> {
            args.get(i)
                .cloned()
                .ok_or_else(|| format!("{flag} requires a value"))
        };
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                parsed.config = Some(PathBuf::from(value(i, "--config")?));
            }
            "--prompt" | "-p" => {
                i += 1;
                parsed.prompt = Some(value(i, "--prompt")?);
            }
            "--requests" | "-n" => {
                i += 1;
                let raw = value(i, "--requests")?;
                parsed.requests = raw
                    .parse()
                    .map_err(|_| format!("invalid request count: {raw}"))?;
            }
            "--timeout-ms" => {
                i += 1;
                let raw = value(i, "--timeout-ms")?;
                parsed.timeout_ms = Some(
                    raw.parse()
                        .map_err(|_| format!("invalid timeout: {raw}"))?,
                );
            }
            "--health" => parsed.health = true,
            "--metrics" => parsed.metrics = true,
            "--watch" => parsed.watch = true,
            "--schema" => parsed.schema = true,
            "--help" | "-h" => return Err(usage()),
            other => return Err(format!("unknown argument: {other}\n{}", usage())),
        }
        i += 1;
    }

    if parsed.watch && parsed.config.is_none() {
        return Err("--watch requires --config".to_string());
    }
    Ok(parsed)
}

fn usage() -> String {
    [
        "Usage: provider-dispatch [OPTIONS]",
        "",
        "Options:",
        "  --config, -c <FILE>    Dispatch config TOML (default: built-in demo)",
        "  --prompt, -p <TEXT>    Prompt to submit",
        "  --requests, -n <N>     Submit the prompt N times (default: 1)",
        "  --timeout-ms <MS>      Per-attempt timeout override",
        "  --health               Print the provider health report as JSON",
        "  --metrics              Print Prometheus metrics",
        "  --watch                Hot-reload the config file while running",
        "  --schema               Print the config JSON schema and exit",
        "  --help, -h             Show this help message",
    ]
    .join("\n")
}

fn load_config(path: Option<&PathBuf>) -> Result<DispatchConfig, DispatchError> {
    match path {
        Some(path) => Ok(loader::load_from_file(path)?),
        None => Ok(loader::load_from_str(DEMO_CONFIG, "<built-in demo>")?),
    }
}

fn print_outcome(index: usize, result: &Result<DispatchOutcome, DispatchError>) {
    match result {
        Ok(DispatchOutcome::Success {
            provider_id,
            reply,
            latency,
            attempts,
        }) => {
            println!(
                "[{index}] {provider_id} ({} ms, {} failed before): {}",
                latency.as_millis(),
                attempts.len(),
                reply.text
            );
            for a in attempts {
                println!("      {} -> {} ({})", a.provider_id, a.failure, a.message);
            }
        }
        Ok(DispatchOutcome::Exhausted { attempts }) => {
            println!("[{index}] exhausted after {} provider(s)", attempts.len());
            for a in attempts {
                println!(
                    "      {} -> {} x{} ({})",
                    a.provider_id, a.failure, a.tries, a.message
                );
            }
        }
        Err(e) => println!("[{index}] error: {e}"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    if args.schema {
        println!("{}", config::export_schema()?);
        return Ok(());
    }

    let cfg = load_config(args.config.as_ref())?;

    let _ = init_tracing_with_default(cfg.observability.log_format.as_env_value());
    metrics::init_metrics()?;

    let dispatcher = Arc::new(Dispatcher::from_config(
        &cfg,
        Arc::new(BackendInvoker::from_env()),
    )?);
    info!(
        name = %cfg.dispatch.name,
        providers = dispatcher.registry().len(),
        "provider-dispatch started"
    );

    let _watcher = match (&args.config, args.watch) {
        (Some(path), true) => {
            let (watcher, _rx) = ConfigWatcher::new(path.clone())?;
            let _applier = watcher.apply_to(Arc::clone(&dispatcher));
            Some(watcher)
        }
        _ => None,
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    if let Some(prompt) = &args.prompt {
        let mut constraints = Constraints::default();
        if let Some(ms) = args.timeout_ms {
            constraints = constraints.with_timeout_override(Duration::from_millis(ms));
        }
        for index in 0..args.requests {
            let envelope =
                RequestEnvelope::new(prompt.as_str()).with_constraints(constraints.clone());
            let result = dispatcher.submit_with_cancel(envelope, cancel.clone()).await;
            print_outcome(index, &result);
            if cancel.is_cancelled() {
                break;
            }
        }
    } else if !args.health && !args.metrics {
        eprintln!("nothing to do: pass --prompt, --health or --metrics\n{}", usage());
    }

    if args.health {
        println!("{}", serde_json::to_string_pretty(&dispatcher.health_snapshot())?);
    }
    if args.metrics {
        print!("{}", metrics::gather());
    }

    Ok(())
}
