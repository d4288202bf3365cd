//! Configuration hot-reload watcher.
//!
//! ## Responsibility
//! Watch a TOML config file for changes and broadcast validated new configs
//! to subscribers. Invalid reloads are logged and rejected; the current
//! config remains unchanged.
//!
//! ## Guarantees
//! - Only validated configs are broadcast
//! - Invalid file edits are logged but do not disrupt dispatch
//! - Reloads wait until the file has been quiet for the debounce window, so
//!   multi-write editors produce one reload
//! - The background task stops when the watcher is dropped
//!
//! ## NOT Responsible For
//! - Initial config loading (that belongs to `loader`)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::loader::load_from_file;
use super::validation::ConfigError;
use super::DispatchConfig;
use crate::dispatcher::Dispatcher;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const QUIET_PERIOD: Duration = Duration::from_millis(300);

/// Watches a config file for changes and broadcasts validated updates.
pub struct ConfigWatcher {
    tx: broadcast::Sender<DispatchConfig>,
    shutdown: CancellationToken,
    // Dropping this stops file watching.
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching `path`.
    ///
    /// Returns the watcher and a receiver for config change notifications.
    /// The initial config is **not** broadcast; use `loader::load_from_file`
    /// for the initial load. Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// `ConfigError::Io` if the file watcher cannot be created or the parent
    /// directory cannot be watched.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// use tokio_provider_dispatch::config::watcher::ConfigWatcher;
    /// use std::path::PathBuf;
    ///
    /// let (watcher, mut rx) = ConfigWatcher::new(PathBuf::from("dispatch.toml"))?;
    /// tokio::spawn(async move {
    ///     while let Ok(config) = rx.recv().await {
    ///         println!("reloaded: {} providers", config.providers.len());
    ///     }
    /// });
    /// ```
    pub fn new(path: PathBuf) -> Result<(Self, broadcast::Receiver<DispatchConfig>), ConfigError> {
        let (tx, rx) = broadcast::channel(8);
        let (notify_tx, notify_rx) = std::sync::mpsc::channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = notify_tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| ConfigError::Io {
            file: path.display().to_string(),
            source: std::io::Error::other(e.to_string()),
        })?;

        // Watch the parent directory so atomic saves (write temp, rename over)
        // are seen.
        let watch_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| ConfigError::Io {
                file: watch_dir.display().to_string(),
                source: std::io::Error::other(e.to_string()),
            })?;

        let shutdown = CancellationToken::new();
        let task_shutdown = shutdown.clone();
        let task_tx = tx.clone();

        tokio::spawn(async move {
            let mut pending_since: Option<Instant> = None;

            loop {
                tokio::select! {
                    _ = task_shutdown.cancelled() => break,
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }

                while let Ok(event) = notify_rx.try_recv() {
                    let relevant = matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
                        && event.paths.iter().any(|p| p.file_name() == path.file_name());
                    if relevant {
                        pending_since = Some(Instant::now());
                    }
                }

                match pending_since {
                    Some(since) if since.elapsed() >= QUIET_PERIOD => pending_since = None,
                    _ => continue,
                }

                match load_from_file(&path) {
                    Ok(new_config) => {
                        tracing::info!(
                            path = %path.display(),
                            name = %new_config.dispatch.name,
                            providers = new_config.providers.len(),
                            "config reloaded successfully"
                        );
                        // No receivers is fine; the config was still validated.
                        let _ = task_tx.send(new_config);
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "config reload rejected, keeping current config"
                        );
                    }
                }
            }
            tracing::debug!("config watcher stopped");
        });

        Ok((
            Self {
                tx,
                shutdown,
                _watcher: watcher,
            },
            rx,
        ))
    }

    /// Subscribe to config change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchConfig> {
        self.tx.subscribe()
    }

    /// Apply every accepted reload to `dispatcher` until the watcher is dropped.
    pub fn apply_to(&self, dispatcher: Arc<Dispatcher>) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let config = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(config) => config,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "config applier lagged, waiting for next reload");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                if let Err(e) = dispatcher.apply_config(&config) {
                    tracing::warn!(error = %e, "reloaded config could not be applied");
                }
            }
        })
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID_TOML: &str = r#"
[dispatch]
name = "watcher-test"

[[providers]]
id = "a"
priority = 1
backend = "echo"
"#;

    #[tokio::test]
    async fn test_config_watcher_creation_succeeds() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("dispatch.toml");
        std::fs::write(&path, VALID_TOML).expect("test: write");

        assert!(ConfigWatcher::new(path).is_ok());
    }

    #[tokio::test]
    async fn test_config_watcher_subscribe_returns_receiver() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("dispatch.toml");
        std::fs::write(&path, VALID_TOML).expect("test: write");

        let (watcher, _rx) = ConfigWatcher::new(path).expect("test: create watcher");
        let _rx2 = watcher.subscribe();
    }

    #[tokio::test]
    async fn test_config_watcher_detects_file_change() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("dispatch.toml");
        std::fs::write(&path, VALID_TOML).expect("test: write");

        let (_watcher, mut rx) = ConfigWatcher::new(path.clone()).expect("test: create watcher");
        tokio::time::sleep(Duration::from_millis(200)).await;

        let updated = VALID_TOML.replace("watcher-test", "updated-name");
        let mut f = std::fs::File::create(&path).expect("test: open for write");
        f.write_all(updated.as_bytes()).expect("test: write");
        f.sync_all().expect("test: sync");
        drop(f);

        let result = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await;
        assert!(result.is_ok(), "should receive config update within 3s");
        let config = result.expect("test: timeout").expect("test: recv");
        assert_eq!(config.dispatch.name, "updated-name");
    }

    #[tokio::test]
    async fn test_config_watcher_rejects_invalid_reload() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("dispatch.toml");
        std::fs::write(&path, VALID_TOML).expect("test: write");

        let (_watcher, mut rx) = ConfigWatcher::new(path.clone()).expect("test: create watcher");
        tokio::time::sleep(Duration::from_millis(200)).await;

        std::fs::write(&path, "[health]\nfailure_threshold = 0\n").expect("test: write invalid");

        let result = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(result.is_err(), "should not broadcast invalid config");
    }

    #[tokio::test]
    async fn test_config_watcher_nonexistent_parent_returns_error() {
        let path = PathBuf::from("/definitely/nonexistent/dir/dispatch.toml");
        assert!(ConfigWatcher::new(path).is_err());
    }
}
