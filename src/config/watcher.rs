//! Show file watcher for hot-reload support

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::AppConfig;

/// Quiet period before a changed file is re-read
const DEBOUNCE: Duration = Duration::from_millis(100);

/// Watches the show file and yields every successfully reloaded config
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<AppConfig>,
}

impl ConfigWatcher {
    /// Load `config_path` and start watching it
    pub async fn new(config_path: String) -> Result<(Self, AppConfig)> {
        let (tx, rx) = mpsc::channel(10);

        let initial_config = AppConfig::load(&config_path)
            .await
            .context("Failed to load initial config")?;

        // notify callbacks run on their own OS thread, outside the runtime
        let runtime_handle = tokio::runtime::Handle::current();
        let generation = Arc::new(AtomicU64::new(0));
        let path = config_path.clone();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    return;
                }
                debug!("Show file changed: {:?}", event.paths);

                // Only the last event of a burst reloads
                let my_generation = generation.fetch_add(1, Ordering::SeqCst) + 1;
                let generation = Arc::clone(&generation);
                let path = path.clone();
                let tx = tx.clone();

                runtime_handle.spawn(async move {
                    tokio::time::sleep(DEBOUNCE).await;
                    if generation.load(Ordering::SeqCst) != my_generation {
                        return;
                    }

                    match AppConfig::load(&path).await {
                        Ok(new_config) => {
                            info!("Show file reloaded");
                            if let Err(e) = tx.send(new_config).await {
                                error!("Failed to send config update: {}", e);
                            }
                        }
                        Err(e) => {
                            warn!("Failed to reload show file (keeping previous one): {:#}", e);
                        }
                    }
                });
            }
            Err(e) => {
                error!("Watch error: {}", e);
            }
        })?;

        watcher
            .watch(Path::new(&config_path), RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch config file: {}", config_path))?;

        info!("Watching show file: {}", config_path);

        Ok((
            Self {
                _watcher: watcher,
                rx,
            },
            initial_config,
        ))
    }

    /// Wait for the next valid config. `None` once the watcher is gone.
    pub async fn next_config(&mut self) -> Option<AppConfig> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reload_on_change() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("show.yaml");

        fs::write(
            &config_path,
            "mappings:\n  mic1: { device: sisyfos, device_id: mixer1, channel: 1 }\n",
        )?;

        let (mut watcher, config) = ConfigWatcher::new(config_path.to_string_lossy().to_string()).await?;
        assert_eq!(config.mappings["mic1"].channel, Some(1));

        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(
            &config_path,
            "mappings:\n  mic1: { device: sisyfos, device_id: mixer1, channel: 3 }\n",
        )?;

        let reloaded = tokio::time::timeout(Duration::from_secs(2), watcher.next_config()).await?;
        if let Some(reloaded) = reloaded {
            assert_eq!(reloaded.mappings["mic1"].channel, Some(3));
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_initial_file_fails() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("show.yaml");
        fs::write(&config_path, "conductor: { resolve_retry_ms: 0 }\n")?;

        let result = ConfigWatcher::new(config_path.to_string_lossy().to_string()).await;
        assert!(result.is_err());
        Ok(())
    }
}
