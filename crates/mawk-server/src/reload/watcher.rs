//! Configuration file watcher.

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

/// Turns file events on the config into reload signals.
pub struct ConfigWatcher {
    path: PathBuf,
    signal_tx: mpsc::Sender<()>,
}

impl ConfigWatcher {
    /// Returns the watcher and the receiver the orchestrator consumes.
    pub fn new(path: &Path) -> (Self, mpsc::Receiver<()>) {
        // one pending signal is enough; the orchestrator coalesces the rest
        let (signal_tx, signal_rx) = mpsc::channel(1);
        (
            Self {
                path: path.to_path_buf(),
                signal_tx,
            },
            signal_rx,
        )
    }

    /// Start watching. The returned watcher must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.signal_tx.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        tracing::debug!(paths = ?event.paths, "config file change detected");
                        let _ = tx.try_send(());
                    }
                }
                Err(e) => tracing::error!("Watch error: {:?}", e),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "config watcher started");
        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_modification_signals_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "routes: []\n").unwrap();

        let (watcher, mut rx) = ConfigWatcher::new(&path);
        let _guard = watcher.run().unwrap();

        std::fs::write(&path, "routes: []\n# changed\n").unwrap();
        let signal = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await;
        assert_eq!(signal.unwrap(), Some(()));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let (watcher, _rx) = ConfigWatcher::new(Path::new("/nonexistent/mawk/config.yaml"));
        assert!(watcher.run().is_err());
    }
}
