//! Configuration loading and hot reload.
//!
//! The [`Orchestrator`] owns the active [`Snapshot`] and the listeners
//! serving it. On a reload signal it drains every listener, loads the file
//! again and restarts. A failed load keeps the previous snapshot, persists
//! the error, and flags [`ReloadStatus`] invalid so responses carry the
//! `x-reload-error` header block until a later load succeeds.
//!
//! ## Module Structure
//!
//! - `mod.rs`: [`Snapshot`] and [`Orchestrator`]
//! - `status`: shared reload state
//! - `errors`: persisted error files and header lines
//! - `watcher`: file change notifications

mod errors;
mod status;
mod watcher;

use anyhow::Context as _;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub use errors::{reload_error_lines, ErrorKind, ErrorLog, ERRORS_PATH, RELOAD_ERROR_HEADER};
pub use status::{ReloadState, ReloadStatus};
pub use watcher::ConfigWatcher;

use crate::config::{Config, ConfigError};
use crate::expression::{builtin_functions, Context, FunctionTable, Template};
use crate::metrics;
use crate::plugin::PluginRegistry;
use crate::router::RouteTable;
use crate::server::{ListenerManager, ListenerPlan, ServeError, ServiceState};

/// A fully compiled configuration: the route table and one plan per listener.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub routes: Arc<RouteTable>,
    pub listeners: Vec<Arc<ListenerPlan>>,
    pub log_dir: Option<PathBuf>,
}

impl Snapshot {
    /// Read and compile the configuration file.
    pub fn load(path: &Path, plugins: &Arc<PluginRegistry>) -> anyhow::Result<Self> {
        let config = Config::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?;
        Self::from_config(&config, plugins)
    }

    /// Compile `config`. Plugins receive their settings only once the rest
    /// of the snapshot has compiled, so a rejected load leaves them as they
    /// were.
    pub fn from_config(config: &Config, plugins: &Arc<PluginRegistry>) -> anyhow::Result<Self> {
        let functions = Arc::new(function_table(config, plugins)?);
        let routes = RouteTable::build(config, functions, Arc::clone(plugins))?;

        let key_ctx = Context::empty(Arc::new(builtin_functions(&config.base_dir)));
        let listeners = config
            .servers
            .iter()
            .map(|server| ListenerPlan::from_config(server, &key_ctx).map(Arc::new))
            .collect::<Result<Vec<_>, ServeError>>()?;

        plugins
            .configure(&config.plugins)
            .map_err(anyhow::Error::msg)
            .context("configuring plugins")?;

        debug!(
            routes = routes.len(),
            listeners = listeners.len(),
            "configuration compiled"
        );
        Ok(Self {
            routes: Arc::new(routes),
            listeners,
            log_dir: config.system.log_dir.clone(),
        })
    }
}

fn function_table(config: &Config, plugins: &PluginRegistry) -> Result<FunctionTable, ConfigError> {
    let mut table = builtin_functions(&config.base_dir);
    plugins.install_functions(&mut table);
    for text in &config.texts {
        let template = Template::parse(&text.data).map_err(|source| ConfigError::Template {
            context: format!("text {:?}", text.name),
            source,
        })?;
        table.add_text(text.name.clone(), template);
    }
    Ok(table)
}

/// Owns the active snapshot and its listeners.
pub struct Orchestrator {
    config_path: PathBuf,
    plugins: Arc<PluginRegistry>,
    status: Arc<ReloadStatus>,
    errors: Arc<ErrorLog>,
    snapshot: Snapshot,
    manager: Option<ListenerManager>,
}

impl Orchestrator {
    /// Load the configuration and start listening. Any failure here is fatal:
    /// there is no earlier snapshot to fall back to.
    pub async fn start(config_path: PathBuf, plugins: Arc<PluginRegistry>) -> anyhow::Result<Self> {
        let snapshot = Snapshot::load(&config_path, &plugins)?;
        let status = Arc::new(ReloadStatus::new());
        let errors = Arc::new(ErrorLog::new(snapshot.log_dir.clone()));

        let mut orchestrator = Self {
            config_path,
            plugins,
            status,
            errors,
            snapshot,
            manager: None,
        };
        let manager = orchestrator
            .start_listeners(&orchestrator.snapshot)
            .await
            .context("starting listeners")?;
        orchestrator.manager = Some(manager);
        info!(
            config = %orchestrator.config_path.display(),
            listeners = orchestrator.snapshot.listeners.len(),
            "server started"
        );
        Ok(orchestrator)
    }

    pub fn status(&self) -> Arc<ReloadStatus> {
        Arc::clone(&self.status)
    }

    pub fn errors(&self) -> Arc<ErrorLog> {
        Arc::clone(&self.errors)
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Addresses the current listeners are bound to.
    pub fn local_addrs(&self) -> Vec<(Arc<str>, SocketAddr)> {
        self.manager
            .as_ref()
            .map(|m| m.local_addrs().to_vec())
            .unwrap_or_default()
    }

    /// Serve until `shutdown` resolves, reloading on every signal.
    pub async fn run<F>(mut self, mut signals: mpsc::Receiver<()>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut watching = true;
        loop {
            tokio::select! {
                signal = signals.recv(), if watching => {
                    match signal {
                        Some(()) => {
                            self.reload(&mut signals).await;
                        }
                        None => {
                            debug!("reload signal channel closed");
                            watching = false;
                        }
                    }
                }
                _ = &mut shutdown => break,
            }
        }
        self.shutdown().await;
    }

    /// Drain, reload, restart. Returns whether the new configuration is live.
    pub async fn reload(&mut self, signals: &mut mpsc::Receiver<()>) -> bool {
        info!(config = %self.config_path.display(), "reloading configuration");
        self.status.begin_reload();

        if let Some(manager) = self.manager.take() {
            let drain = manager.shutdown();
            tokio::pin!(drain);
            loop {
                tokio::select! {
                    _ = &mut drain => break,
                    Some(()) = signals.recv() => {
                        debug!("reload already in progress, signal coalesced");
                    }
                }
            }
        }
        while signals.try_recv().is_ok() {}

        let failure = match Snapshot::load(&self.config_path, &self.plugins) {
            Ok(next) => match self.start_listeners(&next).await {
                Ok(manager) => {
                    self.errors.set_dir(next.log_dir.clone());
                    self.snapshot = next;
                    self.manager = Some(manager);
                    self.status.mark_loaded();
                    metrics::record_reload(true);
                    info!("configuration reloaded");
                    return true;
                }
                Err(e) => e.context("starting listeners for the new configuration"),
            },
            Err(e) => e,
        };

        let text = format!("{failure:#}");
        warn!(error = %text, "reload failed, keeping previous configuration");
        self.errors.record(ErrorKind::Reload, &text);
        self.status.mark_failed();
        metrics::record_reload(false);

        match self.start_listeners(&self.snapshot).await {
            Ok(manager) => self.manager = Some(manager),
            Err(e) => error!(error = %format!("{e:#}"), "failed to restart previous configuration"),
        }
        false
    }

    /// Stop every listener.
    pub async fn shutdown(mut self) {
        if let Some(manager) = self.manager.take() {
            manager.shutdown().await;
        }
        info!("server stopped");
    }

    async fn start_listeners(&self, snapshot: &Snapshot) -> anyhow::Result<ListenerManager> {
        let states = snapshot
            .listeners
            .iter()
            .map(|plan| {
                Arc::new(ServiceState {
                    plan: Arc::clone(plan),
                    routes: Arc::clone(&snapshot.routes),
                    plugins: Arc::clone(&self.plugins),
                    status: Arc::clone(&self.status),
                    errors: Arc::clone(&self.errors),
                })
            })
            .collect();
        Ok(ListenerManager::start(states).await?)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config_path", &self.config_path)
            .field("state", &self.status.state())
            .field("manager", &self.manager)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn free_port() -> u16 {
        port_check::free_local_port().unwrap()
    }

    fn write_config(path: &Path, port: u16, body: &str) {
        let mut file = std::fs::File::create(path).unwrap();
        write!(
            file,
            r#"
system:
  log_dir: logs
servers:
  - name: test
    host: 127.0.0.1:{port}
routes:
  - path: /ping
    requests:
      - method: get
        responses:
          - body: {body}
"#
        )
        .unwrap();
    }

    #[test]
    fn test_snapshot_from_config() {
        let config = Config::from_yaml_str(
            r#"
texts:
  - name: greeting
    data: "hello ${1 + 1}"
routes:
  - path: /a
    requests:
      - method: get
        responses:
          - body: a
"#,
        )
        .unwrap();
        let snapshot = Snapshot::from_config(&config, &Arc::new(PluginRegistry::new())).unwrap();
        assert_eq!(snapshot.routes.len(), 1);
        assert_eq!(snapshot.listeners.len(), 1);
        assert_eq!(&*snapshot.listeners[0].name, "default");
    }

    #[test]
    fn test_snapshot_rejects_bad_text_template() {
        let config = Config::from_yaml_str(
            r#"
texts:
  - name: broken
    data: "${unterminated"
"#,
        )
        .unwrap();
        let err = Snapshot::from_config(&config, &Arc::new(PluginRegistry::new())).unwrap_err();
        assert!(format!("{err:#}").contains("text \"broken\""));
    }

    #[test]
    fn test_rejected_snapshot_leaves_plugin_settings() {
        let plugin = Arc::new(crate::plugin::tests::TestPlugin::default());
        let mut registry = PluginRegistry::new();
        registry.register(plugin.clone());
        let registry = Arc::new(registry);

        let good = Config::from_yaml_str("plugins:\n  test_plugin:\n    mode: one\n").unwrap();
        Snapshot::from_config(&good, &registry).unwrap();
        assert_eq!(*plugin.settings.lock(), serde_json::json!({"mode": "one"}));

        let bad = Config::from_yaml_str(
            r#"
plugins:
  test_plugin:
    mode: two
texts:
  - name: broken
    data: "${unterminated"
"#,
        )
        .unwrap();
        assert!(Snapshot::from_config(&bad, &registry).is_err());
        assert_eq!(*plugin.settings.lock(), serde_json::json!({"mode": "one"}));
    }

    #[tokio::test]
    async fn test_initial_load_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "routes: [not valid").unwrap();
        let result = Orchestrator::start(path, Arc::new(PluginRegistry::new())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_snapshot_and_persists_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let port = free_port();
        write_config(&path, port, "first");

        let mut orchestrator = Orchestrator::start(path.clone(), Arc::new(PluginRegistry::new()))
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(4);

        std::fs::write(&path, "routes: [not valid").unwrap();
        tx.send(()).await.unwrap();
        tx.send(()).await.unwrap();
        assert!(!orchestrator.reload(&mut rx).await);
        assert!(rx.try_recv().is_err(), "pending signals are coalesced");
        assert_eq!(orchestrator.status().state(), ReloadState::Loaded { valid: false });
        assert_eq!(orchestrator.local_addrs().len(), 1);

        let logged = orchestrator.errors().list().unwrap();
        assert_eq!(logged.len(), 1);
        assert!(orchestrator.errors().render().contains("error: on reload"));

        write_config(&path, port, "second");
        assert!(orchestrator.reload(&mut rx).await);
        assert!(orchestrator.status().is_valid());

        orchestrator.shutdown().await;
    }
}
