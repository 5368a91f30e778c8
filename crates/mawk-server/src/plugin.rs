//! Plugin registry.
//!
//! Plugins are registered once at startup and handed to the route table and
//! listeners. A plugin opts into each capability by returning the matching
//! trait object from [`Plugin`]; anything it does not return is skipped.

use async_trait::async_trait;
use hyper::StatusCode;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use crate::expression::{Function, FunctionTable, RequestFacts};

/// Error raised by a pre-request hook. Aborts the request with `status`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{plugin}: {message}")]
pub struct HookError {
    pub plugin: String,
    pub status: StatusCode,
    pub message: String,
}

impl HookError {
    pub fn new(plugin: impl Into<String>, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            status,
            message: message.into(),
        }
    }
}

/// Runs after a response candidate is selected, before any delay.
#[async_trait]
pub trait PreRequestHook: Send + Sync {
    async fn before(&self, request: &RequestFacts) -> Result<(), HookError>;
}

/// Observes the final status of every request on a listener.
#[async_trait]
pub trait PostRequestHook: Send + Sync {
    async fn after(&self, request: &RequestFacts, status: StatusCode);
}

/// Variables merged into the template context root.
pub trait ProvidesVariables: Send + Sync {
    fn variables(&self) -> Map<String, Value>;
}

/// Functions callable from templates.
pub trait ProvidesFunctions: Send + Sync {
    fn functions(&self) -> Vec<(String, Function)>;
}

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Receives the plugin's section of the config on every load.
    fn configure(&self, _settings: &Value) -> Result<(), String> {
        Ok(())
    }

    fn pre_request(&self) -> Option<&dyn PreRequestHook> {
        None
    }

    fn post_request(&self) -> Option<&dyn PostRequestHook> {
        None
    }

    fn variables(&self) -> Option<&dyn ProvidesVariables> {
        None
    }

    fn functions(&self) -> Option<&dyn ProvidesFunctions> {
        None
    }
}

#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Hand each plugin its settings. Plugins without a section get `null`.
    pub fn configure(
        &self,
        settings: &std::collections::BTreeMap<String, Value>,
    ) -> Result<(), String> {
        for plugin in &self.plugins {
            let section = settings.get(plugin.name()).unwrap_or(&Value::Null);
            plugin
                .configure(section)
                .map_err(|e| format!("plugin {:?}: {e}", plugin.name()))?;
        }
        Ok(())
    }

    pub fn variables(&self) -> Map<String, Value> {
        let mut vars = Map::new();
        for provider in self.plugins.iter().filter_map(|p| p.variables()) {
            vars.extend(provider.variables());
        }
        vars
    }

    pub fn install_functions(&self, table: &mut FunctionTable) {
        for provider in self.plugins.iter().filter_map(|p| p.functions()) {
            for (name, function) in provider.functions() {
                table.register(name, function);
            }
        }
    }

    pub async fn before_request(&self, request: &RequestFacts) -> Result<(), HookError> {
        for hook in self.plugins.iter().filter_map(|p| p.pre_request()) {
            hook.before(request).await?;
        }
        Ok(())
    }

    pub async fn after_request(&self, request: &RequestFacts, status: StatusCode) {
        for hook in self.plugins.iter().filter_map(|p| p.post_request()) {
            hook.after(request, status).await;
        }
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}
