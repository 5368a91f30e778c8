//! Mawk: a configuration-driven mock HTTP application server.
//!
//! A YAML file declares listeners, routes and candidate responses. Responses
//! are templated from request data, rotate in order or at random, can be
//! delayed, delegated to a proxy target, or carry a freshly signed JWT. The
//! file is watched and reloaded in place; a broken edit keeps the previous
//! configuration serving and reports itself in an `x-reload-error` header.

// ===== Configuration and templates =====
pub mod config;
pub mod duration;
pub mod expression;

// ===== Request handling =====
pub mod handler;
pub mod jwt;
pub mod router;
pub mod sequencer;

// ===== Runtime =====
pub mod metrics;
pub mod plugin;
pub mod recovery;
pub mod reload;
pub mod server;

pub use config::Config;
pub use plugin::{Plugin, PluginRegistry};
pub use reload::{ConfigWatcher, Orchestrator};
