use chrono::{DateTime, Local};
use parking_lot::RwLock;
use std::fmt;
use std::time::{Duration, Instant};

/// Orchestrator state as seen by listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadState {
    /// Serving a configuration; `valid` is false while falling back to the
    /// previous snapshot after a failed reload.
    Loaded { valid: bool },
    Reloading,
}

impl fmt::Display for ReloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReloadState::Loaded { valid: true } => write!(f, "loaded"),
            ReloadState::Loaded { valid: false } => write!(f, "loaded (fallback)"),
            ReloadState::Reloading => write!(f, "reloading"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: ReloadState,
    /// Whether the most recent load attempt succeeded. Kept across
    /// `Reloading` so responses during a drain still report a pending failure.
    valid: bool,
    loaded_at: DateTime<Local>,
}

/// Server start time, last successful load and current validity.
#[derive(Debug)]
pub struct ReloadStatus {
    started: Instant,
    started_at: DateTime<Local>,
    inner: RwLock<Inner>,
}

impl Default for ReloadStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ReloadStatus {
    pub fn new() -> Self {
        let now = Local::now();
        Self {
            started: Instant::now(),
            started_at: now,
            inner: RwLock::new(Inner {
                state: ReloadState::Loaded { valid: true },
                valid: true,
                loaded_at: now,
            }),
        }
    }

    pub fn state(&self) -> ReloadState {
        self.inner.read().state
    }

    pub fn is_valid(&self) -> bool {
        self.inner.read().valid
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn loaded_at(&self) -> DateTime<Local> {
        self.inner.read().loaded_at
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub(crate) fn begin_reload(&self) {
        self.inner.write().state = ReloadState::Reloading;
    }

    pub(crate) fn mark_loaded(&self) {
        let mut inner = self.inner.write();
        inner.state = ReloadState::Loaded { valid: true };
        inner.valid = true;
        inner.loaded_at = Local::now();
    }

    pub(crate) fn mark_failed(&self) {
        let mut inner = self.inner.write();
        inner.state = ReloadState::Loaded { valid: false };
        inner.valid = false;
    }
}
