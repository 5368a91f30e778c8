//! Persisted reload and panic errors, and the `x-reload-error` header block.

use anyhow::Context as _;
use chrono::Local;
use parking_lot::RwLock;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use tracing::{error, info};

use super::ReloadStatus;
use crate::duration::format_duration;

pub const RELOAD_ERROR_HEADER: &str = "x-reload-error";
pub const ERRORS_PATH: &str = "/_internal/reload/errors";

const NO_LOG_DIR: &str = "no log directory set";
const HEADER_WIDTH: usize = 60;
const EXPLANATION: &str = "The server configuration has not been applied after the most recent update due to an error, please check the configuration and try the reload again.";

const RFC1123: &str = "%a, %d %b %Y %H:%M:%S %Z";
const RFC1123Z: &str = "%a, %d %b %Y %H:%M:%S %z";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Reload,
    Panic,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Reload => "reload",
            ErrorKind::Panic => "panic",
        }
    }

    fn suffix(&self) -> String {
        format!("-{}.txt", self.as_str())
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time-stamped error files under the configured log directory.
#[derive(Debug, Default)]
pub struct ErrorLog {
    dir: RwLock<Option<PathBuf>>,
}

impl ErrorLog {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir: RwLock::new(dir),
        }
    }

    pub fn dir(&self) -> Option<PathBuf> {
        self.dir.read().clone()
    }

    pub fn set_dir(&self, dir: Option<PathBuf>) {
        *self.dir.write() = dir;
    }

    /// Persist one error. Without a log directory this is a no-op.
    pub fn save(&self, kind: ErrorKind, text: &str) -> anyhow::Result<Option<PathBuf>> {
        let Some(dir) = self.dir() else {
            return Ok(None);
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating log directory {}", dir.display()))?;

        let now = Local::now();
        let path = dir.join(format!("{}{}", now.timestamp(), kind.suffix()));
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        write!(
            file,
            "\n---\ndatetime: {}\nerror: on {kind}\n---\n\n{text}\n",
            now.format(RFC1123Z)
        )
        .with_context(|| format!("writing {}", path.display()))?;

        info!(path = %path.display(), kind = %kind, "error persisted");
        Ok(Some(path))
    }

    /// Save, logging instead of failing.
    pub fn record(&self, kind: ErrorKind, text: &str) {
        if let Err(e) = self.save(kind, text) {
            error!(kind = %kind, error = %format!("{e:#}"), "failed to persist error");
        }
    }

    /// Error files, newest first.
    pub fn list(&self) -> anyhow::Result<Vec<PathBuf>> {
        let Some(dir) = self.dir() else {
            return Ok(Vec::new());
        };
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let suffixes = [ErrorKind::Reload.suffix(), ErrorKind::Panic.suffix()];
        let mut files: Vec<(u64, PathBuf)> = std::fs::read_dir(&dir)
            .with_context(|| format!("reading {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?.to_string();
                suffixes
                    .iter()
                    .find_map(|s| name.strip_suffix(s.as_str()))
                    .and_then(|stamp| stamp.parse::<u64>().ok())
                    .map(|stamp| (stamp, path))
            })
            .collect();
        files.sort_by(|a, b| b.cmp(a));
        Ok(files.into_iter().map(|(_, path)| path).collect())
    }

    /// Body of the reload errors endpoint.
    pub fn render(&self) -> String {
        if self.dir().is_none() {
            return NO_LOG_DIR.to_string();
        }
        let files = match self.list() {
            Ok(files) => files,
            Err(e) => return format!("error walking output log files: {e:#}\n"),
        };
        let mut out = String::new();
        for path in files {
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    out.push_str(&content);
                    out.push('\n');
                }
                Err(e) => {
                    out.push_str(&format!("error reading {}: {e}\n", path.display()));
                    break;
                }
            }
        }
        out
    }
}

/// Lines of the `x-reload-error` header, in emission order.
pub fn reload_error_lines(status: &ReloadStatus, base_url: &str) -> Vec<String> {
    let rule = "-".repeat(HEADER_WIDTH);
    let inner_width = HEADER_WIDTH - 7;

    let mut lines = vec![
        rule.clone(),
        header_line(&format!(
            "[server] started on: {}",
            status.started_at().format(RFC1123)
        )),
        header_line(&format!(
            "[server] reloaded on: {}",
            status.loaded_at().format(RFC1123)
        )),
        header_line(&format!(
            "[server] uptime: {}",
            format_duration(status.uptime())
        )),
        header_line(&"=".repeat(inner_width)),
    ];
    lines.extend(word_wrap(EXPLANATION, inner_width).iter().map(|l| header_line(l)));
    lines.push(rule);
    lines.push(format!("for errors see: {base_url}{ERRORS_PATH}"));
    lines
}

/// `-- text<pad> --`, padded out to the header width.
fn header_line(text: &str) -> String {
    let pad = HEADER_WIDTH.saturating_sub(text.chars().count() + 7);
    format!("-- {text} {} --", " ".repeat(pad))
}

/// Break at the last space or newline within `width` characters.
fn word_wrap(text: &str, width: usize) -> Vec<String> {
    let mut rest: Vec<char> = text.trim().chars().collect();
    let mut lines = Vec::new();
    while rest.len() > width {
        match (0..=width).rev().find(|&i| rest[i] == ' ' || rest[i] == '\n') {
            Some(cut) => {
                lines.push(rest[..cut].iter().collect());
                rest.drain(..=cut);
            }
            None => {
                lines.push(rest[..width].iter().collect());
                rest.drain(..width);
            }
        }
    }
    if !rest.is_empty() {
        lines.push(rest.into_iter().collect());
    }
    lines
}
