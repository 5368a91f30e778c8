use super::{stringify, EvalError, Function, FunctionTable};
use crate::duration::parse_duration;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn string_arg<'a>(function: &str, args: &'a [Value], idx: usize) -> Result<&'a str, EvalError> {
    match args.get(idx) {
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(other) => Err(EvalError::function(
            function,
            format!("argument {idx} must be a string, got {other}"),
        )),
        None => Err(EvalError::function(
            function,
            format!("missing argument {idx}"),
        )),
    }
}

fn now() -> Function {
    Arc::new(|_args: &[Value]| Ok(Value::from(Utc::now().timestamp())))
}

fn duration() -> Function {
    Arc::new(|args: &[Value]| {
        let raw = string_arg("duration", args, 0)?;
        let d = parse_duration(raw).map_err(|e| EvalError::function("duration", e.to_string()))?;
        let delta = chrono::Duration::from_std(d)
            .map_err(|e| EvalError::function("duration", e.to_string()))?;
        Ok(Value::from((Utc::now() + delta).timestamp()))
    })
}

fn unix() -> Function {
    Arc::new(|args: &[Value]| {
        let raw = string_arg("unix", args, 0)?;
        let parsed = DateTime::parse_from_rfc2822(raw)
            .or_else(|_| DateTime::parse_from_rfc3339(raw))
            .map_err(|e| EvalError::function("unix", format!("{raw:?}: {e}")))?;
        Ok(Value::from(parsed.timestamp()))
    })
}

fn env() -> Function {
    Arc::new(|args: &[Value]| {
        let name = string_arg("env", args, 0)?;
        Ok(Value::String(std::env::var(name).unwrap_or_default()))
    })
}

/// `file(path)` reads a file relative to the config directory.
fn file(base_dir: PathBuf) -> Function {
    Arc::new(move |args: &[Value]| {
        let raw = string_arg("file", args, 0)?;
        let path = resolve_path(&base_dir, raw);
        std::fs::read_to_string(&path)
            .map(|s| Value::String(s.trim().to_string()))
            .map_err(|e| EvalError::function("file", format!("{}: {e}", path.display())))
    })
}

fn resolve_path(base_dir: &Path, raw: &str) -> PathBuf {
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base_dir.join(raw.trim_start_matches("./"))
    }
}

fn join() -> Function {
    Arc::new(|args: &[Value]| {
        let sep = string_arg("join", args, 0)?;
        let parts: Vec<String> = match args.get(1) {
            Some(Value::Array(items)) => items.iter().map(stringify).collect(),
            _ => args[1..].iter().map(stringify).collect(),
        };
        Ok(Value::String(parts.join(sep)))
    })
}

/// The functions every template can call.
pub fn builtin_functions(base_dir: &Path) -> FunctionTable {
    let mut table = FunctionTable::default();
    table.register("now", now());
    table.register("duration", duration());
    table.register("unix", unix());
    table.register("env", env());
    table.register("file", file(base_dir.to_path_buf()));
    table.register("join", join());
    table
}
