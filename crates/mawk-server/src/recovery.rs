//! Panic handling for request tasks and the serving loop.

use std::any::Any;
use std::backtrace::Backtrace;
use tracing::error;

/// Text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Log every panic with a captured backtrace before unwinding continues.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        let backtrace = Backtrace::force_capture();
        error!(
            panic = %panic_message(info.payload()),
            %location,
            "panic\n{backtrace}"
        );
    }));
}
