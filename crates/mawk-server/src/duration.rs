//! Duration strings such as `250ms`, `1h30m` or `1h 30m`, used by request
//! delays, ticker blocks and the `duration(..)` expression function.

use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid duration {input:?}: {source}")]
pub struct ParseDurationError {
    input: String,
    #[source]
    source: humantime::DurationError,
}

/// Parse a duration in humantime notation. A bare `0` needs no unit.
pub fn parse_duration(input: &str) -> Result<Duration, ParseDurationError> {
    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(s).map_err(|source| ParseDurationError {
        input: input.to_string(),
        source,
    })
}

/// Render a duration as `1h 2m 3s`, truncated to whole seconds.
pub fn format_duration(d: Duration) -> String {
    humantime::format_duration(Duration::from_secs(d.as_secs())).to_string()
}
