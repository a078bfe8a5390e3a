//! Parses the `12[s|min|h]`-style duration strings the CLI accepts.

use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

lazy_static! {
    static ref TIME_INTERVAL_RE: Regex =
        Regex::new(r"(?i)^\s*([0-9]*\.?[0-9]+)\s?(h|m(?:in)?|s)?\s*$").unwrap();
}

/// The duration string didn't match `<number><unit>?`.
#[derive(Debug, Error)]
#[error("invalid time interval (e.g. 12s, 5min, 1h): {:?}", text)]
pub struct ParseError {
    text: String,
}

/// Parse a human-friendly duration, defaulting to seconds when no unit is
/// given.
pub fn parse(text: &str) -> Result<Duration, ParseError> {
    let bad = || ParseError {
        text: text.to_owned(),
    };

    let captures = TIME_INTERVAL_RE.captures(text).ok_or_else(bad)?;
    let quantity: f64 = captures[1].parse().map_err(|_| bad())?;

    let seconds = match captures.get(2).map(|unit| unit.as_str().to_ascii_lowercase()) {
        Some(unit) if unit == "h" => quantity * 3600.0,
        Some(unit) if unit.starts_with('m') => quantity * 60.0,
        _ => quantity,
    };

    if !seconds.is_finite() || seconds < 0.0 {
        return Err(bad());
    }

    Ok(Duration::from_secs_f64(seconds))
}
