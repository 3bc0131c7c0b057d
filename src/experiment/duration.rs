// SPDX-License-Identifier: PMPL-1.0-or-later

//! Human-friendly duration strings (`500ms`, `90s`, `15m`, `2h`).

use anyhow::{anyhow, Context, Result};
use std::time::Duration;

/// Parse a duration; a bare number is taken as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let trimmed = raw.trim().to_ascii_lowercase();
    if trimmed.is_empty() {
        return Err(anyhow!("duration cannot be empty"));
    }

    let (value_str, unit) = if let Some(value) = trimmed.strip_suffix("ms") {
        (value, "ms")
    } else if let Some(value) = trimmed.strip_suffix('s') {
        (value, "s")
    } else if let Some(value) = trimmed.strip_suffix('m') {
        (value, "m")
    } else if let Some(value) = trimmed.strip_suffix('h') {
        (value, "h")
    } else {
        (trimmed.as_str(), "s")
    };

    let value: f64 = value_str
        .trim()
        .parse()
        .with_context(|| format!("invalid duration '{}'", raw))?;
    if !value.is_finite() || value.is_sign_negative() {
        return Err(anyhow!("duration must be a non-negative number: {}", raw));
    }

    let millis = match unit {
        "ms" => value,
        "m" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        _ => value * 1000.0,
    };
    Ok(Duration::from_millis(millis.round() as u64))
}
