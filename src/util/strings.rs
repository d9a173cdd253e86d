use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Returns true if `s` equals one of `list`.
pub fn in_list(s: &str, list: &[&str]) -> bool {
    list.iter().any(|item| *item == s)
}

/// Splits `KEY=VALUE` at the first `=`.
pub fn split_key_value(s: &str) -> Option<(&str, &str)> {
    s.split_once('=')
}

/// Parses durations such as `300ms`, `10s` or `1h2m3.5s`.
///
/// A bare `0` is accepted; every other component needs a unit.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        bail!("invalid duration '{}'", input);
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            bail!("invalid duration '{}'", input);
        }
        let value: f64 = rest[..number_len]
            .parse()
            .with_context(|| format!("invalid duration '{}'", input))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "" => bail!("missing unit in duration '{}'", input),
            other => bail!("unknown unit '{}' in duration '{}'", other, input),
        };
        rest = &rest[unit_len..];
        total += value * scale;
    }

    Duration::try_from_secs_f64(total)
        .with_context(|| format!("duration '{}' out of range", input))
}
