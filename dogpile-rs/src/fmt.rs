//! Provides formatting and parsing helpers for durations.
//!
//! Durations show up in two places: in the configuration (TTLs, rate limit windows, sweep
//! intervals) where they are given as short strings like `15m` or `250ms`, and in log output and
//! statistics where they are rendered back into a human readable form.
use std::fmt::Write;
use std::time::Duration;

use anyhow::Context;

/// Formats a duration given in microseconds.
///
/// This function determines the ideal unit (ranging from microseconds to seconds) to provide
/// a concise representation.
///
/// Note that a helper function [format_short_duration](format_short_duration) is also provided
/// which directly returns a String. This function also provides some examples.
pub fn format_micros(micros: i32, f: &mut dyn std::fmt::Write) -> std::fmt::Result {
    match micros {
        m if m < 1_000 => write!(f, "{} us", m),
        m if m < 10_000 => write!(f, "{:.2} ms", m as f32 / 1_000.),
        m if m < 100_000 => write!(f, "{:.1} ms", m as f32 / 1_000.),
        m if m < 1_000_000 => write!(f, "{} ms", m / 1_000),
        m if m < 10_000_000 => write!(f, "{:.2} s", m as f32 / 1_000_000.),
        m if m < 100_000_000 => write!(f, "{:.1} s", m as f32 / 1_000_000.),
        m => write!(f, "{} s", m / 1_000_000),
    }
}

/// Formats a duration given in microseconds and returns a String representation.
///
/// # Examples
///
/// ```
/// assert_eq!(dogpile::fmt::format_short_duration(100), "100 us");
/// assert_eq!(dogpile::fmt::format_short_duration(8_192), "8.19 ms");
/// assert_eq!(dogpile::fmt::format_short_duration(32_768), "32.8 ms");
/// assert_eq!(dogpile::fmt::format_short_duration(128_123), "128 ms");
/// assert_eq!(dogpile::fmt::format_short_duration(1_128_123), "1.13 s");
/// assert_eq!(dogpile::fmt::format_short_duration(101_000_000), "101 s");
/// ```
pub fn format_short_duration(duration_in_micros: i32) -> String {
    let mut result = String::new();
    let _ = format_micros(duration_in_micros, &mut result);
    result
}

/// Parses a duration from a given string.
///
/// This string can have the following suffixes:
/// * **ms** or **MS**: treats the value as milliseconds (also used if no suffix is given)
/// * **s** or **S**: treats the value as seconds
/// * **m** or **M**: treats the value as minutes
/// * **h** or **H**: treats the value as hours
/// * **d** or **D**: treats the value as days
///
/// Returns an **Err** if either a non-integer value is given or if an unknown suffix was
/// provided.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(dogpile::fmt::parse_duration("1000ms").unwrap(), Duration::from_millis(1000));
/// assert_eq!(dogpile::fmt::parse_duration("250").unwrap(), Duration::from_millis(250));
/// assert_eq!(dogpile::fmt::parse_duration("12 s").unwrap(), Duration::from_secs(12));
/// assert_eq!(dogpile::fmt::parse_duration("15m").unwrap(), Duration::from_secs(15 * 60));
/// assert_eq!(dogpile::fmt::parse_duration("2 H").unwrap(), Duration::from_secs(2 * 60 * 60));
/// assert_eq!(dogpile::fmt::parse_duration("1d").unwrap(), Duration::from_secs(24 * 60 * 60));
///
/// // Unknown suffixes, decimals and negative numbers are rejected...
/// assert!(dogpile::fmt::parse_duration("3 Y").is_err());
/// assert!(dogpile::fmt::parse_duration("1.2s").is_err());
/// assert!(dogpile::fmt::parse_duration("-1m").is_err());
/// ```
pub fn parse_duration(str: impl AsRef<str>) -> anyhow::Result<Duration> {
    lazy_static::lazy_static! {
        static ref NUMBER_AND_UNIT: regex::Regex =
            regex::Regex::new(r"^ *(\d+) *(ms|s|m|h|d|MS|S|M|H|D)? *$").unwrap();
    }

    let input = str.as_ref();
    let captures = NUMBER_AND_UNIT.captures(input).ok_or_else(|| {
        anyhow::anyhow!(
            "Cannot parse '{}' into a duration. \
             Expected a positive number and optionally 'ms', 's', 'm', 'h' or 'd' as unit.",
            input
        )
    })?;

    let number = captures[1]
        .parse::<u64>()
        .with_context(|| format!("'{}' is out of range for a duration", input))?;

    let seconds_per_unit = match captures.get(2).map(|unit| unit.as_str()) {
        Some("s") | Some("S") => 1,
        Some("m") | Some("M") => 60,
        Some("h") | Some("H") => 60 * 60,
        Some("d") | Some("D") => 60 * 60 * 24,
        _ => return Ok(Duration::from_millis(number)),
    };

    number
        .checked_mul(seconds_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| anyhow::anyhow!("'{}' is out of range for a duration", input))
}

/// Formats a duration into a string like "5d 3h 17m 2s 12ms".
///
/// Zero-valued components are skipped, so that a window of one minute is simply rendered as
/// "1m". A zero duration is rendered as "0ms".
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(dogpile::fmt::format_duration(Duration::ZERO), "0ms");
/// assert_eq!(dogpile::fmt::format_duration(Duration::from_millis(13)), "13ms");
/// assert_eq!(dogpile::fmt::format_duration(Duration::from_millis(1013)), "1s 13ms");
/// assert_eq!(dogpile::fmt::format_duration(Duration::from_millis(62_013)), "1m 2s 13ms");
/// assert_eq!(dogpile::fmt::format_duration(Duration::from_secs(60 * 61)), "1h 1m");
/// assert_eq!(dogpile::fmt::format_duration(Duration::from_secs(24 * 60 * 60 + 59)), "1d 59s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    const UNITS: [(u128, &str); 5] = [
        (1000 * 60 * 60 * 24, "d"),
        (1000 * 60 * 60, "h"),
        (1000 * 60, "m"),
        (1000, "s"),
        (1, "ms"),
    ];

    let mut result = String::new();
    let mut remainder = duration.as_millis();

    for (millis_per_unit, unit) in UNITS {
        let amount = remainder / millis_per_unit;
        if amount > 0 {
            if !result.is_empty() {
                result.push(' ');
            }
            let _ = write!(result, "{}{}", amount, unit);
            remainder %= millis_per_unit;
        }
    }

    if result.is_empty() {
        result.push_str("0ms");
    }

    result
}

#[cfg(test)]
mod tests {
    use crate::fmt::{format_duration, parse_duration};
    use std::time::Duration;

    #[test]
    fn parsed_durations_format_back_to_their_canonical_form() {
        assert_eq!(format_duration(parse_duration("90s").unwrap()), "1m 30s");
        assert_eq!(format_duration(parse_duration("1000ms").unwrap()), "1s");
        assert_eq!(format_duration(parse_duration("25h").unwrap()), "1d 1h");
    }

    #[test]
    fn overflowing_durations_are_rejected() {
        assert!(parse_duration("99999999999999999999999s").is_err());
        assert!(parse_duration(format!("{}d", u64::MAX)).is_err());
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("   ").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn whitespace_around_the_expression_is_ignored() {
        assert_eq!(parse_duration("  5 s ").unwrap(), Duration::from_secs(5));
    }
}
