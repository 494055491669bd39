//! Lenient parsing of router-side value formats.
//!
//! RouterOS-style CLIs print durations as concatenated unit segments
//! (`12ms345us`, `1s200ms`) and `print as-value` emits `key=value` pairs
//! joined by semicolons. Both transports share these helpers.

use std::collections::HashMap;

/// Parse a RouterOS-style duration (`867us`, `12ms`, `12ms345us`, `1s2ms`)
/// into milliseconds.
pub(crate) fn parse_time_ms(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    // Bare numbers are taken as milliseconds.
    if let Ok(v) = s.parse::<f64>() {
        return v.is_finite().then_some(v);
    }

    let mut total_ms = 0.0f64;
    let mut number = String::new();
    let mut unit = String::new();
    let mut segments = Vec::new();
    for c in s.chars() {
        if c.is_ascii_digit() || c == '.' {
            if !unit.is_empty() {
                segments.push((number.clone(), unit.clone()));
                number.clear();
                unit.clear();
            }
            number.push(c);
        } else if c.is_ascii_alphabetic() {
            if number.is_empty() {
                return None;
            }
            unit.push(c);
        } else {
            return None;
        }
    }
    if number.is_empty() || unit.is_empty() {
        return None;
    }
    segments.push((number, unit));

    for (num, unit) in segments {
        let value: f64 = num.parse().ok()?;
        let scale = match unit.as_str() {
            "us" => 0.001,
            "ms" => 1.0,
            "s" => 1000.0,
            "m" => 60_000.0,
            _ => return None,
        };
        total_ms += value * scale;
    }
    total_ms.is_finite().then_some(total_ms)
}

/// Split a `key=value;key=value` record (`print as-value` output) into a map.
pub(crate) fn parse_as_value(line: &str) -> HashMap<&str, &str> {
    line.trim()
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect()
}

/// Parse a counter field, tolerating plain integers and quoted integers.
pub(crate) fn parse_u64(s: &str) -> Option<u64> {
    s.trim().trim_matches('"').parse().ok()
}

/// Parse RouterOS booleans (`true`/`false`/`yes`/`no`).
pub(crate) fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().trim_matches('"') {
        "true" | "yes" => Some(true),
        "false" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Durations ──────────────────────────────────────────────────────

    #[test]
    fn parses_single_unit() {
        assert_eq!(parse_time_ms("12ms"), Some(12.0));
        assert_eq!(parse_time_ms("867us"), Some(0.867));
        assert_eq!(parse_time_ms("2s"), Some(2000.0));
    }

    #[test]
    fn parses_compound_units() {
        assert_eq!(parse_time_ms("12ms345us"), Some(12.345));
        assert_eq!(parse_time_ms("1s200ms"), Some(1200.0));
    }

    #[test]
    fn parses_bare_number_as_ms() {
        assert_eq!(parse_time_ms("7"), Some(7.0));
        assert_eq!(parse_time_ms("7.5"), Some(7.5));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_time_ms(""), None);
        assert_eq!(parse_time_ms("ms"), None);
        assert_eq!(parse_time_ms("12xy"), None);
        assert_eq!(parse_time_ms("12ms;"), None);
    }

    // ─── as-value Records ───────────────────────────────────────────────

    #[test]
    fn splits_as_value_record() {
        let map = parse_as_value(".id=*1;packets=123;bytes=45678;dropped=9");
        assert_eq!(map.get("packets"), Some(&"123"));
        assert_eq!(map.get("dropped"), Some(&"9"));
        assert_eq!(map.get(".id"), Some(&"*1"));
    }

    #[test]
    fn scalar_fields() {
        assert_eq!(parse_u64("123"), Some(123));
        assert_eq!(parse_u64("\"123\""), Some(123));
        assert_eq!(parse_u64("12/34"), None);
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("no"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
