//! # Common Utilities
//!
//! Utility functions and helpers used throughout swapdb.

use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds since the Unix epoch (0 if the clock is before it)
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    now_micros() / 1000
}

/// Format bytes in human readable format
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f64 = bytes as f64;
    let exp = (bytes_f64.log2() / 10.0).floor() as usize;
    let unit_index = exp.min(UNITS.len() - 1);
    let size = bytes_f64 / (1024_f64).powi(unit_index as i32);

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else if size >= 100.0 {
        format!("{:.0} {}", size, UNITS[unit_index])
    } else if size >= 10.0 {
        format!("{:.1} {}", size, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Format a count with a decimal K/M/G suffix, e.g. `1.2K`, `3.5M`
pub fn format_count(count: u64) -> String {
    const SUFFIXES: &[(u64, &str)] = &[(1_000_000_000, "G"), (1_000_000, "M"), (1_000, "K")];

    for &(scale, suffix) in SUFFIXES {
        if count >= scale {
            let value = count as f64 / scale as f64;
            return format!("{:.1}{}", value, suffix);
        }
    }
    count.to_string()
}

/// Parse a number with an optional decimal K/M/G magnitude suffix.
///
/// Returns `None` for anything that is not a plain number or a number followed by
/// exactly one suffix letter.
pub fn parse_magnitude(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let (digits, scale) = match text.as_bytes()[text.len() - 1] {
        b'K' => (&text[..text.len() - 1], 1e3),
        b'M' => (&text[..text.len() - 1], 1e6),
        b'G' => (&text[..text.len() - 1], 1e9),
        _ => (text, 1.0),
    };

    // f64's parser accepts "inf"/"nan"; those are text, not numbers
    if !digits
        .bytes()
        .all(|b| b.is_ascii_digit() || b == b'.' || b == b'-')
    {
        return None;
    }
    digits.parse::<f64>().ok().map(|v| v * scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_count() {
        assert_eq!(format_count(999), "999");
        assert_eq!(format_count(1200), "1.2K");
        assert_eq!(format_count(3_500_000), "3.5M");
        assert_eq!(format_count(2_000_000_000), "2.0G");
    }

    #[test]
    fn test_parse_magnitude() {
        assert_eq!(parse_magnitude("42"), Some(42.0));
        assert_eq!(parse_magnitude("1.5K"), Some(1500.0));
        assert_eq!(parse_magnitude("2M"), Some(2_000_000.0));
        assert_eq!(parse_magnitude("0.25G"), Some(250_000_000.0));
        assert_eq!(parse_magnitude("fast"), None);
        assert_eq!(parse_magnitude("inf"), None);
        assert_eq!(parse_magnitude(""), None);
        assert_eq!(parse_magnitude("K"), None);
    }
}
