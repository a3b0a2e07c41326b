// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Utility functions for reporter configuration.

/// Returns true for characters OpenTSDB accepts in metric names and tag keys/values.
pub fn is_opentsdb_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '/')
}

/// Parses and validates a metric prefix string according to OpenTSDB naming rules.
///
/// A valid prefix must:
/// - Start with an ASCII letter
/// - Contain only ASCII alphanumerics, `-`, `_`, `.` or `/`
/// - Not be empty or contain only whitespace
///
/// Whitespace is automatically trimmed from the input.
///
/// # Examples
///
/// ```
/// use opentsdb_reporter::util::parse_metric_prefix;
///
/// assert_eq!(parse_metric_prefix("myapp"), Some("myapp".to_string()));
/// assert_eq!(parse_metric_prefix("my-app.metrics"), Some("my-app.metrics".to_string()));
/// assert_eq!(parse_metric_prefix("1invalid"), None);
/// assert_eq!(parse_metric_prefix("my app"), None);
/// ```
pub fn parse_metric_prefix(prefix: &str) -> Option<String> {
    let trimmed = prefix.trim();

    let mut chars = trimmed.chars();
    match chars.next() {
        None => return None,
        Some(first_char) if !first_char.is_ascii_alphabetic() => {
            tracing::error!(
                "Metric prefix must start with a letter, got: '{}'. Ignoring prefix.",
                trimmed
            );
            return None;
        }
        Some(_) => {}
    }

    if let Some(invalid_char) = chars.find(|&ch| !is_opentsdb_char(ch)) {
        tracing::error!(
            "Metric prefix contains invalid character '{}' in '{}'. Only ASCII alphanumerics, '-', '_', '.' and '/' are allowed. Ignoring prefix.",
            invalid_char, trimmed
        );
        return None;
    }

    Some(trimmed.trim_end_matches('.').to_string())
}

/// Seconds since the unix epoch, saturating to zero if the clock is before it.
pub fn unix_seconds() -> u64 {
    std::time::UNIX_EPOCH
        .elapsed()
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metric_prefix_valid() {
        assert_eq!(parse_metric_prefix("myapp"), Some("myapp".to_string()));
        assert_eq!(parse_metric_prefix("my_app"), Some("my_app".to_string()));
        assert_eq!(parse_metric_prefix("my.app"), Some("my.app".to_string()));
        assert_eq!(parse_metric_prefix("my-app/v2"), Some("my-app/v2".to_string()));
        assert_eq!(
            parse_metric_prefix("test.service"),
            Some("test.service".to_string())
        );
    }

    #[test]
    fn test_parse_metric_prefix_strips_trailing_separator() {
        assert_eq!(parse_metric_prefix("myapp."), Some("myapp".to_string()));
    }

    #[test]
    fn test_parse_metric_prefix_with_whitespace() {
        assert_eq!(parse_metric_prefix("  myapp  "), Some("myapp".to_string()));
        assert_eq!(parse_metric_prefix("\tmyapp\n"), Some("myapp".to_string()));
    }

    #[test]
    fn test_parse_metric_prefix_empty() {
        assert_eq!(parse_metric_prefix(""), None);
        assert_eq!(parse_metric_prefix("   "), None);
    }

    #[test]
    fn test_parse_metric_prefix_invalid() {
        assert_eq!(parse_metric_prefix("1myapp"), None);
        assert_eq!(parse_metric_prefix(".myapp"), None);
        assert_eq!(parse_metric_prefix("my app"), None);
        assert_eq!(parse_metric_prefix("my@app"), None);
        assert_eq!(parse_metric_prefix("my=app"), None);
    }

    #[test]
    fn test_unix_seconds_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(unix_seconds() > 1_577_836_800);
    }
}
