// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rendering and parsing of OpenTSDB tag strings.

use std::collections::BTreeMap;

/// Tag mapping as carried by requests and configuration. Ordered so rendering is stable.
pub type TagMap = BTreeMap<String, String>;

/// Renders tags in OpenTSDB form, e.g. `host=web01 env=prod`.
///
/// An empty mapping renders as an empty string.
pub fn render_tags(tags: &TagMap) -> String {
    let mut rendered = String::new();
    for (key, value) in tags {
        if !rendered.is_empty() {
            rendered.push(' ');
        }
        rendered.push_str(key);
        rendered.push('=');
        rendered.push_str(value);
    }
    rendered
}

/// Joins two rendered tag strings with a single space, skipping empty sides.
pub fn join_tags(defaults: &str, extra: &str) -> String {
    match (defaults.is_empty(), extra.is_empty()) {
        (true, _) => extra.to_string(),
        (_, true) => defaults.to_string(),
        _ => format!("{defaults} {extra}"),
    }
}

/// Parses tags from an environment string.
///
/// Pairs may be written `key=value` or `key:value` and separated by spaces or commas.
/// Malformed pairs are skipped.
pub fn parse_tags(raw: &str) -> TagMap {
    raw.replace(',', " ")
        .split_whitespace()
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').or_else(|| pair.split_once(':'))?;
            if key.is_empty() || value.is_empty() {
                tracing::warn!("Ignoring malformed tag '{}'", pair);
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> TagMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_render_tags() {
        assert_eq!(render_tags(&TagMap::new()), "");
        assert_eq!(render_tags(&tags(&[("foo", "bar")])), "foo=bar");
        assert_eq!(
            render_tags(&tags(&[("tag2", "val2"), ("tag1", "val1")])),
            "tag1=val1 tag2=val2"
        );
    }

    #[test]
    fn test_join_tags() {
        assert_eq!(join_tags("", ""), "");
        assert_eq!(join_tags("foo=bar", ""), "foo=bar");
        assert_eq!(join_tags("", "a=b"), "a=b");
        assert_eq!(join_tags("foo=bar", "a=b"), "foo=bar a=b");
    }

    #[test]
    fn test_parse_tags() {
        assert_eq!(
            parse_tags("env=prod,region:us-east-1 host=web01"),
            tags(&[("env", "prod"), ("region", "us-east-1"), ("host", "web01")])
        );
        assert!(parse_tags("").is_empty());
        assert_eq!(parse_tags("novalue= =nokey ok=1 junk"), tags(&[("ok", "1")]));
    }
}
