// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns validated metric requests into OpenTSDB `put` lines.
//!
//! A line has the form `put <metric> <unix-seconds> <value> <tag=value ...>\n`. The value is not
//! parsed here; the time-series database is responsible for rejecting non-numeric values.

use derive_more::Display;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::errors::FormatError;
use crate::tags::{join_tags, render_tags, TagMap};
use crate::util::unix_seconds;

pub const NAME_FIELD: &str = "name";
pub const VALUE_FIELD: &str = "value";

/// Body of an `add` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MetricRequest {
    #[serde(default, deserialize_with = "string_only")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub value: Option<String>,
    #[serde(default, deserialize_with = "tag_map")]
    pub tags: Option<TagMap>,
}

impl MetricRequest {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            value: Some(value.into()),
            tags: None,
        }
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags
            .get_or_insert_with(TagMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Number of tags carried by the request itself.
    pub fn tag_count(&self) -> usize {
        self.tags.as_ref().map_or(0, TagMap::len)
    }
}

/// One formatted wire record, newline included.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub struct MetricLine(String);

impl MetricLine {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Formats requests using a configured prefix and default tags.
#[derive(Debug, Clone)]
pub struct LineFormatter {
    prefix: Option<String>,
    default_tags: String,
}

impl LineFormatter {
    pub fn new(prefix: Option<String>, default_tags: &TagMap) -> Self {
        Self {
            prefix: prefix.filter(|p| !p.is_empty()),
            default_tags: render_tags(default_tags),
        }
    }

    pub fn default_tags(&self) -> &str {
        &self.default_tags
    }

    /// Formats `request` stamped with the current time.
    pub fn format(&self, request: &MetricRequest) -> Result<MetricLine, FormatError> {
        self.format_at(request, unix_seconds())
    }

    /// Formats `request` stamped with `timestamp` seconds since the epoch.
    pub fn format_at(
        &self,
        request: &MetricRequest,
        timestamp: u64,
    ) -> Result<MetricLine, FormatError> {
        let name = non_empty(&request.name).ok_or(FormatError::MissingField(NAME_FIELD))?;
        let value = non_empty(&request.value).ok_or(FormatError::MissingField(VALUE_FIELD))?;

        let request_tags = request.tags.as_ref().map(render_tags).unwrap_or_default();
        let tags = join_tags(&self.default_tags, &request_tags);
        // OpenTSDB requires at least one tag per data point
        if tags.trim().is_empty() {
            return Err(FormatError::NoTags);
        }

        let line = match &self.prefix {
            Some(prefix) => format!("put {prefix}.{name} {timestamp} {value} {tags}\n"),
            None => format!("put {name} {timestamp} {value} {tags}\n"),
        };
        Ok(MetricLine(line))
    }
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.is_empty())
}

fn scalar_to_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_only<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        _ => None,
    })
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Value>::deserialize(deserializer)?.and_then(scalar_to_string))
}

fn tag_map<'de, D>(deserializer: D) -> Result<Option<TagMap>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Object(map)) => Some(
            map.into_iter()
                .filter_map(|(key, value)| scalar_to_string(value).map(|v| (key, v)))
                .collect(),
        ),
        _ => None,
    })
}
