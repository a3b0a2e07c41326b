// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::str::FromStr;
use std::time::Duration;

use derive_more::Display;
use serde::Deserialize;

use crate::constants::{
    CONNECT_TIMEOUT, DEFAULT_HOST, DEFAULT_MAX_BUFFER_SIZE, DEFAULT_MAX_TAGS, DEFAULT_PORT,
    HEALTH_CHECK_INTERVAL, MAX_DISCONNECTS_BEFORE_QUIET_PERIOD, QUIET_PERIOD_WINDOW,
    READ_TIMEOUT, REPORTING_INTERVAL, WRITE_TIMEOUT,
};
use crate::errors::ReporterError;
use crate::tags::{parse_tags, TagMap};
use crate::util::parse_metric_prefix;

/// A single `(host, port)` time-series endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, Deserialize)]
#[display("{host}:{port}")]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl FromStr for Endpoint {
    type Err = ReporterError;

    /// Parses `host:port`; IPv6 hosts may be bracketed, e.g. `[::1]:4242`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.trim().rsplit_once(':').ok_or_else(|| {
            ReporterError::InvalidConfig(format!("Endpoint '{s}' must be of the form host:port"))
        })?;
        let port = port.parse::<u16>().map_err(|e| {
            ReporterError::InvalidConfig(format!("Invalid port in endpoint '{s}': {e}"))
        })?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok(Self::new(host, port))
    }
}

/// Tunables for one endpoint connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Bound on the health-probe read
    pub read_timeout: Duration,
    /// Minimum time between health-probe reads
    pub health_check_interval: Duration,
    /// Period of the connection report in the logs
    pub reporting_interval: Duration,
    /// Window over which disconnects are counted for the quiet period
    pub quiet_period_window: Duration,
    /// Disconnects tolerated per window before sends are suspended
    pub max_disconnects_before_quiet_period: u32,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_timeout: READ_TIMEOUT,
            health_check_interval: HEALTH_CHECK_INTERVAL,
            reporting_interval: REPORTING_INTERVAL,
            quiet_period_window: QUIET_PERIOD_WINDOW,
            max_disconnects_before_quiet_period: MAX_DISCONNECTS_BEFORE_QUIET_PERIOD,
            connect_timeout: CONNECT_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
        }
    }
}

/// Configuration handed to the reporter at start.
///
/// Deserializes from the module configuration object, e.g.
/// `{"hosts": [{"host": "tsd", "port": 4242}], "maxBufferSizeInBytes": 1500, "tags": {"env": "prod"}}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReporterConfig {
    pub hosts: Vec<Endpoint>,
    pub max_buffer_size_in_bytes: usize,
    pub prefix: Option<String>,
    pub tags: TagMap,
    pub max_tags: usize,
    #[serde(skip)]
    pub connection: ConnectionConfig,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            hosts: vec![Endpoint::default()],
            max_buffer_size_in_bytes: DEFAULT_MAX_BUFFER_SIZE,
            prefix: None,
            tags: TagMap::new(),
            max_tags: DEFAULT_MAX_TAGS,
            connection: ConnectionConfig::default(),
        }
    }
}

impl ReporterConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ReporterError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create configuration from any key lookup, using the same keys as [`Self::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ReporterError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let hosts = match lookup("TSDB_REPORTER_HOSTS") {
            Some(raw) => raw
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(Endpoint::from_str)
                .collect::<Result<Vec<_>, _>>()?,
            None => vec![Endpoint::default()],
        };
        let max_buffer_size_in_bytes = lookup("TSDB_REPORTER_MAX_BUFFER_SIZE")
            .and_then(|val| val.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_BUFFER_SIZE);
        let prefix = lookup("TSDB_REPORTER_PREFIX").and_then(|val| parse_metric_prefix(&val));
        let tags = lookup("TSDB_REPORTER_TAGS")
            .map(|val| parse_tags(&val))
            .unwrap_or_default();
        let max_tags = lookup("TSDB_REPORTER_MAX_TAGS")
            .and_then(|val| val.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_TAGS);

        let config = Self {
            hosts,
            max_buffer_size_in_bytes,
            prefix,
            tags,
            max_tags,
            connection: ConnectionConfig::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ReporterError> {
        if self.hosts.is_empty() {
            return Err(ReporterError::InvalidConfig(
                "At least one endpoint must be configured".to_string(),
            ));
        }

        if let Some(endpoint) = self
            .hosts
            .iter()
            .find(|e| e.host.trim().is_empty() || e.port == 0)
        {
            return Err(ReporterError::InvalidConfig(format!(
                "Invalid endpoint '{endpoint}': host must be set and port must be greater than 0"
            )));
        }

        if self.max_buffer_size_in_bytes == 0 {
            return Err(ReporterError::InvalidConfig(
                "maxBufferSizeInBytes must be greater than 0".to_string(),
            ));
        }

        if self.max_tags == 0 {
            return Err(ReporterError::InvalidConfig(
                "maxTags must be greater than 0".to_string(),
            ));
        }

        if self.tags.len() > self.max_tags {
            return Err(ReporterError::InvalidConfig(format!(
                "Found more default tags than the max ({})",
                self.max_tags
            )));
        }

        Ok(())
    }
}
