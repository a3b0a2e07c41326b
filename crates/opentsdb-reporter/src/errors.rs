// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors raised while turning a request into a metric line
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("All metrics need a '{0}' field")]
    MissingField(&'static str),

    #[error("You must specify at least one tag")]
    NoTags,
}

/// Errors reported back to the producer of a request
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("You must specify an action")]
    MissingAction,

    #[error("Invalid action: {0} specified.")]
    InvalidAction(String),

    #[error("You specified too many tags ({count} with a maximum of {max})")]
    TooManyTags { count: usize, max: usize },

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Reporter is not running")]
    NotRunning,
}

/// The initial connection to an endpoint could not be established
#[derive(Debug, thiserror::Error)]
#[error("Cannot connect to OpenTSDB host: {host} port: {port}: {source}")]
pub struct ConnectError {
    pub host: String,
    pub port: u16,
    #[source]
    pub source: std::io::Error,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker was already started and stopped")]
    AlreadyStopped,

    #[error("Worker is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Connect(#[from] ConnectError),
}

#[derive(Debug, thiserror::Error)]
pub enum ReporterError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to start worker: {0}")]
    Worker(#[from] WorkerError),
}
