// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Entry point for producers: validates requests, formats them and hands them to the workers.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::config::ReporterConfig;
use crate::constants::ADD_COMMAND;
use crate::errors::{ReporterError, RequestError};
use crate::formatter::{LineFormatter, MetricRequest};
use crate::queue::{DispatchQueue, WorkloadPolicy};
use crate::util::parse_metric_prefix;
use crate::worker::MetricsWorker;

/// An inbound request, e.g. `{"action": "add", "name": "cpu", "value": "0.5", "tags": {"host": "a"}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ReporterRequest {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(flatten)]
    pub metric: MetricRequest,
}

impl ReporterRequest {
    pub fn add(metric: MetricRequest) -> Self {
        Self {
            action: Some(ADD_COMMAND.to_string()),
            metric,
        }
    }
}

/// Acknowledgement sent back for every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Reply {
    Ok,
    Error { message: String },
}

impl From<Result<(), RequestError>> for Reply {
    fn from(result: Result<(), RequestError>) -> Self {
        match result {
            Ok(()) => Reply::Ok,
            Err(e) => Reply::Error {
                message: e.to_string(),
            },
        }
    }
}

pub struct OpenTsDbReporter {
    formatter: LineFormatter,
    queue: DispatchQueue,
    max_tags: usize,
    default_tag_count: usize,
    workers: Mutex<Vec<MetricsWorker>>,
    running: AtomicBool,
}

impl OpenTsDbReporter {
    /// Validates `config`, then connects one worker per endpoint.
    ///
    /// Fails if any endpoint cannot be reached; workers already started are stopped again.
    pub async fn start(config: ReporterConfig) -> Result<Self, ReporterError> {
        config.validate()?;

        let prefix = config.prefix.as_deref().and_then(parse_metric_prefix);
        let formatter = LineFormatter::new(prefix, &config.tags);
        let queue = DispatchQueue::new();
        let policy = WorkloadPolicy::for_workers(config.hosts.len())?;

        let mut workers: Vec<MetricsWorker> = Vec::with_capacity(config.hosts.len());
        for endpoint in &config.hosts {
            let mut worker = MetricsWorker::new(
                endpoint.clone(),
                queue.clone(),
                policy,
                config.max_buffer_size_in_bytes,
                config.connection,
            );
            if let Err(e) = worker.start().await {
                error!("Failed to start metrics worker for {}: {}", endpoint, e);
                for started in &mut workers {
                    started.stop().await;
                }
                return Err(e.into());
            }
            workers.push(worker);
        }

        info!(
            "OpenTSDB reporter started with {} endpoint(s), default tags: '{}'",
            workers.len(),
            formatter.default_tags()
        );

        Ok(Self {
            formatter,
            queue,
            max_tags: config.max_tags,
            default_tag_count: config.tags.len(),
            workers: Mutex::new(workers),
            running: AtomicBool::new(true),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Lines formatted but not yet taken by a worker.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Routes a request by its action.
    pub fn handle(&self, request: &ReporterRequest) -> Result<(), RequestError> {
        match request.action.as_deref() {
            None => Err(RequestError::MissingAction),
            Some(ADD_COMMAND) => self.add(&request.metric),
            Some(other) => Err(RequestError::InvalidAction(other.to_string())),
        }
    }

    /// Validates and formats one data point, then queues it for delivery.
    ///
    /// Success means the line was queued, not that it reached an endpoint.
    pub fn add(&self, request: &MetricRequest) -> Result<(), RequestError> {
        if !self.is_running() {
            return Err(RequestError::NotRunning);
        }

        let count = self.default_tag_count + request.tag_count();
        if count > self.max_tags {
            return Err(RequestError::TooManyTags {
                count,
                max: self.max_tags,
            });
        }

        let line = self.formatter.format(request)?;
        debug!("Queueing metric line: {}", line.as_str().trim_end());
        self.queue.push(line);
        Ok(())
    }

    /// Stops every worker and closes every connection. Safe to call more than once.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        let mut workers = self.workers.lock().await;
        for worker in workers.iter_mut() {
            worker.stop().await;
            debug!("Stopped metrics worker for {}", worker.endpoint());
        }
        info!(
            "OpenTSDB reporter stopped, {} metric(s) left undelivered",
            self.queue.len()
        );
    }
}
