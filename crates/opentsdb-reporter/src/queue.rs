// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The shared FIFO of formatted lines and the rule for splitting it between workers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::errors::ReporterError;
use crate::formatter::MetricLine;

/// How many lines a worker takes per wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadPolicy {
    /// The only worker drains everything that is queued.
    FullDrain,
    /// Several workers share the queue; each takes roughly its share so siblings progress too.
    Split { workers: usize },
}

impl WorkloadPolicy {
    pub fn for_workers(workers: usize) -> Result<Self, ReporterError> {
        match workers {
            0 => Err(ReporterError::InvalidConfig(
                "You can't ever have less than one worker".to_string(),
            )),
            1 => Ok(Self::FullDrain),
            workers => Ok(Self::Split { workers }),
        }
    }

    /// Lines to process in one wake given `queued` lines, the waking line included.
    pub fn drain_quota(&self, queued: usize) -> usize {
        match self {
            Self::FullDrain => queued,
            Self::Split { workers } => queued.div_ceil(*workers).max(1),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    lines: Mutex<VecDeque<MetricLine>>,
    notify: Notify,
}

/// Unbounded multi-producer, multi-consumer FIFO of metric lines.
///
/// Cloning yields another handle to the same queue.
#[derive(Debug, Clone, Default)]
pub struct DispatchQueue {
    inner: Arc<Inner>,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lines(&self) -> MutexGuard<'_, VecDeque<MetricLine>> {
        // the deque is never left half-modified, so a poisoned lock is still usable
        self.inner
            .lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, line: MetricLine) {
        self.lines().push_back(line);
        self.inner.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lines().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines().is_empty()
    }

    /// Waits until a line is available and removes it.
    ///
    /// Cancel safe: dropping the future never loses a line.
    pub async fn take(&self) -> MetricLine {
        loop {
            let notified = self.inner.notify.notified();
            let next = self.lines().pop_front();
            if let Some(line) = next {
                return line;
            }
            notified.await;
        }
    }

    /// Moves up to `max` queued lines into `out` without waiting. Returns how many were moved.
    pub fn drain_into(&self, out: &mut Vec<MetricLine>, max: usize) -> usize {
        let mut lines = self.lines();
        let count = max.min(lines.len());
        out.extend(lines.drain(..count));
        let remaining = !lines.is_empty();
        drop(lines);

        // pass the wake along so an idle sibling picks up what this worker left behind
        if remaining {
            self.inner.notify.notify_one();
        }
        count
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::formatter::{LineFormatter, MetricRequest};
    use crate::tags::TagMap;
    use std::time::Duration;
    use tokio::time::timeout;

    fn line(name: &str) -> MetricLine {
        let mut tags = TagMap::new();
        tags.insert("host".to_string(), "test".to_string());
        LineFormatter::new(None, &tags)
            .format_at(&MetricRequest::new(name, "1"), 0)
            .unwrap()
    }

    #[test]
    fn test_workload_policy() {
        assert!(WorkloadPolicy::for_workers(0).is_err());
        assert_eq!(
            WorkloadPolicy::for_workers(1).unwrap(),
            WorkloadPolicy::FullDrain
        );
        assert_eq!(
            WorkloadPolicy::for_workers(3).unwrap(),
            WorkloadPolicy::Split { workers: 3 }
        );
    }

    #[test]
    fn test_drain_quota() {
        assert_eq!(WorkloadPolicy::FullDrain.drain_quota(7), 7);
        let split = WorkloadPolicy::Split { workers: 2 };
        assert_eq!(split.drain_quota(4), 2);
        assert_eq!(split.drain_quota(5), 3);
        assert_eq!(split.drain_quota(1), 1);
        assert_eq!(WorkloadPolicy::Split { workers: 8 }.drain_quota(3), 1);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = DispatchQueue::new();
        queue.push(line("a"));
        queue.push(line("b"));
        queue.push(line("c"));

        assert_eq!(queue.take().await, line("a"));
        let mut out = Vec::new();
        assert_eq!(queue.drain_into(&mut out, 10), 2);
        assert_eq!(out, vec![line("b"), line("c")]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_drain_respects_max() {
        let queue = DispatchQueue::new();
        for name in ["a", "b", "c"] {
            queue.push(line(name));
        }

        let mut out = Vec::new();
        assert_eq!(queue.drain_into(&mut out, 1), 1);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_take_waits_for_push() {
        let queue = DispatchQueue::new();
        assert!(timeout(Duration::from_millis(50), queue.take())
            .await
            .is_err());

        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(line("late"));
        });

        let taken = timeout(Duration::from_secs(1), queue.take())
            .await
            .expect("take should complete after push");
        assert_eq!(taken, line("late"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumers_take_every_line_once() {
        let queue = DispatchQueue::new();
        let mut consumers = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            consumers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Ok(line) = timeout(Duration::from_millis(200), queue.take()).await {
                    seen.push(line);
                }
                seen
            }));
        }

        for i in 0..200 {
            queue.push(line(&format!("m{i}")));
        }

        let mut total = 0;
        for consumer in consumers {
            total += consumer.await.unwrap().len();
        }
        assert_eq!(total, 200);
        assert!(queue.is_empty());
    }
}
