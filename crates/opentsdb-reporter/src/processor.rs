// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Drains queued lines and packs them into buffers sized for the network.

use std::io::Write;

use tracing::{error, trace};

use crate::formatter::MetricLine;
use crate::queue::{DispatchQueue, WorkloadPolicy};
use crate::sender::MetricsSender;

/// Waits for queued lines, then sends this worker's share of them in buffers of at most
/// `max_buffer_size` bytes. Returns the number of lines processed.
///
/// The wait for the first line is the only point where an idle worker suspends.
pub async fn process_metrics<S>(
    queue: &DispatchQueue,
    policy: WorkloadPolicy,
    max_buffer_size: usize,
    sender: &mut S,
) -> usize
where
    S: MetricsSender + ?Sized,
{
    let first = queue.take().await;
    process_metrics_from(first, queue, policy, max_buffer_size, sender).await
}

/// Same as [`process_metrics`] for a worker that already took `first` off the queue.
pub async fn process_metrics_from<S>(
    first: MetricLine,
    queue: &DispatchQueue,
    policy: WorkloadPolicy,
    max_buffer_size: usize,
    sender: &mut S,
) -> usize
where
    S: MetricsSender + ?Sized,
{
    // snapshot once so the share is not recomputed while siblings drain
    let queued = queue.len() + 1;
    let quota = policy.drain_quota(queued);

    let mut drained = Vec::with_capacity(quota);
    drained.push(first);
    queue.drain_into(&mut drained, quota.saturating_sub(1));
    trace!("Drained {} of {} queued metrics", drained.len(), queued);

    send_in_batches(&drained, max_buffer_size, sender).await;
    drained.len()
}

/// Sends `lines` in order, flushing whenever the next line would push the buffer past
/// `max_buffer_size`. A line is never split, so one longer than the limit goes out on its own.
pub async fn send_in_batches<S>(lines: &[MetricLine], max_buffer_size: usize, sender: &mut S)
where
    S: MetricsSender + ?Sized,
{
    let mut buffer: Vec<u8> = Vec::with_capacity(max_buffer_size);

    for line in lines {
        let bytes = line.as_bytes();

        if !buffer.is_empty() && buffer.len() + bytes.len() > max_buffer_size {
            sender.send_data(&buffer).await;
            buffer.clear();
        }

        if let Err(e) = buffer.write_all(bytes) {
            // give up on this batch rather than send a partial line
            error!("Failed to write metric to buffer, dropping batch: {}", e);
            buffer.clear();
        }
    }

    if !buffer.is_empty() {
        sender.send_data(&buffer).await;
    }
}
