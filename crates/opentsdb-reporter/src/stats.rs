// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Connection counters and the quiet-period breaker.
//!
//! The send path only increments counters and reads the quiet-period flag. Two periodic monitor
//! tasks own the windows: the reporting monitor snapshots counters for the logs and the breaker
//! monitor decides whether sends should be suspended. Everything shared between them is atomic.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
pub struct ConnectionStats {
    connects: AtomicU32,
    disconnects_for_reporting: AtomicU32,
    disconnects_for_quiet_period: AtomicU32,
    successful_sends: AtomicU32,
    dropped_sends: AtomicU32,
    in_quiet_period: AtomicBool,
}

/// Counters accumulated over one reporting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportSnapshot {
    pub connects: u32,
    pub disconnects: u32,
    pub successful_sends: u32,
    pub dropped_sends: u32,
}

/// Outcome of evaluating one breaker window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuietPeriodTransition {
    Entered { disconnects: u32 },
    Exited,
    Unchanged,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self) {
        self.disconnects_for_reporting.fetch_add(1, Ordering::Relaxed);
        self.disconnects_for_quiet_period.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send(&self) {
        self.successful_sends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.dropped_sends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn in_quiet_period(&self) -> bool {
        self.in_quiet_period.load(Ordering::Acquire)
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::Relaxed)
    }

    pub fn disconnects(&self) -> u32 {
        self.disconnects_for_reporting.load(Ordering::Relaxed)
    }

    pub fn successful_sends(&self) -> u32 {
        self.successful_sends.load(Ordering::Relaxed)
    }

    pub fn dropped_sends(&self) -> u32 {
        self.dropped_sends.load(Ordering::Relaxed)
    }

    /// Returns the reporting window counters and starts a new window.
    pub fn take_report(&self) -> ReportSnapshot {
        ReportSnapshot {
            connects: self.connects.swap(0, Ordering::Relaxed),
            disconnects: self.disconnects_for_reporting.swap(0, Ordering::Relaxed),
            successful_sends: self.successful_sends.swap(0, Ordering::Relaxed),
            dropped_sends: self.dropped_sends.swap(0, Ordering::Relaxed),
        }
    }

    /// Closes the current breaker window.
    ///
    /// More than `threshold` disconnects in the window enters (or keeps) the quiet period. A
    /// window at or below the threshold ends a quiet period that is in effect.
    pub fn evaluate_quiet_period(&self, threshold: u32) -> QuietPeriodTransition {
        let disconnects = self.disconnects_for_quiet_period.swap(0, Ordering::Relaxed);
        if disconnects > threshold {
            self.in_quiet_period.store(true, Ordering::Release);
            QuietPeriodTransition::Entered { disconnects }
        } else if self.in_quiet_period.swap(false, Ordering::AcqRel) {
            QuietPeriodTransition::Exited
        } else {
            QuietPeriodTransition::Unchanged
        }
    }
}

/// Periodic tasks watching one connection. Stopped when the token is cancelled.
#[derive(Debug)]
pub struct Monitors {
    cancel_token: CancellationToken,
    reporting: JoinHandle<()>,
    breaker: JoinHandle<()>,
}

impl Monitors {
    pub fn spawn(
        endpoint: String,
        stats: Arc<ConnectionStats>,
        reporting_interval: Duration,
        quiet_period_window: Duration,
        max_disconnects: u32,
    ) -> Self {
        let cancel_token = CancellationToken::new();
        let reporting = tokio::spawn(run_reporting(
            endpoint.clone(),
            Arc::clone(&stats),
            reporting_interval,
            cancel_token.clone(),
        ));
        let breaker = tokio::spawn(run_breaker(
            endpoint,
            stats,
            quiet_period_window,
            max_disconnects,
            cancel_token.clone(),
        ));
        Self {
            cancel_token,
            reporting,
            breaker,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.reporting.is_finished() && self.breaker.is_finished()
    }

    pub fn stop(&self) {
        self.cancel_token.cancel();
    }
}

impl Drop for Monitors {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn run_reporting(
    endpoint: String,
    stats: Arc<ConnectionStats>,
    period: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // discard first tick, which is instantaneous

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                let report = stats.take_report();
                if report.disconnects > 0 {
                    error!(
                        "{}: Observed {} disconnects and {} connects, with {} successful sends and {} dropped",
                        endpoint, report.disconnects, report.connects, report.successful_sends, report.dropped_sends
                    );
                } else {
                    info!(
                        "{}: Sent {} times without disconnect, {} dropped",
                        endpoint, report.successful_sends, report.dropped_sends
                    );
                }
            }
        }
    }
    debug!("{}: reporting monitor stopped", endpoint);
}

async fn run_breaker(
    endpoint: String,
    stats: Arc<ConnectionStats>,
    window: Duration,
    max_disconnects: u32,
    cancel_token: CancellationToken,
) {
    let mut ticker = interval(window);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => match stats.evaluate_quiet_period(max_disconnects) {
                QuietPeriodTransition::Entered { disconnects } => error!(
                    "{}: Entering quiet period, had {} disconnects in a {:?} period",
                    endpoint, disconnects, window
                ),
                QuietPeriodTransition::Exited => warn!("{}: Exiting quiet period", endpoint),
                QuietPeriodTransition::Unchanged => {}
            },
        }
    }
    debug!("{}: breaker monitor stopped", endpoint);
}
