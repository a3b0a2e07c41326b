// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ships metric data points to OpenTSDB-compatible time-series endpoints.
//!
//! Producers submit `add` requests to an [`reporter::OpenTsDbReporter`]. Each request is
//! validated, rendered into a `put` line by the [`formatter::LineFormatter`] and pushed onto a
//! shared [`queue::DispatchQueue`]. One [`worker::MetricsWorker`] per endpoint drains that queue,
//! packs lines into buffers no larger than the configured MTU and writes them through a
//! [`connection::EndpointConnection`], which reconnects on failure and stops sending while the
//! endpoint is flapping.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod connection;
pub mod constants;
pub mod errors;
pub mod formatter;
pub mod processor;
pub mod queue;
pub mod reporter;
pub mod sender;
pub mod stats;
pub mod tags;
pub mod util;
pub mod worker;
