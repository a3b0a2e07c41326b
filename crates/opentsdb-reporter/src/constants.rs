// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Default OpenTSDB endpoint host
pub const DEFAULT_HOST: &str = "localhost";

/// Default OpenTSDB telnet-style port
pub const DEFAULT_PORT: u16 = 4242;

/// One Ethernet MTU
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1500;

/// OpenTSDB rejects data points carrying more tags than this by default
pub const DEFAULT_MAX_TAGS: usize = 8;

/// The only command understood by the reporter
pub const ADD_COMMAND: &str = "add";

/// Total write attempts per buffer before it is dropped.
///
/// OpenTSDB often disconnects idle clients and a dead socket is only reliably detected on a
/// failed write, so one retry after reconnecting covers the common case.
pub const MAX_SEND_ATTEMPTS: u32 = 2;

/// Disconnects tolerated inside one breaker window before sends are suspended
pub const MAX_DISCONNECTS_BEFORE_QUIET_PERIOD: u32 = 5;

pub const READ_TIMEOUT: Duration = Duration::from_millis(500);
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);
pub const REPORTING_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const QUIET_PERIOD_WINDOW: Duration = Duration::from_secs(5);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Size of the buffer used to drain error responses written back by the endpoint
pub const READ_BUFFER_SIZE: usize = 10 * 1024;
