// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A self-healing connection to one OpenTSDB endpoint.
//!
//! The connection is owned by a single worker task, so the socket halves and the health-probe
//! state need no locking. Only the counters in [`ConnectionStats`] are shared, with the monitor
//! tasks spawned alongside the connection.
//!
//! Delivery is best effort. A buffer is written at most [`MAX_SEND_ATTEMPTS`] times, reconnecting
//! between attempts, and is dropped once attempts run out or while the endpoint is in its quiet
//! period.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::config::{ConnectionConfig, Endpoint};
use crate::constants::{MAX_SEND_ATTEMPTS, READ_BUFFER_SIZE};
use crate::errors::ConnectError;
use crate::sender::MetricsSender;
use crate::stats::{ConnectionStats, Monitors};

/// Opens byte streams to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn connect(&self, endpoint: &Endpoint) -> io::Result<Self::Stream>;
}

/// Plain TCP with keep-alive on and Nagle's algorithm off.
#[derive(Debug, Clone, Copy)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, endpoint: &Endpoint) -> io::Result<TcpStream> {
        timeout(self.connect_timeout, connect_tcp(endpoint))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("timed out connecting to {endpoint}"),
                )
            })?
    }
}

async fn connect_tcp(endpoint: &Endpoint) -> io::Result<TcpStream> {
    let mut last_error = None;
    for addr in lookup_host((endpoint.host.as_str(), endpoint.port)).await? {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(true)?;
        match socket.connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for {endpoint}"),
        )
    }))
}

pub struct EndpointConnection<C: Connector = TcpConnector> {
    endpoint: Endpoint,
    connector: C,
    config: ConnectionConfig,
    reader: Option<ReadHalf<C::Stream>>,
    writer: Option<WriteHalf<C::Stream>>,
    read_buffer: Box<[u8]>,
    last_read: Instant,
    stats: Arc<ConnectionStats>,
    monitors: Monitors,
}

impl EndpointConnection<TcpConnector> {
    /// Connects to `endpoint` over TCP, failing fast if the first attempt does not succeed.
    pub async fn connect(
        endpoint: Endpoint,
        config: ConnectionConfig,
    ) -> Result<Self, ConnectError> {
        let connector = TcpConnector::new(config.connect_timeout);
        Self::with_connector(endpoint, config, connector).await
    }
}

impl<C: Connector> EndpointConnection<C> {
    pub async fn with_connector(
        endpoint: Endpoint,
        config: ConnectionConfig,
        connector: C,
    ) -> Result<Self, ConnectError> {
        let stream = connector.connect(&endpoint).await.map_err(|source| {
            error!("Failed to acquire connection to OpenTSDB {}: {}", endpoint, source);
            ConnectError {
                host: endpoint.host.clone(),
                port: endpoint.port,
                source,
            }
        })?;

        let stats = Arc::new(ConnectionStats::new());
        let monitors = Monitors::spawn(
            endpoint.to_string(),
            Arc::clone(&stats),
            config.reporting_interval,
            config.quiet_period_window,
            config.max_disconnects_before_quiet_period,
        );

        let mut connection = Self {
            endpoint,
            connector,
            config,
            reader: None,
            writer: None,
            read_buffer: vec![0; READ_BUFFER_SIZE].into_boxed_slice(),
            last_read: Instant::now(),
            stats,
            monitors,
        };
        connection.attach(stream);
        Ok(connection)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    fn attach(&mut self, stream: C::Stream) {
        let (reader, writer) = split(stream);
        self.reader = Some(reader);
        self.writer = Some(writer);
        self.stats.record_connect();
        info!(
            "Connected to host: {} port: {}",
            self.endpoint.host, self.endpoint.port
        );
    }

    async fn reconnect(&mut self) -> bool {
        // never keep stale socket state around
        self.disconnect().await;

        match self.connector.connect(&self.endpoint).await {
            Ok(stream) => {
                self.attach(stream);
                true
            }
            Err(e) => {
                error!(
                    "Failed to acquire connection to OpenTSDB {}: {}",
                    self.endpoint, e
                );
                false
            }
        }
    }

    /// Writes `data` once. On failure the socket is torn down and the disconnect recorded.
    async fn write_to_stream(&mut self, data: &[u8]) -> bool {
        let Some(writer) = self.writer.as_mut() else {
            return false;
        };

        let write = async {
            writer.write_all(data).await?;
            writer.flush().await
        };
        let result = match timeout(self.config.write_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
        };

        match result {
            Ok(()) => {
                self.stats.record_send();
                if let Err(e) = self.check_write_errors().await {
                    // the bytes were handed to the socket, only the connection is lost
                    error!("Health check on {} failed: {}", self.endpoint, e);
                    self.stats.record_disconnect();
                    self.disconnect().await;
                }
                true
            }
            Err(e) => {
                error!(
                    "Failed writing {} bytes to {}: {}",
                    data.len(),
                    self.endpoint,
                    e
                );
                self.stats.record_disconnect();
                self.disconnect().await;
                false
            }
        }
    }

    /// Drains whatever the endpoint wrote back, at most once per health-check interval.
    ///
    /// OpenTSDB writes errors back on the same socket; if nobody reads them its outbound buffers
    /// grow without bound.
    async fn check_write_errors(&mut self) -> io::Result<()> {
        if self.last_read.elapsed() < self.config.health_check_interval {
            return Ok(());
        }
        self.last_read = Instant::now();

        let Some(reader) = self.reader.as_mut() else {
            return Ok(());
        };

        match timeout(self.config.read_timeout, reader.read(&mut self.read_buffer)).await {
            Err(_) => {
                debug!(
                    "No errors read from {} in the last {:?}",
                    self.endpoint, self.config.health_check_interval
                );
                Ok(())
            }
            Ok(Ok(0)) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "saw EOF on the socket, probably closed",
            )),
            Ok(Ok(count)) => {
                error!(
                    "Got error response from OpenTSDB {}, error: {}",
                    self.endpoint,
                    String::from_utf8_lossy(&self.read_buffer[..count]).trim_end()
                );
                Ok(())
            }
            Ok(Err(e)) => Err(e),
        }
    }

    fn drop_data(&self, data: &[u8]) {
        self.stats.record_drop();
        error!("Failed to write {} bytes to {}", data.len(), self.endpoint);
    }

    /// Releases the socket. Each half is released on its own so one failure cannot leak the
    /// other; errors are logged and swallowed.
    async fn disconnect(&mut self) {
        if self.reader.take().is_some() {
            debug!("Closed input stream to {}", self.endpoint);
        }

        if let Some(mut writer) = self.writer.take() {
            match timeout(self.config.write_timeout, writer.shutdown()).await {
                Ok(Ok(())) => debug!("Closed output stream to {}", self.endpoint),
                Ok(Err(e)) => error!(
                    "close - encountered problems closing output stream to {}: {}",
                    self.endpoint, e
                ),
                Err(_) => error!(
                    "close - timed out closing output stream to {}",
                    self.endpoint
                ),
            }
        }
    }

    /// Abandons the socket without shutting it down, so the next send reconnects.
    ///
    /// Used after a send was interrupted by a panic, when the stream halves may be unusable.
    pub fn reset(&mut self) {
        let had_socket = self.writer.take().is_some();
        self.reader = None;
        if had_socket {
            self.stats.record_disconnect();
            warn!("Discarded connection to {} after an interrupted send", self.endpoint);
        }
    }

    /// Closes the socket and stops the monitor tasks. Safe to call more than once.
    pub async fn close(&mut self) {
        self.disconnect().await;
        self.monitors.stop();
    }
}

#[async_trait]
impl<C: Connector> MetricsSender for EndpointConnection<C> {
    async fn send_data(&mut self, data: &[u8]) {
        if self.stats.in_quiet_period() {
            self.stats.record_drop();
            error!(
                "Throwing away {} bytes of metrics for {} due to quiet period",
                data.len(),
                self.endpoint
            );
            return;
        }

        // already known down: one reconnect, no retry ladder, so a real outage stays cheap
        if !self.is_connected() {
            warn!(
                "Lost connection to {}, attempting to reconnect and send",
                self.endpoint
            );
            if !(self.reconnect().await && self.write_to_stream(data).await) {
                self.drop_data(data);
            }
            return;
        }

        for attempt in 1..=MAX_SEND_ATTEMPTS {
            if self.write_to_stream(data).await {
                return;
            }
            if attempt < MAX_SEND_ATTEMPTS && !self.reconnect().await {
                break;
            }
        }

        self.disconnect().await;
        self.drop_data(data);
    }

    fn is_connected(&self) -> bool {
        self.writer.is_some()
    }
}
