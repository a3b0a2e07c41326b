// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One task per endpoint draining the shared queue into that endpoint's connection.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{ConnectionConfig, Endpoint};
use crate::connection::{Connector, EndpointConnection};
use crate::errors::WorkerError;
use crate::processor::process_metrics_from;
use crate::queue::{DispatchQueue, WorkloadPolicy};
use crate::sender::MetricsSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    NotStarted,
    Running,
    Stopped,
}

/// Owns the connection to one endpoint for the lifetime of the processing task.
///
/// A worker can be started once. After [`MetricsWorker::stop`] it stays stopped.
pub struct MetricsWorker {
    endpoint: Endpoint,
    queue: DispatchQueue,
    policy: WorkloadPolicy,
    max_buffer_size: usize,
    connection_config: ConnectionConfig,
    state: WorkerState,
    cancel_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MetricsWorker {
    pub fn new(
        endpoint: Endpoint,
        queue: DispatchQueue,
        policy: WorkloadPolicy,
        max_buffer_size: usize,
        connection_config: ConnectionConfig,
    ) -> Self {
        Self {
            endpoint,
            queue,
            policy,
            max_buffer_size,
            connection_config,
            state: WorkerState::NotStarted,
            cancel_token: CancellationToken::new(),
            task: None,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_running(&self) -> bool {
        self.state == WorkerState::Running
    }

    /// Connects over TCP and starts draining the queue.
    ///
    /// Fails if the first connection attempt fails, so a misconfigured endpoint is reported at
    /// start instead of as a stream of dropped sends.
    pub async fn start(&mut self) -> Result<(), WorkerError> {
        self.check_startable()?;
        let connection =
            EndpointConnection::connect(self.endpoint.clone(), self.connection_config).await?;
        self.spawn(connection);
        Ok(())
    }

    /// Same as [`MetricsWorker::start`] with a custom transport.
    pub async fn start_with_connector<C: Connector>(
        &mut self,
        connector: C,
    ) -> Result<(), WorkerError> {
        self.check_startable()?;
        let connection = EndpointConnection::with_connector(
            self.endpoint.clone(),
            self.connection_config,
            connector,
        )
        .await?;
        self.spawn(connection);
        Ok(())
    }

    fn check_startable(&self) -> Result<(), WorkerError> {
        match self.state {
            WorkerState::NotStarted => Ok(()),
            WorkerState::Running => Err(WorkerError::AlreadyRunning),
            WorkerState::Stopped => Err(WorkerError::AlreadyStopped),
        }
    }

    fn spawn<C: Connector>(&mut self, connection: EndpointConnection<C>) {
        info!("Starting metrics processing for {}", self.endpoint);
        self.state = WorkerState::Running;
        self.task = Some(tokio::spawn(run(
            connection,
            self.queue.clone(),
            self.policy,
            self.max_buffer_size,
            self.cancel_token.clone(),
        )));
    }

    /// Stops the processing task and closes the connection. Safe to call more than once.
    ///
    /// A drain cycle in progress is allowed to finish; lines still queued are left for the
    /// other workers.
    pub async fn stop(&mut self) {
        if self.state == WorkerState::Stopped {
            return;
        }
        self.state = WorkerState::Stopped;
        self.cancel_token.cancel();

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Metrics worker for {} failed to stop: {}", self.endpoint, e);
            }
        }
    }
}

impl Drop for MetricsWorker {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn run<C: Connector>(
    mut connection: EndpointConnection<C>,
    queue: DispatchQueue,
    policy: WorkloadPolicy,
    max_buffer_size: usize,
    cancel_token: CancellationToken,
) {
    while !cancel_token.is_cancelled() {
        let first = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            line = queue.take() => line,
        };

        // a panic in one cycle loses that cycle's lines, never the worker
        let cycle = AssertUnwindSafe(process_metrics_from(
            first,
            &queue,
            policy,
            max_buffer_size,
            &mut connection,
        ))
        .catch_unwind()
        .await;
        match cycle {
            Ok(processed) => {
                debug!("Processed {} metrics for {}", processed, connection.endpoint())
            }
            Err(_) => {
                error!(
                    "Unexpected panic while sending metrics to {}",
                    connection.endpoint()
                );
                // the stream halves may be poisoned, reconnect on the next send
                connection.reset();
            }
        }
    }

    info!("Stopping metrics processing for {}", connection.endpoint());
    connection.close().await;
    debug!(
        "Connection to {} closed, connected: {}",
        connection.endpoint(),
        connection.is_connected()
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::formatter::{LineFormatter, MetricRequest};
    use crate::tags::TagMap;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::io;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{ready, Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, ReadBuf};
    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout, Sleep};

    enum WriteBehavior {
        Accept,
        Panic,
        Delay(Pin<Box<Sleep>>),
    }

    /// Records accepted writes into a buffer shared with the test.
    struct TestStream {
        written: Arc<Mutex<Vec<u8>>>,
        behavior: WriteBehavior,
    }

    impl AsyncRead for TestStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for TestStream {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let this = self.get_mut();
            match &mut this.behavior {
                WriteBehavior::Accept => {}
                WriteBehavior::Panic => panic!("stream blew up mid-write"),
                WriteBehavior::Delay(delay) => ready!(delay.as_mut().poll(cx)),
            }
            this.written.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Hands out one stream per connect, in order; refuses once the script runs out.
    struct ScriptedConnector {
        written: Arc<Mutex<Vec<u8>>>,
        script: Mutex<VecDeque<WriteBehavior>>,
    }

    impl ScriptedConnector {
        fn new(script: Vec<WriteBehavior>) -> (Self, Arc<Mutex<Vec<u8>>>) {
            let written = Arc::new(Mutex::new(Vec::new()));
            let connector = Self {
                written: Arc::clone(&written),
                script: Mutex::new(script.into()),
            };
            (connector, written)
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        type Stream = TestStream;

        async fn connect(&self, _endpoint: &Endpoint) -> io::Result<TestStream> {
            let behavior = self.script.lock().unwrap().pop_front();
            match behavior {
                Some(behavior) => Ok(TestStream {
                    written: Arc::clone(&self.written),
                    behavior,
                }),
                None => Err(io::Error::from(io::ErrorKind::ConnectionRefused)),
            }
        }
    }

    fn delivered(written: &Arc<Mutex<Vec<u8>>>) -> String {
        String::from_utf8_lossy(&written.lock().unwrap()).into_owned()
    }

    async fn wait_for_delivery(written: &Arc<Mutex<Vec<u8>>>, expected: &str) {
        let wait = async {
            while !delivered(written).contains(expected) {
                sleep(Duration::from_millis(10)).await;
            }
        };
        if timeout(Duration::from_secs(5), wait).await.is_err() {
            panic!("'{}' never delivered, got '{}'", expected, delivered(written));
        }
    }

    fn line(name: &str) -> crate::formatter::MetricLine {
        let mut tags = TagMap::new();
        tags.insert("host".to_string(), "test".to_string());
        LineFormatter::new(None, &tags)
            .format_at(&MetricRequest::new(name, "1"), 1_656_581_409)
            .unwrap()
    }

    fn worker_for(port: u16, queue: DispatchQueue) -> MetricsWorker {
        MetricsWorker::new(
            Endpoint::new("127.0.0.1", port),
            queue,
            WorkloadPolicy::FullDrain,
            1500,
            ConnectionConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_worker_delivers_queued_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let queue = DispatchQueue::new();
        let mut worker = worker_for(port, queue.clone());

        worker.start().await.unwrap();
        assert!(worker.is_running());
        let (socket, _) = listener.accept().await.unwrap();

        queue.push(line("first.metric"));
        queue.push(line("second.metric"));

        let mut lines = BufReader::new(socket).lines();
        let first = timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let second = timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(first, "put first.metric 1656581409 1 host=test");
        assert_eq!(second, "put second.metric 1656581409 1 host=test");

        worker.stop().await;
        assert!(!worker.is_running());
        // the worker shuts its side of the socket down on stop
        assert_eq!(
            timeout(Duration::from_secs(5), lines.next_line())
                .await
                .unwrap()
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_start_fails_when_endpoint_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut worker = worker_for(port, DispatchQueue::new());
        let result = worker.start().await;
        assert!(matches!(result, Err(WorkerError::Connect(_))));
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut worker = worker_for(port, DispatchQueue::new());

        worker.start().await.unwrap();
        assert!(matches!(worker.start().await, Err(WorkerError::AlreadyRunning)));

        worker.stop().await;
        worker.stop().await;
        assert!(matches!(worker.start().await, Err(WorkerError::AlreadyStopped)));
    }

    #[tokio::test]
    async fn test_stop_leaves_queue_intact_when_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let queue = DispatchQueue::new();
        let mut worker = worker_for(port, queue.clone());

        worker.start().await.unwrap();
        worker.stop().await;

        queue.push(line("after.stop"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_worker_survives_panicking_cycle() {
        let (connector, written) =
            ScriptedConnector::new(vec![WriteBehavior::Panic, WriteBehavior::Accept]);
        let queue = DispatchQueue::new();
        let mut worker = worker_for(4242, queue.clone());
        worker.start_with_connector(connector).await.unwrap();

        queue.push(line("lost.in.panic"));
        sleep(Duration::from_millis(100)).await;
        assert!(queue.is_empty());
        assert!(worker.is_running());

        queue.push(line("after.panic"));
        wait_for_delivery(&written, "put after.panic 1656581409 1 host=test\n").await;
        assert!(!delivered(&written).contains("lost.in.panic"));

        worker.stop().await;
    }

    #[tokio::test]
    async fn test_stop_lets_cycle_in_flight_finish() {
        let delay = Box::pin(sleep(Duration::from_millis(200)));
        let (connector, written) = ScriptedConnector::new(vec![WriteBehavior::Delay(delay)]);
        let queue = DispatchQueue::new();
        let mut worker = worker_for(4242, queue.clone());
        worker.start_with_connector(connector).await.unwrap();

        queue.push(line("slow.write"));
        // let the worker pick the line up and block in the write
        sleep(Duration::from_millis(50)).await;
        assert!(queue.is_empty());
        assert!(delivered(&written).is_empty());

        worker.stop().await;
        assert_eq!(delivered(&written), "put slow.write 1656581409 1 host=test\n");
    }
}
