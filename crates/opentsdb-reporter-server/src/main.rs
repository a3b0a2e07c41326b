// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, io, net::SocketAddr, sync::Arc};

use futures::StreamExt;
use tokio::{
    io::AsyncWriteExt,
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
};
use tokio_util::{
    codec::{FramedRead, LinesCodec, LinesCodecError},
    sync::CancellationToken,
};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use opentsdb_reporter::{
    config::ReporterConfig,
    errors::RequestError,
    reporter::{OpenTsDbReporter, Reply, ReporterRequest},
};

const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:4243";
const MAX_REQUEST_LENGTH: usize = 8192;

#[tokio::main]
pub async fn main() {
    let log_level = env::var("TSDB_REPORTER_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(log_level).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match ReporterConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Error creating reporter configuration: {e}");
            return;
        }
    };

    let address = env::var("TSDB_REPORTER_ADDRESS").unwrap_or(DEFAULT_LISTEN_ADDRESS.to_string());
    let listener = match TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Unable to listen on {address}: {e}");
            return;
        }
    };

    let reporter = match OpenTsDbReporter::start(config).await {
        Ok(reporter) => Arc::new(reporter),
        Err(e) => {
            error!("Error starting OpenTSDB reporter: {e}");
            return;
        }
    };
    info!("Accepting metric requests on {address}");

    let cancel_token = CancellationToken::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_client(
                        stream,
                        peer,
                        Arc::clone(&reporter),
                        cancel_token.clone(),
                        MAX_REQUEST_LENGTH,
                    ));
                }
                Err(e) => error!("Failed to accept client connection: {e}"),
            },
        }
    }

    cancel_token.cancel();
    reporter.stop().await;
}

/// Answers one reply line per request line until the client hangs up.
///
/// Requests longer than `max_request_length` bytes are answered with an error and discarded.
async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    reporter: Arc<OpenTsDbReporter>,
    cancel_token: CancellationToken,
    max_request_length: usize,
) {
    debug!("Client connected from {peer}");
    let (reader, mut writer) = stream.into_split();
    let codec = LinesCodec::new_with_max_length(max_request_length);
    let mut requests = FramedRead::new(reader, codec);

    loop {
        let next = tokio::select! {
            _ = cancel_token.cancelled() => break,
            next = requests.next() => next,
        };
        let result = match next {
            Some(Ok(line)) if line.trim().is_empty() => continue,
            Some(Ok(line)) => handle_line(&reporter, &line),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => Err(RequestError::Malformed(
                format!("request exceeds {max_request_length} bytes"),
            )),
            Some(Err(LinesCodecError::Io(e))) => {
                error!("Failed to read request from {peer}: {e}");
                break;
            }
            None => break,
        };

        if let Err(e) = write_reply(&mut writer, Reply::from(result)).await {
            error!("Failed to write reply to {peer}: {e}");
            break;
        }
    }
    debug!("Client {peer} disconnected");
}

async fn write_reply(writer: &mut OwnedWriteHalf, reply: Reply) -> io::Result<()> {
    let mut body = serde_json::to_vec(&reply)?;
    body.push(b'\n');
    writer.write_all(&body).await
}

fn handle_line(reporter: &OpenTsDbReporter, line: &str) -> Result<(), RequestError> {
    let request: ReporterRequest =
        serde_json::from_str(line).map_err(|e| RequestError::Malformed(e.to_string()))?;
    reporter.handle(&request)
}
