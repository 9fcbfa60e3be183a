// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::envelope::Envelope;
use crate::errors::ConnectError;
use crate::health::{HealthRegistrar, DOPPLER_CONNECTIONS, DOPPLER_V2_STREAMS};
use crate::rpc::{BatchStream, Channel, Code, Dialer, Method, Status};
use std::sync::Arc;
use tracing::{info, warn};

/// Dials collectors and negotiates which batch-send method to use.
#[derive(Clone)]
pub struct SenderFetcher {
    dialer: Arc<dyn Dialer>,
    health: Arc<dyn HealthRegistrar>,
}

impl SenderFetcher {
    pub fn new(health: Arc<dyn HealthRegistrar>, dialer: Arc<dyn Dialer>) -> Self {
        SenderFetcher { dialer, health }
    }

    /// Dials `addr` and opens the stream all traffic on the connection will use.
    ///
    /// Health counters are only incremented once the stream is open, and the
    /// returned connection decrements them when it goes away.
    pub async fn fetch(&self, addr: &str) -> Result<Connection, ConnectError> {
        let channel = self
            .dialer
            .dial(addr)
            .await
            .map_err(|source| ConnectError::Dial {
                addr: addr.to_string(),
                source,
            })?;

        let stream = match open_stream(channel.as_ref()).await {
            Ok(stream) => stream,
            Err(status) => {
                channel.close().await;
                return Err(ConnectError::ProtocolOpen {
                    addr: addr.to_string(),
                    status,
                });
            }
        };

        self.health.inc(DOPPLER_CONNECTIONS);
        self.health.inc(DOPPLER_V2_STREAMS);

        info!("successfully established a stream to collector {}", addr);

        Ok(Connection {
            addr: addr.to_string(),
            stream,
            closer: DecrementingCloser {
                channel,
                health: Arc::clone(&self.health),
            },
        })
    }
}

/// Tries the current method with an empty call. Collectors that answer
/// `Unimplemented` only speak the legacy method, which is then used for the
/// lifetime of the connection. Otherwise the spent trial call is discarded and a
/// fresh current-method stream is opened.
async fn open_stream(channel: &dyn Channel) -> Result<Box<dyn BatchStream>, Status> {
    let mut trial = channel.open(Method::BatchSender).await?;

    if let Err(status) = trial.close_and_recv().await {
        if status.code == Code::Unimplemented {
            warn!("failed to open stream, falling back to legacy API");
            return channel.open(Method::LegacyBatchSender).await;
        }
    }

    channel.open(Method::BatchSender).await
}

/// An open batch stream and the connection carrying it.
pub struct Connection {
    addr: String,
    stream: Box<dyn BatchStream>,
    closer: DecrementingCloser,
}

impl Connection {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn method(&self) -> Method {
        self.stream.method()
    }

    pub async fn send(&mut self, batch: &[Envelope]) -> Result<(), Status> {
        self.stream.send(batch).await
    }

    pub async fn close(self) {
        self.closer.close().await;
    }
}

/// Closes the channel and releases the health counters taken for it. The
/// counters are also released if the connection is dropped without `close`.
struct DecrementingCloser {
    channel: Box<dyn Channel>,
    health: Arc<dyn HealthRegistrar>,
}

impl DecrementingCloser {
    async fn close(self) {
        self.channel.close().await;
    }
}

impl Drop for DecrementingCloser {
    fn drop(&mut self) {
        self.health.dec(DOPPLER_CONNECTIONS);
        self.health.dec(DOPPLER_V2_STREAMS);
    }
}
