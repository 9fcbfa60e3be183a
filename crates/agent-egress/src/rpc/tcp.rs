// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batch-send call over plain TCP.
//!
//! Every message is a length-delimited JSON [`Frame`]. A client opens a call
//! with [`Frame::Open`], streams [`Frame::Batch`]es and half-closes with
//! [`Frame::Close`]; the collector answers with a single [`Frame::Status`].
//! A collector that does not serve the requested method answers the `Open`
//! directly with an `Unimplemented` status and ignores the rest of the call.
//!
//! Every write and the final status read are bounded by the dialer's I/O
//! timeout. An expired bound fails the call with `DeadlineExceeded`.

use super::{BatchStream, Channel, Code, Dialer, Method, Status};
use crate::envelope::Envelope;
use crate::metrics::EnvelopeAverager;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, trace};

/// Largest frame either side accepts.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(15);

pub type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame<'a> {
    Open { method: Cow<'a, str> },
    Batch { envelopes: Cow<'a, [Envelope]> },
    Close,
    Status(Status),
}

pub fn encode_frame(frame: &Frame<'_>) -> Result<Bytes, Status> {
    serde_json::to_vec(frame)
        .map(Bytes::from)
        .map_err(|e| Status::new(Code::InvalidArgument, format!("failed to encode frame: {e}")))
}

pub fn decode_frame(buf: &[u8]) -> Result<Frame<'static>, Status> {
    serde_json::from_slice(buf)
        .map_err(|e| Status::new(Code::InvalidArgument, format!("failed to decode frame: {e}")))
}

async fn within<T>(
    limit: Duration,
    what: &str,
    io: impl Future<Output = Result<T, Status>>,
) -> Result<T, Status> {
    tokio::time::timeout(limit, io).await.map_err(|_| {
        Status::new(
            Code::DeadlineExceeded,
            format!("{what} timed out after {limit:?}"),
        )
    })?
}

/// Wraps an accepted or dialed socket with the frame codec.
pub fn framed(stream: TcpStream) -> FramedStream {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec();
    Framed::new(stream, codec)
}

#[derive(Clone)]
pub struct TcpDialer {
    dial_timeout: Duration,
    io_timeout: Duration,
    averager: Option<Arc<EnvelopeAverager>>,
}

impl TcpDialer {
    pub fn new(dial_timeout: Duration) -> Self {
        Self {
            dial_timeout,
            io_timeout: DEFAULT_IO_TIMEOUT,
            averager: None,
        }
    }

    /// Bounds each frame write and the wait for a call's final status.
    #[must_use]
    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    /// Tracks the encoded size of every envelope sent over dialed channels.
    #[must_use]
    pub fn with_averager(mut self, averager: Arc<EnvelopeAverager>) -> Self {
        self.averager = Some(averager);
        self
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> std::io::Result<Box<dyn Channel>> {
        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("dial timed out after {:?}", self.dial_timeout),
                )
            })??;
        stream.set_nodelay(true)?;
        debug!("Dialed collector {}", addr);

        Ok(Box::new(TcpChannel {
            framed: Arc::new(Mutex::new(framed(stream))),
            io_timeout: self.io_timeout,
            averager: self.averager.clone(),
        }))
    }
}

struct TcpChannel {
    framed: Arc<Mutex<FramedStream>>,
    io_timeout: Duration,
    averager: Option<Arc<EnvelopeAverager>>,
}

#[async_trait]
impl Channel for TcpChannel {
    async fn open(&self, method: Method) -> Result<Box<dyn BatchStream>, Status> {
        let frame = encode_frame(&Frame::Open {
            method: Cow::Borrowed(method.path()),
        })?;
        within(self.io_timeout, "open", async {
            Ok::<_, Status>(self.framed.lock().await.send(frame).await?)
        })
        .await?;
        trace!("Opened {} stream", method);

        Ok(Box::new(TcpBatchStream {
            framed: Arc::clone(&self.framed),
            io_timeout: self.io_timeout,
            averager: self.averager.clone(),
            method,
            half_closed: false,
        }))
    }

    async fn close(&self) {
        let closed = within(self.io_timeout, "close", async {
            let mut framed = self.framed.lock().await;
            Ok::<_, Status>(SinkExt::<Bytes>::close(&mut *framed).await?)
        });
        if let Err(e) = closed.await {
            debug!("Error closing collector connection: {}", e);
        }
    }
}

struct TcpBatchStream {
    framed: Arc<Mutex<FramedStream>>,
    io_timeout: Duration,
    averager: Option<Arc<EnvelopeAverager>>,
    method: Method,
    half_closed: bool,
}

#[async_trait]
impl BatchStream for TcpBatchStream {
    fn method(&self) -> Method {
        self.method
    }

    async fn send(&mut self, batch: &[Envelope]) -> Result<(), Status> {
        if self.half_closed {
            return Err(Status::new(Code::Cancelled, "stream already closed"));
        }
        let frame = encode_frame(&Frame::Batch {
            envelopes: Cow::Borrowed(batch),
        })?;
        let len = frame.len();
        within(self.io_timeout, "send", async {
            Ok::<_, Status>(self.framed.lock().await.send(frame).await?)
        })
        .await?;

        if let Some(averager) = &self.averager {
            averager.track(batch.len(), len);
        }
        Ok(())
    }

    async fn close_and_recv(&mut self) -> Result<(), Status> {
        if self.half_closed {
            return Err(Status::new(Code::Cancelled, "stream already closed"));
        }
        self.half_closed = true;
        let close = encode_frame(&Frame::Close)?;

        within(self.io_timeout, "status read", async {
            let mut framed = self.framed.lock().await;
            framed.send(close).await?;

            while let Some(buf) = framed.next().await {
                match decode_frame(&buf?)? {
                    Frame::Status(status) if status.is_ok() => return Ok(()),
                    Frame::Status(status) => return Err(status),
                    other => trace!("Ignoring unexpected frame from collector: {:?}", other),
                }
            }
            Err(Status::unavailable("connection closed by collector"))
        })
        .await
    }
}
