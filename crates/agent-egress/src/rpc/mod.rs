// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client-streaming batch-send call.
//!
//! A [`Dialer`] establishes a [`Channel`] to one collector. A channel opens
//! [`BatchStream`]s for a given [`Method`]; only one stream is active on a
//! channel at a time. Collectors that predate the current ingress API answer
//! the current method with [`Code::Unimplemented`].

pub mod tcp;

use crate::envelope::Envelope;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Code {
    Ok,
    Cancelled,
    InvalidArgument,
    Unimplemented,
    Internal,
    Unavailable,
    DeadlineExceeded,
}

/// Final status of a call, as reported by the collector or the transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl From<std::io::Error> for Status {
    fn from(err: std::io::Error) -> Self {
        Self::unavailable(err.to_string())
    }
}

/// The batch-send call variants a collector may expose.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    /// Current ingress API.
    BatchSender,
    /// Deprecated ingress API served by older collectors.
    LegacyBatchSender,
}

impl Method {
    pub const fn path(self) -> &'static str {
        match self {
            Self::BatchSender => "agent.v2.Ingress/BatchSender",
            Self::LegacyBatchSender => "agent.v2.LegacyIngress/BatchSender",
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            "agent.v2.Ingress/BatchSender" => Some(Self::BatchSender),
            "agent.v2.LegacyIngress/BatchSender" => Some(Self::LegacyBatchSender),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Open half of a client-streaming call.
#[async_trait]
pub trait BatchStream: Send {
    /// The method this stream was opened for.
    fn method(&self) -> Method;

    async fn send(&mut self, batch: &[Envelope]) -> Result<(), Status>;

    /// Half-closes the stream and waits for the collector's final status.
    /// The stream cannot carry data afterwards.
    async fn close_and_recv(&mut self) -> Result<(), Status>;
}

/// Established transport connection to one collector.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn open(&self, method: Method) -> Result<Box<dyn BatchStream>, Status>;

    async fn close(&self);
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> std::io::Result<Box<dyn Channel>>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory collector used by unit tests.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    pub struct CollectorState {
        /// Batches received per method.
        pub batches: Mutex<Vec<(Method, Vec<Envelope>)>>,
        /// Every stream opened, in order, per address.
        pub opened: Mutex<Vec<(String, Method)>>,
        pub dials: AtomicUsize,
        pub open_channels: AtomicUsize,
    }

    /// How the mock collector at an address behaves.
    #[derive(Clone, Copy, Debug)]
    pub enum Behavior {
        Current,
        Legacy,
        RefuseDial,
        FailOpen,
        FailSend,
    }

    #[derive(Clone)]
    pub struct MockDialer {
        pub state: Arc<CollectorState>,
        behavior: Arc<Mutex<std::collections::HashMap<String, Behavior>>>,
        default_behavior: Behavior,
    }

    impl MockDialer {
        pub fn new(default_behavior: Behavior) -> Self {
            Self {
                state: Arc::new(CollectorState::default()),
                behavior: Arc::new(Mutex::new(std::collections::HashMap::new())),
                default_behavior,
            }
        }

        pub fn set_behavior(&self, addr: &str, behavior: Behavior) {
            self.behavior
                .lock()
                .unwrap()
                .insert(addr.to_string(), behavior);
        }

        fn behavior_for(&self, addr: &str) -> Behavior {
            self.behavior
                .lock()
                .unwrap()
                .get(addr)
                .copied()
                .unwrap_or(self.default_behavior)
        }

        pub fn batch_count(&self) -> usize {
            self.state.batches.lock().unwrap().len()
        }

        pub fn opened(&self) -> Vec<(String, Method)> {
            self.state.opened.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Dialer for MockDialer {
        async fn dial(&self, addr: &str) -> std::io::Result<Box<dyn Channel>> {
            self.state.dials.fetch_add(1, Ordering::SeqCst);
            let behavior = self.behavior_for(addr);
            if let Behavior::RefuseDial = behavior {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                ));
            }
            self.state.open_channels.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockChannel {
                addr: addr.to_string(),
                behavior,
                state: Arc::clone(&self.state),
            }))
        }
    }

    struct MockChannel {
        addr: String,
        behavior: Behavior,
        state: Arc<CollectorState>,
    }

    #[async_trait]
    impl Channel for MockChannel {
        async fn open(&self, method: Method) -> Result<Box<dyn BatchStream>, Status> {
            self.state
                .opened
                .lock()
                .unwrap()
                .push((self.addr.clone(), method));
            if let Behavior::FailOpen = self.behavior {
                return Err(Status::unavailable("stream refused"));
            }
            Ok(Box::new(MockStream {
                method,
                behavior: self.behavior,
                state: Arc::clone(&self.state),
            }))
        }

        async fn close(&self) {
            self.state.open_channels.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct MockStream {
        method: Method,
        behavior: Behavior,
        state: Arc<CollectorState>,
    }

    impl MockStream {
        fn unimplemented(&self) -> bool {
            matches!(self.behavior, Behavior::Legacy) && self.method == Method::BatchSender
        }
    }

    #[async_trait]
    impl BatchStream for MockStream {
        fn method(&self) -> Method {
            self.method
        }

        async fn send(&mut self, batch: &[Envelope]) -> Result<(), Status> {
            if self.unimplemented() {
                return Err(Status::new(Code::Unimplemented, "unknown method"));
            }
            if let Behavior::FailSend = self.behavior {
                return Err(Status::unavailable("broken pipe"));
            }
            self.state
                .batches
                .lock()
                .unwrap()
                .push((self.method, batch.to_vec()));
            Ok(())
        }

        async fn close_and_recv(&mut self) -> Result<(), Status> {
            if self.unimplemented() {
                return Err(Status::new(Code::Unimplemented, "unknown method"));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_paths_round_trip() {
        for method in [Method::BatchSender, Method::LegacyBatchSender] {
            assert_eq!(Method::from_path(method.path()), Some(method));
        }
        assert_eq!(Method::from_path("agent.v1.Ingress/Send"), None);
    }

    #[test]
    fn test_status_display() {
        let status = Status::new(Code::Unimplemented, "unknown method");
        assert_eq!(status.to_string(), "Unimplemented: unknown method");
        assert!(!status.is_ok());
        assert!(Status::ok().is_ok());
    }
}
