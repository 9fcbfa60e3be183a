// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Owner of one rotating connection slot.
//!
//! A manager replaces its connection when a write fails, when the connection
//! has carried `max_writes` batches, or when it is older than `max_age`. The
//! write ceiling is jittered per manager so that managers, and agents, do not
//! reconnect in lockstep.

use super::connector::Connector;
use super::sender_fetcher::Connection;
use crate::envelope::Envelope;
use crate::errors::WriteError;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct ConnManagerConfig {
    /// Batches a single connection may carry before it is replaced.
    pub max_writes: u64,
    /// How often the manager checks its slot when nothing wakes it earlier.
    pub poll_interval: Duration,
    /// Age after which a healthy connection is replaced anyway.
    pub max_age: Duration,
}

impl Default for ConnManagerConfig {
    fn default() -> Self {
        Self {
            max_writes: 100_000,
            poll_interval: Duration::from_secs(1),
            max_age: Duration::from_secs(300),
        }
    }
}

impl ConnManagerConfig {
    /// Write ceiling of `base` plus a random offset in `0..jitter`.
    pub fn jittered(base: u64, jitter: u64, poll_interval: Duration, max_age: Duration) -> Self {
        let offset = if jitter == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..jitter)
        };
        Self {
            max_writes: base + offset,
            poll_interval,
            max_age,
        }
    }
}

struct Slot {
    connection: Connection,
    writes: u64,
    created: Instant,
}

impl Slot {
    fn new(connection: Connection) -> Self {
        Self {
            connection,
            writes: 0,
            created: Instant::now(),
        }
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    config: ConnManagerConfig,
    slot: Mutex<Option<Slot>>,
    ready: AtomicBool,
    reconnect: Notify,
}

#[derive(Clone)]
pub struct ConnManager {
    inner: Arc<Inner>,
}

impl ConnManager {
    pub fn new(connector: Arc<dyn Connector>, config: ConnManagerConfig) -> Self {
        ConnManager {
            inner: Arc::new(Inner {
                connector,
                config,
                slot: Mutex::new(None),
                ready: AtomicBool::new(false),
                reconnect: Notify::new(),
            }),
        }
    }

    pub fn max_writes(&self) -> u64 {
        self.inner.config.max_writes
    }

    /// Whether the manager currently holds an open connection.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    /// Spawns the task that keeps the slot filled.
    pub fn start(&self) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                manager.maintain().await;
                tokio::select! {
                    _ = tokio::time::sleep(manager.inner.config.poll_interval) => {}
                    _ = manager.inner.reconnect.notified() => {}
                }
            }
        })
    }

    /// Connects if the slot is empty, and replaces the connection if it has
    /// outlived `max_age`.
    pub async fn maintain(&self) {
        let expired = {
            let mut slot = self.inner.slot.lock().await;
            let max_age = self.inner.config.max_age;
            match slot.as_ref().map(|current| current.created.elapsed() >= max_age) {
                Some(false) => return,
                Some(true) => self.invalidate(&mut slot),
                None => None,
            }
        };
        if let Some(expired) = expired {
            debug!(
                "Rotating connection to {} after {:?}",
                expired.connection.addr(),
                self.inner.config.max_age
            );
            expired.connection.close().await;
        }

        match self.inner.connector.connect().await {
            Ok(connection) => {
                let mut slot = self.inner.slot.lock().await;
                *slot = Some(Slot::new(connection));
                self.inner.ready.store(true, Ordering::Release);
            }
            Err(e) => warn!("Failed to connect to collector: {}", e),
        }
    }

    /// Sends `batch` on the current connection.
    ///
    /// A failed send invalidates the connection. A send that exhausts the
    /// rotation budget succeeds and then retires the connection.
    pub async fn write(&self, batch: &[Envelope]) -> Result<(), WriteError> {
        let mut slot = self.inner.slot.lock().await;
        let Some(current) = slot.as_mut() else {
            return Err(WriteError::NoConnection);
        };

        let result = current.connection.send(batch).await;
        let retire = match &result {
            Ok(()) => {
                current.writes += 1;
                current.writes >= self.inner.config.max_writes
                    || current.created.elapsed() >= self.inner.config.max_age
            }
            Err(status) => {
                warn!(
                    "Failed to write to collector {}: {}",
                    current.connection.addr(),
                    status
                );
                true
            }
        };

        let retired = if retire {
            self.invalidate(&mut slot)
        } else {
            None
        };
        drop(slot);

        if let Some(retired) = retired {
            debug!(
                "Closing connection to {} after {} writes",
                retired.connection.addr(),
                retired.writes
            );
            retired.connection.close().await;
            self.inner.reconnect.notify_one();
        }

        result.map_err(WriteError::from)
    }

    fn invalidate(&self, slot: &mut Option<Slot>) -> Option<Slot> {
        self.inner.ready.store(false, Ordering::Release);
        slot.take()
    }

    #[cfg(test)]
    async fn writes_on_current(&self) -> Option<u64> {
        self.inner.slot.lock().await.as_ref().map(|s| s.writes)
    }
}
