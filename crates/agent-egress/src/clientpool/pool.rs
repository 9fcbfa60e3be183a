// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::conn_manager::ConnManager;
use crate::envelope::Envelope;
use crate::errors::WriteError;
use crate::transponder::Writer;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::task::JoinHandle;

/// Spreads batches across a fixed set of connection managers.
///
/// Each write goes to the next ready manager in round-robin order. A write
/// that fails on that manager is reported to the caller and not retried on
/// another one.
pub struct ClientPool {
    managers: Vec<ConnManager>,
    cursor: AtomicUsize,
}

impl ClientPool {
    pub fn new(managers: Vec<ConnManager>) -> Self {
        ClientPool {
            managers,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Starts the maintenance task of every manager.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        self.managers.iter().map(ConnManager::start).collect()
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    pub fn ready_count(&self) -> usize {
        self.managers.iter().filter(|m| m.is_ready()).count()
    }

    fn next_ready(&self) -> Option<&ConnManager> {
        let count = self.managers.len();
        if count == 0 {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        (0..count)
            .map(|offset| &self.managers[(start + offset) % count])
            .find(|manager| manager.is_ready())
    }
}

#[async_trait]
impl Writer for ClientPool {
    async fn write(&self, batch: Vec<Envelope>) -> Result<(), WriteError> {
        let manager = self.next_ready().ok_or(WriteError::NoConnection)?;
        manager.write(&batch).await
    }
}
