// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::balancer::Balancer;
use super::sender_fetcher::{Connection, SenderFetcher};
use crate::errors::ConnectError;
use async_trait::async_trait;
use tracing::warn;

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection, ConnectError>;
}

/// Tries each balancer in order and returns the first connection that opens.
/// A zone-local balancer listed first is therefore preferred, with the
/// general balancer as fallback.
pub struct BalancedConnector {
    fetcher: SenderFetcher,
    balancers: Vec<Balancer>,
}

impl BalancedConnector {
    pub fn new(fetcher: SenderFetcher, balancers: Vec<Balancer>) -> Self {
        BalancedConnector { fetcher, balancers }
    }
}

#[async_trait]
impl Connector for BalancedConnector {
    async fn connect(&self) -> Result<Connection, ConnectError> {
        for balancer in &self.balancers {
            let addr = match balancer.next_host_port().await {
                Ok(addr) => addr,
                Err(e) => {
                    warn!("Failed to resolve collector address: {}", e);
                    continue;
                }
            };

            match self.fetcher.fetch(&addr).await {
                Ok(connection) => return Ok(connection),
                Err(e) => warn!("Failed to connect to collector via {}: {}", balancer.addr(), e),
            }
        }

        Err(ConnectError::Exhausted)
    }
}
