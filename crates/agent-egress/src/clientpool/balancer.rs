// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::ConnectError;
use rand::seq::SliceRandom;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tracing::trace;

/// Resolves a host name to its addresses.
pub type Lookup = Arc<dyn Fn(&str) -> std::io::Result<Vec<IpAddr>> + Send + Sync>;

/// Resolves through the system resolver.
pub fn system_lookup() -> Lookup {
    Arc::new(|host: &str| {
        Ok((host, 0)
            .to_socket_addrs()?
            .map(|addr| addr.ip())
            .collect())
    })
}

/// Picks a concrete address for a logical `host:port`, resolving it afresh on
/// every call.
#[derive(Clone)]
pub struct Balancer {
    addr: String,
    lookup: Lookup,
}

impl std::fmt::Debug for Balancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Balancer").field("addr", &self.addr).finish()
    }
}

impl Balancer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self::with_lookup(addr, system_lookup())
    }

    pub fn with_lookup(addr: impl Into<String>, lookup: Lookup) -> Self {
        Balancer {
            addr: addr.into(),
            lookup,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Returns one of the resolved addresses, chosen uniformly at random.
    ///
    /// The lookup may block, so it runs on the blocking pool.
    pub async fn next_host_port(&self) -> Result<String, ConnectError> {
        let (host, port) = split_host_port(&self.addr).ok_or_else(|| ConnectError::Lookup {
            addr: self.addr.clone(),
            reason: "missing port in address".to_string(),
        })?;

        let lookup = Arc::clone(&self.lookup);
        let owned_host = host.to_string();
        let ips = tokio::task::spawn_blocking(move || lookup(&owned_host))
            .await
            .map_err(|e| self.lookup_error(e.to_string()))?
            .map_err(|e| self.lookup_error(e.to_string()))?;

        let ip = ips
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| self.lookup_error("no addresses found".to_string()))?;
        let host_port = SocketAddr::new(*ip, port).to_string();
        trace!("Balancer for {} selected {}", self.addr, host_port);
        Ok(host_port)
    }

    fn lookup_error(&self, reason: String) -> ConnectError {
        ConnectError::Lookup {
            addr: self.addr.clone(),
            reason,
        }
    }
}

/// Splits `host:port`, accepting bracketed IPv6 hosts.
fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}
