// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Outbound connections to the collector tier.

pub mod balancer;
pub mod conn_manager;
pub mod connector;
pub mod pool;
pub mod sender_fetcher;

pub use balancer::{system_lookup, Balancer, Lookup};
pub use conn_manager::{ConnManager, ConnManagerConfig};
pub use connector::{BalancedConnector, Connector};
pub use pool::ClientPool;
pub use sender_fetcher::{Connection, SenderFetcher};
