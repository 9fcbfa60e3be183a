// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::rpc::Status;

/// Failure to obtain a usable batch stream from a downstream collector.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("error dialing ingestor stream to {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("error establishing ingestor stream to {addr}: {status}")]
    ProtocolOpen { addr: String, status: Status },

    #[error("lookup failed with addr {addr}: {reason}")]
    Lookup { addr: String, reason: String },

    #[error("unable to connect to any balancers")]
    Exhausted,
}

/// Failure to hand a batch to a downstream collector.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("no connection to collector present")]
    NoConnection,

    #[error("failed to send batch: {0}")]
    Send(#[from] Status),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
