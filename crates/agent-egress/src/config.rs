// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::ConfigError;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Static agent tags added to every outgoing envelope.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tags {
    tags: HashMap<String, String>,
}

impl Tags {
    pub fn from_env_string(env_tags: &str) -> Self {
        let mut tags = HashMap::new();

        // Space-separated key:value tags are the standard; comma-separated
        // pairs are accepted as well.
        let normalized = env_tags.replace(',', " ");

        for kv in normalized.split_whitespace() {
            let parts = kv.split(':').collect::<Vec<&str>>();
            if parts.len() == 2 && !parts[0].is_empty() {
                tags.insert(parts[0].to_string(), parts[1].to_string());
            }
        }
        Self { tags }
    }

    pub fn new() -> Self {
        Self::default()
    }

    pub fn tags(&self) -> &HashMap<String, String> {
        &self.tags
    }
}

/// Buffering and batching of outgoing envelopes.
#[derive(Clone, Debug)]
pub struct EgressConfig {
    pub buffer_size: usize,
    pub batch_size: usize,
    pub batch_interval: Duration,
    /// Sleep after the buffer was found empty.
    pub idle_wait: Duration,
    pub counter_aggregation: bool,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            buffer_size: 10_000,
            batch_size: 100,
            batch_interval: Duration::from_millis(100),
            idle_wait: Duration::from_millis(100),
            counter_aggregation: true,
        }
    }
}

impl EgressConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "buffer size must be greater than 0".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "batch size must be greater than 0".to_string(),
            ));
        }
        if self.batch_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "batch interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Connections to the collector tier.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Number of connection managers.
    pub connections: usize,
    /// Writes a connection carries before rotation, before jitter.
    pub max_writes_base: u64,
    /// Upper bound (exclusive) of the random addition to `max_writes_base`.
    pub max_writes_jitter: u64,
    pub poll_interval: Duration,
    pub max_connection_age: Duration,
    pub dial_timeout: Duration,
    /// Bound on each batch write and on waiting for a call's final status.
    pub io_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connections: 5,
            max_writes_base: 100_000,
            max_writes_jitter: 1_000,
            poll_interval: Duration::from_secs(1),
            max_connection_age: Duration::from_secs(5 * 60),
            dial_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(15),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connections == 0 {
            return Err(ConfigError::Invalid(
                "pool must have at least one connection".to_string(),
            ));
        }
        if self.max_writes_base == 0 {
            return Err(ConfigError::Invalid(
                "max writes per connection must be greater than 0".to_string(),
            ));
        }
        if self.io_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "io timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Logical `host:port` of the collector tier.
    pub router_addr: String,
    /// Zone-local collector address, preferred when set.
    pub router_addr_with_az: Option<String>,
    pub tags: Tags,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
    pub egress: EgressConfig,
    pub pool: PoolConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            router_addr: "localhost:8082".to_string(),
            router_addr_with_az: None,
            tags: Tags::new(),
            log_level: "info".to_string(),
            egress: EgressConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let router_addr = env::var("AGENT_ROUTER_ADDR")
            .map_err(|_| ConfigError::Invalid("AGENT_ROUTER_ADDR is not set".to_string()))?;
        let router_addr_with_az = env::var("AGENT_ROUTER_ADDR_WITH_AZ")
            .ok()
            .filter(|addr| !addr.trim().is_empty());
        let tags = if let Ok(env_tags) = env::var("AGENT_TAGS") {
            Tags::from_env_string(&env_tags)
        } else {
            Tags::new()
        };
        let log_level = env::var("AGENT_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or_else(|_| "info".to_string());

        let mut egress = EgressConfig::default();
        if let Some(size) = parse_env("AGENT_BUFFER_SIZE")? {
            egress.buffer_size = size;
        }
        if let Some(size) = parse_env("AGENT_BATCH_SIZE")? {
            egress.batch_size = size;
        }
        if let Some(ms) = parse_env("AGENT_BATCH_INTERVAL_MS")? {
            egress.batch_interval = Duration::from_millis(ms);
        }

        let mut pool = PoolConfig::default();
        if let Some(connections) = parse_env("AGENT_POOL_CONNECTIONS")? {
            pool.connections = connections;
        }
        if let Some(ms) = parse_env("AGENT_IO_TIMEOUT_MS")? {
            pool.io_timeout = Duration::from_millis(ms);
        }

        let config = Self {
            router_addr,
            router_addr_with_az,
            tags,
            log_level,
            egress,
            pool,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.router_addr.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "AGENT_ROUTER_ADDR cannot be empty".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        self.egress.validate()?;
        self.pool.validate()
    }
}

fn parse_env<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{name} has an invalid value '{raw}'"))),
        Err(_) => Ok(None),
    }
}
