// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Named health counters for connection lifecycle accounting.

use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::warn;

pub const DOPPLER_CONNECTIONS: &str = "dopplerConnections";
pub const DOPPLER_V2_STREAMS: &str = "dopplerV2Streams";

pub trait HealthRegistrar: Send + Sync {
    fn inc(&self, name: &str);
    fn dec(&self, name: &str);
}

/// Process-wide health counters. Counters never go below zero.
#[derive(Debug)]
pub struct Registrar {
    counters: Mutex<BTreeMap<String, i64>>,
}

impl Default for Registrar {
    fn default() -> Self {
        Self::new(&[DOPPLER_CONNECTIONS, DOPPLER_V2_STREAMS])
    }
}

impl Registrar {
    /// Creates a registrar with the given counters registered at zero.
    pub fn new(names: &[&str]) -> Self {
        Self {
            counters: Mutex::new(names.iter().map(|name| (name.to_string(), 0)).collect()),
        }
    }

    pub fn get(&self, name: &str) -> i64 {
        #[allow(clippy::expect_used)]
        let counters = self.counters.lock().expect("lock poisoned");
        counters.get(name).copied().unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        #[allow(clippy::expect_used)]
        let counters = self.counters.lock().expect("lock poisoned");
        counters.clone()
    }
}

impl HealthRegistrar for Registrar {
    fn inc(&self, name: &str) {
        #[allow(clippy::expect_used)]
        let mut counters = self.counters.lock().expect("lock poisoned");
        *counters.entry(name.to_string()).or_default() += 1;
    }

    fn dec(&self, name: &str) {
        #[allow(clippy::expect_used)]
        let mut counters = self.counters.lock().expect("lock poisoned");
        let value = counters.entry(name.to_string()).or_default();
        if *value == 0 {
            warn!("Health counter {} decremented below zero, ignoring", name);
            return;
        }
        *value -= 1;
    }
}
