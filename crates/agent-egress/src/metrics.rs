// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory counters and gauges.
//!
//! The egress pipeline only creates and updates metrics. Periodic emission
//! belongs to whoever owns the [`Registry`]; it reads counters with
//! [`CounterMetric::take_delta`] and gauges with [`GaugeMetric::value`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Metadata attached to a metric at creation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetricOptions {
    /// Protocol version as (major, minor).
    pub version: (u32, u32),
    pub tags: BTreeMap<String, String>,
}

impl MetricOptions {
    pub fn v2() -> Self {
        Self {
            version: (2, 0),
            tags: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug)]
pub struct CounterMetric {
    name: String,
    options: MetricOptions,
    delta: AtomicU64,
}

impl CounterMetric {
    fn new(name: &str, options: MetricOptions) -> Self {
        Self {
            name: name.to_string(),
            options,
            delta: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &MetricOptions {
        &self.options
    }

    pub fn increment(&self, n: u64) {
        self.delta.fetch_add(n, Ordering::Relaxed);
    }

    /// Value accumulated since the last call to [`Self::take_delta`].
    pub fn delta(&self) -> u64 {
        self.delta.load(Ordering::Relaxed)
    }

    /// Returns and resets the accumulated value.
    pub fn take_delta(&self) -> u64 {
        self.delta.swap(0, Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct GaugeMetric {
    name: String,
    unit: String,
    options: MetricOptions,
    bits: AtomicU64,
}

impl GaugeMetric {
    fn new(name: &str, unit: &str, options: MetricOptions) -> Self {
        Self {
            name: name.to_string(),
            unit: unit.to_string(),
            options,
            bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn options(&self) -> &MetricOptions {
        &self.options
    }

    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn value(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Creates metrics that are emitted periodically by the owner of the client.
pub trait MetricClient: Send + Sync {
    fn new_counter_metric(&self, name: &str, options: MetricOptions) -> Arc<CounterMetric>;

    fn new_gauge_metric(&self, name: &str, unit: &str, options: MetricOptions)
        -> Arc<GaugeMetric>;
}

type MetricKey = (String, BTreeMap<String, String>);

/// Process-wide metric registry. Requesting a metric twice with the same
/// name and tags returns the same instance.
#[derive(Debug, Default)]
pub struct Registry {
    counters: Mutex<HashMap<MetricKey, Arc<CounterMetric>>>,
    gauges: Mutex<HashMap<MetricKey, Arc<GaugeMetric>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> Vec<Arc<CounterMetric>> {
        #[allow(clippy::expect_used)]
        let counters = self.counters.lock().expect("lock poisoned");
        counters.values().cloned().collect()
    }

    pub fn gauges(&self) -> Vec<Arc<GaugeMetric>> {
        #[allow(clippy::expect_used)]
        let gauges = self.gauges.lock().expect("lock poisoned");
        gauges.values().cloned().collect()
    }

    /// Looks up a counter by name and tags.
    pub fn counter(
        &self,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Option<Arc<CounterMetric>> {
        #[allow(clippy::expect_used)]
        let counters = self.counters.lock().expect("lock poisoned");
        counters.get(&(name.to_string(), tags.clone())).cloned()
    }
}

impl MetricClient for Registry {
    fn new_counter_metric(&self, name: &str, options: MetricOptions) -> Arc<CounterMetric> {
        #[allow(clippy::expect_used)]
        let mut counters = self.counters.lock().expect("lock poisoned");
        let key = (name.to_string(), options.tags.clone());
        Arc::clone(
            counters
                .entry(key)
                .or_insert_with(|| Arc::new(CounterMetric::new(name, options))),
        )
    }

    fn new_gauge_metric(
        &self,
        name: &str,
        unit: &str,
        options: MetricOptions,
    ) -> Arc<GaugeMetric> {
        #[allow(clippy::expect_used)]
        let mut gauges = self.gauges.lock().expect("lock poisoned");
        let key = (name.to_string(), options.tags.clone());
        Arc::clone(
            gauges
                .entry(key)
                .or_insert_with(|| Arc::new(GaugeMetric::new(name, unit, options))),
        )
    }
}

/// Tracks the average encoded size of sent envelopes.
#[derive(Debug, Default)]
pub struct EnvelopeAverager {
    envelopes: AtomicU64,
    bytes: AtomicU64,
}

impl EnvelopeAverager {
    pub fn track(&self, envelopes: usize, bytes: usize) {
        self.envelopes.fetch_add(envelopes as u64, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Average bytes per envelope since the last reset, zero if none were sent.
    pub fn average(&self) -> f64 {
        let envelopes = self.envelopes.load(Ordering::Relaxed);
        if envelopes == 0 {
            return 0.0;
        }
        self.bytes.load(Ordering::Relaxed) as f64 / envelopes as f64
    }

    fn take_average(&self) -> f64 {
        let envelopes = self.envelopes.swap(0, Ordering::Relaxed);
        let bytes = self.bytes.swap(0, Ordering::Relaxed);
        if envelopes == 0 {
            return 0.0;
        }
        bytes as f64 / envelopes as f64
    }

    /// Publishes the average to `gauge` every `period` and resets the window.
    pub async fn run(self: Arc<Self>, period: Duration, gauge: Arc<GaugeMetric>) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await; // first tick is immediate
        loop {
            ticker.tick().await;
            let average = self.take_average();
            debug!("Average envelope size over {:?}: {} bytes", period, average);
            gauge.set(average);
        }
    }
}
