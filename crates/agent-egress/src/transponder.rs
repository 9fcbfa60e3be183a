// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single consumer of the envelope buffer.
//!
//! The transponder drains the buffer into batches, fills in legacy tags and
//! hands every batch to a [`Writer`]. A batch that fails to write is dropped
//! and only accounted for in the `dropped` metric.

use crate::batching::Batcher;
use crate::diode::ManyToOne;
use crate::envelope::Envelope;
use crate::errors::WriteError;
use crate::metrics::{CounterMetric, MetricClient, MetricOptions};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Non-blocking source of envelopes.
pub trait EnvelopeSource: Send + Sync {
    fn try_next(&self) -> Option<Envelope>;
}

impl EnvelopeSource for ManyToOne<Envelope> {
    fn try_next(&self) -> Option<Envelope> {
        ManyToOne::try_next(self)
    }
}

#[async_trait]
pub trait Writer: Send + Sync {
    async fn write(&self, batch: Vec<Envelope>) -> Result<(), WriteError>;
}

#[async_trait]
impl<W: Writer + ?Sized> Writer for Arc<W> {
    async fn write(&self, batch: Vec<Envelope>) -> Result<(), WriteError> {
        (**self).write(batch).await
    }
}

#[derive(Clone, Debug)]
pub struct TransponderConfig {
    pub batch_size: usize,
    pub batch_interval: Duration,
    /// Sleep after an empty poll.
    pub idle_wait: Duration,
    /// Agent tags added to every envelope that does not already carry the key.
    pub tags: HashMap<String, String>,
}

impl Default for TransponderConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_interval: Duration::from_millis(100),
            idle_wait: Duration::from_millis(100),
            tags: HashMap::new(),
        }
    }
}

pub struct Transponder<S, W> {
    source: Arc<S>,
    writer: W,
    tags: HashMap<String, String>,
    batcher: Batcher<Envelope>,
    idle_wait: Duration,
    dropped_metric: Arc<CounterMetric>,
    egress_metric: Arc<CounterMetric>,
}

impl<S: EnvelopeSource, W: Writer> Transponder<S, W> {
    pub fn new(
        source: Arc<S>,
        writer: W,
        config: TransponderConfig,
        metric_client: &dyn MetricClient,
    ) -> Self {
        let dropped_metric = metric_client.new_counter_metric(
            "dropped",
            MetricOptions::v2().with_tag("direction", "egress"),
        );
        let egress_metric = metric_client.new_counter_metric("egress", MetricOptions::v2());

        Transponder {
            source,
            writer,
            tags: config.tags,
            batcher: Batcher::new(config.batch_size, config.batch_interval),
            idle_wait: config.idle_wait,
            dropped_metric,
            egress_metric,
        }
    }

    /// Runs the consumer loop for the lifetime of the process.
    pub async fn start(mut self) {
        debug!("Transponder started");
        loop {
            if !self.poll().await {
                tokio::time::sleep(self.idle_wait).await;
            }
        }
    }

    /// Takes one envelope from the source. Returns `false` if the source was
    /// empty, in which case any pending batch has been flushed.
    pub async fn poll(&mut self) -> bool {
        match self.source.try_next() {
            Some(mut envelope) => {
                self.add_tags(&mut envelope);
                if let Some(batch) = self.batcher.push(envelope) {
                    self.write(batch).await;
                }
                true
            }
            None => {
                if let Some(batch) = self.batcher.flush() {
                    self.write(batch).await;
                }
                false
            }
        }
    }

    async fn write(&self, batch: Vec<Envelope>) {
        let len = batch.len() as u64;
        match self.writer.write(batch).await {
            Ok(()) => {
                trace!("Wrote batch of {} envelopes", len);
                self.egress_metric.increment(len);
            }
            Err(e) => {
                debug!("Dropping batch of {} envelopes: {}", len, e);
                self.dropped_metric.increment(len);
            }
        }
    }

    /// Mirrors structured tags into the legacy tags, then fills in agent tags
    /// for keys that are still missing.
    fn add_tags(&self, envelope: &mut Envelope) {
        for (key, value) in &envelope.tags {
            envelope
                .deprecated_tags
                .insert(key.clone(), value.to_string());
        }

        for (key, value) in &self.tags {
            if !envelope.deprecated_tags.contains_key(key) {
                envelope.deprecated_tags.insert(key.clone(), value.clone());
            }
        }
    }
}
