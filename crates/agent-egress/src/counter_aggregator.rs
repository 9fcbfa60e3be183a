// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Writer decorator that merges counter envelopes before they leave the agent.
//!
//! Within one batch, counters with the same name, source and tags are summed
//! into the first of them. Every forwarded counter is stamped with the running
//! total for its identity. Other envelopes pass through in their original
//! relative order.

use crate::envelope::Envelope;
use crate::errors::WriteError;
use crate::transponder::Writer;
use async_trait::async_trait;
use fnv::FnvHashMap;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::debug;

/// Identities tracked before the running totals are reset.
const MAX_TRACKED_COUNTERS: usize = 10_000;

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct CounterId {
    name: String,
    source_id: String,
    tags: BTreeMap<String, String>,
}

impl CounterId {
    fn new(envelope: &Envelope, name: &str) -> Self {
        let mut tags: BTreeMap<String, String> = envelope
            .deprecated_tags
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in &envelope.tags {
            tags.insert(key.clone(), value.to_string());
        }
        Self {
            name: name.to_string(),
            source_id: envelope.source_id.clone(),
            tags,
        }
    }
}

pub struct CounterAggregator<W> {
    writer: W,
    totals: Mutex<FnvHashMap<CounterId, u64>>,
}

impl<W: Writer> CounterAggregator<W> {
    pub fn new(writer: W) -> Self {
        CounterAggregator {
            writer,
            totals: Mutex::new(FnvHashMap::default()),
        }
    }

    fn aggregate(&self, batch: Vec<Envelope>) -> Vec<Envelope> {
        let mut out: Vec<Envelope> = Vec::with_capacity(batch.len());
        let mut pending: FnvHashMap<CounterId, usize> = FnvHashMap::default();

        for envelope in batch {
            let Some(counter) = envelope.as_counter() else {
                out.push(envelope);
                continue;
            };
            let id = CounterId::new(&envelope, &counter.name);
            let delta = counter.delta;

            match pending.get(&id) {
                Some(&index) => {
                    let merged = &mut out[index];
                    merged.timestamp = merged.timestamp.max(envelope.timestamp);
                    if let Some(counter) = merged.as_counter_mut() {
                        counter.delta = counter.delta.saturating_add(delta);
                    }
                }
                None => {
                    pending.insert(id, out.len());
                    out.push(envelope);
                }
            }
        }

        #[allow(clippy::expect_used)]
        let mut totals = self.totals.lock().expect("lock poisoned");
        for (id, index) in pending {
            if totals.len() > MAX_TRACKED_COUNTERS {
                debug!("Resetting counter totals after tracking {} identities", totals.len());
                totals.clear();
            }
            if let Some(counter) = out[index].as_counter_mut() {
                let total = totals.entry(id).or_default();
                *total = total.saturating_add(counter.delta);
                counter.total = *total;
            }
        }

        out
    }
}

#[async_trait]
impl<W: Writer> Writer for CounterAggregator<W> {
    async fn write(&self, batch: Vec<Envelope>) -> Result<(), WriteError> {
        let batch = self.aggregate(batch);
        self.writer.write(batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Payload;
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingWriter {
        batches: Mutex<Vec<Vec<Envelope>>>,
    }

    #[async_trait]
    impl Writer for RecordingWriter {
        async fn write(&self, batch: Vec<Envelope>) -> Result<(), WriteError> {
            self.batches.lock().unwrap().push(batch);
            Ok(())
        }
    }

    fn counters(batch: &[Envelope]) -> Vec<(String, u64, u64)> {
        batch
            .iter()
            .filter_map(Envelope::as_counter)
            .map(|c| (c.name.clone(), c.delta, c.total))
            .collect()
    }

    #[tokio::test]
    async fn test_merges_counters_with_same_identity() {
        let inner = Arc::new(RecordingWriter::default());
        let aggregator = CounterAggregator::new(Arc::clone(&inner));

        aggregator
            .write(vec![
                Envelope::counter("app", "requests", 2),
                Envelope::counter("app", "requests", 3),
                Envelope::counter("app", "errors", 1),
            ])
            .await
            .unwrap();

        let batches = inner.batches.lock().unwrap();
        assert_eq!(
            counters(&batches[0]),
            vec![
                ("requests".to_string(), 5, 5),
                ("errors".to_string(), 1, 1),
            ]
        );
    }

    #[tokio::test]
    async fn test_different_tags_are_different_counters() {
        let inner = Arc::new(RecordingWriter::default());
        let aggregator = CounterAggregator::new(Arc::clone(&inner));

        aggregator
            .write(vec![
                Envelope::counter("app", "requests", 1).with_tag("code", "200"),
                Envelope::counter("app", "requests", 1).with_tag("code", "500"),
                Envelope::counter("other-app", "requests", 1).with_tag("code", "200"),
            ])
            .await
            .unwrap();

        let batches = inner.batches.lock().unwrap();
        assert_eq!(batches[0].len(), 3);
    }

    #[tokio::test]
    async fn test_running_totals_across_batches() {
        let inner = Arc::new(RecordingWriter::default());
        let aggregator = CounterAggregator::new(Arc::clone(&inner));

        for delta in [4, 6] {
            aggregator
                .write(vec![Envelope::counter("app", "requests", delta)])
                .await
                .unwrap();
        }

        let batches = inner.batches.lock().unwrap();
        assert_eq!(counters(&batches[1]), vec![("requests".to_string(), 6, 10)]);
    }

    #[tokio::test]
    async fn test_non_counters_keep_relative_order() {
        let inner = Arc::new(RecordingWriter::default());
        let aggregator = CounterAggregator::new(Arc::clone(&inner));

        aggregator
            .write(vec![
                Envelope::log("app", "first"),
                Envelope::counter("app", "requests", 1),
                Envelope::log("app", "second"),
                Envelope::counter("app", "requests", 1),
                Envelope::log("app", "third"),
            ])
            .await
            .unwrap();

        let batches = inner.batches.lock().unwrap();
        let logs: Vec<&[u8]> = batches[0]
            .iter()
            .filter_map(|e| match &e.message {
                Payload::Log(log) => Some(log.payload.as_slice()),
                _ => None,
            })
            .collect();
        assert_eq!(logs, vec![&b"first"[..], &b"second"[..], &b"third"[..]]);
        assert_eq!(batches[0].len(), 4);
        assert_eq!(counters(&batches[0]), vec![("requests".to_string(), 2, 2)]);
    }

    #[tokio::test]
    async fn test_totals_reset_when_too_many_identities() {
        let inner = Arc::new(RecordingWriter::default());
        let aggregator = CounterAggregator::new(Arc::clone(&inner));

        let batch = (0..=MAX_TRACKED_COUNTERS)
            .map(|i| Envelope::counter("app", format!("counter-{i}"), 1))
            .collect();
        aggregator.write(batch).await.unwrap();
        aggregator
            .write(vec![Envelope::counter("app", "counter-0", 1)])
            .await
            .unwrap();

        assert_eq!(aggregator.totals.lock().unwrap().len(), 1);
        let batches = inner.batches.lock().unwrap();
        assert_eq!(batches[0].len(), MAX_TRACKED_COUNTERS + 1);
        assert_eq!(counters(&batches[1]), vec![("counter-0".to_string(), 1, 1)]);
    }
}
