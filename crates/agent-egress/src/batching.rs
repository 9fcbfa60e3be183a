// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, Instant};

/// Accumulates items into batches that are released once `size` items are
/// pending or `interval` has passed since the last release.
pub struct Batcher<T> {
    batch: Vec<T>,
    size: usize,
    interval: Duration,
    last_flush: Instant,
}

impl<T> Batcher<T> {
    pub fn new(size: usize, interval: Duration) -> Self {
        let size = size.max(1);
        Batcher {
            batch: Vec::with_capacity(size),
            size,
            interval,
            last_flush: Instant::now(),
        }
    }

    /// Adds an item and returns the pending batch if it is ready to write.
    pub fn push(&mut self, item: T) -> Option<Vec<T>> {
        self.batch.push(item);
        if self.batch.len() >= self.size || self.interval_elapsed() {
            return Some(self.take_batch());
        }
        None
    }

    /// Returns the pending batch, if any, regardless of size or age.
    pub fn flush(&mut self) -> Option<Vec<T>> {
        if self.batch.is_empty() {
            return None;
        }
        Some(self.take_batch())
    }

    pub fn interval_elapsed(&self) -> bool {
        self.last_flush.elapsed() >= self.interval
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    fn take_batch(&mut self) -> Vec<T> {
        self.last_flush = Instant::now();
        std::mem::replace(&mut self.batch, Vec::with_capacity(self.size))
    }
}
