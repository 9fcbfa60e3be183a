// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded many-producer/single-consumer ring buffer that overwrites the
//! oldest unread element when full.
//!
//! Producers claim a sequence number with one `fetch_add` and publish their
//! element with one pointer swap, so inserts never block and never fail.
//! Every slot stores a heap bucket stamped with its sequence number. The
//! consumer detects evictions from gaps between its read index and the
//! sequence numbers it finds, and reports them in aggregate through the
//! alert callback instead of once per element.
//!
//! A producer that stalls for a full lap of the ring may publish after a
//! newer producer on the same slot. The newer element is then lost without
//! being counted. Size the buffer so this cannot happen in practice.

use crate::envelope::Envelope;
use std::cmp::Ordering as CmpOrdering;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

/// Receives the number of elements dropped since the previous call.
pub type AlertFn = Box<dyn Fn(u64) + Send + Sync>;

pub type EnvelopeBuffer = ManyToOne<Envelope>;

struct Bucket<T> {
    seq: u64,
    data: T,
}

pub struct ManyToOne<T> {
    slots: Box<[AtomicPtr<Bucket<T>>]>,
    /// Next sequence number to hand to a producer.
    write_index: AtomicU64,
    /// Next sequence number the consumer expects. Only the consumer writes it.
    read_index: AtomicU64,
    alert: AlertFn,
    _marker: PhantomData<Box<T>>,
}

impl<T: Send> ManyToOne<T> {
    pub fn new(size: usize, alert: impl Fn(u64) + Send + Sync + 'static) -> Self {
        let slots = (0..size.max(1))
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            write_index: AtomicU64::new(0),
            read_index: AtomicU64::new(0),
            alert: Box::new(alert),
            _marker: PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Inserts `data`, evicting the oldest unread element if the buffer is full.
    pub fn set(&self, data: T) {
        let seq = self.claim();
        self.publish(seq, data);
    }

    fn claim(&self) -> u64 {
        self.write_index.fetch_add(1, Ordering::AcqRel)
    }

    fn publish(&self, seq: u64, data: T) {
        let bucket = Box::into_raw(Box::new(Bucket { seq, data }));
        let old = self.slot(seq).swap(bucket, Ordering::AcqRel);
        if !old.is_null() {
            // SAFETY: `old` came from `Box::into_raw` and the swap removed it from
            // the slot, so this is the only reference left.
            drop(unsafe { Box::from_raw(old) });
        }
    }

    /// Returns the next element, or `None` if nothing is ready.
    ///
    /// Must only be called from one consumer at a time.
    pub fn try_next(&self) -> Option<T> {
        self.next_with(|| self.write_index.load(Ordering::Acquire))
    }

    /// Consumer step with the write index observed through `written`.
    fn next_with(&self, mut written: impl FnMut() -> u64) -> Option<T> {
        let len = self.slots.len() as u64;
        let mut read = self.read_index.load(Ordering::Relaxed);
        let mut dropped = 0;

        let next = loop {
            let written = written();
            if read >= written {
                break None;
            }
            if written - read > len {
                dropped += written - len - read;
                read = written - len;
            }

            let ptr = self.slot(read).swap(ptr::null_mut(), Ordering::AcqRel);
            if ptr.is_null() {
                // claimed by a producer that has not published yet
                break None;
            }
            // SAFETY: as in `set`, the swap transferred sole ownership of the bucket.
            let bucket = unsafe { Box::from_raw(ptr) };

            match bucket.seq.cmp(&read) {
                CmpOrdering::Equal => {
                    read += 1;
                    break Some(bucket.data);
                }
                CmpOrdering::Greater => {
                    // lapped between the index check and the swap
                    dropped += bucket.seq - read;
                    read = bucket.seq + 1;
                    break Some(bucket.data);
                }
                // already counted as dropped when the read index jumped
                CmpOrdering::Less => continue,
            }
        };

        self.read_index.store(read, Ordering::Relaxed);
        if dropped > 0 {
            (self.alert)(dropped);
        }
        next
    }

    fn slot(&self, seq: u64) -> &AtomicPtr<Bucket<T>> {
        &self.slots[(seq % self.slots.len() as u64) as usize]
    }
}

impl<T> Drop for ManyToOne<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            let ptr = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if !ptr.is_null() {
                // SAFETY: `&mut self` guarantees no producer or consumer is active.
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    fn counting_diode(size: usize) -> (ManyToOne<u64>, Arc<AtomicU64>) {
        let dropped = Arc::new(AtomicU64::new(0));
        let alerted = Arc::clone(&dropped);
        let diode = ManyToOne::new(size, move |missed| {
            alerted.fetch_add(missed, Ordering::SeqCst);
        });
        (diode, dropped)
    }

    fn drain(diode: &ManyToOne<u64>) -> Vec<u64> {
        std::iter::from_fn(|| diode.try_next()).collect()
    }

    #[test]
    fn test_empty_poll() {
        let (diode, dropped) = counting_diode(4);
        assert_eq!(diode.try_next(), None);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_fifo_within_capacity() {
        let (diode, dropped) = counting_diode(10);
        for i in 0..10 {
            diode.set(i);
        }
        assert_eq!(drain(&diode), (0..10).collect::<Vec<_>>());
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let (diode, dropped) = counting_diode(4);
        for i in 0..10 {
            diode.set(i);
        }
        assert_eq!(drain(&diode), vec![6, 7, 8, 9]);
        assert_eq!(dropped.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_drops_reported_in_aggregate() {
        let alerts = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = Arc::clone(&alerts);
        let diode = ManyToOne::new(2, move |missed| recorded.lock().unwrap().push(missed));

        for i in 0..7u64 {
            diode.set(i);
        }
        assert_eq!(diode.try_next(), Some(5));
        assert_eq!(diode.try_next(), Some(6));
        assert_eq!(*alerts.lock().unwrap(), vec![5]);
    }

    #[test]
    fn test_interleaved_reads_and_wraparound() {
        let (diode, dropped) = counting_diode(3);
        diode.set(1);
        diode.set(2);
        assert_eq!(diode.try_next(), Some(1));
        diode.set(3);
        diode.set(4);
        diode.set(5);
        assert_eq!(drain(&diode), vec![3, 4, 5]);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_frees_unread() {
        let marker = Arc::new(());
        {
            let diode = ManyToOne::new(4, |_| {});
            for _ in 0..6 {
                diode.set(Arc::clone(&marker));
            }
            assert_eq!(Arc::strong_count(&marker), 5);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn test_concurrent_producers_keep_per_producer_order() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 5_000;

        let (diode, dropped) = counting_diode((PRODUCERS * PER_PRODUCER) as usize);
        let diode = Arc::new(diode);

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let diode = Arc::clone(&diode);
                std::thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        diode.set(producer * PER_PRODUCER + i);
                    }
                })
            })
            .collect();

        let mut last_seen = vec![None; PRODUCERS as usize];
        let mut received = 0;
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while received < PRODUCERS * PER_PRODUCER && std::time::Instant::now() < deadline {
            match diode.try_next() {
                Some(value) => {
                    let producer = (value / PER_PRODUCER) as usize;
                    if let Some(previous) = last_seen[producer] {
                        assert!(value > previous, "producer {producer} out of order");
                    }
                    last_seen[producer] = Some(value);
                    received += 1;
                }
                None => std::thread::yield_now(),
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(received, PRODUCERS * PER_PRODUCER);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_slot_overwritten_after_index_read() {
        let (diode, dropped) = counting_diode(4);
        for i in 0..4 {
            diode.set(i);
        }

        // A producer laps slot 0 between the consumer's index read and its swap.
        let mut lapped = false;
        let next = diode.next_with(|| {
            let written = diode.write_index.load(Ordering::Acquire);
            if !lapped {
                lapped = true;
                diode.set(4);
            }
            written
        });

        assert_eq!(next, Some(4));
        assert_eq!(dropped.load(Ordering::SeqCst), 4);
        assert_eq!(diode.try_next(), None);

        diode.set(5);
        assert_eq!(diode.try_next(), Some(5));
        assert_eq!(dropped.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_stale_bucket_behind_read_index_is_discarded() {
        let (diode, dropped) = counting_diode(2);
        diode.set(0);
        diode.set(1);

        // Slot 1 still holds seq 1 after the consumer has moved past it.
        let mut lapped = false;
        let first = diode.next_with(|| {
            let written = diode.write_index.load(Ordering::Acquire);
            if !lapped {
                lapped = true;
                diode.set(2);
            }
            written
        });
        assert_eq!(first, Some(2));
        assert_eq!(dropped.load(Ordering::SeqCst), 2);

        // A producer claims seq 3 for slot 1 but has not published yet.
        let seq = diode.claim();
        assert_eq!(seq, 3);
        assert_eq!(diode.try_next(), None);
        assert_eq!(dropped.load(Ordering::SeqCst), 2);

        diode.publish(seq, 3);
        assert_eq!(diode.try_next(), Some(3));
        assert_eq!(diode.try_next(), None);
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Set,
        Poll,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![3 => Just(Op::Set), 1 => Just(Op::Poll)]
    }

    proptest! {
        #[test]
        fn prop_matches_drop_oldest_queue(
            size in 1usize..16,
            ops in prop::collection::vec(op(), 0..200),
        ) {
            let (diode, dropped) = counting_diode(size);
            let mut model = VecDeque::new();
            let mut model_dropped = 0u64;
            let mut next = 0u64;

            for op in ops {
                match op {
                    Op::Set => {
                        if model.len() == size {
                            model.pop_front();
                            model_dropped += 1;
                        }
                        model.push_back(next);
                        diode.set(next);
                        next += 1;
                    }
                    Op::Poll => {
                        prop_assert_eq!(diode.try_next(), model.pop_front());
                        prop_assert_eq!(dropped.load(Ordering::SeqCst), model_dropped);
                    }
                }
            }

            let rest = drain(&diode);
            prop_assert_eq!(rest, model.into_iter().collect::<Vec<_>>());
            prop_assert_eq!(dropped.load(Ordering::SeqCst), model_dropped);
        }

        #[test]
        fn prop_overflow_drop_count(size in 1usize..64, inserts in 0u64..256) {
            let (diode, dropped) = counting_diode(size);
            for i in 0..inserts {
                diode.set(i);
            }
            let kept = drain(&diode);
            let expected_drops = inserts.saturating_sub(size as u64);
            prop_assert_eq!(dropped.load(Ordering::SeqCst), expected_drops);
            prop_assert_eq!(kept, (expected_drops..inserts).collect::<Vec<_>>());
        }
    }
}
