// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded priority reservoir shared by every event type.
//!
//! A [`Reservoir`] keeps at most `capacity` events. While it is filling up,
//! events are appended in arrival order; the insertion that reaches capacity
//! turns the buffer into a min-heap keyed by [`Priority`]. From then on an
//! incoming event only gets in by displacing the current minimum, and only
//! when its priority is strictly higher.
//!
//! Delaying the heapify until capacity keeps the order of a reservoir that
//! never fills identical to the order the events were offered in, which the
//! payload tests rely on.
//!
//! ```text
//!   add ──► len < cap ──► push (arrival order)
//!              │
//!              └─► len == cap ──► heapify once
//!                                    │
//!   add ──► incoming > min ──► replace min, sift down
//!      └──► otherwise      ──► dropped (still counted as seen)
//! ```

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use tracing::debug;

use crate::priority::Priority;
use crate::FAILED_EVENTS_ATTEMPTS_LIMIT;

/// An event paired with the priority it competes with.
#[derive(Clone, Debug)]
pub struct Prioritized<T> {
    pub priority: Priority,
    pub event: T,
}

impl<T> PartialEq for Prioritized<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

impl<T> Eq for Prioritized<T> {}

impl<T> PartialOrd for Prioritized<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Prioritized<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority)
    }
}

#[derive(Clone, Debug)]
enum Store<T> {
    Filling(Vec<Prioritized<T>>),
    Full(BinaryHeap<Reverse<Prioritized<T>>>),
}

#[derive(Clone, Debug)]
pub struct Reservoir<T> {
    capacity: usize,
    num_seen: u64,
    failed_harvests: u32,
    store: Store<T>,
}

impl<T> Reservoir<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Reservoir {
            capacity,
            num_seen: 0,
            failed_harvests: 0,
            store: Store::Filling(Vec::new()),
        }
    }

    /// Offers an event to the reservoir. The event is always counted as seen,
    /// whether or not it is kept.
    pub fn add(&mut self, event: T, priority: Priority) {
        self.num_seen += 1;
        if self.capacity == 0 {
            return;
        }
        let incoming = Prioritized { priority, event };

        match &mut self.store {
            Store::Filling(events) => {
                events.push(incoming);
                if events.len() >= self.capacity {
                    let events = std::mem::take(events);
                    self.store = Store::Full(events.into_iter().map(Reverse).collect());
                }
            }
            Store::Full(heap) => {
                if let Some(mut min) = heap.peek_mut() {
                    if min.0.priority < incoming.priority {
                        // Sifts down when the guard drops.
                        *min = Reverse(incoming);
                    }
                }
            }
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn num_seen(&self) -> u64 {
        self.num_seen
    }

    #[must_use]
    pub fn num_saved(&self) -> usize {
        match &self.store {
            Store::Filling(events) => events.len(),
            Store::Full(heap) => heap.len(),
        }
    }

    #[must_use]
    pub fn failed_harvests(&self) -> u32 {
        self.failed_harvests
    }

    /// The lowest priority currently stored, if any.
    #[must_use]
    pub fn min_priority(&self) -> Option<Priority> {
        match &self.store {
            Store::Filling(events) => events.iter().map(|e| e.priority).min(),
            Store::Full(heap) => heap.peek().map(|min| min.0.priority),
        }
    }

    /// Stored events. Arrival order while filling, heap order once full.
    pub fn iter(&self) -> Box<dyn Iterator<Item = &Prioritized<T>> + '_> {
        match &self.store {
            Store::Filling(events) => Box::new(events.iter()),
            Store::Full(heap) => Box::new(heap.iter().map(|e| &e.0)),
        }
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<Prioritized<T>> {
        match self.store {
            Store::Filling(events) => events,
            Store::Full(heap) => heap.into_vec().into_iter().map(|e| e.0).collect(),
        }
    }

    /// Re-offers every event of `other` and combines the seen totals, so the
    /// result accounts for everything either reservoir was offered.
    pub fn merge(&mut self, other: Reservoir<T>) {
        let all_seen = self.num_seen + other.num_seen;
        for e in other.into_vec() {
            self.add(e.event, e.priority);
        }
        self.num_seen = all_seen;
    }

    /// Merges a reservoir whose delivery failed. Once the data has failed
    /// [`FAILED_EVENTS_ATTEMPTS_LIMIT`] times it is dropped instead.
    ///
    /// Returns whether the data was merged.
    pub fn merge_failed(&mut self, other: Reservoir<T>) -> bool {
        let fails = other.failed_harvests + 1;
        if fails >= FAILED_EVENTS_ATTEMPTS_LIMIT {
            debug!(
                "Discarding {} events after {} failed harvests",
                other.num_saved(),
                fails
            );
            return false;
        }
        self.failed_harvests = fails;
        self.merge(other);
        true
    }

    #[must_use]
    pub fn into_batch(self) -> EventBatch<T> {
        EventBatch {
            reservoir_size: self.capacity,
            num_seen: self.num_seen,
            failed_harvests: self.failed_harvests,
            events: self.into_vec(),
        }
    }

    /// Rebuilds a reservoir from a batch so that an undelivered batch can be
    /// merged back like any other failed reservoir.
    #[must_use]
    pub fn from_batch(batch: EventBatch<T>) -> Self {
        let capacity = batch.reservoir_size.max(batch.events.len());
        let store = if capacity > 0 && batch.events.len() >= capacity {
            Store::Full(batch.events.into_iter().map(Reverse).collect())
        } else {
            Store::Filling(batch.events)
        };
        Reservoir {
            capacity,
            num_seen: batch.num_seen,
            failed_harvests: batch.failed_harvests,
            store,
        }
    }

    /// Splits into two payload-only halves. See [`EventBatch::split`].
    #[must_use]
    pub fn split(self) -> (EventBatch<T>, EventBatch<T>) {
        self.into_batch().split()
    }
}

/// Detached reservoir contents, ready to serialize. A batch no longer
/// samples: it has no `add`.
#[derive(Clone, Debug)]
pub struct EventBatch<T> {
    pub reservoir_size: usize,
    pub num_seen: u64,
    pub failed_harvests: u32,
    pub events: Vec<Prioritized<T>>,
}

impl<T> EventBatch<T> {
    /// Splits the batch in two. Events, seen count and reservoir size are
    /// each divided `floor(n/2)` / `n - floor(n/2)`, so both halves together
    /// account for exactly the original totals.
    #[must_use]
    pub fn split(mut self) -> (EventBatch<T>, EventBatch<T>) {
        let (seen1, seen2) = split_count(self.num_seen);
        let (size1, size2) = split_count(self.reservoir_size as u64);
        let second = self.events.split_off(self.events.len() / 2);
        (
            EventBatch {
                reservoir_size: size1 as usize,
                num_seen: seen1,
                failed_harvests: self.failed_harvests,
                events: self.events,
            },
            EventBatch {
                reservoir_size: size2 as usize,
                num_seen: seen2,
                failed_harvests: self.failed_harvests,
                events: second,
            },
        )
    }

    /// Repeatedly halves the batch until no part holds more than `limit`
    /// events.
    #[must_use]
    pub fn chunk(self, limit: usize) -> Vec<EventBatch<T>> {
        if limit == 0 || self.events.len() <= limit {
            return vec![self];
        }
        let (first, second) = self.split();
        let mut out = first.chunk(limit);
        out.extend(second.chunk(limit));
        out
    }
}

pub(crate) fn split_count(n: u64) -> (u64, u64) {
    let first = n / 2;
    (first, n - first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn priorities(r: &Reservoir<u32>) -> Vec<f32> {
        let mut out: Vec<f32> = r.iter().map(|e| e.priority.as_f32()).collect();
        out.sort_by(f32::total_cmp);
        out
    }

    #[test]
    fn test_zero_capacity_counts_but_never_stores() {
        let mut r = Reservoir::new(0);
        for i in 0..10 {
            r.add(i, Priority::from_f32(0.5));
        }
        assert_eq!(r.num_seen(), 10);
        assert_eq!(r.num_saved(), 0);
        assert!(r.min_priority().is_none());
        let (a, b) = r.split();
        assert_eq!(a.events.len() + b.events.len(), 0);
        assert_eq!(a.num_seen + b.num_seen, 10);
    }

    #[test]
    fn test_below_capacity_keeps_arrival_order() {
        let mut r = Reservoir::new(10);
        for (i, p) in [0.9, 0.1, 0.5, 0.3].into_iter().enumerate() {
            r.add(i, Priority::from_f32(p));
        }
        let order: Vec<usize> = r.iter().map(|e| e.event).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_evicts_lowest_priority() {
        let mut r = Reservoir::new(3);
        for (i, p) in [0.1, 0.9, 0.5, 0.99, 0.3].into_iter().enumerate() {
            r.add(i as u32, Priority::from_f32(p));
        }
        assert_eq!(r.num_seen(), 5);
        assert_eq!(r.num_saved(), 3);
        assert_eq!(priorities(&r), vec![0.5, 0.9, 0.99]);
    }

    #[test]
    fn test_equal_priority_does_not_displace() {
        let mut r = Reservoir::new(1);
        r.add(1, Priority::from_f32(0.5));
        r.add(2, Priority::from_f32(0.5));
        assert_eq!(r.iter().next().map(|e| e.event), Some(1));
    }

    #[test]
    fn test_synthetic_displaces_in_capacity_one() {
        let mut r = Reservoir::new(1);
        r.add(1, Priority::from_f32(0.999));
        r.add(2, Priority::from_f32(0.001).boost_synthetics());
        r.add(3, Priority::from_f32(0.998));
        assert_eq!(r.iter().next().map(|e| e.event), Some(2));
        assert_eq!(r.num_seen(), 3);
    }

    #[test]
    fn test_synthetic_evicts_lowest_non_synthetic() {
        let mut r = Reservoir::new(3);
        r.add(1, Priority::from_f32(0.7));
        r.add(2, Priority::from_f32(0.2));
        r.add(3, Priority::from_f32(0.9));
        r.add(4, Priority::from_f32(0.01).boost_synthetics());
        let mut kept: Vec<u32> = r.iter().map(|e| e.event).collect();
        kept.sort_unstable();
        assert_eq!(kept, vec![1, 3, 4]);

        // The synthetic event now outranks every regular one.
        r.add(5, Priority::from_f32(0.999));
        let mut kept: Vec<u32> = r.iter().map(|e| e.event).collect();
        kept.sort_unstable();
        assert_eq!(kept, vec![3, 4, 5]);
    }

    #[test]
    fn test_huge_capacity_does_not_preallocate() {
        let mut r = Reservoir::new(usize::MAX);
        r.add(1, Priority::from_f32(0.5));
        assert_eq!(r.num_saved(), 1);
        assert_eq!(r.capacity(), usize::MAX);
    }

    #[test]
    fn test_merge_combines_seen() {
        let mut a = Reservoir::new(2);
        a.add(1, Priority::from_f32(0.1));
        a.add(2, Priority::from_f32(0.2));
        a.add(3, Priority::from_f32(0.05));
        let mut b = Reservoir::new(2);
        b.add(4, Priority::from_f32(0.9));
        a.merge(b);
        assert_eq!(a.num_seen(), 4);
        assert_eq!(a.num_saved(), 2);
        assert_eq!(priorities(&a), vec![0.2, 0.9]);
    }

    #[test]
    fn test_merge_failed_increments_and_respects_limit() {
        let mut failed = Reservoir::new(5);
        failed.add(1, Priority::from_f32(0.5));

        let mut next = Reservoir::new(5);
        assert!(next.merge_failed(failed));
        assert_eq!(next.failed_harvests(), 1);
        assert_eq!(next.num_saved(), 1);

        let mut stale = Reservoir::new(5);
        stale.add(1, Priority::from_f32(0.5));
        stale.failed_harvests = FAILED_EVENTS_ATTEMPTS_LIMIT;
        let mut fresh = Reservoir::<u32>::new(5);
        assert!(!fresh.merge_failed(stale));
        assert_eq!(fresh.num_saved(), 0);
        assert_eq!(fresh.num_seen(), 0);
        assert_eq!(fresh.failed_harvests(), 0);
    }

    #[test]
    fn test_merge_failed_one_below_limit_is_last_attempt() {
        let mut r = Reservoir::new(5);
        r.add(1, Priority::from_f32(0.5));
        r.failed_harvests = FAILED_EVENTS_ATTEMPTS_LIMIT - 2;
        let mut next = Reservoir::new(5);
        assert!(next.merge_failed(r));
        assert_eq!(next.failed_harvests(), FAILED_EVENTS_ATTEMPTS_LIMIT - 1);

        let mut last = Reservoir::new(5);
        assert!(!last.merge_failed(next));
    }

    #[test]
    fn test_split_conserves_counts() {
        let mut r = Reservoir::new(7);
        for i in 0..7 {
            r.add(i, Priority::from_f32(0.1 * (i + 1) as f32));
        }
        for i in 0..6 {
            r.add(100 + i, Priority::from_f32(0.0001));
        }
        let seen = r.num_seen();
        let (a, b) = r.split();
        assert_eq!(a.events.len(), 3);
        assert_eq!(b.events.len(), 4);
        assert_eq!(a.num_seen, 6);
        assert_eq!(b.num_seen, 7);
        assert_eq!(a.num_seen + b.num_seen, seen);
    }

    #[test]
    fn test_from_batch_keeps_counters() {
        let mut r = Reservoir::new(4);
        for i in 0..6 {
            r.add(i, Priority::from_f32(0.1 * (i + 1) as f32));
        }
        r.failed_harvests = 3;
        let (first, _) = r.split();
        let rebuilt = Reservoir::from_batch(first);
        assert_eq!(rebuilt.num_seen(), 3);
        assert_eq!(rebuilt.num_saved(), 2);
        assert_eq!(rebuilt.failed_harvests(), 3);
    }

    #[test]
    fn test_chunk_respects_limit() {
        let mut r = Reservoir::new(100);
        for i in 0..23 {
            r.add(i, Priority::from_f32(0.5));
        }
        let chunks = r.into_batch().chunk(5);
        assert!(chunks.iter().all(|c| c.events.len() <= 5));
        assert_eq!(chunks.iter().map(|c| c.events.len()).sum::<usize>(), 23);
        assert_eq!(chunks.iter().map(|c| c.num_seen).sum::<u64>(), 23);
    }

    proptest! {
        #[test]
        fn prop_capacity_and_seen_invariants(
            capacity in 0usize..20,
            offered in proptest::collection::vec(0.0f32..1.0, 0..200),
        ) {
            let mut r = Reservoir::new(capacity);
            for (i, p) in offered.iter().enumerate() {
                r.add(i, Priority::from_f32(*p));
                prop_assert!(r.num_saved() <= r.capacity());
            }
            prop_assert_eq!(r.num_seen(), offered.len() as u64);
            prop_assert!(r.num_seen() >= r.num_saved() as u64);
        }

        #[test]
        fn prop_keeps_highest_priorities(
            capacity in 1usize..20,
            offered in proptest::collection::hash_set(1u32..1_000_000, 0..100),
        ) {
            let offered: Vec<f32> = offered.into_iter().map(|v| v as f32 / 1_000_000.0).collect();
            let mut r = Reservoir::new(capacity);
            for (i, p) in offered.iter().enumerate() {
                r.add(i, Priority::from_f32(*p));
            }
            let mut expected = offered.clone();
            expected.sort_by(|a, b| b.total_cmp(a));
            expected.truncate(capacity);
            expected.sort_by(f32::total_cmp);

            let mut kept: Vec<f32> = r.iter().map(|e| e.priority.as_f32()).collect();
            kept.sort_by(f32::total_cmp);
            prop_assert_eq!(kept, expected);
        }

        #[test]
        fn prop_split_sums_to_original(
            capacity in 0usize..50,
            n in 0usize..120,
        ) {
            let mut r = Reservoir::new(capacity);
            for i in 0..n {
                r.add(i, Priority::new());
            }
            let saved = r.num_saved();
            let seen = r.num_seen();
            let (a, b) = r.split();
            prop_assert_eq!(a.events.len() + b.events.len(), saved);
            prop_assert_eq!(a.num_seen + b.num_seen, seen);
        }
    }
}
