// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event priority.
//!
//! Every event offered to a reservoir carries a [`Priority`]. When a reservoir
//! is full, the event with the lowest priority is the one evicted. Priorities
//! are drawn uniformly from `(0, 1)` and can be boosted for events that must
//! outrank ordinary traffic:
//!
//! - sampled distributed-trace transactions: `+1.0`
//! - synthetic-origin transactions: `+2.0`, which beats any unboosted or
//!   sampled-only event, even in a reservoir of capacity 1
//!
//! Two events with exactly equal priority are ordered however the heap happens
//! to order them; no stability is promised.

use serde::{Serialize, Serializer};
use std::cmp::Ordering;

const SAMPLED_BOOST: f32 = 1.0;
const SYNTHETICS_BOOST: f32 = 2.0;

#[derive(Clone, Copy, Debug, Default)]
pub struct Priority(f32);

impl Priority {
    /// Draws a fresh random priority in `(0, 1)`.
    #[must_use]
    pub fn new() -> Self {
        Self::from_random(fastrand::f32)
    }

    /// Draws from `rnd` until a non-zero value comes out, so that no event is
    /// ever created with the lowest possible priority.
    pub fn from_random(mut rnd: impl FnMut() -> f32) -> Self {
        loop {
            let r = rnd();
            if r != 0.0 {
                return Priority(r);
            }
        }
    }

    #[must_use]
    pub const fn from_f32(value: f32) -> Self {
        Priority(value)
    }

    #[must_use]
    pub const fn as_f32(self) -> f32 {
        self.0
    }

    #[must_use]
    pub fn is_lower_priority(self, other: Priority) -> bool {
        self.0 < other.0
    }

    #[must_use]
    pub fn boost_sampled(self) -> Self {
        Priority(self.0 + SAMPLED_BOOST)
    }

    #[must_use]
    pub fn boost_synthetics(self) -> Self {
        Priority(self.0 + SYNTHETICS_BOOST)
    }
}

impl PartialEq for Priority {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Priority {}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Serialize for Priority {
    // Six decimals is what the collector expects; anything past that is noise.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let rounded = (f64::from(self.0) * 1_000_000.0).round() / 1_000_000.0;
        serializer.serialize_f64(rounded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_random_skips_zero() {
        let mut draws = vec![0.0, 0.0, 0.25].into_iter();
        let p = Priority::from_random(|| draws.next().unwrap_or(0.5));
        assert!((p.as_f32() - 0.25).abs() < f32::EPSILON);
    }

    #[test]
    fn test_new_is_in_unit_interval() {
        for _ in 0..1000 {
            let p = Priority::new().as_f32();
            assert!(p > 0.0 && p < 1.0, "priority {p} out of range");
        }
    }

    #[test]
    fn test_is_lower_priority() {
        let low = Priority::from_f32(0.1);
        let high = Priority::from_f32(0.9);
        assert!(low.is_lower_priority(high));
        assert!(!high.is_lower_priority(low));
        assert!(!low.is_lower_priority(low));
    }

    #[test]
    fn test_synthetics_boost_beats_everything_unboosted() {
        let synthetic = Priority::from_f32(0.000_001).boost_synthetics();
        let sampled = Priority::from_f32(0.999_999).boost_sampled();
        assert!(sampled.is_lower_priority(synthetic));
        assert!(Priority::from_f32(0.999_999).is_lower_priority(synthetic));
    }

    #[test]
    fn test_serialize_rounds_to_six_decimals() {
        let json = serde_json::to_string(&Priority::from_f32(0.5)).expect("serialize");
        assert_eq!(json, "0.5");
        let json = serde_json::to_string(&Priority::from_f32(0.123_456_78)).expect("serialize");
        assert_eq!(json, "0.123457");
    }
}
