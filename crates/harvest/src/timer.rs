// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Multi-period harvest timer.
//!
//! Each bucket is a set of data types that harvest together on one period.
//! A bucket's last-harvest time only moves forward by whole periods, so a late
//! `ready` call does not shift the cadence and a missed call is caught up on
//! the next one.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::time::{Duration, SystemTime};

use tracing::warn;

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct HarvestTypes(u8);

impl HarvestTypes {
    pub const NONE: HarvestTypes = HarvestTypes(0);
    /// Metrics and error traces.
    pub const METRICS_TRACES: HarvestTypes = HarvestTypes(1 << 0);
    pub const TXN_EVENTS: HarvestTypes = HarvestTypes(1 << 1);
    pub const CUSTOM_EVENTS: HarvestTypes = HarvestTypes(1 << 2);
    pub const ERROR_EVENTS: HarvestTypes = HarvestTypes(1 << 3);
    pub const SPAN_EVENTS: HarvestTypes = HarvestTypes(1 << 4);
    pub const LOG_EVENTS: HarvestTypes = HarvestTypes(1 << 5);
    pub const EVENTS: HarvestTypes = HarvestTypes(
        Self::TXN_EVENTS.0
            | Self::CUSTOM_EVENTS.0
            | Self::ERROR_EVENTS.0
            | Self::SPAN_EVENTS.0
            | Self::LOG_EVENTS.0,
    );
    pub const ALL: HarvestTypes = HarvestTypes(Self::METRICS_TRACES.0 | Self::EVENTS.0);

    /// True when every type in `other` is also in `self`.
    #[must_use]
    pub const fn contains(self, other: HarvestTypes) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when `self` and `other` share any type.
    #[must_use]
    pub const fn intersects(self, other: HarvestTypes) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for HarvestTypes {
    type Output = HarvestTypes;

    fn bitor(self, rhs: HarvestTypes) -> HarvestTypes {
        HarvestTypes(self.0 | rhs.0)
    }
}

impl BitOrAssign for HarvestTypes {
    fn bitor_assign(&mut self, rhs: HarvestTypes) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for HarvestTypes {
    type Output = HarvestTypes;

    fn bitand(self, rhs: HarvestTypes) -> HarvestTypes {
        HarvestTypes(self.0 & rhs.0)
    }
}

impl fmt::Debug for HarvestTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(HarvestTypes, &str); 6] = [
            (HarvestTypes::METRICS_TRACES, "METRICS_TRACES"),
            (HarvestTypes::TXN_EVENTS, "TXN_EVENTS"),
            (HarvestTypes::CUSTOM_EVENTS, "CUSTOM_EVENTS"),
            (HarvestTypes::ERROR_EVENTS, "ERROR_EVENTS"),
            (HarvestTypes::SPAN_EVENTS, "SPAN_EVENTS"),
            (HarvestTypes::LOG_EVENTS, "LOG_EVENTS"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(t, _)| self.contains(*t))
            .map(|(_, n)| *n)
            .collect();
        if names.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

#[derive(Clone, Debug)]
struct Bucket {
    types: HarvestTypes,
    period: Duration,
    last_harvest: SystemTime,
}

#[derive(Clone, Debug)]
pub struct HarvestTimer {
    buckets: Vec<Bucket>,
}

impl HarvestTimer {
    /// Starts every bucket at `now`. Buckets with a zero period never fire.
    pub fn new(
        now: SystemTime,
        periods: impl IntoIterator<Item = (HarvestTypes, Duration)>,
    ) -> Self {
        let buckets = periods
            .into_iter()
            .filter(|(types, period)| {
                if period.is_zero() {
                    warn!("Ignoring zero harvest period for {types:?}");
                    return false;
                }
                !types.is_empty()
            })
            .map(|(types, period)| Bucket {
                types,
                period,
                last_harvest: now,
            })
            .collect();
        HarvestTimer { buckets }
    }

    /// Returns the types whose period has elapsed, advancing each of those
    /// buckets by exactly one period.
    pub fn ready(&mut self, now: SystemTime) -> HarvestTypes {
        let mut ready = HarvestTypes::NONE;
        for bucket in &mut self.buckets {
            let deadline = bucket.last_harvest + bucket.period;
            if deadline <= now {
                bucket.last_harvest = deadline;
                ready |= bucket.types;
            }
        }
        ready
    }

    #[must_use]
    pub fn period(&self, types: HarvestTypes) -> Option<Duration> {
        self.buckets
            .iter()
            .find(|b| b.types.contains(types))
            .map(|b| b.period)
    }
}
