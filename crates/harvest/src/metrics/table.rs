// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metric table.
//!
//! Metrics are keyed by `(name, scope)` and accumulate a six-value summary.
//! For duration metrics the values are count, total, exclusive total, min,
//! max and sum of squares; apdex metrics reuse the first three slots as
//! satisfied / tolerating / failing counts.
//!
//! The table is capped at `max_table_size` distinct keys. Past the cap, new
//! unforced keys are dropped and counted under
//! [`SUPPORTABILITY_DROPPED`]; forced keys still get in, so supportability
//! bookkeeping never disappears.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use serde::ser::{Serialize, SerializeSeq, SerializeStruct, Serializer};
use tracing::debug;

use crate::harvest::Harvest;
use crate::metrics::rules::MetricRules;
use crate::metrics::txn::ApdexZone;
use crate::payload::{
    unix_secs, MergeIntoHarvest, PayloadCreator, PayloadError, ENDPOINT_METRICS,
};
use crate::FAILED_METRIC_ATTEMPTS_LIMIT;

/// Counts metrics dropped because the table was full.
pub const SUPPORTABILITY_DROPPED: &str = "Supportability/MetricsDropped";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricForce {
    /// Reported regardless of table capacity.
    Forced,
    Unforced,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricId {
    pub name: String,
    pub scope: String,
}

impl MetricId {
    pub fn new(name: impl Into<String>, scope: impl Into<String>) -> Self {
        MetricId {
            name: name.into(),
            scope: scope.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct MetricData {
    /// Call count, or satisfied count for apdex.
    pub count_satisfied: f64,
    /// Total seconds, or tolerating count for apdex.
    pub total_tolerated: f64,
    /// Exclusive seconds, or failing count for apdex.
    pub exclusive_failed: f64,
    pub min: f64,
    pub max: f64,
    pub sum_squares: f64,
}

impl MetricData {
    #[must_use]
    pub fn from_duration(duration: Duration, exclusive: Duration) -> Self {
        let ds = duration.as_secs_f64();
        MetricData {
            count_satisfied: 1.0,
            total_tolerated: ds,
            exclusive_failed: exclusive.as_secs_f64(),
            min: ds,
            max: ds,
            sum_squares: ds * ds,
        }
    }

    #[must_use]
    pub fn from_value(total: f64, exclusive: f64) -> Self {
        MetricData {
            count_satisfied: 1.0,
            total_tolerated: total,
            exclusive_failed: exclusive,
            min: total,
            max: total,
            sum_squares: total * total,
        }
    }

    #[must_use]
    pub fn from_count(count: f64) -> Self {
        MetricData {
            count_satisfied: count,
            ..MetricData::default()
        }
    }

    #[must_use]
    pub fn from_apdex(threshold: Duration, zone: ApdexZone) -> Self {
        let t = threshold.as_secs_f64();
        let mut data = MetricData {
            min: t,
            max: t,
            ..MetricData::default()
        };
        match zone {
            ApdexZone::Satisfying => data.count_satisfied = 1.0,
            ApdexZone::Tolerating => data.total_tolerated = 1.0,
            ApdexZone::Failing => data.exclusive_failed = 1.0,
        }
        data
    }

    /// Sums the additive values and reduces min/max.
    pub fn aggregate(&mut self, src: &MetricData) {
        self.count_satisfied += src.count_satisfied;
        self.total_tolerated += src.total_tolerated;
        self.exclusive_failed += src.exclusive_failed;
        self.min = self.min.min(src.min);
        self.max = self.max.max(src.max);
        self.sum_squares += src.sum_squares;
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Metric {
    pub forced: MetricForce,
    pub data: MetricData,
}

#[derive(Clone, Debug)]
pub struct MetricTable {
    period_start: SystemTime,
    failed_harvests: u32,
    max_table_size: usize,
    metrics: HashMap<MetricId, Metric>,
}

impl MetricTable {
    #[must_use]
    pub fn new(max_table_size: usize, period_start: SystemTime) -> Self {
        MetricTable {
            period_start,
            failed_harvests: 0,
            max_table_size,
            metrics: HashMap::new(),
        }
    }

    #[must_use]
    pub fn period_start(&self) -> SystemTime {
        self.period_start
    }

    #[must_use]
    pub fn max_table_size(&self) -> usize {
        self.max_table_size
    }

    #[must_use]
    pub fn failed_harvests(&self) -> u32 {
        self.failed_harvests
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    #[must_use]
    pub fn get(&self, name: &str, scope: &str) -> Option<&Metric> {
        self.metrics.get(&MetricId::new(name, scope))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MetricId, &Metric)> {
        self.metrics.iter()
    }

    pub fn merge_metric(&mut self, id: MetricId, metric: Metric) {
        if let Some(existing) = self.metrics.get_mut(&id) {
            existing.data.aggregate(&metric.data);
            return;
        }
        if self.metrics.len() >= self.max_table_size && metric.forced == MetricForce::Unforced {
            debug!("Metric table full, dropping {}", id.name);
            self.add_single_count(SUPPORTABILITY_DROPPED, MetricForce::Forced);
            return;
        }
        self.metrics.insert(id, metric);
    }

    fn add(&mut self, name: &str, scope: &str, data: MetricData, forced: MetricForce) {
        self.merge_metric(MetricId::new(name, scope), Metric { forced, data });
    }

    pub fn add_duration(
        &mut self,
        name: &str,
        scope: &str,
        duration: Duration,
        exclusive: Duration,
        forced: MetricForce,
    ) {
        self.add(name, scope, MetricData::from_duration(duration, exclusive), forced);
    }

    pub fn add_value(&mut self, name: &str, scope: &str, total: f64, forced: MetricForce) {
        self.add(name, scope, MetricData::from_value(total, total), forced);
    }

    pub fn add_value_exclusive(
        &mut self,
        name: &str,
        scope: &str,
        total: f64,
        exclusive: f64,
        forced: MetricForce,
    ) {
        self.add(name, scope, MetricData::from_value(total, exclusive), forced);
    }

    pub fn add_apdex(
        &mut self,
        name: &str,
        scope: &str,
        threshold: Duration,
        zone: ApdexZone,
        forced: MetricForce,
    ) {
        self.add(name, scope, MetricData::from_apdex(threshold, zone), forced);
    }

    pub fn add_count(&mut self, name: &str, count: f64, forced: MetricForce) {
        self.add(name, "", MetricData::from_count(count), forced);
    }

    pub fn add_single_count(&mut self, name: &str, forced: MetricForce) {
        self.add_count(name, 1.0, forced);
    }

    /// Merges `other` into this table. Entries of `other` without a scope of
    /// their own take `scope`.
    pub fn merge(&mut self, other: MetricTable, scope: &str) {
        for (mut id, metric) in other.metrics {
            if id.scope.is_empty() && !scope.is_empty() {
                id.scope = scope.to_string();
            }
            self.merge_metric(id, metric);
        }
    }

    /// Merges a table whose delivery failed, unless it has already failed
    /// [`FAILED_METRIC_ATTEMPTS_LIMIT`] times.
    pub fn merge_failed(&mut self, other: MetricTable) -> bool {
        let fails = other.failed_harvests + 1;
        if fails >= FAILED_METRIC_ATTEMPTS_LIMIT {
            debug!(
                "Discarding {} metrics after {} failed harvests",
                other.len(),
                fails
            );
            return false;
        }
        if other.period_start < self.period_start {
            self.period_start = other.period_start;
        }
        self.failed_harvests = fails;
        self.merge(other, "");
        true
    }

    /// Returns a new table with every name passed through `rules`. Names the
    /// rules ignore are dropped; names rewritten onto the same output merge.
    /// The cap is not applied again: every entry already got past it.
    #[must_use]
    pub fn apply_rules(self, rules: &MetricRules) -> MetricTable {
        if rules.is_empty() {
            return self;
        }
        let mut applied = MetricTable::new(self.max_table_size, self.period_start);
        applied.failed_harvests = self.failed_harvests;
        let mut renamed: HashMap<String, Option<String>> = HashMap::new();
        for (id, metric) in self.metrics {
            let out = renamed
                .entry(id.name.clone())
                .or_insert_with(|| rules.apply(&id.name))
                .clone();
            let Some(name) = out else {
                continue;
            };
            let id = MetricId {
                name,
                scope: id.scope,
            };
            match applied.metrics.entry(id) {
                Entry::Occupied(mut existing) => existing.get_mut().data.aggregate(&metric.data),
                Entry::Vacant(slot) => {
                    slot.insert(metric);
                }
            }
        }
        applied
    }

    fn sorted(&self) -> Vec<(&MetricId, &Metric)> {
        let mut entries: Vec<_> = self.metrics.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }
}

struct WireId<'a>(&'a MetricId);

impl Serialize for WireId<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let fields = if self.0.scope.is_empty() { 1 } else { 2 };
        let mut s = serializer.serialize_struct("MetricId", fields)?;
        s.serialize_field("name", &self.0.name)?;
        if !self.0.scope.is_empty() {
            s.serialize_field("scope", &self.0.scope)?;
        }
        s.end()
    }
}

struct WireData<'a>(&'a MetricData);

impl Serialize for WireData<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let d = self.0;
        let mut seq = serializer.serialize_seq(Some(6))?;
        for v in [
            d.count_satisfied,
            d.total_tolerated,
            d.exclusive_failed,
            d.min,
            d.max,
            d.sum_squares,
        ] {
            seq.serialize_element(&v)?;
        }
        seq.end()
    }
}

impl PayloadCreator for MetricTable {
    fn data(
        &self,
        agent_run_id: &str,
        harvest_start: SystemTime,
    ) -> Result<Option<Vec<u8>>, PayloadError> {
        if self.metrics.is_empty() {
            return Ok(None);
        }
        let metrics: Vec<(WireId<'_>, WireData<'_>)> = self
            .sorted()
            .into_iter()
            .map(|(id, m)| (WireId(id), WireData(&m.data)))
            .collect();
        serde_json::to_vec(&(
            agent_run_id,
            unix_secs(self.period_start),
            unix_secs(harvest_start),
            metrics,
        ))
        .map(Some)
        .map_err(PayloadError::serialization(ENDPOINT_METRICS))
    }

    fn endpoint_method(&self) -> &'static str {
        ENDPOINT_METRICS
    }
}

impl MergeIntoHarvest for MetricTable {
    fn merge_into_harvest(self: Box<Self>, harvest: &Harvest) {
        let table = *self;
        harvest.with_live(move |live| live.metrics.merge_failed(table));
    }
}
