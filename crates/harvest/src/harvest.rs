// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The harvest coordinator.
//!
//! [`Harvest`] owns one live instance of every reservoir and the metric table,
//! plus the timer deciding when each is due. Producers on any thread add to
//! the live structures; a single cadence driver calls [`Harvest::ready`],
//! which swaps out whatever is due under the same lock, so a producer's write
//! lands either in the detached snapshot or in its fresh replacement and never
//! in between.
//!
//! A [`ReadyHarvest`] snapshot becomes an ordered list of payloads. Payloads
//! that fail delivery are handed back through
//! [`crate::payload::MergeIntoHarvest`] and join the next cycle.

use std::mem;
use std::sync::Mutex;
use std::time::SystemTime;

use tracing::debug;

use crate::config::connect::{ConnectReply, HarvestConfig};
use crate::error_traces::{ErrorTrace, ErrorTraces};
use crate::events::custom::{CustomEvent, CustomEvents};
use crate::events::error::{ErrorEvent, ErrorEvents};
use crate::events::log::{LogEvent, LogEvents};
use crate::events::span::{SpanEvent, SpanEvents};
use crate::events::txn::{TxnEvent, TxnEvents};
use crate::memory::MemoryMonitor;
use crate::metrics::names;
use crate::metrics::table::{MetricForce, MetricTable};
use crate::metrics::txn::{create_txn_metrics, TxnData};
use crate::payload::Payload;
use crate::timer::{HarvestTimer, HarvestTypes};

/// Most transaction events sent in one request when splitting is on.
pub const MAX_TXN_EVENTS_PER_PAYLOAD: usize = 5000;

/// Counters reported by the trace observer, when one is connected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TraceObserverStats {
    pub seen: u64,
    pub sent: u64,
}

/// The live structures producers write into.
#[derive(Debug)]
pub struct LiveHarvest {
    pub(crate) metrics: MetricTable,
    pub(crate) error_traces: ErrorTraces,
    pub(crate) txn_events: TxnEvents,
    pub(crate) custom_events: CustomEvents,
    pub(crate) error_events: ErrorEvents,
    pub(crate) span_events: SpanEvents,
    pub(crate) log_events: LogEvents,
}

impl LiveHarvest {
    fn new(config: &HarvestConfig, now: SystemTime) -> Self {
        LiveHarvest {
            metrics: MetricTable::new(config.max_metrics, now),
            error_traces: ErrorTraces::new(),
            txn_events: TxnEvents::new(config.max_txn_events),
            custom_events: CustomEvents::new(config.max_custom_events),
            error_events: ErrorEvents::new(config.max_error_events),
            span_events: SpanEvents::new(config.max_span_events),
            log_events: LogEvents::new(config.common_attributes.clone(), config.logging),
        }
    }

    fn record_seen_sent(&mut self, seen_name: &str, sent_name: &str, seen: u64, sent: usize) {
        self.metrics.add_count(seen_name, seen as f64, MetricForce::Forced);
        self.metrics.add_count(sent_name, sent as f64, MetricForce::Forced);
    }
}

#[derive(Debug)]
struct Inner {
    timer: HarvestTimer,
    live: LiveHarvest,
}

#[derive(Debug)]
pub struct Harvest {
    config: HarvestConfig,
    memory: Option<MemoryMonitor>,
    inner: Mutex<Inner>,
}

impl Harvest {
    #[must_use]
    pub fn new(config: HarvestConfig, now: SystemTime) -> Self {
        let inner = Inner {
            timer: HarvestTimer::new(now, config.report_periods.iter().copied()),
            live: LiveHarvest::new(&config, now),
        };
        Harvest {
            config,
            memory: None,
            inner: Mutex::new(inner),
        }
    }

    #[must_use]
    pub fn with_memory_monitor(mut self, monitor: MemoryMonitor) -> Self {
        self.memory = Some(monitor);
        self
    }

    #[must_use]
    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    #[allow(clippy::expect_used)]
    pub(crate) fn with_live<R>(&self, f: impl FnOnce(&mut LiveHarvest) -> R) -> R {
        let mut inner = self.inner.lock().expect("lock poisoned");
        f(&mut inner.live)
    }

    pub fn add_txn_event(&self, event: TxnEvent) {
        self.with_live(|live| live.txn_events.add(event));
    }

    pub fn add_custom_event(&self, event: CustomEvent) {
        self.with_live(|live| live.custom_events.add(event));
    }

    pub fn add_error_event(&self, event: ErrorEvent) {
        self.with_live(|live| live.error_events.add(event));
    }

    pub fn add_span_event(&self, event: SpanEvent) {
        self.with_live(|live| live.span_events.add(event));
    }

    pub fn add_log_event(&self, event: LogEvent) {
        self.with_live(|live| live.log_events.add(event));
    }

    pub fn add_error_trace(&self, trace: ErrorTrace) {
        self.with_live(|live| live.error_traces.add(trace));
    }

    /// Records the metrics of a finished transaction.
    pub fn record_txn_metrics(&self, txn: &TxnData) {
        self.with_live(|live| create_txn_metrics(txn, &mut live.metrics));
    }

    /// Merges a table built elsewhere, e.g. a transaction's scoped metrics.
    pub fn merge_metrics(&self, table: MetricTable, scope: &str) {
        self.with_live(|live| live.metrics.merge(table, scope));
    }

    /// Runs `f` against the live metric table.
    pub fn with_metrics<R>(&self, f: impl FnOnce(&mut MetricTable) -> R) -> R {
        self.with_live(|live| f(&mut live.metrics))
    }

    /// Hands an undelivered payload back for the next cycle.
    pub fn merge_failed(&self, payload: Box<dyn Payload>) {
        payload.merge_into_harvest(self);
    }

    /// Swaps out every structure that is due at `now`. Returns `None` when
    /// nothing is due.
    ///
    /// When the memory monitor reports pressure, every live structure is
    /// dropped first.
    #[allow(clippy::expect_used)]
    pub fn ready(&self, now: SystemTime) -> Option<ReadyHarvest> {
        let dump = self.memory.as_ref().is_some_and(|m| m.check(now));

        let mut guard = self.inner.lock().expect("lock poisoned");
        let Inner { timer, live } = &mut *guard;

        if dump {
            debug!("Emergency dump of all live harvest data");
            *live = LiveHarvest::new(&self.config, now);
        }

        let types = timer.ready(now);
        if types.is_empty() {
            return None;
        }
        Some(self.detach(live, types, now))
    }

    /// Detaches every structure regardless of the timer. Used for the final
    /// flush on shutdown.
    #[allow(clippy::expect_used)]
    pub fn ready_all(&self, now: SystemTime) -> ReadyHarvest {
        let mut guard = self.inner.lock().expect("lock poisoned");
        self.detach(&mut guard.live, HarvestTypes::ALL, now)
    }

    fn detach(&self, live: &mut LiveHarvest, types: HarvestTypes, now: SystemTime) -> ReadyHarvest {
        let config = &self.config;
        let mut ready = ReadyHarvest::empty(types, now);

        if types.contains(HarvestTypes::CUSTOM_EVENTS) {
            let events = mem::replace(
                &mut live.custom_events,
                CustomEvents::new(config.max_custom_events),
            );
            live.record_seen_sent(
                names::CUSTOM_EVENTS_SEEN,
                names::CUSTOM_EVENTS_SENT,
                events.num_seen(),
                events.num_saved(),
            );
            ready.custom_events = Some(events);
        }
        if types.contains(HarvestTypes::LOG_EVENTS) {
            let fresh = live.log_events.fresh();
            let logs = mem::replace(&mut live.log_events, fresh);
            logs.record_logging_metrics(&mut live.metrics);
            ready.log_events = Some(logs);
        }
        if types.contains(HarvestTypes::TXN_EVENTS) {
            let events = mem::replace(&mut live.txn_events, TxnEvents::new(config.max_txn_events));
            live.record_seen_sent(
                names::TXN_EVENTS_SEEN,
                names::TXN_EVENTS_SENT,
                events.num_seen(),
                events.num_saved(),
            );
            ready.txn_events = Some(events);
        }
        if types.contains(HarvestTypes::ERROR_EVENTS) {
            let events = mem::replace(
                &mut live.error_events,
                ErrorEvents::new(config.max_error_events),
            );
            live.record_seen_sent(
                names::ERROR_EVENTS_SEEN,
                names::ERROR_EVENTS_SENT,
                events.num_seen(),
                events.num_saved(),
            );
            ready.error_events = Some(events);
        }
        if types.contains(HarvestTypes::SPAN_EVENTS) {
            let events = mem::replace(
                &mut live.span_events,
                SpanEvents::new(config.max_span_events),
            );
            live.record_seen_sent(
                names::SPAN_EVENTS_SEEN,
                names::SPAN_EVENTS_SENT,
                events.num_seen(),
                events.num_saved(),
            );
            ready.span_events = Some(events);
        }
        // Last, so the event counters above go out in this cycle.
        if types.contains(HarvestTypes::METRICS_TRACES) {
            ready.metrics = Some(mem::replace(
                &mut live.metrics,
                MetricTable::new(config.max_metrics, now),
            ));
            ready.error_traces = Some(mem::take(&mut live.error_traces));
        }

        debug!("Harvest ready for {types:?}");
        ready
    }
}

/// Structures detached by one [`Harvest::ready`] call.
#[derive(Debug)]
pub struct ReadyHarvest {
    pub types: HarvestTypes,
    pub harvest_start: SystemTime,
    pub metrics: Option<MetricTable>,
    pub error_traces: Option<ErrorTraces>,
    pub txn_events: Option<TxnEvents>,
    pub custom_events: Option<CustomEvents>,
    pub error_events: Option<ErrorEvents>,
    pub span_events: Option<SpanEvents>,
    pub log_events: Option<LogEvents>,
}

impl ReadyHarvest {
    fn empty(types: HarvestTypes, harvest_start: SystemTime) -> Self {
        ReadyHarvest {
            types,
            harvest_start,
            metrics: None,
            error_traces: None,
            txn_events: None,
            custom_events: None,
            error_events: None,
            span_events: None,
            log_events: None,
        }
    }

    /// Adds the supportability metrics describing this harvest, then applies
    /// the collector's metric name rules. Does nothing unless metrics are part
    /// of this harvest.
    pub fn create_final_metrics(
        &mut self,
        reply: &ConnectReply,
        config: &HarvestConfig,
        trace_observer: Option<&TraceObserverStats>,
    ) {
        let Some(mut metrics) = self.metrics.take() else {
            return;
        };

        metrics.add_single_count(names::INSTANCE_REPORTING, MetricForce::Forced);

        let period = reply.configurable_period();
        metrics.add_duration(names::REPORT_PERIOD, "", period, period, MetricForce::Forced);
        for (name, limit) in [
            (names::TXN_EVENTS_LIMIT, config.max_txn_events),
            (names::CUSTOM_EVENTS_LIMIT, config.max_custom_events),
            (names::ERROR_EVENTS_LIMIT, config.max_error_events),
            (names::SPAN_EVENTS_LIMIT, config.max_span_events),
            (names::LOG_EVENTS_LIMIT, config.logging.max_events),
        ] {
            metrics.add_value(name, "", limit as f64, MetricForce::Forced);
        }

        metrics.add_single_count(&names::agent_version(crate::AGENT_VERSION), MetricForce::Forced);
        metrics.add_single_count(
            &names::platform(std::env::consts::OS, std::env::consts::ARCH),
            MetricForce::Forced,
        );

        if let Some(stats) = trace_observer {
            metrics.add_count(names::TRACE_OBSERVER_SEEN, stats.seen as f64, MetricForce::Forced);
            metrics.add_count(names::TRACE_OBSERVER_SENT, stats.sent as f64, MetricForce::Forced);
        }

        self.metrics = Some(metrics.apply_rules(&reply.metric_name_rules));
    }

    /// Turns the snapshot into payloads, in delivery order: custom events,
    /// logs, transaction events, error events, span events, metrics, error
    /// traces.
    #[must_use]
    pub fn payloads(self, split_large_txn_events: bool) -> Vec<Box<dyn Payload>> {
        let mut payloads: Vec<Box<dyn Payload>> = Vec::new();
        if let Some(events) = self.custom_events {
            payloads.push(Box::new(events));
        }
        if let Some(logs) = self.log_events {
            payloads.push(Box::new(logs));
        }
        if let Some(events) = self.txn_events {
            if split_large_txn_events {
                payloads.extend(events.into_payloads(MAX_TXN_EVENTS_PER_PAYLOAD));
            } else {
                payloads.push(Box::new(events));
            }
        }
        if let Some(events) = self.error_events {
            payloads.push(Box::new(events));
        }
        if let Some(events) = self.span_events {
            payloads.push(Box::new(events));
        }
        if let Some(metrics) = self.metrics {
            payloads.push(Box::new(metrics));
        }
        if let Some(traces) = self.error_traces {
            payloads.push(Box::new(traces));
        }
        payloads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::connect::FIXED_HARVEST_PERIOD;
    use crate::config::Config;
    use crate::error_traces::tests::error_trace;
    use crate::events::custom::tests::custom_event;
    use crate::events::error::tests::error_event;
    use crate::events::log::tests::log_event;
    use crate::events::span::tests::span_event;
    use crate::memory::FixedUsageReader;
    use crate::metrics::txn::tests::web_txn;
    use crate::priority::Priority;
    use std::time::{Duration, UNIX_EPOCH};

    fn t0() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(100_000)
    }

    fn count(mt: &MetricTable, name: &str) -> f64 {
        mt.get(name, "").map_or(0.0, |m| m.data.count_satisfied)
    }

    fn endpoints(payloads: &[Box<dyn Payload>]) -> Vec<&'static str> {
        payloads.iter().map(|p| p.endpoint_method()).collect()
    }

    fn txn_event(priority: f32) -> TxnEvent {
        let mut txn = web_txn("WebTransaction/Go/hello");
        txn.priority = Priority::from_f32(priority);
        TxnEvent::from_txn_data(&txn)
    }

    #[test]
    fn test_not_ready_before_period() {
        let h = Harvest::new(HarvestConfig::default(), t0());
        assert!(h.ready(t0() + Duration::from_secs(59)).is_none());
        assert!(h.ready(t0() + FIXED_HARVEST_PERIOD).is_some());
    }

    #[test]
    fn test_ready_detaches_and_resets() {
        let h = Harvest::new(HarvestConfig::default(), t0());
        h.add_txn_event(txn_event(0.5));
        h.add_custom_event(custom_event(0.5));
        h.add_error_event(error_event(0.5));
        h.add_span_event(span_event(0.5));
        h.add_log_event(log_event("INFO", 0.5));
        h.add_error_trace(error_trace(1));
        h.record_txn_metrics(&web_txn("WebTransaction/Go/hello"));

        let ready = h.ready(t0() + FIXED_HARVEST_PERIOD).expect("ready");
        assert_eq!(ready.types, HarvestTypes::ALL);
        assert_eq!(ready.txn_events.as_ref().map(TxnEvents::num_saved), Some(1));
        assert_eq!(ready.error_traces.as_ref().map(ErrorTraces::len), Some(1));

        let metrics = ready.metrics.as_ref().expect("metrics");
        assert_eq!(count(metrics, names::TXN_EVENTS_SEEN), 1.0);
        assert_eq!(count(metrics, names::TXN_EVENTS_SENT), 1.0);
        assert_eq!(count(metrics, names::CUSTOM_EVENTS_SEEN), 1.0);
        assert_eq!(count(metrics, names::ERROR_EVENTS_SENT), 1.0);
        assert_eq!(count(metrics, names::SPAN_EVENTS_SEEN), 1.0);
        assert_eq!(count(metrics, names::LOGGING_LINES), 1.0);
        assert!(metrics.get("WebTransaction", "").is_some());

        h.with_live(|live| {
            assert_eq!(live.txn_events.num_seen(), 0);
            assert_eq!(live.txn_events.capacity(), 10_000);
            assert_eq!(live.log_events.num_seen(), 0);
            assert!(live.metrics.is_empty());
            assert!(live.error_traces.is_empty());
        });
    }

    #[test]
    fn test_event_bucket_without_metrics_keeps_counters_live() {
        let reply = ConnectReply::from_json(
            br#"{"event_harvest_config": {
                "report_period_ms": 5000,
                "harvest_limits": {"analytic_event_data": 10}
            }}"#,
        )
        .expect("reply");
        let config = HarvestConfig::new(Some(&reply), &Config::default());
        let h = Harvest::new(config, t0());
        h.add_txn_event(txn_event(0.5));

        let ready = h.ready(t0() + Duration::from_secs(5)).expect("ready");
        assert_eq!(ready.types, HarvestTypes::TXN_EVENTS);
        assert!(ready.metrics.is_none());
        h.with_live(|live| {
            assert_eq!(count(&live.metrics, names::TXN_EVENTS_SEEN), 1.0);
            assert_eq!(live.txn_events.capacity(), 10);
        });
    }

    #[test]
    fn test_payload_order() {
        let h = Harvest::new(HarvestConfig::default(), t0());
        let ready = h.ready(t0() + FIXED_HARVEST_PERIOD).expect("ready");
        let payloads = ready.payloads(true);
        assert_eq!(
            endpoints(&payloads),
            vec![
                "custom_event_data",
                "log_event_data",
                "analytic_event_data",
                "error_event_data",
                "span_event_data",
                "metric_data",
                "error_data",
            ]
        );
    }

    #[test]
    fn test_split_large_txn_events() {
        let txn_payloads = |split: bool| {
            let config = HarvestConfig {
                max_txn_events: MAX_TXN_EVENTS_PER_PAYLOAD * 2,
                ..HarvestConfig::default()
            };
            let h = Harvest::new(config, t0());
            for _ in 0..=MAX_TXN_EVENTS_PER_PAYLOAD {
                h.add_txn_event(txn_event(0.5));
            }
            let ready = h.ready(t0() + FIXED_HARVEST_PERIOD).expect("ready");
            ready
                .payloads(split)
                .into_iter()
                .filter(|p| p.endpoint_method() == "analytic_event_data")
                .count()
        };
        assert_eq!(txn_payloads(false), 1);
        assert_eq!(txn_payloads(true), 2);
    }

    #[test]
    fn test_create_final_metrics() {
        let reply = ConnectReply::from_json(
            br#"{"metric_name_rules": [{
                "match_expression": "^Instance/Reporting$",
                "replacement": "Instance/Renamed"
            }]}"#,
        )
        .expect("reply");
        let config = HarvestConfig::default();
        let h = Harvest::new(config.clone(), t0());
        let mut ready = h.ready(t0() + FIXED_HARVEST_PERIOD).expect("ready");
        ready.create_final_metrics(
            &reply,
            &config,
            Some(&TraceObserverStats { seen: 7, sent: 5 }),
        );
        let metrics = ready.metrics.as_ref().expect("metrics");
        assert!(metrics.get(names::INSTANCE_REPORTING, "").is_none());
        assert_eq!(count(metrics, "Instance/Renamed"), 1.0);
        let period = metrics.get(names::REPORT_PERIOD, "").expect("period").data;
        assert_eq!(period.total_tolerated, 60.0);
        let limit = metrics.get(names::TXN_EVENTS_LIMIT, "").expect("limit").data;
        assert_eq!(limit.total_tolerated, 10_000.0);
        let log_limit = metrics.get(names::LOG_EVENTS_LIMIT, "").expect("limit").data;
        assert_eq!(log_limit.total_tolerated, 10_000.0);
        assert_eq!(count(metrics, names::TRACE_OBSERVER_SEEN), 7.0);
        assert_eq!(count(metrics, names::TRACE_OBSERVER_SENT), 5.0);
        assert_eq!(
            count(metrics, &names::agent_version(crate::AGENT_VERSION)),
            1.0
        );
    }

    #[test]
    fn test_ready_all_ignores_timer() {
        let h = Harvest::new(HarvestConfig::default(), t0());
        h.add_span_event(span_event(0.5));
        let ready = h.ready_all(t0());
        assert_eq!(ready.types, HarvestTypes::ALL);
        assert_eq!(ready.span_events.as_ref().map(SpanEvents::num_saved), Some(1));
        // The timer still fires on its own schedule.
        assert!(h.ready(t0() + FIXED_HARVEST_PERIOD).is_some());
    }

    #[test]
    fn test_create_final_metrics_without_metrics_bucket() {
        let mut ready = ReadyHarvest::empty(HarvestTypes::TXN_EVENTS, t0());
        ready.create_final_metrics(&ConnectReply::default(), &HarvestConfig::default(), None);
        assert!(ready.metrics.is_none());
    }

    #[test]
    fn test_failed_payloads_merge_into_next_cycle() {
        let h = Harvest::new(HarvestConfig::default(), t0());
        h.add_txn_event(txn_event(0.5));
        h.with_metrics(|m| m.add_single_count("Custom/count", MetricForce::Unforced));
        let ready = h.ready(t0() + FIXED_HARVEST_PERIOD).expect("ready");
        for payload in ready.payloads(true) {
            h.merge_failed(payload);
        }
        h.with_live(|live| {
            assert_eq!(live.txn_events.num_saved(), 1);
            assert_eq!(live.txn_events.num_seen(), 1);
            assert_eq!(live.txn_events.reservoir().failed_harvests(), 1);
            assert_eq!(live.metrics.failed_harvests(), 1);
            assert_eq!(count(&live.metrics, "Custom/count"), 1.0);
            assert!(live.error_traces.is_empty());
        });
    }

    #[test]
    fn test_emergency_dump() {
        let monitor = MemoryMonitor::new(1_000, Box::new(FixedUsageReader::new(2_000)));
        let h = Harvest::new(HarvestConfig::default(), t0()).with_memory_monitor(monitor);
        h.add_txn_event(txn_event(0.5));
        h.add_log_event(log_event("INFO", 0.5));
        h.with_metrics(|m| m.add_single_count("Custom/count", MetricForce::Forced));

        // Nothing due, but the dump still happens.
        assert!(h.ready(t0() + Duration::from_secs(1)).is_none());
        h.with_live(|live| {
            assert_eq!(live.txn_events.num_seen(), 0);
            assert_eq!(live.log_events.num_seen(), 0);
            assert!(live.metrics.is_empty());
        });
    }

    #[test]
    fn test_concurrent_producers() {
        let h = std::sync::Arc::new(Harvest::new(HarvestConfig::default(), t0()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let h = std::sync::Arc::clone(&h);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        h.add_custom_event(custom_event(0.5));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("producer panicked");
        }
        let ready = h.ready(t0() + FIXED_HARVEST_PERIOD).expect("ready");
        assert_eq!(ready.custom_events.as_ref().map(CustomEvents::num_seen), Some(1000));
    }
}
