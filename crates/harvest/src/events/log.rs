// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Forwarded application log lines.
//!
//! Log events sample through the same priority reservoir as the analytic
//! events, but also count every offered line by severity so the
//! `Logging/lines` metrics stay exact even when lines are dropped.
//!
//! Payload:
//!
//! ```json
//! [{"common": {"attributes": {"entity.guid": "..", "entity.name": "..", "hostname": ".."}},
//!   "logs": [{"level": "INFO", "message": "..", "timestamp": 1700000000000}]}]
//! ```

use std::collections::HashMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::events::reservoir::{split_count, Reservoir};
use crate::harvest::Harvest;
use crate::metrics::names::{logging_lines_severity, LOGGING_DROPPED, LOGGING_LINES};
use crate::metrics::table::{MetricForce, MetricTable};
use crate::payload::{
    unix_millis, MergeIntoHarvest, PayloadCreator, PayloadError, ENDPOINT_LOG_EVENTS,
};
use crate::priority::Priority;

pub const MAX_LOG_MESSAGE_LENGTH: usize = 32768;
pub const UNKNOWN_SEVERITY: &str = "UNKNOWN";

#[derive(Clone, Debug)]
pub struct LogEvent {
    severity: String,
    message: String,
    timestamp: SystemTime,
    span_id: Option<String>,
    trace_id: Option<String>,
    priority: Priority,
}

fn truncate(mut message: String) -> String {
    if message.len() > MAX_LOG_MESSAGE_LENGTH {
        let mut end = MAX_LOG_MESSAGE_LENGTH;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}

impl LogEvent {
    #[must_use]
    pub fn new(severity: &str, message: String, timestamp: SystemTime) -> Self {
        let severity = if severity.trim().is_empty() {
            UNKNOWN_SEVERITY.to_string()
        } else {
            severity.to_string()
        };
        LogEvent {
            severity,
            message: truncate(message),
            timestamp,
            span_id: None,
            trace_id: None,
            priority: Priority::new(),
        }
    }

    /// Links the line to the transaction it was written in and inherits that
    /// transaction's priority.
    #[must_use]
    pub fn with_trace_context(
        mut self,
        trace_id: String,
        span_id: String,
        priority: Priority,
    ) -> Self {
        self.trace_id = Some(trace_id);
        self.span_id = Some(span_id);
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn severity(&self) -> &str {
        &self.severity
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }
}

#[derive(Serialize)]
struct WireLog<'a> {
    level: &'a str,
    message: &'a str,
    timestamp: u64,
    #[serde(rename = "span.id", skip_serializing_if = "Option::is_none")]
    span_id: Option<&'a str>,
    #[serde(rename = "trace.id", skip_serializing_if = "Option::is_none")]
    trace_id: Option<&'a str>,
}

impl<'a> From<&'a LogEvent> for WireLog<'a> {
    fn from(e: &'a LogEvent) -> Self {
        WireLog {
            level: &e.severity,
            message: &e.message,
            timestamp: unix_millis(e.timestamp),
            span_id: e.span_id.as_deref(),
            trace_id: e.trace_id.as_deref(),
        }
    }
}

/// Attributes sent once per payload rather than per line.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CommonAttributes {
    #[serde(rename = "entity.guid", skip_serializing_if = "String::is_empty")]
    pub entity_guid: String,
    #[serde(rename = "entity.name", skip_serializing_if = "String::is_empty")]
    pub entity_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hostname: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Forward log lines as events.
    pub collect_events: bool,
    /// Record `Logging/lines` metrics.
    pub collect_metrics: bool,
    pub max_events: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            collect_events: true,
            collect_metrics: true,
            max_events: crate::config::DEFAULT_MAX_LOG_EVENTS,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LogEvents {
    reservoir: Reservoir<LogEvent>,
    severity_count: HashMap<String, u64>,
    common: CommonAttributes,
    config: LoggingConfig,
}

impl LogEvents {
    #[must_use]
    pub fn new(common: CommonAttributes, config: LoggingConfig) -> Self {
        let capacity = if config.collect_events {
            config.max_events
        } else {
            0
        };
        LogEvents {
            reservoir: Reservoir::new(capacity),
            severity_count: HashMap::new(),
            common,
            config,
        }
    }

    /// A fresh, empty reservoir with the same configuration.
    #[must_use]
    pub fn fresh(&self) -> Self {
        LogEvents::new(self.common.clone(), self.config)
    }

    pub fn add(&mut self, event: LogEvent) {
        *self
            .severity_count
            .entry(event.severity.clone())
            .or_insert(0) += 1;
        let priority = event.priority;
        self.reservoir.add(event, priority);
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.reservoir.capacity()
    }

    #[must_use]
    pub fn num_seen(&self) -> u64 {
        self.reservoir.num_seen()
    }

    #[must_use]
    pub fn num_saved(&self) -> usize {
        self.reservoir.num_saved()
    }

    #[must_use]
    pub fn severity_count(&self, severity: &str) -> u64 {
        self.severity_count.get(severity).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEvent> {
        self.reservoir.iter().map(|e| &e.event)
    }

    pub fn record_logging_metrics(&self, metrics: &mut MetricTable) {
        let seen = self.num_seen();
        if self.config.collect_metrics {
            metrics.add_count(LOGGING_LINES, seen as f64, MetricForce::Forced);
            for (severity, count) in &self.severity_count {
                metrics.add_count(
                    &logging_lines_severity(severity),
                    *count as f64,
                    MetricForce::Forced,
                );
            }
        }
        if self.config.collect_events {
            let dropped = seen.saturating_sub(self.num_saved() as u64);
            metrics.add_count(LOGGING_DROPPED, dropped as f64, MetricForce::Forced);
        }
    }

    pub fn merge_failed(&mut self, other: LogEvents) -> bool {
        if !self.reservoir.merge_failed(other.reservoir) {
            return false;
        }
        for (severity, count) in other.severity_count {
            *self.severity_count.entry(severity).or_insert(0) += count;
        }
        true
    }

    /// Splits into two halves. Seen and per-severity counts are divided
    /// `floor(n/2)` / `n - floor(n/2)`.
    #[must_use]
    pub fn split(self) -> (LogEvents, LogEvents) {
        let (first, second) = self.reservoir.split();
        let mut counts1 = HashMap::with_capacity(self.severity_count.len());
        let mut counts2 = HashMap::with_capacity(self.severity_count.len());
        for (severity, count) in self.severity_count {
            let (c1, c2) = split_count(count);
            counts1.insert(severity.clone(), c1);
            counts2.insert(severity, c2);
        }
        (
            LogEvents {
                reservoir: Reservoir::from_batch(first),
                severity_count: counts1,
                common: self.common.clone(),
                config: self.config,
            },
            LogEvents {
                reservoir: Reservoir::from_batch(second),
                severity_count: counts2,
                common: self.common,
                config: self.config,
            },
        )
    }
}

#[derive(Serialize)]
struct Common<'a> {
    attributes: &'a CommonAttributes,
}

#[derive(Serialize)]
struct WirePayload<'a> {
    common: Common<'a>,
    logs: Vec<WireLog<'a>>,
}

impl PayloadCreator for LogEvents {
    fn data(
        &self,
        _agent_run_id: &str,
        _harvest_start: SystemTime,
    ) -> Result<Option<Vec<u8>>, PayloadError> {
        if self.num_saved() == 0 {
            return Ok(None);
        }
        let payload = WirePayload {
            common: Common {
                attributes: &self.common,
            },
            logs: self.iter().map(WireLog::from).collect(),
        };
        serde_json::to_vec(&[payload])
            .map(Some)
            .map_err(PayloadError::serialization(ENDPOINT_LOG_EVENTS))
    }

    fn endpoint_method(&self) -> &'static str {
        ENDPOINT_LOG_EVENTS
    }
}

impl MergeIntoHarvest for LogEvents {
    fn merge_into_harvest(self: Box<Self>, harvest: &Harvest) {
        let logs = *self;
        harvest.with_live(move |live| {
            if !live.log_events.merge_failed(logs) {
                debug!("Log events not merged back");
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{Duration, UNIX_EPOCH};

    pub(crate) fn log_event(severity: &str, priority: f32) -> LogEvent {
        LogEvent::new(severity, "hello".to_string(), UNIX_EPOCH + Duration::from_millis(7))
            .with_priority(Priority::from_f32(priority))
    }

    fn config(max_events: usize) -> LoggingConfig {
        LoggingConfig {
            collect_events: true,
            collect_metrics: true,
            max_events,
        }
    }

    fn count(mt: &MetricTable, name: &str) -> f64 {
        mt.get(name, "").map_or(0.0, |m| m.data.count_satisfied)
    }

    #[test]
    fn test_severity_counted_past_capacity() {
        let mut logs = LogEvents::new(CommonAttributes::default(), config(1));
        logs.add(log_event("INFO", 0.1));
        logs.add(log_event("INFO", 0.2));
        logs.add(log_event("ERROR", 0.3));
        logs.add(log_event("", 0.4));
        assert_eq!(logs.num_seen(), 4);
        assert_eq!(logs.num_saved(), 1);
        assert_eq!(logs.severity_count("INFO"), 2);
        assert_eq!(logs.severity_count("ERROR"), 1);
        assert_eq!(logs.severity_count(UNKNOWN_SEVERITY), 1);
    }

    #[test]
    fn test_logging_metrics() {
        let mut logs = LogEvents::new(CommonAttributes::default(), config(2));
        for (sev, p) in [("INFO", 0.1), ("INFO", 0.2), ("WARN", 0.3), ("ERROR", 0.4)] {
            logs.add(log_event(sev, p));
        }
        let mut mt = MetricTable::new(100, UNIX_EPOCH);
        logs.record_logging_metrics(&mut mt);
        assert_eq!(count(&mt, "Logging/lines"), 4.0);
        assert_eq!(count(&mt, "Logging/lines/INFO"), 2.0);
        assert_eq!(count(&mt, "Logging/lines/WARN"), 1.0);
        assert_eq!(count(&mt, "Logging/lines/ERROR"), 1.0);
        assert_eq!(count(&mt, "Logging/Forwarding/Dropped"), 2.0);
    }

    #[test]
    fn test_metrics_respect_config() {
        let mut logs = LogEvents::new(
            CommonAttributes::default(),
            LoggingConfig {
                collect_events: false,
                collect_metrics: true,
                max_events: 10,
            },
        );
        logs.add(log_event("INFO", 0.5));
        assert_eq!(logs.capacity(), 0);
        let mut mt = MetricTable::new(100, UNIX_EPOCH);
        logs.record_logging_metrics(&mut mt);
        assert_eq!(count(&mt, "Logging/lines"), 1.0);
        assert!(mt.get("Logging/Forwarding/Dropped", "").is_none());
    }

    #[test]
    fn test_message_truncated_on_char_boundary() {
        let long = "é".repeat(MAX_LOG_MESSAGE_LENGTH);
        let event = LogEvent::new("INFO", long, UNIX_EPOCH);
        assert!(event.message().len() <= MAX_LOG_MESSAGE_LENGTH);
        assert_eq!(event.message().len(), MAX_LOG_MESSAGE_LENGTH);
    }

    #[test]
    fn test_split_conserves_severity_counts() {
        let mut logs = LogEvents::new(CommonAttributes::default(), config(4));
        for i in 0..5 {
            logs.add(log_event("INFO", 0.1 * (i as f32 + 1.0)));
        }
        for _ in 0..3 {
            logs.add(log_event("ERROR", 0.01));
        }
        let (a, b) = logs.split();
        assert_eq!(a.severity_count("INFO") + b.severity_count("INFO"), 5);
        assert_eq!(a.severity_count("ERROR") + b.severity_count("ERROR"), 3);
        assert_eq!(a.severity_count("INFO"), 2);
        assert_eq!(a.num_seen() + b.num_seen(), 8);
        assert_eq!(a.num_saved() + b.num_saved(), 4);
    }

    #[test]
    fn test_merge_failed_sums_counts() {
        let mut failed = LogEvents::new(CommonAttributes::default(), config(10));
        failed.add(log_event("INFO", 0.5));
        let mut live = LogEvents::new(CommonAttributes::default(), config(10));
        live.add(log_event("INFO", 0.6));
        assert!(live.merge_failed(failed));
        assert_eq!(live.severity_count("INFO"), 2);
        assert_eq!(live.num_seen(), 2);
        assert_eq!(live.num_saved(), 2);
    }

    #[test]
    fn test_payload_shape() {
        let common = CommonAttributes {
            entity_guid: "guid".to_string(),
            entity_name: "app".to_string(),
            hostname: "host".to_string(),
        };
        let mut logs = LogEvents::new(common, config(10));
        assert!(logs.data("run", UNIX_EPOCH).expect("serialize").is_none());
        logs.add(
            log_event("INFO", 0.5).with_trace_context(
                "t1".to_string(),
                "s1".to_string(),
                Priority::from_f32(0.5),
            ),
        );
        let bytes = logs.data("run", UNIX_EPOCH).expect("serialize").expect("non-empty");
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(
            value,
            json!([{
                "common": {"attributes": {
                    "entity.guid": "guid",
                    "entity.name": "app",
                    "hostname": "host"
                }},
                "logs": [{
                    "level": "INFO",
                    "message": "hello",
                    "timestamp": 7,
                    "span.id": "s1",
                    "trace.id": "t1"
                }]
            }])
        );
    }
}
