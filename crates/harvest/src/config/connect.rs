// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector-side configuration.
//!
//! The connect reply tells the agent its run id, the metric name rules to
//! apply, and optionally its event harvest limits and report period:
//!
//! ```json
//! {"return_value": {
//!   "agent_run_id": "12345",
//!   "entity_guid": "MTIzNDV8QVBNfEFQUExJQ0FUSU9OfDY3ODk",
//!   "metric_name_rules": [ ... ],
//!   "event_harvest_config": {
//!     "report_period_ms": 5000,
//!     "harvest_limits": {
//!       "analytic_event_data": 833,
//!       "custom_event_data": 2500,
//!       "error_event_data": 8,
//!       "span_event_data": 166,
//!       "log_event_data": 833
//!     }
//!   }
//! }}
//! ```
//!
//! Event types the collector sends a limit for harvest on the configurable
//! period; the rest harvest with metrics on the fixed 60 second period.
//! Limits that are missing, negative or not numbers fall back to the agent
//! configuration. Every event limit is capped at [`MAX_EVENT_LIMIT`].

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::config::{deserialize_optional_count, Config, ConfigError};
use crate::events::log::{CommonAttributes, LoggingConfig};
use crate::metrics::rules::MetricRules;
use crate::timer::HarvestTypes;

pub const FIXED_HARVEST_PERIOD: Duration = Duration::from_secs(60);
pub const DEFAULT_CONFIGURABLE_PERIOD: Duration = Duration::from_secs(60);

/// Largest reservoir size any event type may be given.
pub const MAX_EVENT_LIMIT: usize = 100_000;

fn clamp_limit(name: &str, limit: usize) -> usize {
    if limit > MAX_EVENT_LIMIT {
        warn!("Harvest limit {name}={limit} is too large, using {MAX_EVENT_LIMIT}");
        return MAX_EVENT_LIMIT;
    }
    limit
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct HarvestLimits {
    #[serde(rename = "analytic_event_data", deserialize_with = "deserialize_optional_count")]
    pub txn_events: Option<usize>,
    #[serde(rename = "custom_event_data", deserialize_with = "deserialize_optional_count")]
    pub custom_events: Option<usize>,
    #[serde(rename = "error_event_data", deserialize_with = "deserialize_optional_count")]
    pub error_events: Option<usize>,
    #[serde(rename = "span_event_data", deserialize_with = "deserialize_optional_count")]
    pub span_events: Option<usize>,
    #[serde(rename = "log_event_data", deserialize_with = "deserialize_optional_count")]
    pub log_events: Option<usize>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct EventHarvestConfig {
    #[serde(rename = "report_period_ms", deserialize_with = "deserialize_optional_count")]
    pub report_period_ms: Option<usize>,
    pub harvest_limits: HarvestLimits,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConnectReply {
    #[serde(deserialize_with = "crate::config::deserialize_optional_string")]
    pub agent_run_id: Option<String>,
    #[serde(deserialize_with = "crate::config::deserialize_optional_string")]
    pub entity_guid: Option<String>,
    pub metric_name_rules: MetricRules,
    pub event_harvest_config: EventHarvestConfig,
}

#[derive(Deserialize)]
struct Envelope {
    return_value: Value,
}

impl ConnectReply {
    /// Parses a collector connect response, with or without the
    /// `return_value` envelope.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| ConfigError::ParseError(format!("invalid connect reply: {e}")))?;
        let inner = match serde_json::from_value::<Envelope>(value.clone()) {
            Ok(envelope) => envelope.return_value,
            Err(_) => value,
        };
        serde_json::from_value(inner)
            .map_err(|e| ConfigError::ParseError(format!("invalid connect reply: {e}")))
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        self.agent_run_id.as_deref().unwrap_or_default()
    }

    /// The period for event types with a collector-supplied limit.
    #[must_use]
    pub fn configurable_period(&self) -> Duration {
        match self.event_harvest_config.report_period_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
            _ => DEFAULT_CONFIGURABLE_PERIOD,
        }
    }
}

/// Everything the harvest needs to size and schedule itself.
#[derive(Clone, Debug, PartialEq)]
pub struct HarvestConfig {
    pub report_periods: Vec<(HarvestTypes, Duration)>,
    pub max_txn_events: usize,
    pub max_custom_events: usize,
    pub max_error_events: usize,
    pub max_span_events: usize,
    pub max_metrics: usize,
    pub logging: LoggingConfig,
    pub common_attributes: CommonAttributes,
}

impl HarvestConfig {
    #[must_use]
    pub fn new(reply: Option<&ConnectReply>, config: &Config) -> Self {
        let limits = reply.map(|r| &r.event_harvest_config.harvest_limits);
        let limit_of = |pick: fn(&HarvestLimits) -> Option<usize>| limits.and_then(pick);

        let mut fixed = HarvestTypes::METRICS_TRACES;
        let mut configurable = HarvestTypes::NONE;
        for (types, limit) in [
            (HarvestTypes::TXN_EVENTS, limit_of(|l| l.txn_events)),
            (HarvestTypes::CUSTOM_EVENTS, limit_of(|l| l.custom_events)),
            (HarvestTypes::ERROR_EVENTS, limit_of(|l| l.error_events)),
            (HarvestTypes::SPAN_EVENTS, limit_of(|l| l.span_events)),
            (HarvestTypes::LOG_EVENTS, limit_of(|l| l.log_events)),
        ] {
            if limit.is_some() {
                configurable |= types;
            } else {
                fixed |= types;
            }
        }

        let mut report_periods = vec![(fixed, FIXED_HARVEST_PERIOD)];
        if !configurable.is_empty() {
            let period =
                reply.map_or(DEFAULT_CONFIGURABLE_PERIOD, ConnectReply::configurable_period);
            report_periods.push((configurable, period));
        }

        let txn_events = limit_of(|l| l.txn_events).unwrap_or(config.max_txn_events);
        let custom_events = limit_of(|l| l.custom_events).unwrap_or(config.max_custom_events);
        let error_events = limit_of(|l| l.error_events).unwrap_or(config.max_error_events);
        let span_events = limit_of(|l| l.span_events).unwrap_or(config.max_span_events);
        let log_events = limit_of(|l| l.log_events)
            .unwrap_or(config.application_logging_forwarding_max_samples_stored);

        HarvestConfig {
            report_periods,
            max_txn_events: clamp_limit("analytic_event_data", txn_events),
            max_custom_events: clamp_limit("custom_event_data", custom_events),
            max_error_events: clamp_limit("error_event_data", error_events),
            max_span_events: clamp_limit("span_event_data", span_events),
            max_metrics: config.max_metrics,
            logging: LoggingConfig {
                collect_events: config.application_logging_forwarding_enabled,
                collect_metrics: config.application_logging_metrics_enabled,
                max_events: clamp_limit("log_event_data", log_events),
            },
            common_attributes: CommonAttributes {
                entity_guid: reply
                    .and_then(|r| r.entity_guid.clone())
                    .unwrap_or_default(),
                entity_name: config.app_name.clone(),
                hostname: config.hostname.clone(),
            },
        }
    }

    /// Period of the bucket holding `types`, if any.
    #[must_use]
    pub fn period_of(&self, types: HarvestTypes) -> Option<Duration> {
        self.report_periods
            .iter()
            .find(|(t, _)| t.contains(types))
            .map(|(_, p)| *p)
    }
}

impl Default for HarvestConfig {
    fn default() -> Self {
        HarvestConfig::new(None, &Config::default())
    }
}
