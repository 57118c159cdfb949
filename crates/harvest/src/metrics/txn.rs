// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metrics derived from a finished transaction.

use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::events::Attributes;
use crate::metrics::table::{MetricForce, MetricTable};
use crate::priority::Priority;

const WEB_ROLLUP: &str = "WebTransaction";
const BACKGROUND_ROLLUP: &str = "OtherTransaction/all";
const TOTAL_TIME_WEB: &str = "WebTransactionTotalTime";
const TOTAL_TIME_BACKGROUND: &str = "OtherTransactionTotalTime";
const DISPATCHER: &str = "HttpDispatcher";
const APDEX_ROLLUP: &str = "Apdex";
const ERRORS_ALL: &str = "Errors/all";
const ERRORS_ALL_WEB: &str = "Errors/allWeb";
const ERRORS_ALL_OTHER: &str = "Errors/allOther";
const QUEUE_TIME: &str = "WebFrontend/QueueTime";
const UNKNOWN: &str = "Unknown";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ApdexZone {
    #[serde(rename = "S")]
    Satisfying,
    #[serde(rename = "T")]
    Tolerating,
    #[serde(rename = "F")]
    Failing,
}

impl ApdexZone {
    /// Satisfying up to `threshold`, tolerating up to four times it, failing
    /// beyond.
    #[must_use]
    pub fn calculate(threshold: Duration, duration: Duration) -> Self {
        if duration <= threshold {
            ApdexZone::Satisfying
        } else if duration <= threshold * 4 {
            ApdexZone::Tolerating
        } else {
            ApdexZone::Failing
        }
    }
}

/// Who called into the transaction, when distributed tracing is on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallerInfo {
    pub caller_type: Option<String>,
    pub account: Option<String>,
    pub app: Option<String>,
    pub transport: Option<String>,
}

impl CallerInfo {
    fn prefix(&self, kind: &str) -> String {
        let part = |v: &Option<String>| v.clone().unwrap_or_else(|| UNKNOWN.to_string());
        format!(
            "{kind}/{}/{}/{}/{}",
            part(&self.caller_type),
            part(&self.account),
            part(&self.app),
            part(&self.transport)
        )
    }
}

/// The summary of a finished transaction consumed by the harvest. How it is
/// assembled is the transaction's business.
#[derive(Clone, Debug)]
pub struct TxnData {
    /// Final name after naming rules, e.g. `WebTransaction/Go/users`.
    pub name: String,
    pub is_web: bool,
    pub start: SystemTime,
    pub duration: Duration,
    pub total_time: Duration,
    pub queuing: Option<Duration>,
    pub apdex_threshold: Duration,
    /// `None` when apdex does not apply, e.g. background transactions.
    pub zone: Option<ApdexZone>,
    pub error_count: u32,
    pub guid: String,
    pub trace_id: String,
    pub sampled: bool,
    pub priority: Priority,
    pub synthetics_resource_id: Option<String>,
    /// Set when distributed tracing is enabled.
    pub caller: Option<CallerInfo>,
    pub user_attributes: Attributes,
    pub agent_attributes: Attributes,
}

impl TxnData {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }

    fn name_without_first_segment(&self) -> &str {
        self.name
            .split_once('/')
            .map_or(self.name.as_str(), |(_, rest)| rest)
    }
}

fn web_or_other<'a>(is_web: bool, web: &'a str, other: &'a str) -> &'a str {
    if is_web {
        web
    } else {
        other
    }
}

/// Records the metrics a finished transaction contributes.
pub fn create_txn_metrics(txn: &TxnData, metrics: &mut MetricTable) {
    let short_name = txn.name_without_first_segment();
    let (rollup, total_time_rollup) = if txn.is_web {
        metrics.add_duration(DISPATCHER, "", txn.duration, Duration::ZERO, MetricForce::Forced);
        (WEB_ROLLUP, TOTAL_TIME_WEB)
    } else {
        (BACKGROUND_ROLLUP, TOTAL_TIME_BACKGROUND)
    };

    metrics.add_duration(&txn.name, "", txn.duration, Duration::ZERO, MetricForce::Forced);
    metrics.add_duration(rollup, "", txn.duration, Duration::ZERO, MetricForce::Forced);

    if let Some(caller) = &txn.caller {
        let duration_prefix = caller.prefix("DurationByCaller");
        metrics.add_duration(
            &format!("{duration_prefix}/all"),
            "",
            txn.duration,
            txn.duration,
            MetricForce::Unforced,
        );
        metrics.add_duration(
            &format!("{duration_prefix}/{}", web_or_other(txn.is_web, "allWeb", "allOther")),
            "",
            txn.duration,
            txn.duration,
            MetricForce::Unforced,
        );
        if txn.has_errors() {
            let errors_prefix = caller.prefix("ErrorsByCaller");
            metrics.add_single_count(&format!("{errors_prefix}/all"), MetricForce::Unforced);
            metrics.add_single_count(
                &format!("{errors_prefix}/{}", web_or_other(txn.is_web, "allWeb", "allOther")),
                MetricForce::Unforced,
            );
        }
    }

    metrics.add_duration(
        &format!("{total_time_rollup}/{short_name}"),
        "",
        txn.total_time,
        txn.total_time,
        MetricForce::Forced,
    );
    metrics.add_duration(
        total_time_rollup,
        "",
        txn.total_time,
        txn.total_time,
        MetricForce::Forced,
    );

    if txn.has_errors() {
        metrics.add_single_count(ERRORS_ALL, MetricForce::Forced);
        metrics.add_single_count(
            web_or_other(txn.is_web, ERRORS_ALL_WEB, ERRORS_ALL_OTHER),
            MetricForce::Forced,
        );
        metrics.add_single_count(&format!("Errors/{}", txn.name), MetricForce::Forced);
    }

    if let Some(zone) = txn.zone {
        metrics.add_apdex(APDEX_ROLLUP, "", txn.apdex_threshold, zone, MetricForce::Forced);
        metrics.add_apdex(
            &format!("{APDEX_ROLLUP}/{short_name}"),
            "",
            txn.apdex_threshold,
            zone,
            MetricForce::Unforced,
        );
    }

    if let Some(queuing) = txn.queuing.filter(|q| !q.is_zero()) {
        metrics.add_duration(QUEUE_TIME, "", queuing, queuing, MetricForce::Forced);
    }
}
