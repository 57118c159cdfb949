// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Supportability metric names recorded by the harvest itself.

pub const INSTANCE_REPORTING: &str = "Instance/Reporting";

pub const TXN_EVENTS_SEEN: &str = "Supportability/AnalyticsEvents/TotalEventsSeen";
pub const TXN_EVENTS_SENT: &str = "Supportability/AnalyticsEvents/TotalEventsSent";
pub const CUSTOM_EVENTS_SEEN: &str = "Supportability/Events/Customer/Seen";
pub const CUSTOM_EVENTS_SENT: &str = "Supportability/Events/Customer/Sent";
pub const ERROR_EVENTS_SEEN: &str = "Supportability/Events/TransactionError/Seen";
pub const ERROR_EVENTS_SENT: &str = "Supportability/Events/TransactionError/Sent";
pub const SPAN_EVENTS_SEEN: &str = "Supportability/SpanEvent/TotalEventsSeen";
pub const SPAN_EVENTS_SENT: &str = "Supportability/SpanEvent/TotalEventsSent";

pub const LOGGING_LINES: &str = "Logging/lines";
pub const LOGGING_DROPPED: &str = "Logging/Forwarding/Dropped";

pub const REPORT_PERIOD: &str = "Supportability/EventHarvest/ReportPeriod";
pub const TXN_EVENTS_LIMIT: &str = "Supportability/EventHarvest/AnalyticEventData/HarvestLimit";
pub const CUSTOM_EVENTS_LIMIT: &str = "Supportability/EventHarvest/CustomEventData/HarvestLimit";
pub const ERROR_EVENTS_LIMIT: &str = "Supportability/EventHarvest/ErrorEventData/HarvestLimit";
pub const SPAN_EVENTS_LIMIT: &str = "Supportability/EventHarvest/SpanEventData/HarvestLimit";
pub const LOG_EVENTS_LIMIT: &str = "Supportability/EventHarvest/LogEventData/HarvestLimit";

pub const TRACE_OBSERVER_SEEN: &str = "Supportability/InfiniteTracing/Span/Seen";
pub const TRACE_OBSERVER_SENT: &str = "Supportability/InfiniteTracing/Span/Sent";

#[must_use]
pub fn logging_lines_severity(severity: &str) -> String {
    format!("{LOGGING_LINES}/{severity}")
}

#[must_use]
pub fn agent_version(version: &str) -> String {
    format!("Supportability/Rust/Version/{version}")
}

#[must_use]
pub fn platform(os: &str, arch: &str) -> String {
    format!("Supportability/Rust/Platform/{os}/{arch}")
}
