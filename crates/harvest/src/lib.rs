// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Harvest
//!
//! The aggregation core of an in-process telemetry agent. Producers (finished
//! transactions, custom event recorders, log forwarders, samplers) write into
//! bounded structures owned by a [`harvest::Harvest`] coordinator, and a
//! background cadence driver periodically detaches whatever is due and turns
//! it into payloads for the collector.
//!
//! ## Architecture
//!
//! - [`priority`]: ordering key used for reservoir retention
//! - [`events`]: priority reservoirs for transaction, error, span, custom and log events
//! - [`metrics`]: metric table, server-supplied rename rules and transaction metrics
//! - [`timer`]: multi-period readiness detection
//! - [`harvest`]: the coordinator that swaps live structures for fresh ones
//! - [`memory`]: memory-pressure valve used by the coordinator
//! - [`flusher`] and [`harvest_service`]: delivery and the cadence loop
//!
//! Data loss is silent. Capacity overflow, repeated delivery failure and
//! memory pressure are logged or counted through supportability metrics,
//! never surfaced as errors to the host application.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]

/// Configuration: agent-side sources and the collector's connect reply
pub mod config;

/// Priority reservoirs for every event type
pub mod events;

/// Error traces that ride along with the metrics harvest
pub mod error_traces;

/// Payload delivery and failed-harvest merge-back
pub mod flusher;

/// The harvest coordinator
pub mod harvest;

/// Background cadence driver
pub mod harvest_service;

/// Logging infrastructure and tracing setup
pub mod logger;

/// Memory-pressure detection for emergency data jettisoning
pub mod memory;

/// Metric table, rules and transaction metrics
pub mod metrics;

/// Payload contract consumed by the transport layer
pub mod payload;

/// Event priority
pub mod priority;

/// Harvest timer and data-type buckets
pub mod timer;

/// Agent version reported through supportability metrics.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum number of harvest attempts for a metric table before its data is
/// considered too old to redeliver.
pub(crate) const FAILED_METRIC_ATTEMPTS_LIMIT: u32 = 5;

/// Maximum number of harvest attempts for an event reservoir.
pub(crate) const FAILED_EVENTS_ATTEMPTS_LIMIT: u32 = 10;
