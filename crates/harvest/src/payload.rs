// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The contract between a harvested structure and the transport.
//!
//! Every structure detached by [`crate::harvest::Harvest::ready`] becomes a
//! [`Payload`]: it can render itself into collector bytes and, when delivery
//! fails, fold itself back into the live harvest for the next cycle.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::harvest::Harvest;

pub const ENDPOINT_TXN_EVENTS: &str = "analytic_event_data";
pub const ENDPOINT_ERROR_EVENTS: &str = "error_event_data";
pub const ENDPOINT_SPAN_EVENTS: &str = "span_event_data";
pub const ENDPOINT_CUSTOM_EVENTS: &str = "custom_event_data";
pub const ENDPOINT_LOG_EVENTS: &str = "log_event_data";
pub const ENDPOINT_METRICS: &str = "metric_data";
pub const ENDPOINT_ERROR_TRACES: &str = "error_data";

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("failed to serialize {endpoint} payload: {source}")]
    Serialization {
        endpoint: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl PayloadError {
    pub(crate) fn serialization(endpoint: &'static str) -> impl FnOnce(serde_json::Error) -> Self {
        move |source| PayloadError::Serialization { endpoint, source }
    }
}

pub trait PayloadCreator: Send {
    /// Renders the collector body. `Ok(None)` means there is nothing to send
    /// and no request should be made.
    fn data(
        &self,
        agent_run_id: &str,
        harvest_start: SystemTime,
    ) -> Result<Option<Vec<u8>>, PayloadError>;

    /// Stable identifier the transport routes on.
    fn endpoint_method(&self) -> &'static str;
}

pub trait MergeIntoHarvest {
    /// Folds undelivered data into `harvest`, subject to the structure's
    /// failed-attempt limit.
    fn merge_into_harvest(self: Box<Self>, harvest: &Harvest);
}

pub trait Payload: PayloadCreator + MergeIntoHarvest {}

impl<T: PayloadCreator + MergeIntoHarvest> Payload for T {}

pub(crate) fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub(crate) fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
