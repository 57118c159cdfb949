// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::SystemTime;

use serde::{Serialize, Serializer};

use crate::events::{AnalyticEvent, Attributes, Events};
use crate::harvest::LiveHarvest;
use crate::metrics::txn::{ApdexZone, TxnData};
use crate::payload::{unix_millis, ENDPOINT_TXN_EVENTS};
use crate::priority::Priority;

pub type TxnEvents = Events<TxnEvent>;

#[derive(Clone, Debug)]
pub struct TxnEvent {
    pub name: String,
    pub timestamp: SystemTime,
    pub duration_secs: f64,
    pub total_time_secs: f64,
    pub queue_duration_secs: Option<f64>,
    pub zone: Option<ApdexZone>,
    pub error: bool,
    pub guid: String,
    pub trace_id: String,
    pub sampled: bool,
    pub priority: Priority,
    pub synthetics_resource_id: Option<String>,
    pub user_attributes: Attributes,
    pub agent_attributes: Attributes,
}

impl TxnEvent {
    #[must_use]
    pub fn from_txn_data(txn: &TxnData) -> Self {
        TxnEvent {
            name: txn.name.clone(),
            timestamp: txn.start,
            duration_secs: txn.duration.as_secs_f64(),
            total_time_secs: txn.total_time.as_secs_f64(),
            queue_duration_secs: txn
                .queuing
                .filter(|q| !q.is_zero())
                .map(|q| q.as_secs_f64()),
            zone: txn.zone,
            error: txn.has_errors(),
            guid: txn.guid.clone(),
            trace_id: txn.trace_id.clone(),
            sampled: txn.sampled,
            priority: txn.priority,
            synthetics_resource_id: txn.synthetics_resource_id.clone(),
            user_attributes: txn.user_attributes.clone(),
            agent_attributes: txn.agent_attributes.clone(),
        }
    }
}

#[derive(Serialize)]
struct Intrinsics<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    name: &'a str,
    timestamp: u64,
    duration: f64,
    #[serde(rename = "totalTime")]
    total_time: f64,
    #[serde(rename = "queueDuration", skip_serializing_if = "Option::is_none")]
    queue_duration: Option<f64>,
    #[serde(rename = "nr.apdexPerfZone", skip_serializing_if = "Option::is_none")]
    apdex_zone: Option<ApdexZone>,
    error: bool,
    guid: &'a str,
    #[serde(rename = "traceId")]
    trace_id: &'a str,
    priority: Priority,
    sampled: bool,
    #[serde(rename = "nr.syntheticsResourceId", skip_serializing_if = "Option::is_none")]
    synthetics_resource_id: Option<&'a str>,
}

impl Serialize for TxnEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let intrinsics = Intrinsics {
            kind: "Transaction",
            name: &self.name,
            timestamp: unix_millis(self.timestamp),
            duration: self.duration_secs,
            total_time: self.total_time_secs,
            queue_duration: self.queue_duration_secs,
            apdex_zone: self.zone,
            error: self.error,
            guid: &self.guid,
            trace_id: &self.trace_id,
            priority: self.priority,
            sampled: self.sampled,
            synthetics_resource_id: self.synthetics_resource_id.as_deref(),
        };
        (intrinsics, &self.user_attributes, &self.agent_attributes).serialize(serializer)
    }
}

impl AnalyticEvent for TxnEvent {
    const ENDPOINT: &'static str = ENDPOINT_TXN_EVENTS;

    fn priority(&self) -> Priority {
        self.priority
    }

    fn live_events(live: &mut LiveHarvest) -> &mut Events<Self> {
        &mut live.txn_events
    }
}
