// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::SystemTime;

use serde::{Serialize, Serializer};

use crate::events::{AnalyticEvent, Attributes, Events};
use crate::harvest::LiveHarvest;
use crate::payload::{unix_millis, ENDPOINT_ERROR_EVENTS};
use crate::priority::Priority;

pub type ErrorEvents = Events<ErrorEvent>;

/// An error noticed inside a transaction. Error events share the priority of
/// the transaction they occurred in.
#[derive(Clone, Debug)]
pub struct ErrorEvent {
    pub class: String,
    pub message: String,
    pub expected: bool,
    pub timestamp: SystemTime,
    pub txn_name: String,
    pub duration_secs: f64,
    pub queue_duration_secs: Option<f64>,
    pub txn_guid: String,
    pub trace_id: String,
    pub sampled: bool,
    pub priority: Priority,
    pub user_attributes: Attributes,
    pub agent_attributes: Attributes,
}

#[derive(Serialize)]
struct Intrinsics<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(rename = "error.class")]
    class: &'a str,
    #[serde(rename = "error.message")]
    message: &'a str,
    #[serde(rename = "error.expected")]
    expected: bool,
    timestamp: u64,
    #[serde(rename = "transactionName")]
    txn_name: &'a str,
    duration: f64,
    #[serde(rename = "queueDuration", skip_serializing_if = "Option::is_none")]
    queue_duration: Option<f64>,
    #[serde(rename = "nr.transactionGuid")]
    txn_guid: &'a str,
    #[serde(rename = "traceId")]
    trace_id: &'a str,
    priority: Priority,
    sampled: bool,
}

impl Serialize for ErrorEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let intrinsics = Intrinsics {
            kind: "TransactionError",
            class: &self.class,
            message: &self.message,
            expected: self.expected,
            timestamp: unix_millis(self.timestamp),
            txn_name: &self.txn_name,
            duration: self.duration_secs,
            queue_duration: self.queue_duration_secs,
            txn_guid: &self.txn_guid,
            trace_id: &self.trace_id,
            priority: self.priority,
            sampled: self.sampled,
        };
        (intrinsics, &self.user_attributes, &self.agent_attributes).serialize(serializer)
    }
}

impl AnalyticEvent for ErrorEvent {
    const ENDPOINT: &'static str = ENDPOINT_ERROR_EVENTS;

    fn priority(&self) -> Priority {
        self.priority
    }

    fn live_events(live: &mut LiveHarvest) -> &mut Events<Self> {
        &mut live.error_events
    }
}
