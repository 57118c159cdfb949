// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::SystemTime;

use serde::{Serialize, Serializer};

use crate::events::{AnalyticEvent, Attributes, Events};
use crate::harvest::LiveHarvest;
use crate::payload::{unix_millis, ENDPOINT_SPAN_EVENTS};
use crate::priority::Priority;

pub type SpanEvents = Events<SpanEvent>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanCategory {
    Generic,
    Http,
    Datastore,
}

#[derive(Clone, Debug)]
pub struct SpanEvent {
    pub trace_id: String,
    pub guid: String,
    pub parent_id: Option<String>,
    pub transaction_id: String,
    pub sampled: bool,
    pub priority: Priority,
    pub timestamp: SystemTime,
    pub duration_secs: f64,
    pub name: String,
    pub category: SpanCategory,
    pub is_entrypoint: bool,
    pub kind: Option<String>,
    pub component: Option<String>,
    pub user_attributes: Attributes,
    pub agent_attributes: Attributes,
}

#[derive(Serialize)]
struct Intrinsics<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(rename = "traceId")]
    trace_id: &'a str,
    guid: &'a str,
    #[serde(rename = "parentId", skip_serializing_if = "Option::is_none")]
    parent_id: Option<&'a str>,
    #[serde(rename = "transactionId")]
    transaction_id: &'a str,
    sampled: bool,
    priority: Priority,
    timestamp: u64,
    duration: f64,
    name: &'a str,
    category: SpanCategory,
    #[serde(rename = "nr.entryPoint", skip_serializing_if = "std::ops::Not::not")]
    is_entrypoint: bool,
    #[serde(rename = "span.kind", skip_serializing_if = "Option::is_none")]
    span_kind: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    component: Option<&'a str>,
}

impl Serialize for SpanEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let intrinsics = Intrinsics {
            kind: "Span",
            trace_id: &self.trace_id,
            guid: &self.guid,
            parent_id: self.parent_id.as_deref(),
            transaction_id: &self.transaction_id,
            sampled: self.sampled,
            priority: self.priority,
            timestamp: unix_millis(self.timestamp),
            duration: self.duration_secs,
            name: &self.name,
            category: self.category,
            is_entrypoint: self.is_entrypoint,
            span_kind: self.kind.as_deref(),
            component: self.component.as_deref(),
        };
        (intrinsics, &self.user_attributes, &self.agent_attributes).serialize(serializer)
    }
}

impl AnalyticEvent for SpanEvent {
    const ENDPOINT: &'static str = ENDPOINT_SPAN_EVENTS;

    fn priority(&self) -> Priority {
        self.priority
    }

    fn live_events(live: &mut LiveHarvest) -> &mut Events<Self> {
        &mut live.span_events
    }
}
