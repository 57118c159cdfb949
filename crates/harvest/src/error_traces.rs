// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error traces: the detailed record behind an error event, stack included.
//!
//! Only the first [`MAX_ERROR_TRACES`] per harvest are kept. They travel with
//! the metrics bucket and are not retried when delivery fails.

use std::time::SystemTime;

use serde::Serialize;
use tracing::debug;

use crate::events::Attributes;
use crate::harvest::Harvest;
use crate::payload::{
    unix_millis, MergeIntoHarvest, PayloadCreator, PayloadError, ENDPOINT_ERROR_TRACES,
};

pub const MAX_ERROR_TRACES: usize = 20;

#[derive(Clone, Debug)]
pub struct ErrorTrace {
    pub when: SystemTime,
    pub txn_name: String,
    pub message: String,
    pub class: String,
    pub stack_trace: Vec<String>,
    pub txn_guid: String,
    pub user_attributes: Attributes,
    pub agent_attributes: Attributes,
}

#[derive(Serialize)]
struct Params<'a> {
    stack_trace: &'a [String],
    #[serde(rename = "agentAttributes")]
    agent_attributes: &'a Attributes,
    #[serde(rename = "userAttributes")]
    user_attributes: &'a Attributes,
    intrinsics: Intrinsics<'a>,
}

#[derive(Serialize)]
struct Intrinsics<'a> {
    guid: &'a str,
}

impl Serialize for ErrorTrace {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (
            unix_millis(self.when),
            &self.txn_name,
            &self.message,
            &self.class,
            Params {
                stack_trace: &self.stack_trace,
                agent_attributes: &self.agent_attributes,
                user_attributes: &self.user_attributes,
                intrinsics: Intrinsics {
                    guid: &self.txn_guid,
                },
            },
            &self.txn_guid,
        )
            .serialize(serializer)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ErrorTraces {
    traces: Vec<ErrorTrace>,
    num_seen: u64,
}

impl ErrorTraces {
    #[must_use]
    pub fn new() -> Self {
        ErrorTraces {
            traces: Vec::with_capacity(MAX_ERROR_TRACES),
            num_seen: 0,
        }
    }

    pub fn add(&mut self, trace: ErrorTrace) {
        self.num_seen += 1;
        if self.traces.len() < MAX_ERROR_TRACES {
            self.traces.push(trace);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.traces.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    #[must_use]
    pub fn num_seen(&self) -> u64 {
        self.num_seen
    }
}

impl PayloadCreator for ErrorTraces {
    fn data(
        &self,
        agent_run_id: &str,
        _harvest_start: SystemTime,
    ) -> Result<Option<Vec<u8>>, PayloadError> {
        if self.traces.is_empty() {
            return Ok(None);
        }
        serde_json::to_vec(&(agent_run_id, &self.traces))
            .map(Some)
            .map_err(PayloadError::serialization(ENDPOINT_ERROR_TRACES))
    }

    fn endpoint_method(&self) -> &'static str {
        ENDPOINT_ERROR_TRACES
    }
}

impl MergeIntoHarvest for ErrorTraces {
    fn merge_into_harvest(self: Box<Self>, _harvest: &Harvest) {
        debug!("Dropping {} undelivered error traces", self.len());
    }
}
