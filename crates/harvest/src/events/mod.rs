// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event reservoirs.
//!
//! Transaction, error, span and custom events all sample through the same
//! [`reservoir::Reservoir`]; logs use the [`log::LogEvents`] variant, which
//! also keeps per-severity counters.
//!
//! Analytic event payloads share one wire shape:
//!
//! ```json
//! ["<agent run id>", {"reservoir_size": 10000, "events_seen": 12345}, [ <event>, ... ]]
//! ```

pub mod custom;
pub mod error;
pub mod log;
pub mod reservoir;
pub mod span;
pub mod txn;

use std::time::SystemTime;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::harvest::{Harvest, LiveHarvest};
use crate::payload::{MergeIntoHarvest, Payload, PayloadCreator, PayloadError};
use crate::priority::Priority;
use reservoir::{EventBatch, Prioritized, Reservoir};

/// User or agent attributes attached to an event.
pub type Attributes = Map<String, Value>;

#[derive(Serialize)]
struct SamplingInfo {
    reservoir_size: usize,
    events_seen: u64,
}

/// Serializes a batch of analytic events. Returns `Ok(None)` when there are
/// no events to send.
pub(crate) fn analytic_events_payload<T: Serialize>(
    endpoint: &'static str,
    agent_run_id: &str,
    reservoir_size: usize,
    num_seen: u64,
    events: Vec<&T>,
) -> Result<Option<Vec<u8>>, PayloadError> {
    if events.is_empty() {
        return Ok(None);
    }
    serde_json::to_vec(&(
        agent_run_id,
        SamplingInfo {
            reservoir_size,
            events_seen: num_seen,
        },
        events,
    ))
    .map(Some)
    .map_err(PayloadError::serialization(endpoint))
}

pub(crate) fn batch_payload<T: Serialize>(
    endpoint: &'static str,
    agent_run_id: &str,
    batch: &EventBatch<T>,
) -> Result<Option<Vec<u8>>, PayloadError> {
    analytic_events_payload(
        endpoint,
        agent_run_id,
        batch.reservoir_size,
        batch.num_seen,
        batch.events.iter().map(|e| &e.event).collect(),
    )
}

/// An event type that samples through an analytic event reservoir.
pub trait AnalyticEvent: Serialize + Send + Sized + 'static {
    /// Collector endpoint for this event type.
    const ENDPOINT: &'static str;

    fn priority(&self) -> Priority;

    /// The live reservoir of this type inside a harvest, used to merge
    /// undelivered events back.
    fn live_events(live: &mut LiveHarvest) -> &mut Events<Self>;
}

/// A typed reservoir of analytic events.
#[derive(Clone, Debug)]
pub struct Events<T> {
    reservoir: Reservoir<T>,
}

impl<T: AnalyticEvent> Events<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Events {
            reservoir: Reservoir::new(capacity),
        }
    }

    pub fn add(&mut self, event: T) {
        let priority = event.priority();
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
    pub fn reservoir(&self) -> &Reservoir<T> {
        &self.reservoir
    }

    pub fn iter(&self) -> impl Iterator<Item = &Prioritized<T>> {
        self.reservoir.iter()
    }

    pub fn merge_failed(&mut self, other: Events<T>) -> bool {
        self.reservoir.merge_failed(other.reservoir)
    }

    /// Breaks the events into payloads of at most `limit` events each.
    #[must_use]
    pub fn into_payloads(self, limit: usize) -> Vec<Box<dyn Payload>> {
        if self.num_saved() <= limit {
            return vec![Box::new(self)];
        }
        self.reservoir
            .into_batch()
            .chunk(limit)
            .into_iter()
            .map(|batch| Box::new(EventsBatch(batch)) as Box<dyn Payload>)
            .collect()
    }
}

impl<T: AnalyticEvent> PayloadCreator for Events<T> {
    fn data(
        &self,
        agent_run_id: &str,
        _harvest_start: SystemTime,
    ) -> Result<Option<Vec<u8>>, PayloadError> {
        analytic_events_payload(
            T::ENDPOINT,
            agent_run_id,
            self.reservoir.capacity(),
            self.reservoir.num_seen(),
            self.reservoir.iter().map(|e| &e.event).collect(),
        )
    }

    fn endpoint_method(&self) -> &'static str {
        T::ENDPOINT
    }
}

impl<T: AnalyticEvent> MergeIntoHarvest for Events<T> {
    fn merge_into_harvest(self: Box<Self>, harvest: &Harvest) {
        let events = *self;
        harvest.with_live(move |live| T::live_events(live).merge_failed(events));
    }
}

/// A slice of a split reservoir. It serializes like the full reservoir and
/// merges back as one.
#[derive(Debug)]
pub struct EventsBatch<T>(pub EventBatch<T>);

impl<T: AnalyticEvent> PayloadCreator for EventsBatch<T> {
    fn data(
        &self,
        agent_run_id: &str,
        _harvest_start: SystemTime,
    ) -> Result<Option<Vec<u8>>, PayloadError> {
        batch_payload(T::ENDPOINT, agent_run_id, &self.0)
    }

    fn endpoint_method(&self) -> &'static str {
        T::ENDPOINT
    }
}

impl<T: AnalyticEvent> MergeIntoHarvest for EventsBatch<T> {
    fn merge_into_harvest(self: Box<Self>, harvest: &Harvest) {
        let events = Events {
            reservoir: Reservoir::from_batch(self.0),
        };
        harvest.with_live(move |live| T::live_events(live).merge_failed(events));
    }
}
