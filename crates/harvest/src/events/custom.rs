// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Custom events recorded by application code.

use std::time::SystemTime;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::events::{AnalyticEvent, Attributes, Events};
use crate::harvest::LiveHarvest;
use crate::payload::{unix_millis, ENDPOINT_CUSTOM_EVENTS};
use crate::priority::Priority;

pub type CustomEvents = Events<CustomEvent>;

pub const MAX_EVENT_TYPE_LENGTH: usize = 255;
pub const MAX_ATTRIBUTE_KEY_LENGTH: usize = 255;
pub const MAX_ATTRIBUTES: usize = 64;

lazy_static! {
    static ref EVENT_TYPE_REGEX: Regex =
        Regex::new(r"^[a-zA-Z0-9:_ ]+$").expect("failed creating regex");
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CustomEventError {
    #[error("event type {0:?} must match [a-zA-Z0-9:_ ]+")]
    InvalidEventType(String),
    #[error("event type is {0} bytes, the limit is {MAX_EVENT_TYPE_LENGTH}")]
    EventTypeTooLong(usize),
    #[error("event has {0} attributes, the limit is {MAX_ATTRIBUTES}")]
    TooManyAttributes(usize),
    #[error("attribute key is {0} bytes, the limit is {MAX_ATTRIBUTE_KEY_LENGTH}")]
    AttributeKeyTooLong(usize),
    #[error("attribute {0:?} must be a string, number or boolean")]
    InvalidAttributeValue(String),
}

#[derive(Clone, Debug)]
pub struct CustomEvent {
    event_type: String,
    timestamp: SystemTime,
    attributes: Attributes,
    priority: Priority,
}

impl CustomEvent {
    pub fn new(
        event_type: &str,
        params: Attributes,
        now: SystemTime,
    ) -> Result<Self, CustomEventError> {
        if event_type.len() > MAX_EVENT_TYPE_LENGTH {
            return Err(CustomEventError::EventTypeTooLong(event_type.len()));
        }
        if !EVENT_TYPE_REGEX.is_match(event_type) {
            return Err(CustomEventError::InvalidEventType(event_type.to_string()));
        }
        if params.len() > MAX_ATTRIBUTES {
            return Err(CustomEventError::TooManyAttributes(params.len()));
        }
        for (key, value) in &params {
            if key.len() > MAX_ATTRIBUTE_KEY_LENGTH {
                return Err(CustomEventError::AttributeKeyTooLong(key.len()));
            }
            if !matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_)) {
                return Err(CustomEventError::InvalidAttributeValue(key.clone()));
            }
        }
        Ok(CustomEvent {
            event_type: event_type.to_string(),
            timestamp: now,
            attributes: params,
            priority: Priority::new(),
        })
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    #[must_use]
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }
}

#[derive(Serialize)]
struct Intrinsics<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    timestamp: u64,
}

impl Serialize for CustomEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let intrinsics = Intrinsics {
            kind: &self.event_type,
            timestamp: unix_millis(self.timestamp),
        };
        (intrinsics, &self.attributes, Map::new()).serialize(serializer)
    }
}

impl AnalyticEvent for CustomEvent {
    const ENDPOINT: &'static str = ENDPOINT_CUSTOM_EVENTS;

    fn priority(&self) -> Priority {
        self.priority
    }

    fn live_events(live: &mut LiveHarvest) -> &mut Events<Self> {
        &mut live.custom_events
    }
}
