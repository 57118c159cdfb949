// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of a detached harvest.
//!
//! The transport itself lives behind [`PayloadSender`]. The flusher renders
//! each payload, hands it over and decides what happens on failure:
//! retryable failures merge the payload back into the live harvest, permanent
//! ones drop it.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::config::connect::ConnectReply;
use crate::config::Config;
use crate::harvest::{Harvest, ReadyHarvest, TraceObserverStats};
use crate::payload::{Payload, PayloadError};

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The collector answered with a non-success status.
    #[error("collector responded with status {0}")]
    Status(u16),
    /// The request never got an answer.
    #[error("failed to reach collector: {0}")]
    Transport(String),
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

impl SendError {
    /// 4xx statuses and malformed payloads will fail the same way again.
    /// Request timeouts and throttling are the exceptions.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            SendError::Status(408 | 429) | SendError::Transport(_) => true,
            SendError::Status(code) => !(400..500).contains(code),
            SendError::Payload(_) => false,
        }
    }
}

#[async_trait]
pub trait PayloadSender: Send + Sync {
    async fn send(&self, endpoint: &'static str, body: Vec<u8>) -> Result<(), SendError>;
}

pub type TraceObserverSource = Arc<dyn Fn() -> TraceObserverStats + Send + Sync>;

/// What happened to the payloads of one flush.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub sent: usize,
    pub empty: usize,
    pub merged_back: usize,
    pub dropped: usize,
}

/// Returns `(continue_to_next_payload, merge_this_payload_back)`.
fn should_try_next_payload(result: &Result<(), SendError>) -> (bool, bool) {
    match result {
        Ok(()) => (true, false),
        Err(e @ SendError::Transport(_)) => {
            warn!("{e}, keeping remaining payloads for the next harvest");
            (false, true)
        }
        Err(e) if e.is_retryable() => {
            warn!("{e}, merging payload back");
            (true, true)
        }
        Err(e) => {
            error!("{e}, payload dropped");
            (true, false)
        }
    }
}

#[derive(Clone)]
pub struct Flusher {
    harvest: Arc<Harvest>,
    sender: Arc<dyn PayloadSender>,
    reply: Arc<ConnectReply>,
    split_large_txn_events: bool,
    trace_observer: Option<TraceObserverSource>,
}

impl Flusher {
    #[must_use]
    pub fn new(
        harvest: Arc<Harvest>,
        sender: Arc<dyn PayloadSender>,
        reply: Arc<ConnectReply>,
        split_large_txn_events: bool,
    ) -> Self {
        Flusher {
            harvest,
            sender,
            reply,
            split_large_txn_events,
            trace_observer: None,
        }
    }

    /// Takes the payload splitting choice from `config`.
    #[must_use]
    pub fn from_config(
        harvest: Arc<Harvest>,
        sender: Arc<dyn PayloadSender>,
        reply: Arc<ConnectReply>,
        config: &Config,
    ) -> Self {
        Flusher::new(harvest, sender, reply, config.split_large_txn_events)
    }

    #[must_use]
    pub fn with_trace_observer(mut self, source: TraceObserverSource) -> Self {
        self.trace_observer = Some(source);
        self
    }

    #[must_use]
    pub fn harvest(&self) -> &Arc<Harvest> {
        &self.harvest
    }

    /// Flushes whatever is due at `now`. Returns `None` when nothing was.
    pub async fn flush(&self, now: SystemTime) -> Option<FlushOutcome> {
        let ready = self.harvest.ready(now)?;
        Some(self.flush_ready(ready).await)
    }

    /// Flushes everything, ignoring the timer.
    pub async fn flush_all(&self, now: SystemTime) -> FlushOutcome {
        let ready = self.harvest.ready_all(now);
        self.flush_ready(ready).await
    }

    pub async fn flush_ready(&self, mut ready: ReadyHarvest) -> FlushOutcome {
        let stats = self.trace_observer.as_ref().map(|source| source());
        ready.create_final_metrics(&self.reply, self.harvest.config(), stats.as_ref());

        let harvest_start = ready.harvest_start;
        let run_id = self.reply.run_id();
        let mut outcome = FlushOutcome::default();
        let mut payloads = ready.payloads(self.split_large_txn_events).into_iter();

        while let Some(payload) = payloads.next() {
            let endpoint = payload.endpoint_method();
            let body = match payload.data(run_id, harvest_start) {
                Ok(Some(body)) => body,
                Ok(None) => {
                    outcome.empty += 1;
                    continue;
                }
                Err(e) => {
                    error!("Failed to prepare payload. Data dropped: {e}");
                    outcome.dropped += 1;
                    continue;
                }
            };

            let result = self.sender.send(endpoint, body).await;
            let (continue_sending, merge_back) = should_try_next_payload(&result);
            if result.is_ok() {
                debug!("Sent {endpoint} payload");
                outcome.sent += 1;
            } else if merge_back {
                self.merge_back(payload, &mut outcome);
            } else {
                outcome.dropped += 1;
            }

            if !continue_sending {
                for rest in payloads.by_ref() {
                    self.merge_back(rest, &mut outcome);
                }
            }
        }

        debug!(
            "Flush done: {} sent, {} empty, {} merged back, {} dropped",
            outcome.sent, outcome.empty, outcome.merged_back, outcome.dropped
        );
        outcome
    }

    fn merge_back(&self, payload: Box<dyn Payload>, outcome: &mut FlushOutcome) {
        self.harvest.merge_failed(payload);
        outcome.merged_back += 1;
    }
}
