// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background cadence driver.
//!
//! Polls the harvest every `tick` and flushes whatever is due. Cancelling the
//! token stops the loop after one last flush of everything, bounded by
//! `flush_timeout`.

use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::flusher::Flusher;

pub struct HarvestService {
    flusher: Flusher,
    tick: Duration,
    flush_timeout: Duration,
    cancel_token: CancellationToken,
}

impl HarvestService {
    #[must_use]
    pub fn new(
        flusher: Flusher,
        tick: Duration,
        flush_timeout: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        HarvestService {
            flusher,
            tick,
            flush_timeout,
            cancel_token,
        }
    }

    /// Uses the tick and flush timeout from `config`.
    #[must_use]
    pub fn from_config(flusher: Flusher, config: &Config, cancel_token: CancellationToken) -> Self {
        HarvestService::new(
            flusher,
            config.harvest_tick,
            config.flush_timeout,
            cancel_token,
        )
    }

    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                _ = interval.tick() => {
                    if let Some(outcome) = self.flusher.flush(SystemTime::now()).await {
                        debug!("Harvest cycle: {outcome:?}");
                    }
                }
            }
        }

        debug!("Harvest service shutting down, running final flush");
        match tokio::time::timeout(
            self.flush_timeout,
            self.flusher.flush_all(SystemTime::now()),
        )
        .await
        {
            Ok(outcome) => debug!("Final flush: {outcome:?}"),
            Err(_) => warn!(
                "Final flush did not finish within {:?}, data dropped",
                self.flush_timeout
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::connect::{ConnectReply, HarvestConfig};
    use crate::events::custom::tests::custom_event;
    use crate::flusher::tests::RecordingSender;
    use crate::flusher::{PayloadSender, SendError};
    use crate::harvest::Harvest;
    use crate::timer::HarvestTypes;
    use async_trait::async_trait;
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn service(
        config: HarvestConfig,
        sender: Arc<dyn PayloadSender>,
        flush_timeout: Duration,
    ) -> (HarvestService, Arc<Harvest>, CancellationToken) {
        let harvest = Arc::new(Harvest::new(config, SystemTime::now()));
        let config = Config {
            harvest_tick: Duration::from_millis(5),
            flush_timeout,
            ..Config::default()
        };
        let flusher = Flusher::from_config(
            Arc::clone(&harvest),
            sender,
            Arc::new(ConnectReply::default()),
            &config,
        );
        let token = CancellationToken::new();
        let svc = HarvestService::from_config(flusher, &config, token.clone());
        (svc, harvest, token)
    }

    #[tokio::test]
    #[traced_test]
    async fn test_final_flush_on_cancel() {
        let sender = Arc::new(RecordingSender::default());
        let (svc, harvest, token) = service(
            HarvestConfig::default(),
            sender.clone(),
            Duration::from_secs(5),
        );
        harvest.add_custom_event(custom_event(0.5));

        let observer = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(sender.endpoints().is_empty());
            token.cancel();
        };
        tokio::join!(svc.run(), observer);
        assert_eq!(sender.endpoints(), vec!["custom_event_data", "metric_data"]);
        assert!(logs_contain("running final flush"));
    }

    #[tokio::test]
    async fn test_flushes_on_period() {
        let sender = Arc::new(RecordingSender::default());
        let config = HarvestConfig {
            report_periods: vec![(HarvestTypes::ALL, Duration::from_millis(10))],
            ..HarvestConfig::default()
        };
        let (svc, harvest, token) = service(config, sender.clone(), Duration::from_secs(5));
        harvest.add_custom_event(custom_event(0.5));
        let handle = svc.spawn();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !sender.endpoints().contains(&"custom_event_data") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("periodic flush never happened");

        token.cancel();
        handle.await.expect("service panicked");
    }

    struct StuckSender;

    #[async_trait]
    impl PayloadSender for StuckSender {
        async fn send(&self, _endpoint: &'static str, _body: Vec<u8>) -> Result<(), SendError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_final_flush_is_bounded() {
        let (svc, _harvest, token) = service(
            HarvestConfig::default(),
            Arc::new(StuckSender),
            Duration::from_millis(20),
        );
        token.cancel();
        svc.run().await;
        assert!(logs_contain("Final flush did not finish"));
    }
}
