//! One consumer loop per event category, each feeding the orchestrator.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bus::EventBus;
use crate::error::Result;
use crate::event::EventCategory;
use crate::orchestrator::Orchestrator;
use crate::settings::EventSettings;

/// Cap on the redelivery delay multiplier after a failed handling attempt.
const MAX_RELEASE_STEPS: u32 = 10;

#[derive(Clone)]
pub struct EventConsumer {
    category: EventCategory,
    bus: Arc<dyn EventBus>,
    orchestrator: Arc<Orchestrator>,
    settings: EventSettings,
}

impl EventConsumer {
    pub fn new(
        category: EventCategory,
        bus: Arc<dyn EventBus>,
        orchestrator: Arc<Orchestrator>,
        settings: EventSettings,
    ) -> Self {
        Self {
            category,
            bus,
            orchestrator,
            settings,
        }
    }

    pub fn category(&self) -> EventCategory {
        self.category
    }

    /// Handle the next visible event, if any. Returns whether one was taken.
    ///
    /// The event is acknowledged once the orchestrator returns. When it
    /// returns an error the event is released for a later redelivery, and an
    /// event delivered more than `max_deliveries` times is dropped.
    pub async fn process_next(&self) -> Result<bool> {
        let Some(delivery) = self.bus.receive(self.category).await? else {
            return Ok(false);
        };

        if delivery.deliveries > self.settings.max_deliveries {
            self.orchestrator
                .abandon(&delivery.event, delivery.deliveries)
                .await?;
            self.bus.ack(&delivery).await?;
            return Ok(true);
        }

        match self.orchestrator.handle(&delivery.event).await {
            Ok(()) => self.bus.ack(&delivery).await?,
            Err(e) => {
                let delay = self.settings.poll_interval()
                    * delivery.deliveries.clamp(1, MAX_RELEASE_STEPS);
                warn!(
                    "{} event {} for {} not handled (delivery {}), retrying in {:?}: {}",
                    self.category,
                    delivery.event.id,
                    delivery.event.gitspace_id,
                    delivery.deliveries,
                    delay,
                    e
                );
                self.bus.release(&delivery, delay).await?;
            }
        }
        Ok(true)
    }

    /// Poll until `shutdown` flips to true. An event being handled when the
    /// signal arrives is finished first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("{} consumer started", self.category);

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.process_next().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => error!("{} consumer error: {}", self.category, e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("{} consumer stopped", self.category);
    }
}

/// Start one consumer per category. Join the handles after signalling
/// `shutdown` to wait for in-flight work.
pub fn spawn_consumers(
    bus: Arc<dyn EventBus>,
    orchestrator: Arc<Orchestrator>,
    settings: &EventSettings,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    EventCategory::ALL
        .into_iter()
        .map(|category| {
            let consumer =
                EventConsumer::new(category, bus.clone(), orchestrator.clone(), settings.clone());
            tokio::spawn(consumer.run(shutdown.clone()))
        })
        .collect()
}
