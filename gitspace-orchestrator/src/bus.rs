//! Durable event bus on the `event_queue` table.
//!
//! Delivery is at-least-once: a received event stays in the queue, invisible
//! for the visibility timeout, until it is acknowledged. An event that is
//! neither acknowledged nor released becomes visible again and is redelivered.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{SqliteExecutor, SqlitePool};
use tracing::{debug, error};

use crate::error::Result;
use crate::event::{EventCategory, LifecycleEvent};

/// An event handed to a consumer, plus how many times it has been handed out.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub event: LifecycleEvent,
    /// Including this one.
    pub deliveries: u32,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: &LifecycleEvent) -> Result<()>;

    /// Claim the oldest visible event of `category`, if any.
    async fn receive(&self, category: EventCategory) -> Result<Option<Delivery>>;

    /// The event was handled; it will not be delivered again.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Make the event visible again after `delay`.
    async fn release(&self, delivery: &Delivery, delay: Duration) -> Result<()>;
}

/// Add `event` to the queue through any executor, so the write can join the
/// transaction that changed the state the event describes.
pub async fn enqueue<'e, E: SqliteExecutor<'e>>(ex: E, event: &LifecycleEvent) -> Result<()> {
    let payload = serde_json::to_string(event)?;
    sqlx::query(
        "INSERT INTO event_queue (id, category, payload, enqueued_at, visible_at, deliveries)
         VALUES (?, ?, ?, ?, ?, 0)",
    )
    .bind(&event.id)
    .bind(event.category())
    .bind(payload)
    .bind(event.enqueued_at.timestamp())
    .bind(Utc::now().timestamp_millis())
    .execute(ex)
    .await?;

    Ok(())
}

#[derive(Clone)]
pub struct SqliteEventBus {
    pool: SqlitePool,
    visibility_timeout: Duration,
}

impl SqliteEventBus {
    pub fn new(pool: SqlitePool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
        }
    }

    /// Events waiting in `category`, visible or not.
    pub async fn depth(&self, category: EventCategory) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM event_queue WHERE category = ?")
            .bind(category)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl EventBus for SqliteEventBus {
    async fn publish(&self, event: &LifecycleEvent) -> Result<()> {
        enqueue(&self.pool, event).await?;
        debug!("Published {} event {}", event.category(), event.id);
        Ok(())
    }

    async fn receive(&self, category: EventCategory) -> Result<Option<Delivery>> {
        loop {
            let now = Utc::now().timestamp_millis();
            // Claiming is a single statement, so two consumers never get the
            // same event within one visibility window.
            let claimed: Option<(String, String, i64)> = sqlx::query_as(
                r#"
                UPDATE event_queue
                SET visible_at = ?, deliveries = deliveries + 1
                WHERE seq = (
                    SELECT seq FROM event_queue
                    WHERE category = ? AND visible_at <= ?
                    ORDER BY seq
                    LIMIT 1
                )
                RETURNING id, payload, deliveries
                "#,
            )
            .bind(now.saturating_add(millis(self.visibility_timeout)))
            .bind(category)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            let Some((id, payload, deliveries)) = claimed else {
                return Ok(None);
            };

            match serde_json::from_str::<LifecycleEvent>(&payload) {
                Ok(event) => {
                    return Ok(Some(Delivery {
                        event,
                        deliveries: u32::try_from(deliveries).unwrap_or(u32::MAX),
                    }))
                }
                Err(e) => {
                    error!("Discarding undecodable {} event {}: {}", category, id, e);
                    sqlx::query("DELETE FROM event_queue WHERE id = ?")
                        .bind(&id)
                        .execute(&self.pool)
                        .await?;
                }
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        sqlx::query("DELETE FROM event_queue WHERE id = ?")
            .bind(&delivery.event.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        let visible_at = Utc::now().timestamp_millis().saturating_add(millis(delay));
        sqlx::query("UPDATE event_queue SET visible_at = ? WHERE id = ?")
            .bind(visible_at)
            .bind(&delivery.event.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
