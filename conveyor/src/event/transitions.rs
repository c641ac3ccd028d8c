use crate::{error::Result, storage::Storage};

use super::{
    Applying, AttemptRecord, Claimed, Disposition, Event, Failed, Queued, Succeeded,
};

/// Result of releasing an event back to its lane.
///
/// A release consumes one redelivery; events that run out of budget are
/// parked in the dead-letter sink instead of requeued.
#[derive(Debug, Clone)]
pub enum Released {
    Requeued(Event<Queued>),
    Parked(Event<Failed>),
}

impl Event<Claimed> {
    /// Begin applying this event downstream.
    pub async fn start<S: Storage + ?Sized>(self, storage: &S) -> Result<Event<Applying>> {
        let event = Event {
            state: Applying {
                worker_id: self.state.worker_id,
                claimed_at: self.state.claimed_at,
                started_at: chrono::Utc::now(),
                redeliveries: self.state.redeliveries,
            },
            data: self.data,
        };
        storage.persist(&event).await?;
        Ok(event)
    }

    /// Return this event to its lane without consuming a redelivery.
    ///
    /// Used when the worker gives the claim back untouched (shutdown before
    /// processing started).
    pub async fn unclaim<S: Storage + ?Sized>(self, storage: &S) -> Result<Event<Queued>> {
        let event = Event {
            state: Queued {
                enqueued_at: chrono::Utc::now(),
                not_before: None,
                redeliveries: self.state.redeliveries,
            },
            data: self.data,
        };
        storage.persist(&event).await?;
        Ok(event)
    }
}

impl Event<Applying> {
    /// Resolve this event successfully. Terminal.
    pub async fn succeed<S: Storage + ?Sized>(
        self,
        disposition: Disposition,
        attempts: Vec<AttemptRecord>,
        storage: &S,
    ) -> Result<Event<Succeeded>> {
        let event = Event {
            state: Succeeded {
                disposition,
                attempts,
                completed_at: chrono::Utc::now(),
            },
            data: self.data,
        };
        storage.persist(&event).await?;
        Ok(event)
    }

    /// Mark this event permanently failed. Terminal; the event is parked in
    /// the dead-letter sink with its attempt history.
    pub async fn fail<S: Storage + ?Sized>(
        self,
        error: impl Into<String>,
        attempts: Vec<AttemptRecord>,
        storage: &S,
    ) -> Result<Event<Failed>> {
        let event = Event {
            state: Failed {
                error: error.into(),
                attempts,
                failed_at: chrono::Utc::now(),
                redeliveries: self.state.redeliveries,
            },
            data: self.data,
        };
        storage.persist(&event).await?;
        Ok(event)
    }

    /// Return this event to its lane to be claimed again after `delay_ms`.
    ///
    /// The redelivery counter is incremented; once it would exceed
    /// `max_redeliveries` the event is parked instead.
    pub async fn release<S: Storage + ?Sized>(
        self,
        delay_ms: u64,
        max_redeliveries: u32,
        reason: &str,
        storage: &S,
    ) -> Result<Released> {
        let redeliveries = self.state.redeliveries + 1;

        if redeliveries > max_redeliveries {
            tracing::warn!(
                delivery_id = %self.data.id,
                event_id = %self.data.event_id,
                redeliveries,
                max_redeliveries,
                "Redelivery budget exhausted, parking event"
            );

            let event = Event {
                state: Failed {
                    error: format!(
                        "redelivery limit reached after {} releases (last: {})",
                        redeliveries - 1,
                        reason
                    ),
                    attempts: Vec::new(),
                    failed_at: chrono::Utc::now(),
                    redeliveries: redeliveries - 1,
                },
                data: self.data,
            };
            storage.persist(&event).await?;
            return Ok(Released::Parked(event));
        }

        let now = chrono::Utc::now();
        let not_before = now + chrono::Duration::milliseconds(delay_ms as i64);

        tracing::info!(
            delivery_id = %self.data.id,
            event_id = %self.data.event_id,
            redeliveries,
            delay_ms,
            reason,
            "Releasing event back to its lane"
        );

        let event = Event {
            state: Queued {
                enqueued_at: now,
                not_before: Some(not_before),
                redeliveries,
            },
            data: self.data,
        };
        storage.persist(&event).await?;
        Ok(Released::Requeued(event))
    }
}
