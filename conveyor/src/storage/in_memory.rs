//! In-memory storage implementation for events.
//!
//! Stores all events in memory behind a read-write lock. Suitable for tests
//! and single-process deployments; events are lost on restart.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{ConveyorError, Result};
use crate::event::*;

use super::{LaneDepth, ReapSummary, Storage};

/// In-memory implementation of the Storage trait.
///
/// Claims take queued events in arrival order per lane and respect
/// `not_before`. Terminal states are immutable once persisted.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    events: Arc<RwLock<HashMap<DeliveryId, AnyEvent>>>,
}

impl InMemoryStorage {
    /// Create a new in-memory storage.
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Storage for InMemoryStorage {
    async fn enqueue(&self, event: Event<Queued>) -> Result<()> {
        let id = event.data.id;

        let mut events = self.events.write();

        if events.contains_key(&id) {
            return Err(ConveyorError::InvalidEvent(format!(
                "event {id} already enqueued"
            )));
        }

        events.insert(id, event.into());
        Ok(())
    }

    async fn claim_events(
        &self,
        lane: Lane,
        limit: usize,
        worker_id: WorkerId,
    ) -> Result<Vec<Event<Claimed>>> {
        let mut events = self.events.write();
        let now = chrono::Utc::now();

        // Claimable: queued in this lane, past any not_before, arrival order
        let mut claimable: Vec<(chrono::DateTime<chrono::Utc>, DeliveryId)> = events
            .iter()
            .filter_map(|(id, stored)| {
                let queued = stored.as_queued()?;
                if queued.data.lane != lane {
                    return None;
                }
                if queued.state.not_before.is_some_and(|t| t > now) {
                    return None;
                }
                Some((queued.state.enqueued_at, *id))
            })
            .collect();
        claimable.sort();
        claimable.truncate(limit);

        let mut claimed_events = Vec::with_capacity(claimable.len());

        for (_, id) in claimable {
            if let Some(stored) = events.get_mut(&id) {
                if let Some(queued) = stored.as_queued() {
                    let claimed = Event {
                        state: Claimed {
                            worker_id,
                            claimed_at: now,
                            redeliveries: queued.state.redeliveries,
                        },
                        data: queued.data.clone(),
                    };

                    *stored = claimed.clone().into();
                    claimed_events.push(claimed);
                }
            }
        }

        Ok(claimed_events)
    }

    async fn persist<T: EventState + Clone>(&self, event: &Event<T>) -> Result<()>
    where
        AnyEvent: From<Event<T>>,
    {
        let id = event.data.id;

        let mut events = self.events.write();

        match events.get_mut(&id) {
            Some(existing) => {
                // Terminal states are immutable
                if existing.is_terminal() {
                    return Err(ConveyorError::InvalidState(
                        id,
                        existing.state_name().to_string(),
                    ));
                }

                *existing = event.clone().into();
                Ok(())
            }
            None => Err(ConveyorError::EventNotFound(id)),
        }
    }

    async fn park(&self, event: Event<Failed>) -> Result<()> {
        let id = event.data.id;

        let mut events = self.events.write();

        if events.contains_key(&id) {
            return Err(ConveyorError::InvalidEvent(format!(
                "event {id} already recorded"
            )));
        }

        events.insert(id, event.into());
        Ok(())
    }

    async fn reap_expired_claims(
        &self,
        visibility_timeout_ms: u64,
        max_redeliveries: u32,
    ) -> Result<ReapSummary> {
        let mut events = self.events.write();
        let now = chrono::Utc::now();
        let cutoff = now - chrono::Duration::milliseconds(visibility_timeout_ms as i64);

        let mut summary = ReapSummary::default();

        for stored in events.values_mut() {
            let (claimed_at, redeliveries) = match stored {
                AnyEvent::Claimed(e) => (e.state.claimed_at, e.state.redeliveries),
                AnyEvent::Applying(e) => (e.state.claimed_at, e.state.redeliveries),
                _ => continue,
            };

            if claimed_at > cutoff {
                continue;
            }

            let data = stored.data().clone();
            let redeliveries = redeliveries + 1;

            if redeliveries > max_redeliveries {
                tracing::warn!(
                    delivery_id = %data.id,
                    event_id = %data.event_id,
                    redeliveries,
                    "Expired claim out of redelivery budget, parking event"
                );
                *stored = AnyEvent::Failed(Event {
                    state: Failed {
                        error: format!(
                            "claim expired after {} redeliveries",
                            redeliveries - 1
                        ),
                        attempts: Vec::new(),
                        failed_at: now,
                        redeliveries: redeliveries - 1,
                    },
                    data,
                });
                summary.parked += 1;
            } else {
                tracing::info!(
                    delivery_id = %data.id,
                    event_id = %data.event_id,
                    redeliveries,
                    "Reclaiming expired claim"
                );
                *stored = AnyEvent::Queued(Event {
                    state: Queued {
                        enqueued_at: now,
                        not_before: None,
                        redeliveries,
                    },
                    data,
                });
                summary.requeued += 1;
            }
        }

        Ok(summary)
    }

    async fn depth(&self, lane: Lane) -> Result<LaneDepth> {
        let events = self.events.read();

        let mut depth = LaneDepth::default();
        for stored in events.values() {
            if stored.data().lane != lane {
                continue;
            }
            match stored {
                AnyEvent::Queued(_) => depth.queued += 1,
                AnyEvent::Claimed(_) | AnyEvent::Applying(_) => depth.in_flight += 1,
                AnyEvent::Succeeded(_) => depth.succeeded += 1,
                AnyEvent::Failed(_) => depth.failed += 1,
            }
        }

        Ok(depth)
    }

    async fn get_events(&self, ids: Vec<DeliveryId>) -> Result<Vec<Result<AnyEvent>>> {
        let events = self.events.read();

        let results = ids
            .into_iter()
            .map(|id| {
                events
                    .get(&id)
                    .cloned()
                    .ok_or(ConveyorError::EventNotFound(id))
            })
            .collect();

        Ok(results)
    }

    async fn failed_events(&self, limit: usize) -> Result<Vec<Event<Failed>>> {
        let events = self.events.read();

        let mut failed: Vec<Event<Failed>> = events
            .values()
            .filter_map(|stored| stored.as_failed().cloned())
            .collect();
        failed.sort_by(|a, b| b.state.failed_at.cmp(&a.state.failed_at));
        failed.truncate(limit);

        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data(lane: Lane) -> EventData {
        EventData::new(
            "evt_sample",
            "customer.updated",
            lane,
            chrono::Utc::now(),
            serde_json::json!({"object": {"id": "cus_1"}}),
        )
    }

    #[tokio::test]
    async fn test_enqueue_and_claim() {
        let storage = InMemoryStorage::new();
        let data = sample_data(Lane::Immediate);
        let id = data.id;

        storage.enqueue(Event::queued(data)).await.unwrap();

        let claimed = storage
            .claim_events(Lane::Immediate, 10, uuid::Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].data.id, id);
    }

    #[tokio::test]
    async fn test_enqueue_duplicate_id_rejected() {
        let storage = InMemoryStorage::new();
        let data = sample_data(Lane::Immediate);

        storage.enqueue(Event::queued(data.clone())).await.unwrap();
        let result = storage.enqueue(Event::queued(data)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let storage = InMemoryStorage::new();
        let worker1 = uuid::Uuid::new_v4();
        let worker2 = uuid::Uuid::new_v4();

        storage
            .enqueue(Event::queued(sample_data(Lane::Immediate)))
            .await
            .unwrap();
        storage
            .enqueue(Event::queued(sample_data(Lane::Immediate)))
            .await
            .unwrap();

        // Worker 1 claims both
        let claimed = storage
            .claim_events(Lane::Immediate, 10, worker1)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(claimed.iter().all(|e| e.state.worker_id == worker1));

        // Worker 2 gets nothing
        let claimed2 = storage
            .claim_events(Lane::Immediate, 10, worker2)
            .await
            .unwrap();
        assert!(claimed2.is_empty());
    }

    #[tokio::test]
    async fn test_claim_respects_lane() {
        let storage = InMemoryStorage::new();

        storage
            .enqueue(Event::queued(sample_data(Lane::Deferred)))
            .await
            .unwrap();

        let claimed = storage
            .claim_events(Lane::Immediate, 10, uuid::Uuid::new_v4())
            .await
            .unwrap();
        assert!(claimed.is_empty());

        let claimed = storage
            .claim_events(Lane::Deferred, 10, uuid::Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_respects_not_before() {
        let storage = InMemoryStorage::new();
        let data = sample_data(Lane::Immediate);

        let delayed = Event {
            state: Queued {
                enqueued_at: chrono::Utc::now(),
                not_before: Some(chrono::Utc::now() + chrono::Duration::seconds(30)),
                redeliveries: 1,
            },
            data,
        };
        storage.enqueue(delayed).await.unwrap();

        let claimed = storage
            .claim_events(Lane::Immediate, 10, uuid::Uuid::new_v4())
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_claim_arrival_order() {
        let storage = InMemoryStorage::new();
        let base = chrono::Utc::now();

        let mut ids = Vec::new();
        for i in 0..3 {
            let data = sample_data(Lane::Immediate);
            ids.push(data.id);
            let event = Event {
                state: Queued {
                    enqueued_at: base + chrono::Duration::milliseconds(i),
                    not_before: None,
                    redeliveries: 0,
                },
                data,
            };
            storage.enqueue(event).await.unwrap();
        }

        let claimed = storage
            .claim_events(Lane::Immediate, 2, uuid::Uuid::new_v4())
            .await
            .unwrap();
        let claimed_ids: Vec<_> = claimed.iter().map(|e| e.data.id).collect();
        assert_eq!(claimed_ids, ids[..2]);
    }

    #[tokio::test]
    async fn test_persist_rejects_terminal_overwrite() {
        let storage = InMemoryStorage::new();
        let data = sample_data(Lane::Immediate);
        let id = data.id;

        storage.enqueue(Event::queued(data.clone())).await.unwrap();

        let failed = Event {
            state: Failed {
                error: "permanent".to_string(),
                attempts: Vec::new(),
                failed_at: chrono::Utc::now(),
                redeliveries: 0,
            },
            data: data.clone(),
        };
        storage.persist(&failed).await.unwrap();

        let requeue = Event {
            state: Queued {
                enqueued_at: chrono::Utc::now(),
                not_before: None,
                redeliveries: 0,
            },
            data,
        };
        let result = storage.persist(&requeue).await;
        assert!(matches!(result, Err(ConveyorError::InvalidState(eid, _)) if eid == id));
    }

    #[tokio::test]
    async fn test_persist_unknown_event() {
        let storage = InMemoryStorage::new();
        let event = Event::queued(sample_data(Lane::Immediate));

        let result = storage.persist(&event).await;
        assert!(matches!(result, Err(ConveyorError::EventNotFound(_))));
    }

    #[tokio::test]
    async fn test_reap_expired_claims_requeues() {
        let storage = InMemoryStorage::new();
        let data = sample_data(Lane::Immediate);
        let id = data.id;

        storage.enqueue(Event::queued(data.clone())).await.unwrap();

        // Backdate the claim past the visibility timeout
        let stale = Event {
            state: Claimed {
                worker_id: uuid::Uuid::new_v4(),
                claimed_at: chrono::Utc::now() - chrono::Duration::seconds(120),
                redeliveries: 0,
            },
            data,
        };
        storage.persist(&stale).await.unwrap();

        let summary = storage.reap_expired_claims(60_000, 5).await.unwrap();
        assert_eq!(summary, ReapSummary { requeued: 1, parked: 0 });

        let claimed = storage
            .claim_events(Lane::Immediate, 1, uuid::Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].data.id, id);
        assert_eq!(claimed[0].state.redeliveries, 1);
    }

    #[tokio::test]
    async fn test_reap_parks_when_budget_spent() {
        let storage = InMemoryStorage::new();
        let data = sample_data(Lane::Immediate);

        storage.enqueue(Event::queued(data.clone())).await.unwrap();

        let stale = Event {
            state: Applying {
                worker_id: uuid::Uuid::new_v4(),
                claimed_at: chrono::Utc::now() - chrono::Duration::seconds(120),
                started_at: chrono::Utc::now() - chrono::Duration::seconds(119),
                redeliveries: 5,
            },
            data,
        };
        storage.persist(&stale).await.unwrap();

        let summary = storage.reap_expired_claims(60_000, 5).await.unwrap();
        assert_eq!(summary, ReapSummary { requeued: 0, parked: 1 });

        let failed = storage.failed_events(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].state.error.contains("claim expired"));
    }

    #[tokio::test]
    async fn test_reap_leaves_fresh_claims() {
        let storage = InMemoryStorage::new();

        storage
            .enqueue(Event::queued(sample_data(Lane::Immediate)))
            .await
            .unwrap();
        let claimed = storage
            .claim_events(Lane::Immediate, 1, uuid::Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        let summary = storage.reap_expired_claims(60_000, 5).await.unwrap();
        assert_eq!(summary, ReapSummary::default());
    }

    #[tokio::test]
    async fn test_depth_counts_by_state() {
        let storage = InMemoryStorage::new();

        storage
            .enqueue(Event::queued(sample_data(Lane::Immediate)))
            .await
            .unwrap();
        storage
            .enqueue(Event::queued(sample_data(Lane::Immediate)))
            .await
            .unwrap();
        storage
            .enqueue(Event::queued(sample_data(Lane::Deferred)))
            .await
            .unwrap();

        let worker = uuid::Uuid::new_v4();
        let claimed = storage
            .claim_events(Lane::Immediate, 1, worker)
            .await
            .unwrap();
        claimed
            .into_iter()
            .next()
            .unwrap()
            .start(&storage)
            .await
            .unwrap();

        let depth = storage.depth(Lane::Immediate).await.unwrap();
        assert_eq!(depth.queued, 1);
        assert_eq!(depth.in_flight, 1);
        assert_eq!(depth.succeeded, 0);
        assert_eq!(depth.failed, 0);

        let depth = storage.depth(Lane::Deferred).await.unwrap();
        assert_eq!(depth.queued, 1);
    }

    #[tokio::test]
    async fn test_park_inserts_fresh_record() {
        let storage = InMemoryStorage::new();
        let data = sample_data(Lane::Deferred);

        let failed = Event {
            state: Failed {
                error: "bulk job failed".to_string(),
                attempts: Vec::new(),
                failed_at: chrono::Utc::now(),
                redeliveries: 0,
            },
            data,
        };
        storage.park(failed.clone()).await.unwrap();

        // Same id cannot be parked twice
        assert!(storage.park(failed).await.is_err());

        let listed = storage.failed_events(10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state.error, "bulk job failed");
    }

    #[tokio::test]
    async fn test_failed_events_most_recent_first() {
        let storage = InMemoryStorage::new();
        let now = chrono::Utc::now();

        for i in 0..3 {
            let failed = Event {
                state: Failed {
                    error: format!("failure {i}"),
                    attempts: Vec::new(),
                    failed_at: now + chrono::Duration::seconds(i),
                    redeliveries: 0,
                },
                data: sample_data(Lane::Immediate),
            };
            storage.park(failed).await.unwrap();
        }

        let listed = storage.failed_events(2).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].state.error, "failure 2");
        assert_eq!(listed[1].state.error, "failure 1");
    }
}
