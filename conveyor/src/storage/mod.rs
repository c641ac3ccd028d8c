use std::future::Future;

use serde::Serialize;

use crate::error::Result;
use crate::event::{AnyEvent, Claimed, DeliveryId, Event, EventState, Failed, Lane, Queued, WorkerId};

pub mod in_memory;

/// Point-in-time totals for one lane, for the status surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LaneDepth {
    /// Events waiting to be claimed (including delayed releases).
    pub queued: usize,
    /// Events currently claimed or being applied.
    pub in_flight: usize,
    /// Events that resolved successfully.
    pub succeeded: usize,
    /// Events parked in the dead-letter sink.
    pub failed: usize,
}

/// Result of one expired-claim sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapSummary {
    /// Claims returned to the queue with an incremented redelivery count.
    pub requeued: usize,
    /// Claims whose events ran out of redelivery budget and were parked.
    pub parked: usize,
}

/// Storage trait for persisting and querying events.
///
/// This trait provides atomic operations for event lifecycle management.
/// The type system ensures valid state transitions, so implementations don't
/// need to validate them.
pub trait Storage: Send + Sync {
    /// Accept a new queued event.
    ///
    /// # Errors
    /// - If an event with the same queue id already exists
    fn enqueue(&self, event: Event<Queued>) -> impl Future<Output = Result<()>> + Send;

    /// Atomically claim queued events from one lane for processing.
    ///
    /// Transitions events from `Queued` to `Claimed` atomically, preventing
    /// double-claims when multiple workers poll concurrently. Events whose
    /// `not_before` lies in the future are skipped; the rest are returned in
    /// arrival order.
    ///
    /// # Arguments
    /// - `lane` - Lane to claim from
    /// - `limit` - Maximum number of events to claim
    /// - `worker_id` - ID of the worker claiming these events
    fn claim_events(
        &self,
        lane: Lane,
        limit: usize,
        worker_id: WorkerId,
    ) -> impl Future<Output = Result<Vec<Event<Claimed>>>> + Send;

    /// Update an existing event's state in storage.
    ///
    /// The type system ensures valid state transitions, so this method just
    /// persists the new state without validation.
    ///
    /// # Errors
    /// - `EventNotFound` - if the event doesn't exist
    /// - `InvalidState` - if the stored event is already terminal
    fn persist<T: EventState + Clone>(
        &self,
        event: &Event<T>,
    ) -> impl Future<Output = Result<()>> + Send
    where
        AnyEvent: From<Event<T>>;

    /// Insert a fresh dead-letter record.
    ///
    /// Used for failures discovered outside an event's own queue record, such
    /// as a batch window whose bulk submission failed after its member events
    /// already resolved.
    ///
    /// # Errors
    /// - If an event with the same queue id already exists
    fn park(&self, event: Event<Failed>) -> impl Future<Output = Result<()>> + Send;

    /// Return claims older than `visibility_timeout_ms` to their lanes.
    ///
    /// Claimed and applying events whose workers disappeared become claimable
    /// again with an incremented redelivery count, or are parked once the
    /// count would exceed `max_redeliveries`.
    fn reap_expired_claims(
        &self,
        visibility_timeout_ms: u64,
        max_redeliveries: u32,
    ) -> impl Future<Output = Result<ReapSummary>> + Send;

    /// Point-in-time totals for one lane.
    fn depth(&self, lane: Lane) -> impl Future<Output = Result<LaneDepth>> + Send;

    /// Get events by queue id.
    ///
    /// Returns the current event (in whatever state) for each requested id.
    /// Entries for unknown ids are errors.
    fn get_events(
        &self,
        ids: Vec<DeliveryId>,
    ) -> impl Future<Output = Result<Vec<Result<AnyEvent>>>> + Send;

    /// List parked events, most recent failures first.
    fn failed_events(&self, limit: usize) -> impl Future<Output = Result<Vec<Event<Failed>>>> + Send;
}
