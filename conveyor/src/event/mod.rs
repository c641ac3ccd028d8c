//! Core types for the event delivery system.
//!
//! This module defines the type-safe event lifecycle using the typestate pattern.
//! Each event progresses through distinct states, enforced at compile time:
//! `Queued -> Claimed -> Applying -> {Succeeded, Failed}`, with releases
//! returning an event to `Queued` until its redelivery budget runs out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod transitions;

pub use transitions::Released;

/// Marker trait for valid event states.
///
/// This trait enables the typestate pattern, ensuring that operations
/// are only performed on events in valid states.
pub trait EventState: Send + Sync {}

/// An event moving through the delivery system.
///
/// Uses the typestate pattern to ensure type-safe state transitions.
/// The generic parameter `T` represents the current state of the event.
#[derive(Debug, Clone)]
pub struct Event<T: EventState> {
    /// The current state of the event.
    pub state: T,
    /// The immutable event record accepted at the ingestion edge.
    pub data: EventData,
}

/// Queue lane an event is routed to at ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Applied downstream as soon as a worker is free.
    Immediate,
    /// Accumulated into a batch window and applied in bulk.
    Deferred,
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lane::Immediate => write!(f, "immediate"),
            Lane::Deferred => write!(f, "deferred"),
        }
    }
}

/// The event record as accepted at the edge.
///
/// `id` identifies this queue entry; `event_id` is the upstream provider's
/// event identifier and the deduplication key. The same `event_id` can appear
/// under multiple `id`s when the provider redelivers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    /// Queue entry identity, assigned on enqueue.
    pub id: DeliveryId,

    /// Upstream event identifier (e.g. "evt_1abc..."), the dedupe key.
    pub event_id: String,

    /// Upstream event type string (e.g. "customer.updated").
    pub kind: String,

    /// Lane this event is processed on.
    pub lane: Lane,

    /// When the upstream provider says the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// When this service accepted the delivery.
    pub received_at: DateTime<Utc>,

    /// Raw event envelope. Handlers deserialize the parts they need.
    pub payload: serde_json::Value,
}

impl EventData {
    /// Build a fresh record with a new queue id stamped at the current time.
    pub fn new(
        event_id: impl Into<String>,
        kind: impl Into<String>,
        lane: Lane,
        occurred_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_id: event_id.into(),
            kind: kind.into(),
            lane,
            occurred_at,
            received_at: Utc::now(),
            payload,
        }
    }
}

/// One delivery attempt against the downstream API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Status line or error text describing how the attempt ended.
    pub outcome: String,
    /// When the attempt finished.
    pub at: DateTime<Utc>,
}

/// How a successfully terminal event was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "resolution")]
pub enum Disposition {
    /// The downstream write(s) were performed.
    Applied,
    /// Another delivery of the same upstream event already won the apply.
    Duplicate,
    /// The event kind is outside the routing table; acknowledged and skipped.
    Ignored,
    /// The event joined an accumulation window; the batch flusher owns it now.
    Accumulated { window_id: Uuid },
}

// ============================================================================
// Event States
// ============================================================================

/// Event is waiting in its lane.
///
/// This is the initial state for all accepted events and the state an event
/// returns to when released for redelivery.
#[derive(Debug, Clone)]
pub struct Queued {
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time a worker may claim this event. `None` means immediately.
    pub not_before: Option<DateTime<Utc>>,
    /// Times this event has been returned to the queue after a claim.
    pub redeliveries: u32,
}

impl EventState for Queued {}

/// Event has been pulled by a worker but processing has not started.
///
/// Claimed events are invisible to other workers; the claim expires after
/// the lane's visibility timeout if the worker disappears.
#[derive(Debug, Clone)]
pub struct Claimed {
    pub worker_id: WorkerId,
    pub claimed_at: DateTime<Utc>,
    pub redeliveries: u32,
}

impl EventState for Claimed {}

/// A worker is applying the event downstream.
#[derive(Debug, Clone)]
pub struct Applying {
    pub worker_id: WorkerId,
    pub claimed_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub redeliveries: u32,
}

impl EventState for Applying {}

/// Event was resolved. Terminal.
#[derive(Debug, Clone)]
pub struct Succeeded {
    pub disposition: Disposition,
    /// Delivery attempts made during processing, oldest first.
    pub attempts: Vec<AttemptRecord>,
    pub completed_at: DateTime<Utc>,
}

impl EventState for Succeeded {}

/// Event could not be applied. Terminal; parked in the dead-letter sink.
#[derive(Debug, Clone)]
pub struct Failed {
    pub error: String,
    /// Delivery attempts made during processing, oldest first.
    pub attempts: Vec<AttemptRecord>,
    pub failed_at: DateTime<Utc>,
    pub redeliveries: u32,
}

impl EventState for Failed {}

/// Unique identifier for a queue entry.
pub type DeliveryId = Uuid;

/// Unique identifier for a worker pool instance.
pub type WorkerId = Uuid;

impl Event<Queued> {
    /// Wrap a record in the initial queue state, claimable immediately.
    pub fn queued(data: EventData) -> Self {
        Event {
            state: Queued {
                enqueued_at: Utc::now(),
                not_before: None,
                redeliveries: 0,
            },
            data,
        }
    }
}

impl Event<Failed> {
    /// Wrap a record as a fresh dead-letter entry with no queue history.
    ///
    /// For failures discovered after the originating queue records already
    /// resolved, such as a rejected bulk submission.
    pub fn parked(
        data: EventData,
        error: impl Into<String>,
        attempts: Vec<AttemptRecord>,
    ) -> Self {
        Event {
            state: Failed {
                error: error.into(),
                attempts,
                failed_at: Utc::now(),
                redeliveries: 0,
            },
            data,
        }
    }
}

// ============================================================================
// Unified Event Representation
// ============================================================================

/// Enum that can hold an event in any state.
///
/// This is used for storage and status surfaces where events are handled
/// uniformly regardless of their current state.
#[derive(Debug, Clone)]
pub enum AnyEvent {
    Queued(Event<Queued>),
    Claimed(Event<Claimed>),
    Applying(Event<Applying>),
    Succeeded(Event<Succeeded>),
    Failed(Event<Failed>),
}

impl AnyEvent {
    /// Get the queue entry id regardless of state.
    pub fn id(&self) -> DeliveryId {
        self.data().id
    }

    /// Get the event record regardless of state.
    pub fn data(&self) -> &EventData {
        match self {
            AnyEvent::Queued(e) => &e.data,
            AnyEvent::Claimed(e) => &e.data,
            AnyEvent::Applying(e) => &e.data,
            AnyEvent::Succeeded(e) => &e.data,
            AnyEvent::Failed(e) => &e.data,
        }
    }

    /// Name of the current state, for logs and status payloads.
    pub fn state_name(&self) -> &'static str {
        match self {
            AnyEvent::Queued(_) => "queued",
            AnyEvent::Claimed(_) => "claimed",
            AnyEvent::Applying(_) => "applying",
            AnyEvent::Succeeded(_) => "succeeded",
            AnyEvent::Failed(_) => "failed",
        }
    }

    /// Check if this event is waiting in its lane.
    pub fn is_queued(&self) -> bool {
        matches!(self, AnyEvent::Queued(_))
    }

    /// Check if this event is in a terminal state (Succeeded or Failed).
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnyEvent::Succeeded(_) | AnyEvent::Failed(_))
    }

    /// Try to extract as a queued event.
    pub fn as_queued(&self) -> Option<&Event<Queued>> {
        match self {
            AnyEvent::Queued(e) => Some(e),
            _ => None,
        }
    }

    /// Try to extract as a failed event.
    pub fn as_failed(&self) -> Option<&Event<Failed>> {
        match self {
            AnyEvent::Failed(e) => Some(e),
            _ => None,
        }
    }
}

// Conversion traits for going from typed Event to AnyEvent

impl From<Event<Queued>> for AnyEvent {
    fn from(e: Event<Queued>) -> Self {
        AnyEvent::Queued(e)
    }
}

impl From<Event<Claimed>> for AnyEvent {
    fn from(e: Event<Claimed>) -> Self {
        AnyEvent::Claimed(e)
    }
}

impl From<Event<Applying>> for AnyEvent {
    fn from(e: Event<Applying>) -> Self {
        AnyEvent::Applying(e)
    }
}

impl From<Event<Succeeded>> for AnyEvent {
    fn from(e: Event<Succeeded>) -> Self {
        AnyEvent::Succeeded(e)
    }
}

impl From<Event<Failed>> for AnyEvent {
    fn from(e: Event<Failed>) -> Self {
        AnyEvent::Failed(e)
    }
}
