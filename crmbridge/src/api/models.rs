//! API request and response data models.
//!
//! These structures define the public HTTP contract: the upstream delivery
//! envelope on the way in, and the acknowledgement/status/dead-letter views
//! on the way out. They are distinct from the queue-level types in
//! [`conveyor`] so the API surface can evolve without touching storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use conveyor::{AttemptRecord, Event, Failed, Lane, LaneDepth};

use crate::batch::WindowSnapshot;
use crate::errors::Error;
use crate::limits::TierUsage;

/// An upstream delivery envelope as it appears on the wire.
///
/// The payload under `data` is carried opaquely; the per-entity handlers
/// read `data.object` when the event is applied.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct EventEnvelope {
    /// Upstream event id (e.g. `evt_1Nr...`), the idempotency key
    pub id: String,
    /// Dotted event kind (e.g. `payment_intent.succeeded`)
    #[serde(rename = "type")]
    pub kind: String,
    /// Unix seconds when the event occurred upstream
    #[serde(rename = "created", with = "chrono::serde::ts_seconds")]
    #[schema(value_type = i64)]
    pub occurred_at: DateTime<Utc>,
    /// Kind-specific payload
    pub data: serde_json::Value,
}

impl EventEnvelope {
    /// Parse a raw delivery body, rejecting envelopes that cannot be queued.
    pub fn parse(payload: &str) -> Result<Self, Error> {
        let envelope: Self = serde_json::from_str(payload).map_err(|e| Error::MalformedEnvelope {
            message: e.to_string(),
        })?;

        if envelope.id.is_empty() {
            return Err(Error::MalformedEnvelope {
                message: "event id is empty".to_string(),
            });
        }
        if envelope.kind.is_empty() {
            return Err(Error::MalformedEnvelope {
                message: "event type is empty".to_string(),
            });
        }

        Ok(envelope)
    }
}

/// Acknowledgement returned for an accepted delivery.
///
/// Acceptance means queued for processing, nothing more. The eventual
/// outcome is visible on the status and dead-letter surfaces, never here.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WebhookAck {
    /// Always `true` on a 200 response
    pub received: bool,
    /// Upstream event id as supplied in the envelope
    pub event_id: String,
    /// Queue lane the event was routed to ("immediate" or "deferred")
    pub lane: String,
}

/// Probe response body.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

/// Point-in-time operational snapshot.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StatusResponse {
    /// Per-lane event counts by lifecycle stage
    pub lanes: Vec<LaneStatus>,
    /// Rate-limit tier usage against configured ceilings
    pub limits: Vec<TierUsage>,
    /// Open accumulation windows
    pub windows: Vec<WindowStatus>,
}

/// Event counts for one queue lane.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LaneStatus {
    /// Lane name ("immediate" or "deferred")
    pub lane: String,
    /// Waiting to be claimed, including delayed redeliveries
    pub queued: usize,
    /// Claimed or mid-application
    pub in_flight: usize,
    pub succeeded: usize,
    /// Parked in the dead-letter sink
    pub failed: usize,
}

impl LaneStatus {
    pub fn new(lane: Lane, depth: LaneDepth) -> Self {
        Self {
            lane: lane.to_string(),
            queued: depth.queued,
            in_flight: depth.in_flight,
            succeeded: depth.succeeded,
            failed: depth.failed,
        }
    }
}

/// One open accumulation window.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct WindowStatus {
    pub category: String,
    pub window_id: Uuid,
    pub record_count: usize,
    /// Window age in whole seconds
    pub age_secs: u64,
    /// Whether the window has crossed a readiness threshold
    pub ready: bool,
}

impl From<WindowSnapshot> for WindowStatus {
    fn from(snapshot: WindowSnapshot) -> Self {
        Self {
            category: snapshot.category,
            window_id: snapshot.window_id,
            record_count: snapshot.record_count,
            age_secs: snapshot.window_age.as_secs(),
            ready: snapshot.ready,
        }
    }
}

/// Query parameters for the dead-letter listing.
#[derive(Debug, Deserialize, IntoParams, ToSchema)]
pub struct DeadLettersQuery {
    /// Maximum entries to return (default 50, capped at 500)
    pub limit: Option<usize>,
}

/// One attempt against the CRM, as recorded in an event's history.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AttemptView {
    pub attempt: u32,
    /// What the attempt resolved to (e.g. "HTTP 200", "timeout")
    pub outcome: String,
    pub at: DateTime<Utc>,
}

impl From<AttemptRecord> for AttemptView {
    fn from(record: AttemptRecord) -> Self {
        Self {
            attempt: record.attempt,
            outcome: record.outcome,
            at: record.at,
        }
    }
}

/// One parked event, listed newest first.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DeadLetterEntry {
    /// Upstream event id
    pub event_id: String,
    /// Dotted event kind
    pub kind: String,
    pub lane: String,
    /// Terminal error that parked the event
    pub error: String,
    pub failed_at: DateTime<Utc>,
    /// Queue-level redeliveries consumed before parking
    pub redeliveries: u32,
    pub attempts: Vec<AttemptView>,
}

impl From<Event<Failed>> for DeadLetterEntry {
    fn from(event: Event<Failed>) -> Self {
        let Event { state, data } = event;
        Self {
            event_id: data.event_id,
            kind: data.kind,
            lane: data.lane.to_string(),
            error: state.error,
            failed_at: state.failed_at,
            redeliveries: state.redeliveries,
            attempts: state.attempts.into_iter().map(AttemptView::from).collect(),
        }
    }
}
