//! HTTP handlers for upstream webhook deliveries.

use axum::{
    body::Body,
    extract::{FromRequest, State},
    http::Request,
    Json,
};
use conveyor::{Event, EventData, Storage};

use crate::{
    api::models::{EventEnvelope, WebhookAck},
    errors::{Error, Result},
    signature::{self, SIGNATURE_HEADER},
    AppState,
};

/// Extractor that verifies the delivery signature before parsing the body.
///
/// Verification runs against the raw bytes as received; the envelope is only
/// deserialized once the signature checks out. The body is kept whole as
/// [`SignedEnvelope::body`] because that is what gets queued: handlers read
/// `data.object` from it, and a verbatim payload stays replayable from the
/// dead-letter sink.
pub struct SignedEnvelope {
    pub envelope: EventEnvelope,
    pub body: serde_json::Value,
}

impl FromRequest<AppState> for SignedEnvelope
where
    String: FromRequest<AppState>,
{
    type Rejection = Error;

    async fn from_request(req: Request<Body>, state: &AppState) -> Result<Self> {
        let header = match req.headers().get(SIGNATURE_HEADER) {
            Some(value) => value
                .to_str()
                .map_err(|_| Error::InvalidSignature {
                    reason: "signature header is not valid ASCII".to_string(),
                })?
                .to_owned(),
            None => {
                return Err(Error::InvalidSignature {
                    reason: format!("missing {SIGNATURE_HEADER} header"),
                });
            }
        };

        let payload = String::from_request(req, state)
            .await
            .map_err(|e| Error::MalformedEnvelope {
                message: e.to_string(),
            })?;

        let Some(secret) = state.config.upstream.signing_secret.as_deref() else {
            return Err(Error::Internal {
                operation: "verify webhook delivery: upstream.signing_secret is not configured"
                    .to_string(),
            });
        };

        signature::verify_header(
            &header,
            &payload,
            secret,
            state.config.upstream.replay_tolerance,
        )
        .map_err(|e| Error::InvalidSignature {
            reason: e.to_string(),
        })?;

        let envelope = EventEnvelope::parse(&payload)?;
        let body = serde_json::from_str(&payload).map_err(|e| Error::MalformedEnvelope {
            message: e.to_string(),
        })?;

        Ok(Self { envelope, body })
    }
}

/// Receive an upstream event delivery.
///
/// Verifies the signature, routes the event to a lane by kind, and enqueues
/// it. Returns 200 as soon as the event is durably queued; application to the
/// CRM happens asynchronously.
#[utoipa::path(
    post,
    path = "/webhooks/events",
    tag = "ingress",
    summary = "Receive event delivery",
    description = "Accepts a signed upstream event, routes it to a processing lane, and queues it. A 200 acknowledges receipt, not application.",
    request_body = EventEnvelope,
    responses(
        (status = 200, description = "Event queued for processing", body = WebhookAck),
        (status = 400, description = "Invalid signature or malformed envelope"),
        (status = 503, description = "Queue unavailable, redeliver later")
    )
)]
#[tracing::instrument(skip_all, fields(event_id = %delivery.envelope.id, kind = %delivery.envelope.kind))]
pub async fn receive_event(
    State(state): State<AppState>,
    delivery: SignedEnvelope,
) -> Result<Json<WebhookAck>> {
    let SignedEnvelope { envelope, body } = delivery;
    let route = state.router.classify(&envelope.kind);
    let lane = route.lane();

    let event_id = envelope.id.clone();
    let data = EventData::new(envelope.id, envelope.kind, lane, envelope.occurred_at, body);

    state
        .storage
        .enqueue(Event::queued(data))
        .await
        .map_err(|e| Error::QueueUnavailable {
            message: e.to_string(),
        })?;

    metrics::counter!("crmbridge_events_received_total", "lane" => lane.to_string()).increment(1);
    tracing::info!(%lane, "Queued upstream event");

    Ok(Json(WebhookAck {
        received: true,
        event_id,
        lane: lane.to_string(),
    }))
}
