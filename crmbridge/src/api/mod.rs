//! API layer for HTTP request handling and data models.
//!
//! This module contains the REST API implementation, organized into:
//!
//! - **[`handlers`]**: Axum route handlers for all endpoints
//! - **[`models`]**: Request/response data structures for API communication
//!
//! # API Structure
//!
//! The API is divided into a few functional areas:
//!
//! - **Ingress** (`/webhooks/events`): Signed upstream webhook deliveries
//! - **Probes** (`/health`, `/health/ready`): Liveness and readiness
//! - **Operations** (`/status`, `/dead-letters`): Queue depths, limiter
//!   usage, open windows, and parked events
//!
//! # OpenAPI Documentation
//!
//! All endpoints are documented with OpenAPI annotations using `utoipa`.
//! Interactive documentation is served at `/docs` when the server is running.

pub mod handlers;
pub mod models;

use utoipa::OpenApi;

/// OpenAPI document for the ingress and operations surfaces.
#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::webhooks::receive_event,
        handlers::health::health,
        handlers::health::readiness,
        handlers::status::get_status,
        handlers::status::list_dead_letters,
    ),
    components(schemas(
        models::EventEnvelope,
        models::WebhookAck,
        models::HealthResponse,
        models::StatusResponse,
        models::LaneStatus,
        models::WindowStatus,
        models::DeadLetterEntry,
        models::AttemptView,
        crate::limits::TierUsage,
    )),
    tags(
        (name = "ingress", description = "Upstream webhook receipt"),
        (name = "operations", description = "Queue, limiter, and window visibility"),
    )
)]
pub struct ApiDoc;
