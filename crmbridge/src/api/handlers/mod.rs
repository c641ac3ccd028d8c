//! HTTP request handlers for all API endpoints.
//!
//! # Handler Modules
//!
//! - [`webhooks`] - Upstream delivery receipt: signature verification,
//!   envelope parsing, lane routing, and enqueue
//! - [`health`] - Liveness and readiness probes
//! - [`status`] - Operational visibility: lane depths, limiter usage,
//!   open windows, and the dead-letter listing

pub mod health;
pub mod status;
pub mod webhooks;
