use thiserror::Error;

use crate::event::DeliveryId;

/// Result type for conveyor operations.
pub type Result<T> = std::result::Result<T, ConveyorError>;

/// Errors that can occur in the delivery system.
#[derive(Debug, Error)]
pub enum ConveyorError {
    /// Event not found
    #[error("Event not found: {0}")]
    EventNotFound(DeliveryId),

    /// Event is in the wrong state for the attempted update
    #[error("Invalid state for event {0}: {1} cannot be updated")]
    InvalidState(DeliveryId, String),

    /// Invalid event parameters
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
