use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use conveyor::AttemptRecord;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Webhook signature missing, malformed, stale, or not matching
    #[error("Invalid webhook signature: {reason}")]
    InvalidSignature { reason: String },

    /// Request body is not a parseable event envelope
    #[error("Malformed event envelope: {message}")]
    MalformedEnvelope { message: String },

    /// The queue refused the event; the upstream should redeliver
    #[error("Queue unavailable: {message}")]
    QueueUnavailable { message: String },

    /// Downstream credentials rejected or unobtainable
    #[error("Authentication failure: {message}")]
    AuthenticationFailure { message: String },

    /// Payload failed validation; retrying cannot help
    #[error("Validation failure: {message}")]
    ValidationFailure { message: String },

    /// Transient downstream condition worth retrying
    #[error("Transient failure: {message}")]
    TransientFailure { message: String },

    /// A rate-limit tier is at its ceiling
    #[error("Rate limit exceeded on tier {tier}, retry after {retry_after:?}")]
    RateLimitExceeded { tier: String, retry_after: Duration },

    /// Event id was already processed
    #[error("Duplicate event: {event_id}")]
    DuplicateEvent { event_id: String },

    /// Retries exhausted or a non-retryable downstream rejection
    #[error("Permanent failure: {message}")]
    PermanentFailure {
        message: String,
        attempts: Vec<AttemptRecord>,
    },

    /// Queue or storage level error from the delivery substrate
    #[error(transparent)]
    Infrastructure(#[from] conveyor::ConveyorError),

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidSignature { .. } => StatusCode::BAD_REQUEST,
            Error::MalformedEnvelope { .. } => StatusCode::BAD_REQUEST,
            Error::ValidationFailure { .. } => StatusCode::BAD_REQUEST,
            Error::QueueUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::AuthenticationFailure { .. } => StatusCode::BAD_GATEWAY,
            Error::TransientFailure { .. } => StatusCode::BAD_GATEWAY,
            Error::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::DuplicateEvent { .. } => StatusCode::CONFLICT,
            Error::PermanentFailure { .. } => StatusCode::BAD_GATEWAY,
            Error::Infrastructure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::InvalidSignature { reason } => format!("Invalid webhook signature: {reason}"),
            Error::MalformedEnvelope { message } => format!("Malformed event envelope: {message}"),
            Error::ValidationFailure { message } => message.clone(),
            Error::QueueUnavailable { .. } => "Event queue temporarily unavailable, please redeliver".to_string(),
            Error::RateLimitExceeded { tier, .. } => format!("Rate limit exceeded on tier {tier}"),
            Error::DuplicateEvent { event_id } => format!("Event {event_id} was already processed"),
            Error::AuthenticationFailure { .. } | Error::TransientFailure { .. } | Error::PermanentFailure { .. } => {
                "Downstream delivery error".to_string()
            }
            Error::Infrastructure(_) | Error::Internal { .. } => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::Infrastructure(_) | Error::Internal { .. } => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::QueueUnavailable { .. } | Error::AuthenticationFailure { .. } | Error::PermanentFailure { .. } => {
                tracing::error!("Delivery path error: {}", self);
            }
            Error::TransientFailure { .. } | Error::RateLimitExceeded { .. } => {
                tracing::warn!("Retryable error: {}", self);
            }
            Error::InvalidSignature { .. } | Error::MalformedEnvelope { .. } | Error::ValidationFailure { .. } => {
                tracing::debug!("Client error: {}", self);
            }
            Error::DuplicateEvent { .. } => {
                tracing::debug!("Duplicate event: {}", self);
            }
        }

        let status = self.status_code();

        // Rate-limit responses carry a Retry-After hint
        if let Error::RateLimitExceeded { ref retry_after, .. } = self {
            let headers = [("retry-after", retry_after.as_secs().max(1).to_string())];
            return (status, headers, self.user_message()).into_response();
        }

        (status, self.user_message()).into_response()
    }
}

/// Convert from String errors (e.g., from external functions)
impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Internal { operation: msg }
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
