//! Per-entity event handlers.
//!
//! Handlers are pure: they map a verified event payload to the CRM upserts
//! it implies. An event carrying nothing actionable maps to no operations
//! and is acknowledged as ignored; a payload missing required fields is a
//! validation failure and is never retried.
//!
//! - [`customer`]: account upserts from customer events
//! - [`subscription`]: subscription lifecycle and checkout session events
//! - [`payment`]: one-time payment intents and recurring invoice payments

pub mod customer;
pub mod payment;
pub mod subscription;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use conveyor::EventData;

use crate::crm::UpsertOperation;
use crate::errors::{Error, Result};
use crate::events::EventKind;

/// Map one event to the CRM upserts it implies.
pub fn operations_for(kind: EventKind, event: &EventData) -> Result<Vec<UpsertOperation>> {
    let object = event_object(event)?;

    match kind {
        EventKind::CustomerUpdated => customer::updated(object),
        EventKind::SubscriptionCreated | EventKind::SubscriptionUpdated => {
            subscription::changed(object)
        }
        EventKind::SubscriptionDeleted => subscription::deleted(object),
        EventKind::CheckoutCompleted => subscription::checkout_completed(object),
        EventKind::CheckoutExpired => subscription::checkout_expired(object),
        EventKind::PaymentSucceeded => payment::succeeded(object, event.occurred_at),
        EventKind::PaymentFailed => payment::failed(object, event.occurred_at),
        EventKind::InvoicePaymentSucceeded => payment::invoice_succeeded(object, event.occurred_at),
        EventKind::InvoicePaymentFailed => payment::invoice_failed(object, event.occurred_at),
    }
}

/// The entity object carried under `data.object`.
fn event_object(event: &EventData) -> Result<&Value> {
    event
        .payload
        .get("data")
        .and_then(|data| data.get("object"))
        .filter(|object| object.is_object())
        .ok_or_else(|| Error::ValidationFailure {
            message: format!("event {} carries no data.object", event.event_id),
        })
}

fn required_str(object: &Value, field: &str) -> Result<String> {
    match object.get(field).and_then(Value::as_str) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(Error::ValidationFailure {
            message: format!("payload field \"{field}\" is missing or empty"),
        }),
    }
}

fn opt_str(object: &Value, field: &str) -> Option<String> {
    object.get(field).and_then(Value::as_str).map(str::to_string)
}

/// Upstream minor units (cents) to currency units.
fn minor_units(object: &Value, field: &str) -> Option<f64> {
    object
        .get(field)
        .and_then(Value::as_i64)
        .map(|cents| cents as f64 / 100.0)
}

fn unix_timestamp(object: &Value, field: &str) -> Option<DateTime<Utc>> {
    object
        .get(field)
        .and_then(Value::as_i64)
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

fn uppercase(value: Option<String>) -> Option<String> {
    value.map(|s| s.to_uppercase()).filter(|s| !s.is_empty())
}
