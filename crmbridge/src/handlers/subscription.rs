//! Subscription lifecycle and checkout session events.

use serde_json::Value;

use crate::crm::{SubscriptionRecord, SyncStatus, UpsertOperation};
use crate::errors::Result;

/// `customer.subscription.created` and `.updated` carry the same shape.
pub fn changed(object: &Value) -> Result<Vec<UpsertOperation>> {
    let price = object.pointer("/items/data/0/price");

    let record = SubscriptionRecord {
        subscription_id: super::required_str(object, "id")?,
        customer_id: super::opt_str(object, "customer"),
        status: super::opt_str(object, "status"),
        price_id: price
            .and_then(|price| price.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string),
        current_period_start: super::unix_timestamp(object, "current_period_start"),
        current_period_end: super::unix_timestamp(object, "current_period_end"),
        amount: price
            .and_then(|price| price.get("unit_amount"))
            .and_then(Value::as_i64)
            .map(|cents| cents as f64 / 100.0),
        currency: super::uppercase(
            price
                .and_then(|price| price.get("currency"))
                .and_then(Value::as_str)
                .map(str::to_string),
        ),
        ..SubscriptionRecord::default()
    };

    Ok(vec![UpsertOperation::Subscription(record)])
}

/// `customer.subscription.deleted`: the row survives, marked canceled.
pub fn deleted(object: &Value) -> Result<Vec<UpsertOperation>> {
    let record = SubscriptionRecord {
        subscription_id: super::required_str(object, "id")?,
        status: Some("canceled".to_string()),
        ..SubscriptionRecord::default()
    };

    Ok(vec![UpsertOperation::Subscription(record)])
}

/// `checkout.session.completed`: mark the purchased subscription as synced.
///
/// Sessions without a subscription (one-time purchases) carry nothing to
/// relay and map to no operations.
pub fn checkout_completed(object: &Value) -> Result<Vec<UpsertOperation>> {
    let Some(subscription_id) = super::opt_str(object, "subscription") else {
        return Ok(Vec::new());
    };

    let record = SubscriptionRecord {
        subscription_id,
        customer_id: super::opt_str(object, "customer"),
        checkout_session_id: super::opt_str(object, "id"),
        sync_status: Some(SyncStatus::Synced),
        ..SubscriptionRecord::default()
    };

    Ok(vec![UpsertOperation::Subscription(record)])
}

/// `checkout.session.expired`: flag the abandoned subscription with an error.
pub fn checkout_expired(object: &Value) -> Result<Vec<UpsertOperation>> {
    let Some(subscription_id) = super::opt_str(object, "subscription") else {
        return Ok(Vec::new());
    };
    let session_id = super::opt_str(object, "id");

    let record = SubscriptionRecord {
        subscription_id,
        checkout_session_id: session_id.clone(),
        sync_status: Some(SyncStatus::Error),
        sync_error: Some(format!(
            "checkout session {} expired without completion",
            session_id.as_deref().unwrap_or("(unknown)")
        )),
        ..SubscriptionRecord::default()
    };

    Ok(vec![UpsertOperation::Subscription(record)])
}
