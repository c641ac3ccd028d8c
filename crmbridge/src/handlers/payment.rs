//! One-time payment intents and recurring invoice payments.
//!
//! Both shapes land in the same CRM payment entity: intents are keyed by
//! their own id, invoice payments by the intent behind the invoice when one
//! exists, falling back to the invoice id.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::crm::{PaymentRecord, TransactionType, UpsertOperation};
use crate::errors::Result;

/// `payment_intent.succeeded`
pub fn succeeded(object: &Value, occurred_at: DateTime<Utc>) -> Result<Vec<UpsertOperation>> {
    intent(object, "succeeded", occurred_at)
}

/// `payment_intent.payment_failed`
pub fn failed(object: &Value, occurred_at: DateTime<Utc>) -> Result<Vec<UpsertOperation>> {
    intent(object, "failed", occurred_at)
}

/// `invoice.payment_succeeded`
pub fn invoice_succeeded(object: &Value, occurred_at: DateTime<Utc>) -> Result<Vec<UpsertOperation>> {
    invoice(object, "succeeded", occurred_at)
}

/// `invoice.payment_failed`
pub fn invoice_failed(object: &Value, occurred_at: DateTime<Utc>) -> Result<Vec<UpsertOperation>> {
    invoice(object, "failed", occurred_at)
}

fn intent(object: &Value, status: &str, occurred_at: DateTime<Utc>) -> Result<Vec<UpsertOperation>> {
    let failure_reason = if status == "failed" {
        object
            .pointer("/last_payment_error/message")
            .and_then(Value::as_str)
            .map(str::to_string)
    } else {
        None
    };

    let record = PaymentRecord {
        payment_id: super::required_str(object, "id")?,
        customer_id: super::opt_str(object, "customer"),
        amount: super::minor_units(object, "amount"),
        currency: super::uppercase(super::opt_str(object, "currency")),
        status: Some(status.to_string()),
        payment_method_type: object
            .pointer("/payment_method_types/0")
            .and_then(Value::as_str)
            .map(str::to_string),
        transaction_at: super::unix_timestamp(object, "created").or(Some(occurred_at)),
        subscription_id: object
            .pointer("/metadata/subscription_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        invoice_id: None,
        transaction_type: Some(TransactionType::InitialPayment),
        failure_reason,
    };

    Ok(vec![UpsertOperation::Payment(record)])
}

fn invoice(object: &Value, status: &str, occurred_at: DateTime<Utc>) -> Result<Vec<UpsertOperation>> {
    let invoice_id = super::required_str(object, "id")?;
    let payment_id =
        super::opt_str(object, "payment_intent").unwrap_or_else(|| invoice_id.clone());
    // A failed invoice still carries the amount it tried to collect
    let amount_field = if status == "succeeded" { "amount_paid" } else { "amount_due" };

    let record = PaymentRecord {
        payment_id,
        customer_id: super::opt_str(object, "customer"),
        amount: super::minor_units(object, amount_field),
        currency: super::uppercase(super::opt_str(object, "currency")),
        status: Some(status.to_string()),
        payment_method_type: None,
        transaction_at: super::unix_timestamp(object, "created").or(Some(occurred_at)),
        subscription_id: super::opt_str(object, "subscription"),
        invoice_id: Some(invoice_id),
        transaction_type: Some(TransactionType::RecurringPayment),
        failure_reason: None,
    };

    Ok(vec![UpsertOperation::Payment(record)])
}
