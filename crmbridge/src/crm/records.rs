//! Entity record models for CRM upserts.
//!
//! Records are keyed by their upstream identifier so repeated upserts
//! converge on one CRM row. Optional fields are left off the wire body when
//! unset, leaving existing CRM values untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Sync bookkeeping the relay writes alongside entity data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Pending,
    Error,
}

/// Whether a payment came from a one-time intent or a recurring invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    InitialPayment,
    RecurringPayment,
}

/// CRM account row, keyed by the upstream customer id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub customer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_payment_method: Option<String>,
}

/// CRM subscription row, keyed by the upstream subscription id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub subscription_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_period_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_period_end: Option<DateTime<Utc>>,
    /// Amount in currency units, converted from upstream minor units
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_status: Option<SyncStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_error: Option<String>,
}

/// CRM payment row, keyed by the upstream payment id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub payment_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    /// Amount in currency units, converted from upstream minor units
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_method_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_type: Option<TransactionType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// One write against the CRM, tagged by entity.
///
/// The `entity` tag keeps operations self-describing when they round-trip
/// through queue payloads and batch windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum UpsertOperation {
    Account(AccountRecord),
    Subscription(SubscriptionRecord),
    Payment(PaymentRecord),
}

impl UpsertOperation {
    /// REST collection the record belongs to.
    pub fn entity(&self) -> &'static str {
        match self {
            UpsertOperation::Account(_) => "accounts",
            UpsertOperation::Subscription(_) => "subscriptions",
            UpsertOperation::Payment(_) => "payments",
        }
    }

    /// Upstream identifier the upsert is keyed by.
    pub fn external_id(&self) -> &str {
        match self {
            UpsertOperation::Account(record) => &record.customer_id,
            UpsertOperation::Subscription(record) => &record.subscription_id,
            UpsertOperation::Payment(record) => &record.payment_id,
        }
    }

    /// Wire body for the upsert: the bare record, without the entity tag.
    pub fn payload(&self) -> Result<serde_json::Value> {
        let value = match self {
            UpsertOperation::Account(record) => serde_json::to_value(record),
            UpsertOperation::Subscription(record) => serde_json::to_value(record),
            UpsertOperation::Payment(record) => serde_json::to_value(record),
        };
        value.map_err(|e| Error::Internal {
            operation: format!("serialize {} record: {e}", self.entity()),
        })
    }
}
