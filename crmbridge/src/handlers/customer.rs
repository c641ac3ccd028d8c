//! Account upserts from customer events.

use serde_json::Value;

use crate::crm::{AccountRecord, UpsertOperation};
use crate::errors::Result;

/// `customer.updated`: refresh the account's contact details.
pub fn updated(object: &Value) -> Result<Vec<UpsertOperation>> {
    let record = AccountRecord {
        customer_id: super::required_str(object, "id")?,
        email: super::opt_str(object, "email"),
        name: super::opt_str(object, "name"),
        phone: super::opt_str(object, "phone"),
        default_payment_method: object
            .pointer("/invoice_settings/default_payment_method")
            .and_then(Value::as_str)
            .map(str::to_string),
    };

    Ok(vec![UpsertOperation::Account(record)])
}
