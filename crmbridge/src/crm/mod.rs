//! Downstream CRM integration.
//!
//! This module owns everything that talks to the CRM:
//!
//! - [`records`]: entity record models and the tagged upsert operation
//! - [`client`]: single-record delivery with retries and auth recovery
//! - [`bulk`]: bulk ingest jobs for accumulated windows

pub mod bulk;
pub mod client;
pub mod records;

pub use bulk::{BulkClient, BulkOutcome, RecordResult};
pub use client::DeliveryClient;
pub use records::{
    AccountRecord, PaymentRecord, SubscriptionRecord, SyncStatus, TransactionType, UpsertOperation,
};
