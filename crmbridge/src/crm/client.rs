//! Single-record delivery to the CRM REST API.
//!
//! One rate-limiter admission covers one logical upsert: the transient
//! retries inside [`DeliveryClient::upsert`] ride on the admission that let
//! the call through. A 401 invalidates the shared token and the call is
//! re-issued once with a fresh one before failing; every wire attempt lands
//! in the returned history.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use url::Url;

use conveyor::{AttemptRecord, HttpClient, HttpRequest, RetryPolicy, default_should_retry};

use crate::config::CrmConfig;
use crate::credentials::CredentialCache;
use crate::crm::records::UpsertOperation;
use crate::errors::{Error, Result};

/// How one wire attempt ended.
enum Attempt {
    Delivered(u16),
    Unauthorized,
    Transient(String),
    Rejected(u16),
}

/// Rate-limited upsert delivery with retries and auth recovery.
pub struct DeliveryClient<C: HttpClient> {
    http: C,
    credentials: Arc<CredentialCache<C>>,
    base_url: Url,
    api_timeout: Duration,
    retry: RetryPolicy,
}

impl<C: HttpClient> DeliveryClient<C> {
    pub fn new(
        config: &CrmConfig,
        retry: RetryPolicy,
        http: C,
        credentials: Arc<CredentialCache<C>>,
    ) -> Self {
        Self {
            http,
            credentials,
            base_url: config.base_url.clone(),
            api_timeout: config.api_timeout,
            retry,
        }
    }

    /// Deliver one upsert. The caller must already hold a limiter admission.
    ///
    /// Returns the full attempt history on success. Transient failures are
    /// retried on the configured backoff until the budget is spent; CRM
    /// rejections and exhausted budgets fail with the history attached.
    #[tracing::instrument(skip(self, operation), fields(entity = operation.entity(), external_id = operation.external_id()))]
    pub async fn upsert(&self, operation: &UpsertOperation) -> Result<Vec<AttemptRecord>> {
        let url = format!(
            "{}/objects/{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            operation.entity(),
            operation.external_id(),
        );
        let body = operation.payload()?.to_string();

        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut attempt: u32 = 1;
        let mut auth_retried = false;

        loop {
            match self.try_once(&url, &body).await {
                Ok(Attempt::Delivered(status)) => {
                    attempts.push(record(attempt, format!("HTTP {status}")));
                    tracing::debug!(status, wire_attempts = attempts.len(), "Upsert delivered");
                    return Ok(attempts);
                }
                Ok(Attempt::Unauthorized) => {
                    attempts.push(record(attempt, "HTTP 401"));
                    if auth_retried {
                        return Err(Error::PermanentFailure {
                            message: format!(
                                "authentication retry exhausted for {} {}",
                                operation.entity(),
                                operation.external_id(),
                            ),
                            attempts,
                        });
                    }
                    tracing::warn!("CRM rejected the access token, refreshing and re-issuing");
                    self.credentials.invalidate().await;
                    // Re-issued under the same attempt number: the auth retry
                    // does not consume the transient budget.
                    auth_retried = true;
                }
                Ok(Attempt::Transient(reason)) => {
                    attempts.push(record(attempt, reason.clone()));
                    if self.retry.is_exhausted(attempt) {
                        return Err(Error::PermanentFailure {
                            message: format!(
                                "retry budget exhausted for {} {} (last: {reason})",
                                operation.entity(),
                                operation.external_id(),
                            ),
                            attempts,
                        });
                    }
                    let backoff = self.retry.backoff_after(attempt);
                    tracing::warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        %reason,
                        "Transient CRM failure, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Ok(Attempt::Rejected(status)) => {
                    attempts.push(record(attempt, format!("HTTP {status}")));
                    return Err(Error::PermanentFailure {
                        message: format!(
                            "CRM rejected {} {} with HTTP {status}",
                            operation.entity(),
                            operation.external_id(),
                        ),
                        attempts,
                    });
                }
                // Token-level auth failure; keep any wire history collected
                Err(e) => {
                    return if attempts.is_empty() {
                        Err(e)
                    } else {
                        Err(Error::PermanentFailure {
                            message: e.to_string(),
                            attempts,
                        })
                    };
                }
            }
        }
    }

    async fn try_once(&self, url: &str, body: &str) -> Result<Attempt> {
        let token = match self.credentials.token().await {
            Ok(token) => token,
            Err(Error::TransientFailure { message }) => {
                return Ok(Attempt::Transient(format!("token refresh failed: {message}")));
            }
            Err(e) => return Err(e),
        };

        let request = HttpRequest::new("PATCH", url)
            .bearer(&token)
            .header("Content-Type", "application/json")
            .body(body);

        let response = match self
            .http
            .execute(&request, self.api_timeout.as_millis() as u64)
            .await
        {
            Ok(response) => response,
            Err(e) => return Ok(Attempt::Transient(format!("network error: {e}"))),
        };

        if response.is_success() {
            Ok(Attempt::Delivered(response.status))
        } else if response.status == 401 {
            Ok(Attempt::Unauthorized)
        } else if default_should_retry(&response) {
            Ok(Attempt::Transient(format!("HTTP {}", response.status)))
        } else {
            Ok(Attempt::Rejected(response.status))
        }
    }
}

fn record(attempt: u32, outcome: impl Into<String>) -> AttemptRecord {
    AttemptRecord {
        attempt,
        outcome: outcome.into(),
        at: Utc::now(),
    }
}
