//! Bulk ingest jobs for accumulated windows.
//!
//! A flushed window becomes one bulk job per entity: create the job, upload
//! the records as a JSON array, close it, poll until the job reaches a
//! terminal state, then fetch per-record results. Every call passes through
//! the shared rate limiter, so bulk traffic and single deliveries draw on
//! the same CRM budget.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use conveyor::{HttpClient, HttpRequest, HttpResponse, default_should_retry};

use crate::config::{CrmConfig, LimitsConfig};
use crate::credentials::CredentialCache;
use crate::errors::{Error, Result};
use crate::limits::{Admission, RateLimiter};

/// Job info returned by the create and close calls.
#[derive(Debug, Deserialize)]
struct JobInfo {
    id: String,
}

/// Poll response for a pending job.
#[derive(Debug, Deserialize)]
struct JobStatus {
    state: String,
    #[serde(default)]
    records_failed: Option<usize>,
}

/// Result line for one uploaded record.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordResult {
    pub external_id: String,
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// Terminal summary of one bulk job.
#[derive(Debug)]
pub struct BulkOutcome {
    pub job_id: String,
    pub total: usize,
    pub failed: usize,
    pub results: Vec<RecordResult>,
}

/// Client for the CRM bulk ingest surface.
pub struct BulkClient<C: HttpClient> {
    http: C,
    credentials: Arc<CredentialCache<C>>,
    limiter: Arc<RateLimiter>,
    base_url: Url,
    api_timeout: Duration,
    max_wait: Duration,
    poll_interval: Duration,
    poll_attempts: u32,
}

impl<C: HttpClient> BulkClient<C> {
    pub fn new(
        crm: &CrmConfig,
        limits: &LimitsConfig,
        http: C,
        credentials: Arc<CredentialCache<C>>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            http,
            credentials,
            limiter,
            base_url: crm.base_url.clone(),
            api_timeout: crm.api_timeout,
            max_wait: limits.max_wait,
            poll_interval: crm.bulk_poll_interval,
            poll_attempts: crm.bulk_poll_attempts,
        }
    }

    /// Run one window's records for `entity` through a bulk ingest job.
    #[tracing::instrument(skip(self, records), fields(record_count = records.len()))]
    pub async fn submit(&self, entity: &str, records: Vec<serde_json::Value>) -> Result<BulkOutcome> {
        let total = records.len();

        let create_body = serde_json::json!({"entity": entity, "operation": "upsert"}).to_string();
        let created = self
            .call("POST", &self.job_url(""), Some(&create_body))
            .await?;
        let job: JobInfo = parse(&created, "bulk job")?;
        tracing::info!(job_id = %job.id, total, "Bulk job created");

        let upload_body = serde_json::Value::Array(records).to_string();
        self.call(
            "PUT",
            &self.job_url(&format!("{}/records", job.id)),
            Some(&upload_body),
        )
        .await?;

        let close_body = serde_json::json!({"state": "closed"}).to_string();
        self.call("PATCH", &self.job_url(&job.id), Some(&close_body))
            .await?;

        self.wait_until_terminal(&job.id).await?;

        let results_response = self
            .call("GET", &self.job_url(&format!("{}/results", job.id)), None)
            .await?;
        let results: Vec<RecordResult> = parse(&results_response, "bulk job results")?;
        let failed = results.iter().filter(|r| !r.success).count();

        if failed > 0 {
            tracing::warn!(job_id = %job.id, total, failed, "Bulk job completed with record failures");
        } else {
            tracing::info!(job_id = %job.id, total, "Bulk job completed");
        }

        Ok(BulkOutcome {
            job_id: job.id,
            total,
            failed,
            results,
        })
    }

    /// Poll the job until it completes or fails, bounded by the configured
    /// round count.
    async fn wait_until_terminal(&self, job_id: &str) -> Result<()> {
        let mut state = String::new();

        for round in 0..self.poll_attempts {
            if round > 0 {
                tokio::time::sleep(self.poll_interval).await;
            }

            let response = self.call("GET", &self.job_url(job_id), None).await?;
            let status: JobStatus = parse(&response, "bulk job status")?;
            state = status.state;

            match state.as_str() {
                "complete" => return Ok(()),
                "failed" => {
                    return Err(Error::PermanentFailure {
                        message: format!(
                            "bulk job {job_id} failed ({} records rejected)",
                            status.records_failed.unwrap_or(0)
                        ),
                        attempts: Vec::new(),
                    });
                }
                _ => tracing::debug!(job_id, %state, round, "Bulk job still pending"),
            }
        }

        Err(Error::TransientFailure {
            message: format!(
                "bulk job {job_id} still \"{state}\" after {} polls",
                self.poll_attempts
            ),
        })
    }

    /// One authenticated, rate-limited call. A 401 invalidates the shared
    /// token and the call is re-issued once with a fresh one.
    async fn call(&self, method: &str, url: &str, body: Option<&str>) -> Result<HttpResponse> {
        match self.limiter.acquire_within(self.max_wait).await {
            Admission::Allowed => {}
            Admission::Denied { tier, retry_after } => {
                return Err(Error::RateLimitExceeded { tier, retry_after });
            }
        }

        let token = self.credentials.token().await?;
        let response = self.execute(method, url, body, &token).await?;

        if response.status != 401 {
            return check(response);
        }

        tracing::warn!(url, "CRM rejected the access token, refreshing and re-issuing");
        self.credentials.invalidate().await;
        let token = self.credentials.token().await?;
        let response = self.execute(method, url, body, &token).await?;
        check(response)
    }

    async fn execute(
        &self,
        method: &str,
        url: &str,
        body: Option<&str>,
        token: &str,
    ) -> Result<HttpResponse> {
        let mut request = HttpRequest::new(method, url).bearer(token);
        if let Some(body) = body {
            request = request.header("Content-Type", "application/json").body(body);
        }

        self.http
            .execute(&request, self.api_timeout.as_millis() as u64)
            .await
            .map_err(|e| Error::TransientFailure {
                message: format!("CRM unreachable: {e}"),
            })
    }

    fn job_url(&self, suffix: &str) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        if suffix.is_empty() {
            format!("{base}/bulk/jobs")
        } else {
            format!("{base}/bulk/jobs/{suffix}")
        }
    }
}

fn check(response: HttpResponse) -> Result<HttpResponse> {
    if response.is_success() {
        Ok(response)
    } else if default_should_retry(&response) {
        Err(Error::TransientFailure {
            message: format!("CRM returned HTTP {}", response.status),
        })
    } else {
        Err(Error::PermanentFailure {
            message: format!("CRM returned HTTP {}", response.status),
            attempts: Vec::new(),
        })
    }
}

fn parse<T: serde::de::DeserializeOwned>(response: &HttpResponse, what: &str) -> Result<T> {
    serde_json::from_str(&response.body).map_err(|e| Error::TransientFailure {
        message: format!("unreadable {what} response: {e}"),
    })
}
