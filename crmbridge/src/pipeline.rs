//! Event processing for both queue lanes.
//!
//! [`DeliveryPipeline`] is the processor the worker pools run claimed events
//! through. Immediate-lane events become rate-limited CRM upserts on the
//! spot; deferred-lane events join an accumulation window and resolve as
//! accumulated, handing ownership to the [`BatchFlusher`].
//!
//! Ordering of the gates on the immediate lane matters. The limiter is asked
//! before the dedupe mark is taken, so a denied event is released with
//! nothing recorded and the redelivery applies as if the claim never
//! happened. Once the mark is taken the event can no longer be released;
//! every later failure is terminal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conveyor::{Disposition, Event, EventData, HttpClient, Lane, Outcome, Processor, Storage};

use crate::batch::{BatchAccumulator, BatchEntry};
use crate::crm::{BulkClient, DeliveryClient, UpsertOperation};
use crate::dedupe::IdempotencyStore;
use crate::errors::{Error, Result};
use crate::events::EventKind;
use crate::handlers;
use crate::limits::{Admission, RateLimiter};
use crate::routing::{EventRouter, Route};

/// Processor shared by the immediate and deferred worker pools.
#[derive(Builder)]
pub struct DeliveryPipeline<C: HttpClient> {
    router: Arc<EventRouter>,
    dedupe: IdempotencyStore,
    limiter: Arc<RateLimiter>,
    batches: Arc<BatchAccumulator>,
    delivery: DeliveryClient<C>,
    /// Budget for admissions beyond an event's first upsert
    max_wait: Duration,
}

#[async_trait]
impl<C: HttpClient> Processor for DeliveryPipeline<C> {
    #[tracing::instrument(skip(self, event), fields(event_id = %event.event_id, kind = %event.kind, lane = %event.lane))]
    async fn process(&self, event: &EventData) -> Outcome {
        let outcome = match self.apply(event).await {
            Ok(outcome) => outcome,
            Err(Error::PermanentFailure { message, attempts }) => Outcome::Failed {
                error: message,
                attempts,
            },
            Err(error) => Outcome::Failed {
                error: error.to_string(),
                attempts: Vec::new(),
            },
        };

        let label = match &outcome {
            Outcome::Succeeded { disposition, .. } => match disposition {
                Disposition::Applied => "applied",
                Disposition::Accumulated { .. } => "accumulated",
                Disposition::Duplicate => "duplicate",
                Disposition::Ignored => "ignored",
            },
            Outcome::Failed { .. } => "failed",
            Outcome::Release { .. } => "released",
        };
        counter!("crmbridge_deliveries_total", "outcome" => label).increment(1);

        outcome
    }
}

impl<C: HttpClient> DeliveryPipeline<C> {
    async fn apply(&self, event: &EventData) -> Result<Outcome> {
        let Ok(kind) = event.kind.parse::<EventKind>() else {
            tracing::debug!("Event kind outside the catalog, acknowledging and skipping");
            return Ok(resolved(Disposition::Ignored));
        };

        match self.router.route(kind) {
            Route::Unsupported => {
                tracing::debug!("Event kind unrouted, acknowledging and skipping");
                Ok(resolved(Disposition::Ignored))
            }
            Route::Immediate => self.deliver(kind, event).await,
            Route::Deferred { category } => self.accumulate(kind, event, &category).await,
        }
    }

    /// Immediate lane: one rate-limited upsert per operation, right now.
    async fn deliver(&self, kind: EventKind, event: &EventData) -> Result<Outcome> {
        let operations = handlers::operations_for(kind, event)?;
        if operations.is_empty() {
            tracing::debug!("Event carries nothing actionable, acknowledging");
            return Ok(resolved(Disposition::Ignored));
        }

        // Redeliveries are common upstream; shed them before drawing on the
        // CRM budget. The atomic mark below still decides concurrent races.
        if self.dedupe.has_processed(&event.event_id).await {
            tracing::debug!("Event already processed, acknowledging duplicate");
            return Ok(resolved(Disposition::Duplicate));
        }

        match self.limiter.acquire() {
            Admission::Allowed => {}
            Admission::Denied { tier, retry_after } => {
                counter!("crmbridge_rate_limit_denials_total", "tier" => tier.clone()).increment(1);
                // Nothing written and no mark taken: the redelivery applies
                // as if this claim never happened.
                return Ok(Outcome::Release {
                    delay_ms: retry_after.as_millis() as u64,
                    reason: format!("rate limited ({tier})"),
                });
            }
        }

        // The first write is about to happen; take the mark so a concurrent
        // delivery of the same upstream event cannot also apply.
        if !self.dedupe.mark_processed(&event.event_id).await {
            tracing::debug!("Lost the dedupe race, acknowledging duplicate");
            return Ok(resolved(Disposition::Duplicate));
        }

        let mut attempts = Vec::new();
        for (index, operation) in operations.iter().enumerate() {
            // Follow-up upserts need their own admission, but the event can
            // no longer be released: the mark is already taken.
            if index > 0 {
                match self.limiter.acquire_within(self.max_wait).await {
                    Admission::Allowed => {}
                    Admission::Denied { tier, .. } => {
                        counter!("crmbridge_rate_limit_denials_total", "tier" => tier.clone())
                            .increment(1);
                        return Err(Error::PermanentFailure {
                            message: format!(
                                "rate limit ({tier}) starved upsert {} of {} after the event was marked",
                                index + 1,
                                operations.len(),
                            ),
                            attempts,
                        });
                    }
                }
            }

            match self.delivery.upsert(operation).await {
                Ok(records) => attempts.extend(records),
                Err(Error::PermanentFailure {
                    message,
                    attempts: wire,
                }) => {
                    attempts.extend(wire);
                    return Err(Error::PermanentFailure { message, attempts });
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Outcome::Succeeded {
            disposition: Disposition::Applied,
            attempts,
        })
    }

    /// Deferred lane: append to the category's window and resolve.
    async fn accumulate(
        &self,
        kind: EventKind,
        event: &EventData,
        category: &str,
    ) -> Result<Outcome> {
        let mut operations = handlers::operations_for(kind, event)?.into_iter();
        let Some(first) = operations.next() else {
            tracing::debug!("Event carries nothing actionable, acknowledging");
            return Ok(resolved(Disposition::Ignored));
        };

        // The window append is this lane's first write; the mark keeps a
        // redelivered event from joining a second window.
        if !self.dedupe.mark_processed(&event.event_id).await {
            tracing::debug!("Event already processed, acknowledging duplicate");
            return Ok(resolved(Disposition::Duplicate));
        }

        let mut stats = self.batches.add(category, entry(event, first));
        for operation in operations {
            stats = self.batches.add(category, entry(event, operation));
        }

        tracing::debug!(
            window_id = %stats.window_id,
            record_count = stats.record_count,
            ready = stats.ready,
            "Event joined an accumulation window"
        );

        Ok(Outcome::Succeeded {
            disposition: Disposition::Accumulated {
                window_id: stats.window_id,
            },
            attempts: Vec::new(),
        })
    }
}

fn resolved(disposition: Disposition) -> Outcome {
    Outcome::Succeeded {
        disposition,
        attempts: Vec::new(),
    }
}

fn entry(event: &EventData, operation: UpsertOperation) -> BatchEntry {
    BatchEntry {
        event_id: event.event_id.clone(),
        kind: event.kind.clone(),
        occurred_at: event.occurred_at,
        operation,
    }
}

/// Sweeps accumulation windows and submits the ready ones as bulk jobs.
///
/// Window entries belong to events that already resolved as accumulated, so
/// a failed submission cannot flow back into the queue record; rejected
/// entries are parked as fresh dead-letter records instead.
pub struct BatchFlusher<S, C: HttpClient> {
    storage: Arc<S>,
    batches: Arc<BatchAccumulator>,
    bulk: BulkClient<C>,
    sweep_interval: Duration,
}

impl<S: Storage, C: HttpClient> BatchFlusher<S, C> {
    pub fn new(
        storage: Arc<S>,
        batches: Arc<BatchAccumulator>,
        bulk: BulkClient<C>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            storage,
            batches,
            bulk,
            sweep_interval,
        }
    }

    /// Run the sweep loop until `shutdown` is cancelled, then flush whatever
    /// is still open so accepted events are not stranded.
    #[tracing::instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(sweep_interval = ?self.sweep_interval, "Batch flusher starting");

        let mut interval = tokio::time::interval(self.sweep_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => self.sweep().await,
                _ = shutdown.cancelled() => break,
            }
        }

        let open = self.batches.drain_all();
        if !open.is_empty() {
            tracing::info!(windows = open.len(), "Flushing open windows before shutdown");
            for (category, window_id, entries) in open {
                self.flush(&category, window_id, entries).await;
            }
        }
        tracing::info!("Batch flusher stopped");
    }

    /// Submit every window that is ready or stale.
    async fn sweep(&self) {
        for candidate in self.batches.flushable() {
            // The fence is lost when a concurrent sweep already took the
            // window; there is nothing left to do then.
            let Some(entries) = self.batches.submit(&candidate.category, candidate.window_id)
            else {
                continue;
            };

            if candidate.stale {
                tracing::warn!(
                    category = %candidate.category,
                    window_id = %candidate.window_id,
                    record_count = entries.len(),
                    "Force-flushing stale window"
                );
            }
            self.flush(&candidate.category, candidate.window_id, entries).await;
        }
    }

    #[tracing::instrument(skip(self, entries), fields(category = %category, window_id = %window_id, record_count = entries.len()))]
    async fn flush(&self, category: &str, window_id: Uuid, entries: Vec<BatchEntry>) {
        // One bulk job per entity. A window usually holds one kind of record,
        // but routing overrides can mix entities in a category.
        let mut by_entity: HashMap<&'static str, Vec<BatchEntry>> = HashMap::new();
        for entry in entries {
            by_entity.entry(entry.operation.entity()).or_default().push(entry);
        }

        for (entity, group) in by_entity {
            self.flush_entity(entity, group).await;
        }
    }

    async fn flush_entity(&self, entity: &str, group: Vec<BatchEntry>) {
        let mut records = Vec::with_capacity(group.len());
        let mut uploaded = Vec::with_capacity(group.len());
        for entry in group {
            match entry.operation.payload() {
                Ok(record) => {
                    records.push(record);
                    uploaded.push(entry);
                }
                Err(e) => {
                    self.park(entry, format!("record serialization failed: {e}")).await;
                }
            }
        }
        if uploaded.is_empty() {
            return;
        }

        match self.bulk.submit(entity, records).await {
            Ok(outcome) if outcome.failed == 0 => {
                counter!("crmbridge_batch_flushes_total", "outcome" => "delivered").increment(1);
            }
            Ok(outcome) => {
                counter!("crmbridge_batch_flushes_total", "outcome" => "partial").increment(1);

                let mut rejected: HashMap<String, String> = HashMap::new();
                for result in outcome.results {
                    if !result.success {
                        rejected.insert(
                            result.external_id,
                            result.message.unwrap_or_else(|| "no reason given".to_string()),
                        );
                    }
                }
                for entry in uploaded {
                    if let Some(message) = rejected.get(entry.operation.external_id()) {
                        let error = format!("bulk record rejected: {message}");
                        self.park(entry, error).await;
                    }
                }
            }
            Err(e) => {
                counter!("crmbridge_batch_flushes_total", "outcome" => "parked").increment(1);
                tracing::error!(entity, error = %e, "Bulk submission failed, parking the window");
                let error = e.to_string();
                for entry in uploaded {
                    self.park(entry, error.clone()).await;
                }
            }
        }
    }

    /// Insert a dead-letter record for an entry whose queue event already
    /// resolved as accumulated.
    async fn park(&self, entry: BatchEntry, error: String) {
        tracing::warn!(
            event_id = %entry.event_id,
            kind = %entry.kind,
            external_id = entry.operation.external_id(),
            %error,
            "Parking batch entry in the dead-letter sink"
        );
        counter!("crmbridge_dead_letters_total").increment(1);

        let payload = serde_json::to_value(&entry.operation).unwrap_or(serde_json::Value::Null);
        let data = EventData::new(entry.event_id, entry.kind, Lane::Deferred, entry.occurred_at, payload);
        if let Err(e) = self.storage.park(Event::parked(data, error, Vec::new())).await {
            tracing::error!(error = %e, "Failed to insert dead-letter record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatchConfig, CrmConfig, LimitsConfig, RateLimitTier};
    use crate::credentials::CredentialCache;
    use crate::crm::AccountRecord;
    use crate::routing::CUSTOMER_UPDATES;
    use chrono::Utc;
    use conveyor::{HttpResponse, InMemoryStorage, MockHttpClient, RetryPolicy};

    const TOKEN_KEY: &str = "POST http://localhost:9090/oauth/token";
    const PAYMENT_KEY: &str = "PATCH http://localhost:9090/api/objects/payments/pi_1";
    const CREATE_KEY: &str = "POST http://localhost:9090/api/bulk/jobs";
    const UPLOAD_KEY: &str = "PUT http://localhost:9090/api/bulk/jobs/job_1/records";
    const CLOSE_KEY: &str = "PATCH http://localhost:9090/api/bulk/jobs/job_1";
    const STATUS_KEY: &str = "GET http://localhost:9090/api/bulk/jobs/job_1";
    const RESULTS_KEY: &str = "GET http://localhost:9090/api/bulk/jobs/job_1/results";

    fn token() -> conveyor::Result<HttpResponse> {
        Ok(HttpResponse {
            status: 200,
            body: r#"{"access_token":"tok","expires_in":3600}"#.to_string(),
        })
    }

    fn status(code: u16) -> conveyor::Result<HttpResponse> {
        Ok(HttpResponse {
            status: code,
            body: String::new(),
        })
    }

    fn ok(body: &str) -> conveyor::Result<HttpResponse> {
        Ok(HttpResponse {
            status: 200,
            body: body.to_string(),
        })
    }

    struct Fixture {
        mock: MockHttpClient,
        dedupe: IdempotencyStore,
        limiter: Arc<RateLimiter>,
        batches: Arc<BatchAccumulator>,
        pipeline: DeliveryPipeline<MockHttpClient>,
    }

    fn fixture_with_tiers(tiers: Vec<RateLimitTier>) -> Fixture {
        let mock = MockHttpClient::new();
        let crm = CrmConfig::default();
        let credentials = Arc::new(CredentialCache::new(&crm, mock.clone()));
        let delivery = DeliveryClient::new(&crm, RetryPolicy::default(), mock.clone(), credentials);

        let dedupe = IdempotencyStore::new(Duration::from_secs(3600), 10_000);
        let limiter = Arc::new(RateLimiter::new(&tiers));
        let batches = Arc::new(BatchAccumulator::new(BatchConfig::default()));

        let pipeline = DeliveryPipeline::builder()
            .router(Arc::new(EventRouter::default()))
            .dedupe(dedupe.clone())
            .limiter(limiter.clone())
            .batches(batches.clone())
            .delivery(delivery)
            .max_wait(Duration::from_secs(5))
            .build();

        Fixture {
            mock,
            dedupe,
            limiter,
            batches,
            pipeline,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_tiers(vec![RateLimitTier {
            name: "per_second".to_string(),
            limit: 10,
            window: Duration::from_secs(1),
        }])
    }

    fn payment_event(event_id: &str) -> EventData {
        EventData::new(
            event_id,
            "payment_intent.succeeded",
            Lane::Immediate,
            Utc::now(),
            serde_json::json!({
                "id": event_id,
                "type": "payment_intent.succeeded",
                "data": {"object": {
                    "id": "pi_1",
                    "amount": 2500,
                    "currency": "usd",
                    "status": "succeeded",
                }}
            }),
        )
    }

    fn customer_event(event_id: &str) -> EventData {
        EventData::new(
            event_id,
            "customer.updated",
            Lane::Deferred,
            Utc::now(),
            serde_json::json!({
                "id": event_id,
                "type": "customer.updated",
                "data": {"object": {"id": "cus_1", "email": "a@example.com"}}
            }),
        )
    }

    #[tokio::test]
    async fn immediate_event_is_applied_with_history() {
        let f = fixture();
        f.mock.add_response(TOKEN_KEY, token());
        f.mock.add_response(PAYMENT_KEY, status(200));

        let outcome = f.pipeline.process(&payment_event("evt_1")).await;

        match outcome {
            Outcome::Succeeded {
                disposition: Disposition::Applied,
                attempts,
            } => {
                assert_eq!(attempts.len(), 1);
                assert_eq!(attempts[0].outcome, "HTTP 200");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(f.dedupe.has_processed("evt_1").await);
    }

    #[tokio::test]
    async fn redelivered_event_resolves_as_duplicate() {
        let f = fixture();
        f.mock.add_response(TOKEN_KEY, token());
        f.mock.add_response(PAYMENT_KEY, status(200));

        let first = f.pipeline.process(&payment_event("evt_1")).await;
        assert!(matches!(
            first,
            Outcome::Succeeded {
                disposition: Disposition::Applied,
                ..
            }
        ));
        f.mock.clear_calls();

        // Same upstream event redelivered under a fresh queue id
        let second = f.pipeline.process(&payment_event("evt_1")).await;
        assert!(matches!(
            second,
            Outcome::Succeeded {
                disposition: Disposition::Duplicate,
                ..
            }
        ));
        assert_eq!(f.mock.call_count(), 0, "a duplicate must not touch the CRM");
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_event_is_released_without_marking() {
        let f = fixture_with_tiers(vec![RateLimitTier {
            name: "per_minute".to_string(),
            limit: 1,
            window: Duration::from_secs(60),
        }]);
        assert!(f.limiter.acquire().is_allowed());

        let outcome = f.pipeline.process(&payment_event("evt_1")).await;

        match outcome {
            Outcome::Release { delay_ms, reason } => {
                assert_eq!(delay_ms, 61_000);
                assert!(reason.contains("per_minute"), "reason: {reason}");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        // No mark taken: the redelivery must still apply
        assert!(!f.dedupe.has_processed("evt_1").await);
        assert_eq!(f.mock.call_count(), 0);
    }

    #[tokio::test]
    async fn unsupported_kind_is_acknowledged_and_skipped() {
        let f = fixture();
        let event = EventData::new(
            "evt_9",
            "order.created",
            Lane::Immediate,
            Utc::now(),
            serde_json::json!({"data": {"object": {"id": "ord_1"}}}),
        );

        let outcome = f.pipeline.process(&event).await;

        assert!(matches!(
            outcome,
            Outcome::Succeeded {
                disposition: Disposition::Ignored,
                ..
            }
        ));
        assert_eq!(f.mock.call_count(), 0);
        assert!(!f.dedupe.has_processed("evt_9").await);
    }

    #[tokio::test]
    async fn malformed_payload_fails_without_wire_attempts() {
        let f = fixture();
        let event = EventData::new(
            "evt_bad",
            "payment_intent.succeeded",
            Lane::Immediate,
            Utc::now(),
            serde_json::json!({"data": {"object": {"amount": 2500}}}),
        );

        let outcome = f.pipeline.process(&event).await;

        match outcome {
            Outcome::Failed { error, attempts } => {
                assert!(error.contains("missing or empty"), "error: {error}");
                assert!(attempts.is_empty());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(f.mock.call_count(), 0);
        // A corrected redelivery must not be shed as a duplicate
        assert!(!f.dedupe.has_processed("evt_bad").await);
    }

    #[tokio::test]
    async fn crm_rejection_surfaces_attempt_history() {
        let f = fixture();
        f.mock.add_response(TOKEN_KEY, token());
        f.mock.add_response(PAYMENT_KEY, status(422));

        let outcome = f.pipeline.process(&payment_event("evt_1")).await;

        match outcome {
            Outcome::Failed { error, attempts } => {
                assert!(error.contains("HTTP 422"), "error: {error}");
                assert_eq!(attempts.len(), 1);
                assert_eq!(attempts[0].outcome, "HTTP 422");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        // Terminal failure: the redelivery is a duplicate, not a retry
        assert!(f.dedupe.has_processed("evt_1").await);
    }

    #[tokio::test]
    async fn deferred_event_joins_a_window() {
        let f = fixture();

        let outcome = f.pipeline.process(&customer_event("evt_c1")).await;

        match outcome {
            Outcome::Succeeded {
                disposition: Disposition::Accumulated { window_id },
                ..
            } => {
                let snapshot = f.batches.snapshot();
                assert_eq!(snapshot.len(), 1);
                assert_eq!(snapshot[0].window_id, window_id);
                assert_eq!(snapshot[0].category, CUSTOMER_UPDATES);
                assert_eq!(snapshot[0].record_count, 1);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(f.mock.call_count(), 0, "accumulation makes no CRM calls");
        assert!(f.dedupe.has_processed("evt_c1").await);
    }

    #[tokio::test]
    async fn deferred_redelivery_does_not_join_twice() {
        let f = fixture();

        f.pipeline.process(&customer_event("evt_c1")).await;
        let second = f.pipeline.process(&customer_event("evt_c1")).await;

        assert!(matches!(
            second,
            Outcome::Succeeded {
                disposition: Disposition::Duplicate,
                ..
            }
        ));
        assert_eq!(f.batches.snapshot()[0].record_count, 1);
    }

    fn account_entry(event_id: &str, customer: &str) -> BatchEntry {
        BatchEntry {
            event_id: event_id.to_string(),
            kind: "customer.updated".to_string(),
            occurred_at: Utc::now(),
            operation: UpsertOperation::Account(AccountRecord {
                customer_id: customer.to_string(),
                email: Some(format!("{customer}@example.com")),
                ..AccountRecord::default()
            }),
        }
    }

    fn flusher_fixture(
        mock: &MockHttpClient,
        batches: Arc<BatchAccumulator>,
    ) -> (Arc<InMemoryStorage>, BatchFlusher<InMemoryStorage, MockHttpClient>) {
        let storage = Arc::new(InMemoryStorage::new());
        let crm = CrmConfig {
            bulk_poll_interval: Duration::from_millis(100),
            bulk_poll_attempts: 3,
            ..CrmConfig::default()
        };
        let limits = LimitsConfig::default();
        let credentials = Arc::new(CredentialCache::new(&crm, mock.clone()));
        let limiter = Arc::new(RateLimiter::new(&limits.tiers));
        let bulk = BulkClient::new(&crm, &limits, mock.clone(), credentials, limiter);
        let flusher = BatchFlusher::new(storage.clone(), batches, bulk, Duration::from_millis(50));
        (storage, flusher)
    }

    fn script_lifecycle(mock: &MockHttpClient, results: &str) {
        mock.add_response(TOKEN_KEY, token());
        mock.add_response(CREATE_KEY, ok(r#"{"id":"job_1","state":"open"}"#));
        mock.add_response(UPLOAD_KEY, ok("{}"));
        mock.add_response(CLOSE_KEY, ok(r#"{"id":"job_1","state":"closed"}"#));
        mock.add_response(STATUS_KEY, ok(r#"{"state":"complete"}"#));
        mock.add_response(RESULTS_KEY, ok(results));
    }

    #[tokio::test(start_paused = true)]
    async fn ready_window_is_flushed_as_one_bulk_job() {
        let mock = MockHttpClient::new();
        script_lifecycle(
            &mock,
            r#"[
                {"external_id":"cus_1","success":true},
                {"external_id":"cus_2","success":true}
            ]"#,
        );

        let batches = Arc::new(BatchAccumulator::new(BatchConfig {
            size_threshold: 2,
            ..BatchConfig::default()
        }));
        batches.add(CUSTOMER_UPDATES, account_entry("evt_1", "cus_1"));
        batches.add(CUSTOMER_UPDATES, account_entry("evt_2", "cus_2"));

        let (storage, flusher) = flusher_fixture(&mock, batches.clone());
        flusher.sweep().await;

        assert!(batches.snapshot().is_empty(), "the window should be gone");
        let upload = mock
            .get_calls()
            .into_iter()
            .find(|call| call.method == "PUT")
            .unwrap();
        let records: Vec<serde_json::Value> = serde_json::from_str(&upload.body).unwrap();
        assert_eq!(records.len(), 2);
        assert!(storage.failed_events(10).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_records_are_parked_individually() {
        let mock = MockHttpClient::new();
        script_lifecycle(
            &mock,
            r#"[
                {"external_id":"cus_1","success":true},
                {"external_id":"cus_2","success":false,"message":"required field missing"}
            ]"#,
        );

        let batches = Arc::new(BatchAccumulator::new(BatchConfig {
            size_threshold: 2,
            ..BatchConfig::default()
        }));
        batches.add(CUSTOMER_UPDATES, account_entry("evt_1", "cus_1"));
        batches.add(CUSTOMER_UPDATES, account_entry("evt_2", "cus_2"));

        let (storage, flusher) = flusher_fixture(&mock, batches);
        flusher.sweep().await;

        let parked = storage.failed_events(10).await.unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].data.event_id, "evt_2");
        assert!(parked[0].state.error.contains("required field missing"));
        // The parked payload is the tagged operation, replayable by hand
        assert_eq!(parked[0].data.payload["entity"], "account");
        assert_eq!(parked[0].data.payload["customer_id"], "cus_2");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_submission_parks_the_whole_window() {
        let mock = MockHttpClient::new();
        mock.add_response(TOKEN_KEY, token());
        mock.add_response(CREATE_KEY, status(503));

        let batches = Arc::new(BatchAccumulator::new(BatchConfig {
            size_threshold: 2,
            ..BatchConfig::default()
        }));
        batches.add(CUSTOMER_UPDATES, account_entry("evt_1", "cus_1"));
        batches.add(CUSTOMER_UPDATES, account_entry("evt_2", "cus_2"));

        let (storage, flusher) = flusher_fixture(&mock, batches);
        flusher.sweep().await;

        let parked = storage.failed_events(10).await.unwrap();
        assert_eq!(parked.len(), 2);
        assert!(parked[0].state.error.contains("HTTP 503"));
    }

    #[tokio::test(start_paused = true)]
    async fn unready_windows_are_left_alone() {
        let mock = MockHttpClient::new();
        let batches = Arc::new(BatchAccumulator::new(BatchConfig::default()));
        batches.add(CUSTOMER_UPDATES, account_entry("evt_1", "cus_1"));

        let (_storage, flusher) = flusher_fixture(&mock, batches.clone());
        flusher.sweep().await;

        assert_eq!(mock.call_count(), 0);
        assert_eq!(batches.snapshot().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_open_windows() {
        let mock = MockHttpClient::new();
        script_lifecycle(&mock, r#"[{"external_id":"cus_1","success":true}]"#);

        // Below every threshold: only the shutdown drain can flush this
        let batches = Arc::new(BatchAccumulator::new(BatchConfig::default()));
        batches.add(CUSTOMER_UPDATES, account_entry("evt_1", "cus_1"));

        let (storage, flusher) = flusher_fixture(&mock, batches.clone());
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(flusher.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(mock.call_count_for(CREATE_KEY), 1);
        assert!(batches.snapshot().is_empty());
        assert!(storage.failed_events(10).await.unwrap().is_empty());
    }
}
