//! # crmbridge: Webhook-to-CRM Integration Relay
//!
//! `crmbridge` receives webhook event deliveries from an upstream billing
//! provider, verifies and queues them, and applies them to a downstream CRM
//! as rate-limited record upserts. It decouples the upstream's delivery
//! schedule from the CRM's strict call budget so that bursts of events never
//! translate into rejected API calls or lost data.
//!
//! ## Overview
//!
//! Billing providers deliver webhooks in bursts and expect a fast 200; CRMs
//! meter every API call and throttle aggressively. Wiring one directly to the
//! other loses events whenever the two disagree about pace. `crmbridge` sits
//! between them as a relay: deliveries are acknowledged as soon as they are
//! verified and durably queued, and asynchronous workers drain the queue at
//! whatever rate the CRM's budget allows.
//!
//! The relay is built for integrations where correctness matters more than
//! latency: every accepted event is applied exactly once (redeliveries are
//! shed by an idempotency mark), rate limits are enforced before calls are
//! attempted rather than discovered as rejections, and events that cannot be
//! applied after retries are parked in a dead-letter sink with their full
//! attempt history instead of being dropped.
//!
//! ### What It Does
//!
//! At its core, `crmbridge` receives a signed event envelope on
//! `/webhooks/events`, verifies the HMAC signature against the shared
//! secret, routes the event by kind to one of two queue lanes, and returns a
//! 200. Immediate-lane events (payments, subscriptions) become individual
//! CRM upserts through a tiered rate limiter; deferred-lane events (customer
//! profile updates) accumulate into time- and size-bounded windows that are
//! submitted as bulk jobs. OAuth tokens for the CRM are cached and refreshed
//! ahead of expiry, failed calls are retried with exponential backoff, and
//! operational state is visible over `/status` and `/dead-letters`.
//!
//! ## Architecture
//!
//! The application is built on [Axum](https://github.com/tokio-rs/axum) for
//! the HTTP layer and the `conveyor` crate for the typestate event queue and
//! its worker pools. All queue state is held in process memory; the upstream
//! provider's redelivery schedule acts as the recovery mechanism after a
//! restart.
//!
//! ### Request Flow
//!
//! #### Ingress (`/webhooks/events`)
//!
//! A delivery first passes through the [`api::handlers::webhooks::SignedEnvelope`]
//! extractor, which verifies the signature header against the raw body and
//! rejects stale timestamps before anything is parsed. The envelope is then
//! validated, classified onto a lane by the [`routing::EventRouter`], and
//! enqueued. The 200 response acknowledges receipt only; application happens
//! in the background. A 503 tells the upstream to redeliver later.
//!
//! #### Processing (background)
//!
//! One worker pool per lane claims queued events and runs them through the
//! [`pipeline::DeliveryPipeline`]. The immediate lane checks the dedupe
//! store, draws an admission from the [`limits::RateLimiter`], and upserts
//! through the [`crm::DeliveryClient`] with retry and backoff. The deferred
//! lane appends to an accumulation window in the [`batch::BatchAccumulator`];
//! the [`pipeline::BatchFlusher`] sweeps ready windows and submits them as
//! CRM bulk jobs. Events that exhaust their redeliveries are parked and
//! listed on `/dead-letters`.
//!
//! ### Core Components
//!
//! The **API layer** ([`api`]) exposes the ingress endpoint, liveness and
//! readiness probes, and the operations surfaces (`/status`,
//! `/dead-letters`), documented via OpenAPI and served at `/docs`.
//!
//! The **processing layer** ([`pipeline`], [`handlers`]) maps verified event
//! payloads to CRM record upserts and decides each event's outcome:
//! applied, accumulated, duplicate, ignored, released for redelivery, or
//! failed.
//!
//! The **CRM layer** ([`crm`], [`credentials`]) owns the wire protocol:
//! OAuth client-credentials tokens with proactive refresh, single-record
//! upserts with retry, and the bulk job lifecycle (create, upload, close,
//! poll, fetch results).
//!
//! **Background services** run alongside the HTTP server: a worker pool per
//! queue lane and the batch flusher. All of them shut down gracefully when
//! the serve future resolves.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use crmbridge::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Parse CLI arguments and load configuration
//!     let args = crmbridge::config::Args::parse();
//!     let config = Config::load(&args)?;
//!
//!     // Initialize structured logging
//!     crmbridge::telemetry::init_telemetry(&config.logging)?;
//!
//!     // Create and start the application
//!     let app = Application::new(config)?;
//!
//!     // Run with graceful shutdown on Ctrl+C
//!     app.serve(async {
//!         tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!     }).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.

pub mod api;
pub mod batch;
pub mod config;
pub mod credentials;
pub mod crm;
pub mod dedupe;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod limits;
pub mod pipeline;
pub mod routing;
pub mod signature;
pub mod telemetry;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use axum_prometheus::PrometheusMetricLayer;
use bon::Builder;
use tokio::net::TcpListener;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{debug, info, Level};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

use conveyor::{InMemoryStorage, Lane, ReqwestHttpClient, WorkerPool};

use crate::{
    batch::BatchAccumulator,
    credentials::CredentialCache,
    crm::{BulkClient, DeliveryClient},
    dedupe::IdempotencyStore,
    limits::RateLimiter,
    pipeline::{BatchFlusher, DeliveryPipeline},
    routing::EventRouter,
};

pub use config::Config;

/// Application state shared across all request handlers.
///
/// This struct contains the shared resources the API handlers need: the
/// event queue, the routing table, and handles to the limiter and batch
/// accumulator for the status surfaces.
///
/// # Example
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .storage(storage)
///     .router(router)
///     .limiter(limiter)
///     .batches(batches)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub storage: Arc<InMemoryStorage>,
    pub router: Arc<EventRouter>,
    pub limiter: Arc<RateLimiter>,
    pub batches: Arc<BatchAccumulator>,
}

/// Build the application router with all endpoints and middleware.
///
/// This function constructs the complete Axum router with:
/// - The webhook ingress endpoint
/// - Liveness and readiness probes
/// - Operations surfaces (status, dead letters)
/// - OpenAPI documentation served at `/docs`
/// - Optional Prometheus metrics at `/metrics`
/// - CORS and tracing middleware
pub fn build_router(state: &AppState) -> Router {
    let enable_metrics = state.config.enable_metrics;

    let mut router = Router::new()
        .route("/webhooks/events", post(api::handlers::webhooks::receive_event))
        .route("/health", get(api::handlers::health::health))
        .route("/health/ready", get(api::handlers::health::readiness))
        .route("/status", get(api::handlers::status::get_status))
        .route("/dead-letters", get(api::handlers::status::list_dead_letters))
        .with_state(state.clone())
        .merge(Scalar::with_url("/docs", api::ApiDoc::openapi()))
        .layer(CorsLayer::permissive());

    if enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        router = router
            .route("/metrics", get(|| async move { metric_handle.render() }))
            .layer(prometheus_layer);
    }

    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}

/// Container for background services and their lifecycle management.
///
/// This struct encapsulates the tasks that run alongside the HTTP server:
/// one worker pool per queue lane and the batch flusher.
///
/// # Graceful Shutdown
///
/// The [`shutdown`](BackgroundServices::shutdown) method cancels the shared
/// token and waits for every task to finish. When dropped, the `drop_guard`
/// cancels the token automatically so tasks never outlive their owner.
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown_token: tokio_util::sync::CancellationToken,
    // Pub so callers can disarm the automatic cancel-on-drop
    pub drop_guard: Option<tokio_util::sync::DropGuard>,
}

impl BackgroundServices {
    /// Gracefully shutdown all background tasks
    pub async fn shutdown(self) {
        // Signal all background tasks to shutdown
        self.shutdown_token.cancel();

        // Wait for all background tasks to complete
        for handle in self.background_tasks {
            let _ = handle.await;
        }
    }
}

/// Spawn the worker pools and the batch flusher.
fn setup_background_services(
    config: &Config,
    storage: Arc<InMemoryStorage>,
    limiter: Arc<RateLimiter>,
    batches: Arc<BatchAccumulator>,
    router: Arc<EventRouter>,
    shutdown_token: tokio_util::sync::CancellationToken,
) -> BackgroundServices {
    let drop_guard = shutdown_token.clone().drop_guard();
    // Track all background task handles for graceful shutdown
    let mut background_tasks = Vec::new();

    let http = ReqwestHttpClient::new();
    let credentials = Arc::new(CredentialCache::new(&config.crm, http.clone()));
    let delivery = DeliveryClient::new(
        &config.crm,
        config.retry.clone(),
        http.clone(),
        credentials.clone(),
    );
    let bulk = BulkClient::new(&config.crm, &config.limits, http, credentials, limiter.clone());
    let dedupe = IdempotencyStore::new(config.dedupe.ttl, config.dedupe.max_entries);

    let pipeline = Arc::new(
        DeliveryPipeline::builder()
            .router(router)
            .dedupe(dedupe)
            .limiter(limiter)
            .batches(batches.clone())
            .delivery(delivery)
            .max_wait(config.limits.max_wait)
            .build(),
    );

    // One worker pool per lane, sharing the pipeline
    for (lane, lane_config) in [
        (Lane::Immediate, &config.queue.immediate),
        (Lane::Deferred, &config.queue.deferred),
    ] {
        let pool = Arc::new(WorkerPool::new(
            storage.clone(),
            pipeline.clone(),
            lane_config.to_worker_config(lane),
        ));
        let worker_shutdown = shutdown_token.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = pool.run(worker_shutdown).await {
                tracing::error!(%lane, "Worker pool exited with error: {}", e);
            }
        });
        background_tasks.push(handle);
    }

    let flusher = BatchFlusher::new(storage, batches, bulk, config.batch.sweep_interval);
    let flusher_shutdown = shutdown_token.clone();
    let handle = tokio::spawn(async move {
        flusher.run(flusher_shutdown).await;
    });
    background_tasks.push(handle);

    BackgroundServices {
        background_tasks,
        shutdown_token,
        drop_guard: Some(drop_guard),
    }
}

/// Main application struct that owns all resources and lifecycle.
///
/// # Lifecycle
///
/// 1. **Create**: [`Application::new`] builds the routing table, the queue,
///    and the shared state, and spawns the background services
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and starts
///    handling requests
/// 3. **Shutdown**: when the shutdown future resolves, the server stops
///    accepting requests and background services drain gracefully
pub struct Application {
    router: Router,
    config: Config,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create a new application instance with all resources initialized.
    ///
    /// Spawns the background worker pools, so this must be called from
    /// within a Tokio runtime.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting integration relay with configuration: {:#?}", config);

        let event_router = EventRouter::with_overrides(&config.routing.overrides)
            .map_err(|e| anyhow::anyhow!("Invalid routing override: {}", e))?;
        let event_router = Arc::new(event_router);
        let storage = Arc::new(InMemoryStorage::new());
        let limiter = Arc::new(RateLimiter::new(&config.limits.tiers));
        let batches = Arc::new(BatchAccumulator::new(config.batch.clone()));

        // Create a shutdown token for coordinating graceful shutdown of background tasks
        let shutdown_token = tokio_util::sync::CancellationToken::new();
        let bg_services = setup_background_services(
            &config,
            storage.clone(),
            limiter.clone(),
            batches.clone(),
            event_router.clone(),
            shutdown_token,
        );

        let state = AppState::builder()
            .config(config.clone())
            .storage(storage)
            .router(event_router)
            .limiter(limiter)
            .batches(batches)
            .build();

        let router = build_router(&state);

        Ok(Self {
            router,
            config,
            bg_services,
        })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> (axum_test::TestServer, BackgroundServices) {
        let server = axum_test::TestServer::new(self.router).expect("Failed to create test server");
        (server, self.bg_services)
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "Integration relay listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        // Run the server with graceful shutdown
        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;

        // Shutdown background services and wait for tasks to complete
        self.bg_services.shutdown().await;

        info!("Integration relay stopped");

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;
    use url::Url;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::signature;
    use crate::test_support::test_config;
    use crate::Application;

    fn wired_config(crm: &MockServer) -> crate::Config {
        let mut config = test_config();
        config.crm.base_url = Url::parse(&format!("{}/api", crm.uri())).unwrap();
        config.crm.auth_url = Url::parse(&format!("{}/oauth/token", crm.uri())).unwrap();
        config.queue.immediate.claim_interval = Duration::from_millis(20);
        config.queue.deferred.claim_interval = Duration::from_millis(20);
        config
    }

    async fn mount_token_endpoint(crm: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok_test",
                "expires_in": 3600
            })))
            .mount(crm)
            .await;
    }

    /// Integration test: a signed delivery is accepted, claimed by the
    /// immediate-lane workers, and applied to the CRM as an upsert.
    #[test_log::test(tokio::test)]
    async fn accepted_event_reaches_the_crm() {
        let crm = MockServer::start().await;
        mount_token_endpoint(&crm).await;
        Mock::given(method("PATCH"))
            .and(path("/api/objects/payments/pi_42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "pay_1"})))
            .expect(1)
            .mount(&crm)
            .await;

        let config = wired_config(&crm);
        let secret = config.upstream.signing_secret.clone().unwrap();
        let app = Application::new(config).expect("application should start");
        let (server, bg_services) = app.into_test_server();

        let body = json!({
            "id": "evt_int_1",
            "type": "payment_intent.succeeded",
            "created": Utc::now().timestamp(),
            "data": {"object": {
                "id": "pi_42",
                "amount": 2500,
                "currency": "usd",
                "status": "succeeded",
            }}
        })
        .to_string();
        let header = signature::signature_header(Utc::now().timestamp(), &body, &secret).unwrap();

        server
            .post("/webhooks/events")
            .add_header(signature::SIGNATURE_HEADER, header)
            .text(body)
            .await
            .assert_status_ok();

        // Poll the status surface until the workers apply the event.
        let mut succeeded = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let status: serde_json::Value = server.get("/status").await.json();
            if status["lanes"][0]["succeeded"] == 1 {
                succeeded = true;
                break;
            }
        }
        assert!(succeeded, "the event should have been applied to the CRM");

        bg_services.shutdown().await;
    }

    /// Integration test: a deferred delivery joins an accumulation window
    /// and reaches the CRM as a bulk job once the window fills.
    #[test_log::test(tokio::test)]
    async fn deferred_event_is_flushed_as_a_bulk_job() {
        let crm = MockServer::start().await;
        mount_token_endpoint(&crm).await;
        Mock::given(method("POST"))
            .and(path("/api/bulk/jobs"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": "job_1", "state": "open"})),
            )
            .expect(1)
            .mount(&crm)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/bulk/jobs/job_1/records"))
            .and(body_string_contains("cus_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&crm)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/api/bulk/jobs/job_1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "job_1", "state": "closed"})),
            )
            .mount(&crm)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/bulk/jobs/job_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"state": "complete"})))
            .mount(&crm)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/bulk/jobs/job_1/results"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"external_id": "cus_1", "success": true}
            ])))
            .mount(&crm)
            .await;

        let mut config = wired_config(&crm);
        config.batch.size_threshold = 1;
        config.batch.sweep_interval = Duration::from_millis(20);
        config.crm.bulk_poll_interval = Duration::from_millis(20);
        let secret = config.upstream.signing_secret.clone().unwrap();
        let app = Application::new(config).expect("application should start");
        let (server, bg_services) = app.into_test_server();

        let body = json!({
            "id": "evt_int_2",
            "type": "customer.updated",
            "created": Utc::now().timestamp(),
            "data": {"object": {"id": "cus_1", "email": "a@example.com"}}
        })
        .to_string();
        let header = signature::signature_header(Utc::now().timestamp(), &body, &secret).unwrap();

        server
            .post("/webhooks/events")
            .add_header(signature::SIGNATURE_HEADER, header)
            .text(body)
            .await
            .assert_status_ok();

        // Poll until the event is accumulated and the window is flushed.
        let mut flushed = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let status: serde_json::Value = server.get("/status").await.json();
            let deferred_done = status["lanes"][1]["succeeded"] == 1;
            let window_gone = status["windows"].as_array().is_some_and(Vec::is_empty);
            if deferred_done && window_gone && !crm.received_requests().await.unwrap().is_empty() {
                let uploaded = crm
                    .received_requests()
                    .await
                    .unwrap()
                    .iter()
                    .any(|r| r.url.path() == "/api/bulk/jobs/job_1/records");
                if uploaded {
                    flushed = true;
                    break;
                }
            }
        }
        assert!(flushed, "the window should have been submitted as a bulk job");

        // No dead letters: the bulk job reported full success.
        let dead: serde_json::Value = server.get("/dead-letters").await.json();
        assert_eq!(dead.as_array().unwrap().len(), 0);

        bg_services.shutdown().await;
    }
}
