//! Shared fixtures for handler and API tests.

use std::sync::Arc;

use axum_test::TestServer;
use chrono::Utc;
use conveyor::InMemoryStorage;

use crate::{
    batch::BatchAccumulator,
    config::Config,
    limits::RateLimiter,
    routing::EventRouter,
    signature, AppState,
};

/// A router under test with handles to its shared state.
pub struct TestApp {
    pub server: TestServer,
    pub storage: Arc<InMemoryStorage>,
    pub batches: Arc<BatchAccumulator>,
    pub limiter: Arc<RateLimiter>,
    pub secret: String,
}

impl TestApp {
    /// Sign a body the way the upstream would, using this app's secret.
    pub fn sign(&self, body: &str) -> String {
        signature::signature_header(Utc::now().timestamp(), body, &self.secret)
            .expect("test secret should be decodable")
    }
}

/// Default config with a fresh signing secret and metrics off.
///
/// Metrics stay off because the Prometheus recorder is a process-wide
/// singleton and tests share one process.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.enable_metrics = false;
    config.upstream.signing_secret = Some(signature::generate_secret());
    config
}

/// Build the router against in-memory state, without background workers.
///
/// Workers are deliberately not spawned so tests can assert on queue depths
/// before anything claims the events.
pub async fn spawn_app(config: Config) -> TestApp {
    let secret = config
        .upstream
        .signing_secret
        .clone()
        .unwrap_or_default();

    let router = EventRouter::with_overrides(&config.routing.overrides)
        .expect("test routing overrides should be valid");
    let storage = Arc::new(InMemoryStorage::new());
    let limiter = Arc::new(RateLimiter::new(&config.limits.tiers));
    let batches = Arc::new(BatchAccumulator::new(config.batch.clone()));

    let state = AppState::builder()
        .config(config)
        .storage(storage.clone())
        .router(Arc::new(router))
        .limiter(limiter.clone())
        .batches(batches.clone())
        .build();

    let server = TestServer::new(crate::build_router(&state)).expect("failed to start test server");

    TestApp {
        server,
        storage,
        batches,
        limiter,
        secret,
    }
}
