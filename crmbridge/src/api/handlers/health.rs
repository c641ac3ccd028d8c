//! Liveness and readiness probe handlers.

use axum::{extract::State, Json};
use conveyor::{Lane, Storage};

use crate::{
    api::models::HealthResponse,
    errors::{Error, Result},
    AppState,
};

/// Liveness probe.
#[utoipa::path(
    get,
    path = "/health",
    tag = "operations",
    summary = "Liveness probe",
    description = "Returns 200 whenever the process is serving requests",
    responses(
        (status = 200, description = "Service is alive", body = HealthResponse)
    )
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Readiness probe.
///
/// Ready means the queue answers on both lanes; a 503 tells the upstream to
/// hold deliveries and redeliver later.
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "operations",
    summary = "Readiness probe",
    description = "Returns 200 when the event queue is reachable on both lanes",
    responses(
        (status = 200, description = "Service is ready to accept deliveries", body = HealthResponse),
        (status = 503, description = "Queue unavailable")
    )
)]
pub async fn readiness(State(state): State<AppState>) -> Result<Json<HealthResponse>> {
    for lane in [Lane::Immediate, Lane::Deferred] {
        state
            .storage
            .depth(lane)
            .await
            .map_err(|e| Error::QueueUnavailable {
                message: e.to_string(),
            })?;
    }

    Ok(Json(HealthResponse {
        status: "ready".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use crate::api::models::HealthResponse;
    use crate::test_support::{spawn_app, test_config};

    #[test_log::test(tokio::test)]
    async fn health_always_reports_ok() {
        let app = spawn_app(test_config()).await;

        let response = app.server.get("/health").await;

        response.assert_status_ok();
        let body: HealthResponse = response.json();
        assert_eq!(body.status, "ok");
    }

    #[test_log::test(tokio::test)]
    async fn readiness_reports_ready_with_a_live_queue() {
        let app = spawn_app(test_config()).await;

        let response = app.server.get("/health/ready").await;

        response.assert_status_ok();
        let body: HealthResponse = response.json();
        assert_eq!(body.status, "ready");
    }
}
