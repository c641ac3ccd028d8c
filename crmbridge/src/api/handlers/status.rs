//! Operational visibility handlers.

use axum::{
    extract::{Query, State},
    Json,
};
use conveyor::{Lane, Storage};

use crate::{
    api::models::{DeadLetterEntry, DeadLettersQuery, LaneStatus, StatusResponse, WindowStatus},
    errors::Result,
    AppState,
};

/// Report queue depths, limiter usage, and open accumulation windows.
#[utoipa::path(
    get,
    path = "/status",
    tag = "operations",
    summary = "Operational snapshot",
    description = "Reports per-lane event counts, rate-limit tier usage, and open accumulation windows",
    responses(
        (status = 200, description = "Current snapshot", body = StatusResponse),
        (status = 503, description = "Queue unavailable")
    )
)]
pub async fn get_status(State(state): State<AppState>) -> Result<Json<StatusResponse>> {
    let mut lanes = Vec::with_capacity(2);
    for lane in [Lane::Immediate, Lane::Deferred] {
        let depth = state.storage.depth(lane).await?;
        lanes.push(LaneStatus::new(lane, depth));
    }

    Ok(Json(StatusResponse {
        lanes,
        limits: state.limiter.usage(),
        windows: state
            .batches
            .snapshot()
            .into_iter()
            .map(WindowStatus::from)
            .collect(),
    }))
}

/// List events parked after exhausting their redeliveries.
#[utoipa::path(
    get,
    path = "/dead-letters",
    tag = "operations",
    summary = "List dead letters",
    description = "Returns parked events newest first, with their full attempt history",
    params(DeadLettersQuery),
    responses(
        (status = 200, description = "Parked events", body = [DeadLetterEntry]),
        (status = 503, description = "Queue unavailable")
    )
)]
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DeadLettersQuery>,
) -> Result<Json<Vec<DeadLetterEntry>>> {
    let limit = query.limit.unwrap_or(50).min(500);

    let parked = state.storage.failed_events(limit).await?;

    Ok(Json(parked.into_iter().map(DeadLetterEntry::from).collect()))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use conveyor::{AttemptRecord, Event, EventData, Lane, Storage};
    use serde_json::json;

    use crate::batch::BatchEntry;
    use crate::crm::{AccountRecord, UpsertOperation};
    use crate::routing::CUSTOMER_UPDATES;
    use crate::signature;
    use crate::test_support::{spawn_app, test_config};

    #[test_log::test(tokio::test)]
    async fn status_reports_lanes_limits_and_windows() {
        let app = spawn_app(test_config()).await;

        let body = json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "created": Utc::now().timestamp(),
            "data": {"object": {"id": "pi_1"}}
        })
        .to_string();
        app.server
            .post("/webhooks/events")
            .add_header(signature::SIGNATURE_HEADER, app.sign(&body))
            .text(body)
            .await
            .assert_status_ok();

        // One admission so tier usage is visible.
        assert!(app.limiter.acquire().is_allowed());

        // One open window so the windows section is visible.
        app.batches.add(
            CUSTOMER_UPDATES,
            BatchEntry {
                event_id: "evt_w1".to_string(),
                kind: "customer.updated".to_string(),
                occurred_at: Utc::now(),
                operation: UpsertOperation::Account(AccountRecord {
                    customer_id: "cus_9".to_string(),
                    ..AccountRecord::default()
                }),
            },
        );

        let response = app.server.get("/status").await;
        response.assert_status_ok();

        let status: serde_json::Value = response.json();
        assert_eq!(status["lanes"][0]["lane"], "immediate");
        assert_eq!(status["lanes"][0]["queued"], 1);
        assert_eq!(status["lanes"][1]["lane"], "deferred");
        assert_eq!(status["lanes"][1]["queued"], 0);

        assert_eq!(status["limits"][0]["name"], "per_second");
        assert_eq!(status["limits"][0]["used"], 1);
        assert_eq!(status["limits"][0]["limit"], 10);

        let windows = status["windows"].as_array().unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0]["category"], CUSTOMER_UPDATES);
        assert_eq!(windows[0]["record_count"], 1);
        assert_eq!(windows[0]["ready"], false);
    }

    #[test_log::test(tokio::test)]
    async fn dead_letters_lists_parked_events_newest_first() {
        let app = spawn_app(test_config()).await;

        for (event_id, error) in [("evt_old", "first failure"), ("evt_new", "second failure")] {
            let data = EventData::new(
                event_id,
                "payment_intent.succeeded",
                Lane::Immediate,
                Utc::now(),
                json!({}),
            );
            let attempts = vec![AttemptRecord {
                attempt: 1,
                outcome: "HTTP 500".to_string(),
                at: Utc::now(),
            }];
            app.storage
                .park(Event::parked(data, error, attempts))
                .await
                .unwrap();
        }

        let response = app.server.get("/dead-letters").await;
        response.assert_status_ok();

        let entries: serde_json::Value = response.json();
        let entries = entries.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["event_id"], "evt_new");
        assert_eq!(entries[1]["event_id"], "evt_old");
        assert_eq!(entries[0]["attempts"][0]["outcome"], "HTTP 500");

        let limited = app
            .server
            .get("/dead-letters")
            .add_query_param("limit", "1")
            .await;
        limited.assert_status_ok();
        let limited: serde_json::Value = limited.json();
        assert_eq!(limited.as_array().unwrap().len(), 1);
        assert_eq!(limited[0]["event_id"], "evt_new");
    }
}
