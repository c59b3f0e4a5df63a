use axum::{
    extract::{Query, State},
    Json,
};
use metrics::counter;
use serde::Deserialize;
use tracing::error;

use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::views::{self, LeaderboardView, RecentItem};

#[derive(Debug, Deserialize)]
pub struct LeaderboardQuery {
    #[serde(default, rename = "windowDays")]
    window_days: Option<u32>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    #[serde(default)]
    limit: Option<usize>,
}

/// `GET /api/leaderboard`
pub async fn leaderboard(
    State(state): State<AppState>,
    Query(query): Query<LeaderboardQuery>,
) -> Result<Json<LeaderboardView>, ProblemResponse> {
    let view = views::build_leaderboard(
        state.storage(),
        state.now(),
        query.window_days,
        query.limit,
    )
    .await
    .map_err(|err| {
        counter!("api_requests_total", "endpoint" => "leaderboard", "result" => "error")
            .increment(1);
        error!(stage = "api", error = %err, "failed to build leaderboard");
        ProblemResponse::internal("failed to build leaderboard")
    })?;

    counter!("api_requests_total", "endpoint" => "leaderboard", "result" => "ok").increment(1);
    Ok(Json(view))
}

/// `GET /api/recent`
pub async fn recent_events(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Vec<RecentItem>>, ProblemResponse> {
    let items = views::build_recent_events(state.storage(), query.limit)
        .await
        .map_err(|err| {
            counter!("api_requests_total", "endpoint" => "recent", "result" => "error")
                .increment(1);
            error!(stage = "api", error = %err, "failed to build recent events");
            ProblemResponse::internal("failed to build recent events")
        })?;

    counter!("api_requests_total", "endpoint" => "recent", "result" => "ok").increment(1);
    Ok(Json(items))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use chrono::DateTime;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::router::app_router;
    use crate::telemetry;
    use stamphog_storage::{Database, NewStampEvent};

    async fn setup_state() -> AppState {
        let metrics = telemetry::init_metrics().expect("metrics init");
        let database = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        database.run_migrations().await.expect("migrations");

        let now = DateTime::from_timestamp(1_712_400_000, 0).expect("fixed time");
        AppState::new(metrics, database, None, None, Vec::new())
            .with_clock(Arc::new(move || now))
    }

    async fn seed_stamp(state: &AppState) {
        state
            .storage()
            .stamp_events()
            .ingest(NewStampEvent {
                giver_id: "U-B",
                requester_id: "U-A",
                giver_display_name: Some("Bob"),
                giver_image_url: None,
                requester_display_name: Some("Alice"),
                requester_image_url: None,
                reaction: "white_check_mark",
                source: None,
                occurred_at: Some(DateTime::from_timestamp(1_712_399_000, 0).expect("ts")),
                ingested_at: state.now(),
                channel_id: "C-1",
                pr_url: Some("https://github.com/o/r/pull/1"),
                dedupe_key: "reaction:C-1:1.000:white_check_mark:U-B",
            })
            .await
            .expect("seed stamp");
    }

    #[tokio::test]
    async fn leaderboard_endpoint_returns_aggregates() {
        let state = setup_state().await;
        seed_stamp(&state).await;

        let app = app_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/leaderboard?windowDays=7&limit=5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        let json: Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(json["windowDays"], 7);
        assert_eq!(json["totals"]["stamps"], 1);
        assert_eq!(json["givers"][0]["actorId"], "U-B");
        assert_eq!(json["givers"][0]["displayName"], "Bob");
        assert_eq!(json["requesters"][0]["stampsRequested"], 1);
    }

    #[tokio::test]
    async fn recent_endpoint_returns_tagged_items() {
        let state = setup_state().await;
        seed_stamp(&state).await;

        let app = app_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/recent?limit=10")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        let json: Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(json[0]["type"], "stamp");
        assert_eq!(json[0]["giverDisplayName"], "Bob");
    }
}
