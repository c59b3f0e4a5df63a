use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use stamphog_slack::SlackClient;
use stamphog_storage::Database;

use crate::{admin, api, telemetry, webhook};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    slack: Option<SlackClient>,
    signing_secret: Option<Arc<[u8]>>,
    channel_ids: Arc<Vec<String>>,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        slack: Option<SlackClient>,
        signing_secret: Option<Arc<[u8]>>,
        channel_ids: Vec<String>,
    ) -> Self {
        Self {
            metrics,
            storage,
            slack,
            signing_secret,
            channel_ids: Arc::new(channel_ids),
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn slack(&self) -> Option<&SlackClient> {
        self.slack.as_ref()
    }

    pub fn signing_secret(&self) -> Option<Arc<[u8]>> {
        self.signing_secret.clone()
    }

    pub fn channel_ids(&self) -> &[String] {
        &self.channel_ids
    }

    pub fn clock(&self) -> Arc<dyn Fn() -> DateTime<Utc> + Send + Sync> {
        self.clock.clone()
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/slack/events", post(webhook::handle))
        .route("/api/leaderboard", get(api::leaderboard))
        .route("/api/recent", get(api::recent_events))
        .route("/admin/backfill", post(admin::backfill_channel))
        .route("/admin/backfill/all", post(admin::backfill_all))
        .route("/admin/prune", post(admin::prune))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(body))
        .unwrap()
}
