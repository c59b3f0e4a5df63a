use axum::{
    extract::State,
    http::StatusCode,
    Json,
};
use serde::Serialize;
use tracing::{error, warn};

use crate::backfill::{BackfillArgs, BackfillEngine, BackfillError, BackfillSummary};
use crate::problem::ProblemResponse;
use crate::retention::{run_prune, PruneSummary};
use crate::router::AppState;

/// `POST /admin/backfill`: replays one channel and returns its summary.
pub async fn backfill_channel(
    State(state): State<AppState>,
    Json(args): Json<BackfillArgs>,
) -> Result<Json<BackfillSummary>, ProblemResponse> {
    let engine = engine_for(&state)?;
    match engine.run(&args).await {
        Ok(summary) => Ok(Json(summary)),
        Err(err) => Err(backfill_problem(&args.channel_id, err)),
    }
}

/// Aggregate result of a multi-channel sweep. Per-channel failures do not
/// abort the remaining channels.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillSweep {
    pub channels: usize,
    pub failures: Vec<ChannelFailure>,
    pub total_scanned_messages: u64,
    pub total_created_events: u64,
    pub total_created_requests: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelFailure {
    pub channel_id: String,
    pub error: String,
}

/// `POST /admin/backfill/all`: replays every configured channel.
pub async fn backfill_all(
    State(state): State<AppState>,
) -> Result<Json<BackfillSweep>, ProblemResponse> {
    let channel_ids: Vec<String> = state.channel_ids().to_vec();
    if channel_ids.is_empty() {
        return Err(ProblemResponse::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "missing_configuration",
            "CHANNEL_IDS is not configured",
        ));
    }
    let engine = engine_for(&state)?;

    let mut sweep = BackfillSweep {
        channels: channel_ids.len(),
        failures: Vec::new(),
        total_scanned_messages: 0,
        total_created_events: 0,
        total_created_requests: 0,
    };

    for channel_id in channel_ids {
        let args = BackfillArgs {
            channel_id: channel_id.clone(),
            oldest_ts: None,
            max_messages: None,
        };
        match engine.run(&args).await {
            Ok(summary) => {
                sweep.total_scanned_messages += summary.scanned_messages;
                sweep.total_created_events += summary.created_events;
                sweep.total_created_requests += summary.created_requests;
            }
            Err(err) => {
                warn!(stage = "backfill", channel = %channel_id, error = %err, "channel backfill failed");
                sweep.failures.push(ChannelFailure {
                    channel_id,
                    error: err.to_string(),
                });
            }
        }
    }

    Ok(Json(sweep))
}

/// `POST /admin/prune`: runs one retention sweep and returns its summary.
pub async fn prune(State(state): State<AppState>) -> Result<Json<PruneSummary>, ProblemResponse> {
    run_prune(state.storage(), state.now())
        .await
        .map(Json)
        .map_err(|err| {
            error!(stage = "retention", error = %err, "admin prune failed");
            ProblemResponse::internal("retention sweep failed")
        })
}

fn engine_for(state: &AppState) -> Result<BackfillEngine, ProblemResponse> {
    let Some(slack) = state.slack() else {
        return Err(ProblemResponse::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "missing_configuration",
            "missing SLACK_BOT_TOKEN",
        ));
    };
    Ok(BackfillEngine::new(
        state.storage().clone(),
        slack.clone(),
        state.clock(),
    ))
}

fn backfill_problem(channel_id: &str, err: BackfillError) -> ProblemResponse {
    match err {
        BackfillError::History(inner) => {
            warn!(stage = "backfill", channel = %channel_id, error = %inner, "history fetch failed");
            ProblemResponse::new(
                StatusCode::BAD_GATEWAY,
                "slack_history_failed",
                inner.to_string(),
            )
        }
        BackfillError::Storage(inner) => {
            error!(stage = "backfill", channel = %channel_id, error = %inner, "storage failure during backfill");
            ProblemResponse::internal("storage failure during backfill")
        }
    }
}
