use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::Response,
};
use metrics::{counter, histogram};
use serde_json::json;
use tracing::{error, info, warn};

use stamphog_core::event::{classify, EventEnvelope, MessageEvent, ReactionEvent, SlackEvent};
use stamphog_core::keys::{reaction_dedupe_key, request_dedupe_key};
use stamphog_core::rules::{normalize_emoji, tracked_emoji_set};
use stamphog_core::time::parse_slack_timestamp;
use stamphog_storage::{NewRequest, NewStampEvent, RemoveStamp};

use crate::router::AppState;
use crate::signature::{self, HEADER_SIGNATURE, HEADER_TIMESTAMP};

/// Entry point for `POST /slack/events`.
pub async fn handle(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let start = Instant::now();
    let (label, response) = process(&state, &headers, &body).await;
    counter!("slack_ingress_total", "type" => label).increment(1);
    histogram!("webhook_ack_latency_seconds", "type" => label)
        .record(start.elapsed().as_secs_f64());
    response
}

async fn process(
    state: &AppState,
    headers: &HeaderMap,
    body: &Bytes,
) -> (&'static str, Response) {
    // parse first: the handshake must be answered before any signature check
    let envelope: EventEnvelope = match serde_json::from_slice(body) {
        Ok(envelope) => envelope,
        Err(_) => return ("invalid", plain(StatusCode::BAD_REQUEST, "invalid json body")),
    };

    if envelope.is_url_verification() {
        if let Some(challenge) = envelope.challenge {
            return ("challenge", challenge_response(challenge));
        }
    }

    let Some(secret) = state.signing_secret() else {
        error!(stage = "ingress", "SLACK_SIGNING_SECRET is not configured");
        return (
            "invalid",
            plain(
                StatusCode::INTERNAL_SERVER_ERROR,
                "missing SLACK_SIGNING_SECRET",
            ),
        );
    };
    let timestamp = header_value(headers, HEADER_TIMESTAMP);
    let provided = header_value(headers, HEADER_SIGNATURE);
    if let Err(err) = signature::verify(&secret, timestamp, provided, body, state.now()) {
        counter!("slack_invalid_signature_total").increment(1);
        warn!(stage = "ingress", error = %err, "webhook signature rejected");
        return ("invalid", plain_owned(StatusCode::UNAUTHORIZED, err.to_string()));
    }

    if !envelope.is_event_callback() {
        return ("other", ignored("not_event_callback"));
    }
    let Some(event_value) = envelope.event else {
        return ("other", ignored("event_not_handled"));
    };

    match classify(&event_value) {
        SlackEvent::Message(event) => ("message", handle_message(state, event).await),
        SlackEvent::ReactionAdded(event) => (
            "reaction_added",
            handle_reaction(state, event, ReactionKind::Added).await,
        ),
        SlackEvent::ReactionRemoved(event) => (
            "reaction_removed",
            handle_reaction(state, event, ReactionKind::Removed).await,
        ),
        SlackEvent::Unhandled { event_type } => {
            info!(stage = "ingress", event_type, "event type not handled");
            ("other", ignored("event_not_handled"))
        }
    }
}

async fn handle_message(state: &AppState, event: MessageEvent) -> Response {
    // edits, joins, bot chatter and the like carry a subtype
    if event.subtype.is_some() {
        return ignored("message_subtype");
    }

    let (Some(requester_id), Some(channel_id), Some(message_ts)) =
        (event.user.as_deref(), event.channel.as_deref(), event.ts.as_deref())
    else {
        return plain(StatusCode::BAD_REQUEST, "missing message event fields");
    };

    let Some(slack) = state.slack() else {
        error!(stage = "ingress", "SLACK_BOT_TOKEN is not configured");
        return plain(StatusCode::INTERNAL_SERVER_ERROR, "missing SLACK_BOT_TOKEN");
    };

    let qualifying_url = slack
        .find_qualifying_url(
            channel_id,
            message_ts,
            event.text.as_deref(),
            event.has_thread_activity(),
        )
        .await;
    let Some(qualifying_url) = qualifying_url else {
        return ignored("missing_qualifying_review_url");
    };

    let requester = slack.user_summary(requester_id).await;
    let occurred_at = event
        .event_ts
        .as_deref()
        .or(Some(message_ts))
        .and_then(parse_slack_timestamp);

    let outcome = state
        .storage()
        .requests()
        .ingest(NewRequest {
            requester_id,
            requester_display_name: Some(&requester.display_name),
            requester_image_url: requester.image_url.as_deref(),
            channel_id,
            message_ref: message_ts,
            occurred_at,
            ingested_at: state.now(),
            pr_url: &qualifying_url,
            dedupe_key: &request_dedupe_key(channel_id, message_ts),
        })
        .await;

    match outcome {
        Ok(outcome) => {
            counter!("requests_ingested_total", "result" => ingest_label(outcome.duplicate))
                .increment(1);
            ok_json(json!({ "ok": true, "duplicateSkipped": outcome.duplicate }))
        }
        Err(err) => {
            error!(stage = "ingress", channel_id, message_ts, error = %err, "failed to persist request");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "failed to persist request")
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ReactionKind {
    Added,
    Removed,
}

async fn handle_reaction(state: &AppState, event: ReactionEvent, kind: ReactionKind) -> Response {
    let reaction = normalize_emoji(event.reaction.as_deref().unwrap_or_default());
    if !tracked_emoji_set().contains(&reaction) {
        return ignored("emoji_not_tracked");
    }

    let item = event.item.as_ref();
    let (Some(giver_id), Some(channel_id), Some(message_ts)) = (
        event.user.as_deref(),
        item.and_then(|item| item.channel.as_deref()),
        item.and_then(|item| item.ts.as_deref()),
    ) else {
        return plain(StatusCode::BAD_REQUEST, "missing reaction event fields");
    };

    let Some(slack) = state.slack() else {
        error!(stage = "ingress", "SLACK_BOT_TOKEN is not configured");
        return plain(StatusCode::INTERNAL_SERVER_ERROR, "missing SLACK_BOT_TOKEN");
    };

    let message = match slack.message_at(channel_id, message_ts).await {
        Ok(Some(message)) => message,
        Ok(None) => return plain(StatusCode::BAD_REQUEST, "could not resolve message author"),
        Err(err) => {
            warn!(stage = "ingress", channel_id, message_ts, error = %err, "message point lookup failed");
            return plain(StatusCode::BAD_REQUEST, "could not resolve message author");
        }
    };
    let Some(requester_id) = message.user.clone() else {
        return plain(StatusCode::BAD_REQUEST, "could not resolve message author");
    };

    let qualifying_url = slack
        .find_qualifying_url(
            channel_id,
            message_ts,
            message.text.as_deref(),
            message.has_thread_activity(),
        )
        .await;
    let Some(qualifying_url) = qualifying_url else {
        return ignored("missing_qualifying_review_url");
    };

    // the stamped message is itself a request; record it so a reaction seen
    // before (or instead of) the original message event still counts
    let requester = slack.user_summary(&requester_id).await;
    let occurred_at = event.event_ts.as_deref().and_then(parse_slack_timestamp);
    let request_outcome = state
        .storage()
        .requests()
        .ingest(NewRequest {
            requester_id: &requester_id,
            requester_display_name: Some(&requester.display_name),
            requester_image_url: requester.image_url.as_deref(),
            channel_id,
            message_ref: message_ts,
            occurred_at,
            ingested_at: state.now(),
            pr_url: &qualifying_url,
            dedupe_key: &request_dedupe_key(channel_id, message_ts),
        })
        .await;
    if let Err(err) = request_outcome {
        error!(stage = "ingress", channel_id, message_ts, error = %err, "failed to persist request");
        return plain(StatusCode::INTERNAL_SERVER_ERROR, "failed to persist request");
    }

    let dedupe_key = reaction_dedupe_key(channel_id, message_ts, &reaction, giver_id);

    match kind {
        ReactionKind::Removed => {
            let outcome = state
                .storage()
                .stamp_events()
                .remove(RemoveStamp {
                    dedupe_key: &dedupe_key,
                    giver_id,
                    requester_id: &requester_id,
                    reaction: &reaction,
                    source: None,
                    channel_id,
                })
                .await;
            match outcome {
                Ok(outcome) => {
                    counter!("stamp_events_removed_total", "strategy" => outcome.strategy.as_str())
                        .increment(1);
                    ok_json(json!({
                        "ok": true,
                        "removed": outcome.removed,
                        "strategy": outcome.strategy.as_str(),
                    }))
                }
                Err(err) => {
                    error!(stage = "ingress", %dedupe_key, error = %err, "failed to remove stamp");
                    plain(StatusCode::INTERNAL_SERVER_ERROR, "failed to remove stamp")
                }
            }
        }
        ReactionKind::Added => {
            if giver_id == requester_id {
                return ignored("self_reaction");
            }

            let giver = slack.user_summary(giver_id).await;
            let outcome = state
                .storage()
                .stamp_events()
                .ingest(NewStampEvent {
                    giver_id,
                    requester_id: &requester_id,
                    giver_display_name: Some(&giver.display_name),
                    giver_image_url: giver.image_url.as_deref(),
                    requester_display_name: Some(&requester.display_name),
                    requester_image_url: requester.image_url.as_deref(),
                    reaction: &reaction,
                    source: None,
                    occurred_at,
                    ingested_at: state.now(),
                    channel_id,
                    pr_url: Some(&qualifying_url),
                    dedupe_key: &dedupe_key,
                })
                .await;
            match outcome {
                Ok(outcome) => {
                    counter!("stamp_events_ingested_total", "result" => ingest_label(outcome.duplicate))
                        .increment(1);
                    ok_json(json!({ "ok": true, "duplicateSkipped": outcome.duplicate }))
                }
                Err(err) => {
                    error!(stage = "ingress", %dedupe_key, error = %err, "failed to persist stamp");
                    plain(StatusCode::INTERNAL_SERVER_ERROR, "failed to persist stamp")
                }
            }
        }
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn ingest_label(duplicate: bool) -> &'static str {
    if duplicate {
        "duplicate"
    } else {
        "created"
    }
}

fn plain(status: StatusCode, body: &'static str) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(body))
        .unwrap()
}

fn plain_owned(status: StatusCode, body: String) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(body))
        .unwrap()
}

fn challenge_response(challenge: String) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(challenge))
        .unwrap()
}

fn ignored(reason: &'static str) -> Response {
    ok_json(json!({ "ok": true, "ignored": true, "reason": reason }))
}

fn ok_json(value: serde_json::Value) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(value.to_string()))
        .unwrap()
}
