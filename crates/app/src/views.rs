use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use stamphog_storage::{ActorProfile, Database, StorageError};

pub const DEFAULT_LEADERBOARD_LIMIT: usize = 20;
pub const DEFAULT_RECENT_EVENTS_LIMIT: usize = 23;
pub const MAX_RESULTS_LIMIT: usize = 100;

/// Aggregate leaderboard served to the front end.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardView {
    pub generated_at: DateTime<Utc>,
    pub window_days: Option<u32>,
    pub totals: LeaderboardTotals,
    pub givers: Vec<GiverAggregate>,
    pub requesters: Vec<RequesterAggregate>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardTotals {
    pub events: u64,
    pub stamps: i64,
    pub requests: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GiverAggregate {
    pub actor_id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub stamps_given: i64,
    pub approvals_given: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequesterAggregate {
    pub actor_id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub requests_posted: u64,
    pub stamps_requested: i64,
    pub approvals_received: u64,
}

/// One entry in the merged recent-activity feed.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RecentItem {
    #[serde(rename_all = "camelCase")]
    Stamp {
        id: String,
        occurred_at: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pr_url: Option<String>,
        giver_id: String,
        giver_display_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        giver_image_url: Option<String>,
        requester_id: String,
        requester_display_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        requester_image_url: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Request {
        id: String,
        occurred_at: DateTime<Utc>,
        pr_url: String,
        requester_id: String,
        requester_display_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        requester_image_url: Option<String>,
    },
}

impl RecentItem {
    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            Self::Stamp { occurred_at, .. } | Self::Request { occurred_at, .. } => *occurred_at,
        }
    }
}

pub fn clamp_limit(value: Option<usize>, fallback: usize) -> usize {
    value.unwrap_or(fallback).clamp(1, MAX_RESULTS_LIMIT)
}

fn resolve_profile<'a>(
    actor_map: &'a HashMap<String, ActorProfile>,
    actor_id: &str,
) -> (String, Option<String>) {
    match actor_map.get(actor_id) {
        Some(profile) => (profile.display_name.clone(), profile.image_url.clone()),
        None => (actor_id.to_string(), None),
    }
}

/// Builds the leaderboard over all records, or those inside the window.
pub async fn build_leaderboard(
    storage: &Database,
    now: DateTime<Utc>,
    window_days: Option<u32>,
    limit: Option<usize>,
) -> Result<LeaderboardView, StorageError> {
    let limit = clamp_limit(limit, DEFAULT_LEADERBOARD_LIMIT);
    let since = window_days
        .filter(|days| *days > 0)
        .map(|days| now - Duration::days(i64::from(days)));

    let stamp_events = storage.stamp_events().list_since(since).await?;
    let requests = storage.requests().list_since(since).await?;
    let actor_map = storage.actors().profile_map().await?;

    let mut givers: HashMap<String, GiverAggregate> = HashMap::new();
    let mut requesters: HashMap<String, RequesterAggregate> = HashMap::new();

    for request in &requests {
        let requester = requesters
            .entry(request.requester_id.clone())
            .or_insert_with(|| {
                let (display_name, image_url) = resolve_profile(&actor_map, &request.requester_id);
                RequesterAggregate {
                    actor_id: request.requester_id.clone(),
                    display_name,
                    image_url,
                    requests_posted: 0,
                    stamps_requested: 0,
                    approvals_received: 0,
                }
            });
        requester.requests_posted += 1;
    }

    let mut total_stamps = 0i64;
    for event in &stamp_events {
        total_stamps += event.stamp_count;

        let giver = givers.entry(event.giver_id.clone()).or_insert_with(|| {
            let (display_name, image_url) = resolve_profile(&actor_map, &event.giver_id);
            GiverAggregate {
                actor_id: event.giver_id.clone(),
                display_name,
                image_url,
                stamps_given: 0,
                approvals_given: 0,
            }
        });
        giver.stamps_given += event.stamp_count;
        giver.approvals_given += 1;

        let requester = requesters
            .entry(event.requester_id.clone())
            .or_insert_with(|| {
                let (display_name, image_url) = resolve_profile(&actor_map, &event.requester_id);
                RequesterAggregate {
                    actor_id: event.requester_id.clone(),
                    display_name,
                    image_url,
                    requests_posted: 0,
                    stamps_requested: 0,
                    approvals_received: 0,
                }
            });
        requester.stamps_requested += event.stamp_count;
        requester.approvals_received += 1;
    }

    let mut givers: Vec<GiverAggregate> = givers.into_values().collect();
    givers.sort_by(|a, b| {
        b.stamps_given
            .cmp(&a.stamps_given)
            .then(b.approvals_given.cmp(&a.approvals_given))
            .then(a.actor_id.cmp(&b.actor_id))
    });
    givers.truncate(limit);

    let mut requesters: Vec<RequesterAggregate> = requesters
        .into_values()
        .filter(|requester| requester.stamps_requested > 0)
        .collect();
    requesters.sort_by(|a, b| {
        b.stamps_requested
            .cmp(&a.stamps_requested)
            .then(b.approvals_received.cmp(&a.approvals_received))
            .then(b.requests_posted.cmp(&a.requests_posted))
            .then(a.actor_id.cmp(&b.actor_id))
    });
    requesters.truncate(limit);

    Ok(LeaderboardView {
        generated_at: now,
        window_days,
        totals: LeaderboardTotals {
            events: stamp_events.len() as u64,
            stamps: total_stamps,
            requests: requests.len() as u64,
        },
        givers,
        requesters,
    })
}

/// Builds the merged stamp/request activity feed, newest first.
pub async fn build_recent_events(
    storage: &Database,
    limit: Option<usize>,
) -> Result<Vec<RecentItem>, StorageError> {
    let limit = clamp_limit(limit, DEFAULT_RECENT_EVENTS_LIMIT);

    // over-fetch from each table, then merge and trim
    let stamps = storage.stamp_events().list_recent(limit as u32).await?;
    let requests = storage.requests().list_recent(limit as u32).await?;
    let actor_map = storage.actors().profile_map().await?;

    let mut items: Vec<RecentItem> = Vec::with_capacity(stamps.len() + requests.len());

    for event in stamps {
        let (giver_display_name, giver_image_url) = resolve_profile(&actor_map, &event.giver_id);
        let (requester_display_name, requester_image_url) =
            resolve_profile(&actor_map, &event.requester_id);
        items.push(RecentItem::Stamp {
            id: event.id,
            occurred_at: event.occurred_at,
            pr_url: event.pr_url,
            giver_id: event.giver_id,
            giver_display_name,
            giver_image_url,
            requester_id: event.requester_id,
            requester_display_name,
            requester_image_url,
        });
    }

    for request in requests {
        let (requester_display_name, requester_image_url) =
            resolve_profile(&actor_map, &request.requester_id);
        items.push(RecentItem::Request {
            id: request.id,
            occurred_at: request.occurred_at,
            pr_url: request.pr_url,
            requester_id: request.requester_id,
            requester_display_name,
            requester_image_url,
        });
    }

    items.sort_by(|a, b| b.occurred_at().cmp(&a.occurred_at()));
    items.truncate(limit);
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use stamphog_storage::{NewRequest, NewStampEvent};

    async fn setup_db() -> Database {
        let db = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        db
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).expect("timestamp")
    }

    async fn seed_request(db: &Database, requester: &str, ts: i64, key: &str) {
        db.requests()
            .ingest(NewRequest {
                requester_id: requester,
                requester_display_name: Some(requester),
                requester_image_url: None,
                channel_id: "C-1",
                message_ref: "1.000",
                occurred_at: Some(at(ts)),
                ingested_at: at(ts),
                pr_url: "https://github.com/o/r/pull/1",
                dedupe_key: key,
            })
            .await
            .expect("ingest request");
    }

    async fn seed_stamp(db: &Database, giver: &str, requester: &str, ts: i64, key: &str) {
        db.stamp_events()
            .ingest(NewStampEvent {
                giver_id: giver,
                requester_id: requester,
                giver_display_name: Some(giver),
                giver_image_url: None,
                requester_display_name: Some(requester),
                requester_image_url: None,
                reaction: "white_check_mark",
                source: None,
                occurred_at: Some(at(ts)),
                ingested_at: at(ts),
                channel_id: "C-1",
                pr_url: Some("https://github.com/o/r/pull/1"),
                dedupe_key: key,
            })
            .await
            .expect("ingest stamp");
    }

    #[tokio::test]
    async fn leaderboard_aggregates_and_sorts_by_stamps() {
        let db = setup_db().await;
        let now = at(1_712_400_000);

        seed_request(&db, "U-A", 1_712_000_000, "request:C-1:1").await;
        seed_request(&db, "U-C", 1_712_000_100, "request:C-1:2").await;
        seed_stamp(&db, "U-B", "U-A", 1_712_000_200, "reaction:1").await;
        seed_stamp(&db, "U-B", "U-C", 1_712_000_300, "reaction:2").await;
        seed_stamp(&db, "U-C", "U-A", 1_712_000_400, "reaction:3").await;

        let view = build_leaderboard(&db, now, None, None).await.expect("view");

        assert_eq!(view.totals.events, 3);
        assert_eq!(view.totals.stamps, 3);
        assert_eq!(view.totals.requests, 2);

        assert_eq!(view.givers[0].actor_id, "U-B");
        assert_eq!(view.givers[0].stamps_given, 2);
        assert_eq!(view.givers[0].approvals_given, 2);
        assert_eq!(view.givers[1].actor_id, "U-C");

        // U-A received two stamps, U-C one
        assert_eq!(view.requesters[0].actor_id, "U-A");
        assert_eq!(view.requesters[0].stamps_requested, 2);
        assert_eq!(view.requesters[0].requests_posted, 1);
        assert_eq!(view.requesters[1].actor_id, "U-C");
    }

    #[tokio::test]
    async fn leaderboard_excludes_requesters_without_stamps() {
        let db = setup_db().await;
        seed_request(&db, "U-quiet", 1_712_000_000, "request:C-1:1").await;

        let view = build_leaderboard(&db, at(1_712_400_000), None, None)
            .await
            .expect("view");
        assert!(view.requesters.is_empty());
        assert_eq!(view.totals.requests, 1);
    }

    #[tokio::test]
    async fn leaderboard_window_filters_old_records() {
        let db = setup_db().await;
        let now = at(1_712_400_000);

        seed_stamp(&db, "U-B", "U-A", 1_712_399_000, "reaction:new").await;
        // 30 days earlier
        seed_stamp(&db, "U-B", "U-A", 1_712_400_000 - 30 * 86_400, "reaction:old").await;

        let view = build_leaderboard(&db, now, Some(7), None).await.expect("view");
        assert_eq!(view.totals.events, 1);
        assert_eq!(view.window_days, Some(7));

        let unbounded = build_leaderboard(&db, now, None, None).await.expect("view");
        assert_eq!(unbounded.totals.events, 2);
    }

    #[tokio::test]
    async fn leaderboard_falls_back_to_raw_ids_for_unknown_actors() {
        let db = setup_db().await;
        // raw insert bypasses the actor upsert that ingest performs
        sqlx::query(
            "INSERT INTO stamp_events \
             (id, giver_id, requester_id, stamp_count, occurred_at, source, channel_id, pr_url, dedupe_key) \
             VALUES ('e-1', 'U-ghost', 'U-phantom', 1, '2024-04-06T00:00:00.000Z', 'stamp:stamp', 'C-1', NULL, NULL)",
        )
        .execute(db.pool())
        .await
        .expect("insert");

        let view = build_leaderboard(&db, at(1_712_500_000), None, None)
            .await
            .expect("view");
        assert_eq!(view.givers[0].display_name, "U-ghost");
        assert_eq!(view.requesters[0].display_name, "U-phantom");
    }

    #[tokio::test]
    async fn recent_events_merge_newest_first() {
        let db = setup_db().await;

        seed_request(&db, "U-A", 1_712_000_000, "request:C-1:1").await;
        seed_stamp(&db, "U-B", "U-A", 1_712_000_500, "reaction:1").await;
        seed_request(&db, "U-C", 1_712_000_250, "request:C-1:2").await;

        let items = build_recent_events(&db, None).await.expect("items");
        assert_eq!(items.len(), 3);
        assert!(matches!(items[0], RecentItem::Stamp { .. }));
        assert!(matches!(items[1], RecentItem::Request { .. }));
        assert_eq!(items[0].occurred_at(), at(1_712_000_500));

        let limited = build_recent_events(&db, Some(2)).await.expect("items");
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn limits_clamp_into_range() {
        assert_eq!(clamp_limit(None, DEFAULT_LEADERBOARD_LIMIT), 20);
        assert_eq!(clamp_limit(Some(0), DEFAULT_LEADERBOARD_LIMIT), 1);
        assert_eq!(clamp_limit(Some(500), DEFAULT_LEADERBOARD_LIMIT), 100);
        assert_eq!(clamp_limit(Some(5), DEFAULT_LEADERBOARD_LIMIT), 5);
    }
}
