use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use url::Url;

use stamphog_core::keys::{reaction_dedupe_key, request_dedupe_key};
use stamphog_core::rules::{normalize_emoji, tracked_emoji_set};
use stamphog_core::time::{parse_slack_timestamp, to_slack_timestamp};
use stamphog_slack::{HistoryMessage, HistoryPageParams, SlackApiError, SlackClient, UserSummary};
use stamphog_storage::{Database, NewRequest, NewStampEvent, StorageError};

pub const DEFAULT_MAX_MESSAGES: u32 = 5_000;
pub const MAX_BACKFILL_MESSAGES: u32 = 50_000;
pub const BACKFILL_WINDOW_DAYS: i64 = 90;

const TOP_COUNT_LIMIT: usize = 20;

/// Parameters for one backfill run.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillArgs {
    pub channel_id: String,
    #[serde(default)]
    pub oldest_ts: Option<String>,
    #[serde(default)]
    pub max_messages: Option<u32>,
}

/// Errors that abort a backfill run.
///
/// A history-page failure is fatal by design: there is no way to know what
/// the missing page contained, and re-running after the upstream recovers is
/// safe because every ingest dedupes.
#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("slack history fetch failed: {0}")]
    History(SlackApiError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Replays channel history through the same qualification rules and ingestion
/// mutations the live webhook uses.
pub struct BackfillEngine {
    storage: Database,
    slack: SlackClient,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl BackfillEngine {
    pub fn new(
        storage: Database,
        slack: SlackClient,
        clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    ) -> Self {
        Self {
            storage,
            slack,
            clock,
        }
    }

    /// Scans one channel and returns the diagnostic summary.
    pub async fn run(&self, args: &BackfillArgs) -> Result<BackfillSummary, BackfillError> {
        let max_messages = bounded_max_messages(args.max_messages);
        let now = (self.clock)();
        let applied_oldest_ts = effective_oldest_ts(args.oldest_ts.as_deref(), now);
        let tracked = tracked_emoji_set();

        let mut stats = BackfillStats::default();
        let mut users = UserCache::default();
        let mut cursor: Option<String> = None;

        while stats.scanned_messages < u64::from(max_messages) {
            let page = self
                .slack
                .history_page(&HistoryPageParams {
                    channel_id: &args.channel_id,
                    cursor: cursor.as_deref(),
                    oldest_ts: Some(&applied_oldest_ts),
                })
                .await
                .map_err(BackfillError::History)?;

            if page.messages.is_empty() {
                break;
            }
            let page_len = page.messages.len();

            for message in &page.messages {
                if stats.scanned_messages >= u64::from(max_messages) {
                    break;
                }
                self.process_message(&args.channel_id, &tracked, message, &mut stats, &mut users)
                    .await?;
            }

            match page.next_cursor {
                Some(next) if page_len >= stamphog_slack::HISTORY_PAGE_SIZE as usize => {
                    cursor = Some(next);
                }
                _ => break,
            }
        }

        let summary = stats.into_summary(SummaryContext {
            channel_id: &args.channel_id,
            tracked: &tracked,
            requested_oldest_ts: args.oldest_ts.clone(),
            applied_oldest_ts,
        });
        info!(
            stage = "backfill",
            channel = %args.channel_id,
            scanned = summary.scanned_messages,
            created_requests = summary.created_requests,
            created_events = summary.created_events,
            "backfill run completed"
        );
        Ok(summary)
    }

    async fn process_message(
        &self,
        channel_id: &str,
        tracked: &HashSet<String>,
        message: &HistoryMessage,
        stats: &mut BackfillStats,
        users: &mut UserCache,
    ) -> Result<(), BackfillError> {
        stats.scanned_messages += 1;

        let Some(requester_id) = message.user.as_deref() else {
            stats.skipped_missing_author += 1;
            return Ok(());
        };

        let message_ref = message.ts.as_deref().unwrap_or("0");
        let qualifying_url = self
            .slack
            .find_qualifying_url(
                channel_id,
                message_ref,
                message.text.as_deref(),
                message.has_thread_activity(),
            )
            .await;
        let Some(qualifying_url) = qualifying_url else {
            stats.skipped_missing_url += 1;
            return Ok(());
        };

        if let Ok(parsed) = Url::parse(&qualifying_url) {
            if let Some(host) = parsed.host_str() {
                bump(&mut stats.qualifying_url_hosts, host);
            }
        }

        let occurred_at = message.ts.as_deref().and_then(parse_slack_timestamp);
        let requester = users.get(&self.slack, requester_id).await;
        let outcome = self
            .storage
            .requests()
            .ingest(NewRequest {
                requester_id,
                requester_display_name: Some(&requester.display_name),
                requester_image_url: requester.image_url.as_deref(),
                channel_id,
                message_ref,
                occurred_at,
                ingested_at: (self.clock)(),
                pr_url: &qualifying_url,
                dedupe_key: &request_dedupe_key(channel_id, message_ref),
            })
            .await?;
        if outcome.duplicate {
            stats.duplicate_requests += 1;
        } else {
            stats.created_requests += 1;
        }

        let scan = ReactionScan {
            channel_id,
            tracked,
            message,
            message_ref,
            requester_id,
            qualifying_url: &qualifying_url,
            occurred_at,
        };
        let matched_tracked = self.process_reactions(scan, stats, users).await?;

        if matched_tracked {
            stats.qualifying_messages += 1;
            stats.messages_with_tracked_reaction += 1;
        } else {
            stats.skipped_no_tracked_reactions += 1;
        }

        Ok(())
    }

    async fn process_reactions(
        &self,
        scan: ReactionScan<'_>,
        stats: &mut BackfillStats,
        users: &mut UserCache,
    ) -> Result<bool, BackfillError> {
        if scan.message.reactions.is_empty() {
            stats.skipped_no_reactions += 1;
            return Ok(false);
        }
        stats.messages_with_any_reaction += 1;

        let mut matched_tracked = false;
        for reaction in &scan.message.reactions {
            let name = normalize_emoji(reaction.name.as_deref().unwrap_or_default());
            bump(&mut stats.all_reaction_names, &name);

            if !scan.tracked.contains(&name) {
                bump(&mut stats.untracked_reaction_names, &name);
                continue;
            }

            matched_tracked = true;
            bump(&mut stats.tracked_reaction_names, &name);

            for giver_id in &reaction.users {
                if giver_id == scan.requester_id {
                    stats.skipped_self_reactions += 1;
                    continue;
                }

                let giver = users.get(&self.slack, giver_id).await;
                let requester = users.get(&self.slack, scan.requester_id).await;

                let outcome = self
                    .storage
                    .stamp_events()
                    .ingest(NewStampEvent {
                        giver_id,
                        requester_id: scan.requester_id,
                        giver_display_name: Some(&giver.display_name),
                        giver_image_url: giver.image_url.as_deref(),
                        requester_display_name: Some(&requester.display_name),
                        requester_image_url: requester.image_url.as_deref(),
                        reaction: &name,
                        source: None,
                        occurred_at: scan.occurred_at,
                        ingested_at: (self.clock)(),
                        channel_id: scan.channel_id,
                        pr_url: Some(scan.qualifying_url),
                        dedupe_key: &reaction_dedupe_key(
                            scan.channel_id,
                            scan.message_ref,
                            &name,
                            giver_id,
                        ),
                    })
                    .await?;

                if outcome.duplicate {
                    stats.duplicate_events += 1;
                    counter!("backfill_duplicates_total").increment(1);
                } else {
                    stats.created_events += 1;
                    counter!("backfill_processed_total").increment(1);
                }
            }
        }

        Ok(matched_tracked)
    }
}

struct ReactionScan<'a> {
    channel_id: &'a str,
    tracked: &'a HashSet<String>,
    message: &'a HistoryMessage,
    message_ref: &'a str,
    requester_id: &'a str,
    qualifying_url: &'a str,
    occurred_at: Option<DateTime<Utc>>,
}

/// Per-run memoization of directory lookups. Unbounded and scoped to a single
/// backfill invocation; a channel's distinct-user count stays small.
#[derive(Default)]
struct UserCache {
    cache: HashMap<String, UserSummary>,
}

impl UserCache {
    async fn get(&mut self, slack: &SlackClient, user_id: &str) -> UserSummary {
        if let Some(cached) = self.cache.get(user_id) {
            return cached.clone();
        }
        let summary = slack.user_summary(user_id).await;
        self.cache.insert(user_id.to_string(), summary.clone());
        summary
    }
}

/// Accumulator threaded through the scan loop; folded into [`BackfillSummary`]
/// when the run finishes.
#[derive(Debug, Default)]
struct BackfillStats {
    scanned_messages: u64,
    qualifying_messages: u64,
    created_events: u64,
    duplicate_events: u64,
    created_requests: u64,
    duplicate_requests: u64,
    skipped_self_reactions: u64,
    skipped_missing_url: u64,
    skipped_missing_author: u64,
    skipped_no_reactions: u64,
    skipped_no_tracked_reactions: u64,
    messages_with_any_reaction: u64,
    messages_with_tracked_reaction: u64,
    all_reaction_names: HashMap<String, u64>,
    tracked_reaction_names: HashMap<String, u64>,
    untracked_reaction_names: HashMap<String, u64>,
    qualifying_url_hosts: HashMap<String, u64>,
}

struct SummaryContext<'a> {
    channel_id: &'a str,
    tracked: &'a HashSet<String>,
    requested_oldest_ts: Option<String>,
    applied_oldest_ts: String,
}

impl BackfillStats {
    fn into_summary(self, context: SummaryContext<'_>) -> BackfillSummary {
        let mut tracked_emoji_set: Vec<String> = context.tracked.iter().cloned().collect();
        tracked_emoji_set.sort();

        BackfillSummary {
            channel_id: context.channel_id.to_string(),
            scanned_messages: self.scanned_messages,
            qualifying_messages: self.qualifying_messages,
            created_events: self.created_events,
            duplicate_events: self.duplicate_events,
            created_requests: self.created_requests,
            duplicate_requests: self.duplicate_requests,
            skipped_self_reactions: self.skipped_self_reactions,
            skipped_missing_url: self.skipped_missing_url,
            skipped_missing_author: self.skipped_missing_author,
            skipped_no_reactions: self.skipped_no_reactions,
            skipped_no_tracked_reactions: self.skipped_no_tracked_reactions,
            messages_with_any_reaction: self.messages_with_any_reaction,
            messages_with_tracked_reaction: self.messages_with_tracked_reaction,
            top_all_reaction_names: top_counts(self.all_reaction_names),
            top_tracked_reaction_names: top_counts(self.tracked_reaction_names),
            top_untracked_reaction_names: top_counts(self.untracked_reaction_names),
            qualifying_url_hosts: top_counts(self.qualifying_url_hosts),
            tracked_emoji_set,
            requested_oldest_ts: context.requested_oldest_ts,
            applied_oldest_ts: context.applied_oldest_ts,
            backfill_window_days: BACKFILL_WINDOW_DAYS,
        }
    }
}

/// Diagnostic output of one backfill run; operational review only, not state.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillSummary {
    pub channel_id: String,
    pub scanned_messages: u64,
    pub qualifying_messages: u64,
    pub created_events: u64,
    pub duplicate_events: u64,
    pub created_requests: u64,
    pub duplicate_requests: u64,
    pub skipped_self_reactions: u64,
    pub skipped_missing_url: u64,
    pub skipped_missing_author: u64,
    pub skipped_no_reactions: u64,
    pub skipped_no_tracked_reactions: u64,
    pub messages_with_any_reaction: u64,
    pub messages_with_tracked_reaction: u64,
    pub top_all_reaction_names: Vec<CountEntry>,
    pub top_tracked_reaction_names: Vec<CountEntry>,
    pub top_untracked_reaction_names: Vec<CountEntry>,
    pub qualifying_url_hosts: Vec<CountEntry>,
    pub tracked_emoji_set: Vec<String>,
    pub requested_oldest_ts: Option<String>,
    pub applied_oldest_ts: String,
    pub backfill_window_days: i64,
}

/// One name-to-count entry in a summary breakdown.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct CountEntry {
    pub key: String,
    pub count: u64,
}

fn bump(map: &mut HashMap<String, u64>, key: &str) {
    if key.is_empty() {
        return;
    }
    *map.entry(key.to_string()).or_insert(0) += 1;
}

fn top_counts(map: HashMap<String, u64>) -> Vec<CountEntry> {
    let mut entries: Vec<CountEntry> = map
        .into_iter()
        .map(|(key, count)| CountEntry { key, count })
        .collect();
    entries.sort_by(|a, b| b.count.cmp(&a.count).then(a.key.cmp(&b.key)));
    entries.truncate(TOP_COUNT_LIMIT);
    entries
}

fn bounded_max_messages(requested: Option<u32>) -> u32 {
    requested
        .unwrap_or(DEFAULT_MAX_MESSAGES)
        .clamp(1, MAX_BACKFILL_MESSAGES)
}

/// The scan never reaches further back than the retention window, whatever
/// bound the caller asked for.
fn effective_oldest_ts(requested: Option<&str>, now: DateTime<Utc>) -> String {
    let cutoff = now - Duration::days(BACKFILL_WINDOW_DAYS);
    let cutoff_seconds = cutoff.timestamp() as f64;

    match requested
        .and_then(|raw| raw.parse::<f64>().ok())
        .filter(|seconds| seconds.is_finite())
    {
        Some(requested_seconds) if requested_seconds >= cutoff_seconds => {
            requested.unwrap_or_default().to_string()
        }
        _ => to_slack_timestamp(cutoff),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use reqwest::Client;
    use serde_json::json;

    use crate::telemetry;

    const FIXED_NOW_SECONDS: i64 = 1_712_400_000;

    struct TestHarness {
        engine: BackfillEngine,
        database: Database,
        server: MockServer,
    }

    async fn setup_harness() -> TestHarness {
        telemetry::init_metrics().expect("metrics init");
        let database = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        database.run_migrations().await.expect("migrations");

        let server = MockServer::start_async().await;
        let base = url::Url::parse(&server.url("/api/")).expect("url");
        let slack = SlackClient::new(
            "xoxb-test",
            base,
            Client::builder().build().expect("client"),
        );

        let now = DateTime::from_timestamp(FIXED_NOW_SECONDS, 0).expect("fixed time");
        let engine = BackfillEngine::new(database.clone(), slack, Arc::new(move || now));

        TestHarness {
            engine,
            database,
            server,
        }
    }

    async fn mock_user(server: &MockServer, user_id: &str) {
        let user_id = user_id.to_string();
        server
            .mock_async(move |when, then| {
                when.method(GET)
                    .path("/api/users.info")
                    .query_param("user", &user_id);
                then.status(200).json_body(json!({
                    "ok": true,
                    "user": {
                        "id": user_id,
                        "name": user_id.to_lowercase(),
                        "profile": {"display_name_normalized": format!("Name {user_id}")}
                    }
                }));
            })
            .await;
    }

    async fn mock_history(server: &MockServer, channel: &str, messages: serde_json::Value) {
        let channel = channel.to_string();
        server
            .mock_async(move |when, then| {
                when.method(GET)
                    .path("/api/conversations.history")
                    .query_param("channel", &channel)
                    .query_param("limit", "200");
                then.status(200)
                    .json_body(json!({"ok": true, "messages": messages}));
            })
            .await;
    }

    fn fixture_messages() -> serde_json::Value {
        json!([
            {
                "ts": "1712345678.000100",
                "user": "U-A",
                "text": "review https://github.com/org/repo/pull/42 please",
                "reactions": [
                    {"name": "white_check_mark", "users": ["U-B", "U-A"]},
                    {"name": "thumbsup", "users": ["U-C"]}
                ]
            },
            {
                "ts": "1712345679.000100",
                "user": "U-B",
                "text": "no links here"
            },
            {
                "ts": "1712345680.000100",
                "text": "authorless system message"
            }
        ])
    }

    #[tokio::test]
    async fn backfill_replays_history_and_is_rerunnable() {
        let harness = setup_harness().await;
        mock_history(&harness.server, "C-BF", fixture_messages()).await;
        mock_user(&harness.server, "U-A").await;
        mock_user(&harness.server, "U-B").await;

        let args = BackfillArgs {
            channel_id: "C-BF".to_string(),
            oldest_ts: None,
            max_messages: None,
        };

        let first = harness.engine.run(&args).await.expect("first run");
        assert_eq!(first.scanned_messages, 3);
        assert_eq!(first.created_requests, 1);
        assert_eq!(first.duplicate_requests, 0);
        assert_eq!(first.created_events, 1);
        assert_eq!(first.duplicate_events, 0);
        assert_eq!(first.qualifying_messages, 1);
        assert_eq!(first.skipped_missing_url, 1);
        assert_eq!(first.skipped_missing_author, 1);
        assert_eq!(first.skipped_self_reactions, 1);
        assert_eq!(first.messages_with_any_reaction, 1);
        assert_eq!(first.messages_with_tracked_reaction, 1);
        assert_eq!(
            first.qualifying_url_hosts,
            vec![CountEntry {
                key: "github.com".to_string(),
                count: 1
            }]
        );
        assert_eq!(
            first.top_untracked_reaction_names,
            vec![CountEntry {
                key: "thumbsup".to_string(),
                count: 1
            }]
        );
        assert_eq!(first.applied_oldest_ts, {
            let cutoff = DateTime::from_timestamp(FIXED_NOW_SECONDS, 0).expect("ts")
                - Duration::days(BACKFILL_WINDOW_DAYS);
            to_slack_timestamp(cutoff)
        });

        // the dedupe keys make a second pass a pure duplicate scan
        let second = harness.engine.run(&args).await.expect("second run");
        assert_eq!(second.created_requests, 0);
        assert_eq!(second.duplicate_requests, 1);
        assert_eq!(second.created_events, 0);
        assert_eq!(second.duplicate_events, 1);

        let stamps: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stamp_events")
            .fetch_one(harness.database.pool())
            .await
            .expect("count");
        assert_eq!(stamps, 1);

        // backfill and live paths derive the same key for this tuple
        let key: String = sqlx::query_scalar("SELECT dedupe_key FROM stamp_events")
            .fetch_one(harness.database.pool())
            .await
            .expect("key");
        assert_eq!(
            key,
            reaction_dedupe_key("C-BF", "1712345678.000100", "white_check_mark", "U-B")
        );
    }

    #[tokio::test]
    async fn backfill_honors_message_cap() {
        let harness = setup_harness().await;
        mock_history(&harness.server, "C-CAP", fixture_messages()).await;
        mock_user(&harness.server, "U-A").await;
        mock_user(&harness.server, "U-B").await;

        let args = BackfillArgs {
            channel_id: "C-CAP".to_string(),
            oldest_ts: None,
            max_messages: Some(1),
        };

        let summary = harness.engine.run(&args).await.expect("run");
        assert_eq!(summary.scanned_messages, 1);
    }

    #[tokio::test]
    async fn page_fetch_failure_fails_the_run() {
        let harness = setup_harness().await;
        harness
            .server
            .mock_async(|when, then| {
                when.method(GET).path("/api/conversations.history");
                then.status(200)
                    .json_body(json!({"ok": false, "error": "channel_not_found"}));
            })
            .await;

        let args = BackfillArgs {
            channel_id: "C-404".to_string(),
            oldest_ts: None,
            max_messages: None,
        };

        let err = harness.engine.run(&args).await.expect_err("should fail");
        assert!(err.to_string().contains("channel_not_found"));
    }

    #[test]
    fn max_messages_is_clamped_to_the_hard_ceiling() {
        assert_eq!(bounded_max_messages(None), DEFAULT_MAX_MESSAGES);
        assert_eq!(bounded_max_messages(Some(0)), 1);
        assert_eq!(bounded_max_messages(Some(10)), 10);
        assert_eq!(
            bounded_max_messages(Some(u32::MAX)),
            MAX_BACKFILL_MESSAGES
        );
    }

    #[test]
    fn oldest_bound_never_precedes_the_retention_window() {
        let now = DateTime::from_timestamp(FIXED_NOW_SECONDS, 0).expect("ts");
        let cutoff = to_slack_timestamp(now - Duration::days(BACKFILL_WINDOW_DAYS));

        // absent or too-old bounds collapse to the cutoff
        assert_eq!(effective_oldest_ts(None, now), cutoff);
        assert_eq!(effective_oldest_ts(Some("1000000000"), now), cutoff);
        assert_eq!(effective_oldest_ts(Some("garbage"), now), cutoff);

        // a bound inside the window is honored verbatim
        let recent = (FIXED_NOW_SECONDS - 86_400).to_string();
        assert_eq!(effective_oldest_ts(Some(&recent), now), recent);
    }

    #[test]
    fn top_counts_sort_and_truncate() {
        let mut map = HashMap::new();
        for (name, count) in [("a", 3u64), ("b", 5), ("c", 1)] {
            map.insert(name.to_string(), count);
        }
        let entries = top_counts(map);
        assert_eq!(entries[0].key, "b");
        assert_eq!(entries[1].key, "a");
        assert_eq!(entries[2].key, "c");
    }
}
