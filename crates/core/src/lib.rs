//! Domain rules for the stamp leaderboard pipeline.
//!
//! Everything in this crate is pure: event classification, emoji and
//! review-URL qualification, dedupe-key derivation, and Slack timestamp
//! parsing. Live webhook handling and backfill both build on these functions,
//! which is what keeps their ingestion decisions identical.

pub mod event;
pub mod keys;
pub mod rules;
pub mod time;

pub use event::{classify, EventEnvelope, MessageEvent, ReactionEvent, ReactionItem, SlackEvent};
pub use keys::{reaction_dedupe_key, request_dedupe_key, stamp_source};
pub use rules::{extract_qualifying_url, normalize_emoji, tracked_emoji_set};
pub use time::{parse_slack_timestamp, to_slack_timestamp};
