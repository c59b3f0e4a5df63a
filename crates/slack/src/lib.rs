//! Slack Web API client used for identity resolution and channel history.

pub mod web_api;

pub use web_api::{
    HistoryMessage, HistoryPage, HistoryPageParams, MessageReaction, SlackApiError, SlackClient,
    ThreadPageParams, UserSummary, HISTORY_PAGE_SIZE,
};
