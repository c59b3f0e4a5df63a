//! Dedupe-key derivation.
//!
//! The same key must come out of a live webhook delivery and a backfill
//! replay of the same underlying Slack event; every component is taken from
//! event coordinates that both paths observe identically.

/// Key identifying a request message: one per (channel, message) pair.
pub fn request_dedupe_key(channel_id: &str, message_ts: &str) -> String {
    format!("request:{channel_id}:{message_ts}")
}

/// Key identifying a single reviewer stamp. `reaction` must already be
/// normalized via [`crate::rules::normalize_emoji`].
pub fn reaction_dedupe_key(
    channel_id: &str,
    message_ts: &str,
    reaction: &str,
    giver_id: &str,
) -> String {
    format!("reaction:{channel_id}:{message_ts}:{reaction}:{giver_id}")
}

/// Source tag stored on stamp events; also the fallback-removal predicate,
/// so it has to be derived the same way at insert and delete time.
pub fn stamp_source(reaction: &str) -> String {
    format!("stamp:{reaction}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::normalize_emoji;

    #[test]
    fn request_key_is_channel_and_ts() {
        assert_eq!(
            request_dedupe_key("C123", "1712345678.000200"),
            "request:C123:1712345678.000200"
        );
    }

    #[test]
    fn reaction_key_includes_reaction_and_giver() {
        assert_eq!(
            reaction_dedupe_key("C123", "1712345678.000200", "white_check_mark", "U42"),
            "reaction:C123:1712345678.000200:white_check_mark:U42"
        );
    }

    #[test]
    fn live_and_backfill_coordinates_produce_identical_keys() {
        // a live reaction event carries the raw emoji; backfill sees the
        // normalized name from history; both must land on one key
        let live = reaction_dedupe_key(
            "C1",
            "1.000",
            &normalize_emoji(":White_Check_Mark:"),
            "U1",
        );
        let backfill = reaction_dedupe_key("C1", "1.000", &normalize_emoji("white_check_mark"), "U1");
        assert_eq!(live, backfill);
    }

    #[test]
    fn source_tag_embeds_reaction_name() {
        assert_eq!(stamp_source("stampstamp"), "stamp:stampstamp");
    }
}
