use std::collections::HashSet;

use url::Url;

/// Reaction names that count as an approval stamp.
const TRACKED_STAMP_EMOJIS: [&str; 5] = [
    "stampstamp",
    "white_check_mark",
    "heavy_check_mark",
    "stamp",
    "white_tick",
];

/// Hosts (and their subdomains) whose URLs qualify a message as a review request.
const QUALIFYING_REVIEW_HOSTS: [&str; 2] = ["github.com", "graphite.dev"];

/// Canonicalizes a reaction name: colon delimiters stripped, trimmed, lowercased.
pub fn normalize_emoji(raw: &str) -> String {
    raw.replace(':', "").trim().to_lowercase()
}

/// Returns the normalized tracked-emoji set used for membership tests.
pub fn tracked_emoji_set() -> HashSet<String> {
    TRACKED_STAMP_EMOJIS
        .iter()
        .map(|emoji| normalize_emoji(emoji))
        .filter(|emoji| !emoji.is_empty())
        .collect()
}

/// Scans message text for the first URL hosted on a qualifying review domain.
///
/// Candidates are `http(s)://` tokens terminated by whitespace or `>` (the
/// closer of Slack's `<url|label>` convention). Trailing punctuation and a
/// pipe-delimited link label are stripped before the host check. Malformed
/// candidates are skipped, never an error.
pub fn extract_qualifying_url(text: Option<&str>) -> Option<String> {
    let text = text?;
    for candidate in url_candidates(text) {
        if let Some(parsed) = to_normalized_url(candidate) {
            if is_qualifying_review_host(parsed.host_str().unwrap_or_default()) {
                return Some(parsed.to_string());
            }
        }
    }
    None
}

fn url_candidates(text: &str) -> Vec<&str> {
    let mut candidates = Vec::new();
    let mut cursor = 0;
    for (start, _) in text.match_indices("http") {
        // skip occurrences inside an already-captured token
        if start < cursor {
            continue;
        }
        let tail = &text[start..];
        if !(tail.starts_with("http://") || tail.starts_with("https://")) {
            continue;
        }
        let end = tail
            .find(|c: char| c.is_whitespace() || c == '>')
            .unwrap_or(tail.len());
        candidates.push(&tail[..end]);
        cursor = start + end;
    }
    candidates
}

fn to_normalized_url(candidate: &str) -> Option<Url> {
    let cleaned = candidate.trim_end_matches([')', '>', '.', ',', '!', '?']);
    let cleaned = cleaned.split('|').next().unwrap_or_default();
    Url::parse(cleaned).ok()
}

fn is_qualifying_review_host(hostname: &str) -> bool {
    let host = hostname.to_ascii_lowercase();
    QUALIFYING_REVIEW_HOSTS
        .iter()
        .any(|allowed| host == *allowed || host.ends_with(&format!(".{allowed}")))
}
