use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

pub const HEADER_TIMESTAMP: &str = "x-slack-request-timestamp";
pub const HEADER_SIGNATURE: &str = "x-slack-signature";

const SIGNATURE_PREFIX: &str = "v0=";
const REPLAY_WINDOW_SECONDS: f64 = 300.0;

/// Why a delivery failed signature verification. Every variant maps to a 401
/// at the webhook boundary; a missing signing secret is handled by the caller
/// before verification is attempted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing slack signature headers")]
    MissingHeaders,
    #[error("stale slack request")]
    Stale,
    #[error("invalid slack signature")]
    Mismatch,
}

/// Verifies a Slack request signature against the raw body bytes.
///
/// The expected signature is `v0=` + hex(HMAC-SHA256(`v0:{timestamp}:{body}`))
/// keyed by the signing secret. Timestamps older or newer than the replay
/// window are rejected before any MAC work. The final comparison is
/// constant-time: length first, then an equal-time byte comparison with no
/// early exit.
pub fn verify(
    secret: &[u8],
    timestamp: Option<&str>,
    signature: Option<&str>,
    body: &[u8],
    now: DateTime<Utc>,
) -> Result<(), SignatureError> {
    let (Some(timestamp), Some(signature)) = (timestamp, signature) else {
        return Err(SignatureError::MissingHeaders);
    };
    if timestamp.is_empty() || signature.is_empty() {
        return Err(SignatureError::MissingHeaders);
    }

    let header_seconds: f64 = timestamp.parse().map_err(|_| SignatureError::Stale)?;
    if !header_seconds.is_finite() {
        return Err(SignatureError::Stale);
    }
    let age_seconds = (now.timestamp() as f64 - header_seconds).abs();
    if age_seconds > REPLAY_WINDOW_SECONDS {
        return Err(SignatureError::Stale);
    }

    let hex_part = signature
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or(SignatureError::Mismatch)?;
    let provided = hex::decode(hex_part).map_err(|_| SignatureError::Mismatch)?;

    let expected = compute_mac(secret, timestamp, body)?;
    if expected.as_slice().ct_eq(provided.as_slice()).into() {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Computes the signature header value for a timestamp and body. Webhook
/// tests sign synthetic deliveries with this.
#[cfg(test)]
pub fn sign(secret: &[u8], timestamp: &str, body: &[u8]) -> String {
    let mac = compute_mac(secret, timestamp, body).expect("hmac accepts keys of any length");
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac))
}

fn compute_mac(secret: &[u8], timestamp: &str, body: &[u8]) -> Result<Vec<u8>, SignatureError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|_| SignatureError::Mismatch)?;
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-signing-secret";
    const BODY: &[u8] = br#"{"type":"event_callback"}"#;
    const TIMESTAMP: &str = "1712345678";

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_712_345_678, 0).expect("timestamp")
    }

    #[test]
    fn matches_precomputed_reference_signature() {
        // reference computed independently over the same secret/ts/body
        let reference = "v0=f417405e4e5f8c4c6d84c439a84804cd0b5950aa5d27a26abdb43111c72afbb4";
        assert_eq!(sign(SECRET, TIMESTAMP, BODY), reference);
        assert_eq!(
            verify(SECRET, Some(TIMESTAMP), Some(reference), BODY, now()),
            Ok(())
        );
    }

    #[test]
    fn rejects_missing_headers() {
        let signature = sign(SECRET, TIMESTAMP, BODY);
        assert_eq!(
            verify(SECRET, None, Some(&signature), BODY, now()),
            Err(SignatureError::MissingHeaders)
        );
        assert_eq!(
            verify(SECRET, Some(TIMESTAMP), None, BODY, now()),
            Err(SignatureError::MissingHeaders)
        );
        assert_eq!(
            verify(SECRET, Some(""), Some(&signature), BODY, now()),
            Err(SignatureError::MissingHeaders)
        );
    }

    #[test]
    fn rejects_timestamps_outside_replay_window() {
        let signature = sign(SECRET, TIMESTAMP, BODY);

        // 300 seconds old is the boundary and still accepted
        let at_boundary = DateTime::from_timestamp(1_712_345_678 + 300, 0).expect("timestamp");
        assert_eq!(
            verify(SECRET, Some(TIMESTAMP), Some(&signature), BODY, at_boundary),
            Ok(())
        );

        let one_past = DateTime::from_timestamp(1_712_345_678 + 301, 0).expect("timestamp");
        assert_eq!(
            verify(SECRET, Some(TIMESTAMP), Some(&signature), BODY, one_past),
            Err(SignatureError::Stale)
        );

        // a future timestamp outside the window is equally stale
        let future_ts = (1_712_345_678 + 301).to_string();
        let future_sig = sign(SECRET, &future_ts, BODY);
        assert_eq!(
            verify(SECRET, Some(&future_ts), Some(&future_sig), BODY, now()),
            Err(SignatureError::Stale)
        );

        assert_eq!(
            verify(SECRET, Some("not-a-number"), Some(&signature), BODY, now()),
            Err(SignatureError::Stale)
        );
    }

    #[test]
    fn rejects_any_flipped_hex_character() {
        let signature = sign(SECRET, TIMESTAMP, BODY);
        let hex_part = signature.strip_prefix("v0=").expect("prefix");

        // flipping the first, a middle, and the last character must all fail;
        // the comparison itself is constant-time so the position cannot matter
        for position in [0, hex_part.len() / 2, hex_part.len() - 1] {
            let mut flipped: Vec<char> = hex_part.chars().collect();
            flipped[position] = if flipped[position] == '0' { '1' } else { '0' };
            let tampered = format!("v0={}", flipped.into_iter().collect::<String>());
            assert_eq!(
                verify(SECRET, Some(TIMESTAMP), Some(&tampered), BODY, now()),
                Err(SignatureError::Mismatch),
                "flip at {position} must be rejected"
            );
        }
    }

    #[test]
    fn rejects_malformed_signature_values() {
        assert_eq!(
            verify(SECRET, Some(TIMESTAMP), Some("sha256=abcdef"), BODY, now()),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify(SECRET, Some(TIMESTAMP), Some("v0=not-hex"), BODY, now()),
            Err(SignatureError::Mismatch)
        );
        // truncated signature differs in length; the length gate rejects it
        assert_eq!(
            verify(SECRET, Some(TIMESTAMP), Some("v0=abcd"), BODY, now()),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_signature_for_different_body() {
        let signature = sign(SECRET, TIMESTAMP, BODY);
        assert_eq!(
            verify(
                SECRET,
                Some(TIMESTAMP),
                Some(&signature),
                br#"{"type":"tampered"}"#,
                now()
            ),
            Err(SignatureError::Mismatch)
        );
    }
}
