//! Content fingerprints (ETags).

use base64::{Engine, engine::general_purpose::STANDARD};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Compute a fingerprint for a response payload.
///
/// With `deterministic` set and a non-empty payload this is the base64
/// SHA-256 digest of the payload, so identical content always yields the same
/// tag. Otherwise a fresh random token is returned; empty payloads never share
/// a tag.
pub fn compute(payload: &[u8], deterministic: bool) -> String {
    if deterministic && !payload.is_empty() {
        let digest = Sha256::digest(payload);
        STANDARD.encode(digest)
    } else {
        Uuid::new_v4().to_string()
    }
}

/// Render a fingerprint as a strong entity tag header value.
pub fn quoted(fingerprint: &str) -> String {
    format!("\"{}\"", fingerprint.replace('"', ""))
}

/// Strip the weak prefix and quotes from an entity tag.
pub fn normalize(tag: &str) -> &str {
    let tag = tag.trim();
    let tag = tag.strip_prefix("W/").unwrap_or(tag);
    tag.trim_matches('"')
}

/// Whether any of the client's `If-None-Match` tags matches `fingerprint`.
pub fn matches_any<S: AsRef<str>>(if_none_match: &[S], fingerprint: &str) -> bool {
    let expected = normalize(fingerprint);
    if_none_match.iter().any(|tag| {
        let tag = normalize(tag.as_ref());
        tag == "*" || tag == expected
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_fingerprint_is_stable() {
        let first = compute(b"<rss>33</rss>", true);
        let second = compute(b"<rss>33</rss>", true);
        assert_eq!(first, second);
        assert_eq!(first.len(), 44);
    }

    #[test]
    fn deterministic_fingerprint_tracks_content() {
        assert_ne!(compute(b"<rss>33</rss>", true), compute(b"<rss>44</rss>", true));
    }

    #[test]
    fn random_fingerprint_differs_per_call() {
        assert_ne!(compute(b"same", false), compute(b"same", false));
    }

    #[test]
    fn empty_payload_falls_back_to_random() {
        let first = compute(b"", true);
        let second = compute(b"", true);
        assert_ne!(first, second);
        assert!(Uuid::parse_str(&first).is_ok());
    }

    #[test]
    fn quoted_strips_embedded_quotes() {
        assert_eq!(quoted("abc"), "\"abc\"");
        assert_eq!(quoted("a\"b"), "\"ab\"");
    }

    #[test]
    fn if_none_match_comparison() {
        assert!(matches_any(&["\"abc\""], "abc"));
        assert!(matches_any(&["W/\"abc\""], "abc"));
        assert!(matches_any(&["\"zzz\"", "*"], "abc"));
        assert!(!matches_any(&["\"abd\""], "abc"));
        assert!(!matches_any::<&str>(&[], "abc"));
    }
}
