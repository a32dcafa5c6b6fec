//! KEYS command and glob pattern matching
//!
//! Supports glob-style patterns: * ? [abc] [^abc] [a-z]

use crate::protocol::Frame;
use crate::storage::Store;

/// KEYS pattern: all live keys matching a glob pattern.
///
/// Lazily expired keys are never returned.
pub fn keys(store: &Store, pattern: &str) -> Frame {
    let matched: Vec<Frame> = store
        .keys()
        .into_iter()
        .filter(|key| glob_match(pattern.as_bytes(), key))
        .map(|key| Frame::Bulk(Some(key)))
        .collect();

    Frame::Array(Some(matched))
}

/// Glob-style pattern matching over raw bytes
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let mut p = 0;
    let mut t = 0;
    let mut star_p = None;
    let mut star_t = 0;

    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                b'*' => {
                    star_p = Some(p);
                    star_t = t;
                    p += 1;
                    continue;
                }
                b'?' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                b'[' => {
                    if let Some((matches, consumed)) = match_char_class(&pattern[p..], text[t]) {
                        if matches {
                            p += consumed;
                            t += 1;
                            continue;
                        }
                    }
                }
                b'\\' if p + 1 < pattern.len() => {
                    if pattern[p + 1] == text[t] {
                        p += 2;
                        t += 1;
                        continue;
                    }
                }
                c => {
                    if c == text[t] {
                        p += 1;
                        t += 1;
                        continue;
                    }
                }
            }
        }

        // No match here: backtrack to the last *
        if let Some(sp) = star_p {
            p = sp + 1;
            star_t += 1;
            t = star_t;
        } else {
            return false;
        }
    }

    // Remaining pattern may only be *
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }

    p == pattern.len()
}

/// Match a character class like [abc], [^abc], [a-z].
/// Returns (matched, bytes_consumed), or None for an unclosed bracket.
fn match_char_class(pattern: &[u8], ch: u8) -> Option<(bool, usize)> {
    if pattern.is_empty() || pattern[0] != b'[' {
        return None;
    }

    let mut i = 1;
    let negate = if i < pattern.len() && pattern[i] == b'^' {
        i += 1;
        true
    } else {
        false
    };

    let mut matched = false;
    let mut prev_char = None;

    while i < pattern.len() && pattern[i] != b']' {
        if pattern[i] == b'-'
            && prev_char.is_some()
            && i + 1 < pattern.len()
            && pattern[i + 1] != b']'
        {
            // Range like a-z
            let start = prev_char.unwrap_or_default();
            let end = pattern[i + 1];
            if ch >= start && ch <= end {
                matched = true;
            }
            i += 2;
            prev_char = None;
        } else {
            if pattern[i] == ch {
                matched = true;
            }
            prev_char = Some(pattern[i]);
            i += 1;
        }
    }

    if i < pattern.len() && pattern[i] == b']' {
        Some((if negate { !matched } else { matched }, i + 1))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::{Duration, SystemTime};

    use crate::storage::Value;

    fn matches(pattern: &str, text: &str) -> bool {
        glob_match(pattern.as_bytes(), text.as_bytes())
    }

    #[test]
    fn test_glob_match() {
        assert!(matches("*", "anything"));
        assert!(matches("foo*", "foobar"));
        assert!(matches("*bar", "foobar"));
        assert!(matches("f?o", "foo"));
        assert!(matches("f*o*bar", "fooooobar"));
        assert!(!matches("foo", "bar"));
        assert!(!matches("foo?", "foo"));
        assert!(matches("", ""));
        assert!(!matches("", "x"));
    }

    #[test]
    fn test_glob_char_classes() {
        assert!(matches("h[ae]llo", "hello"));
        assert!(matches("h[ae]llo", "hallo"));
        assert!(!matches("h[ae]llo", "hillo"));
        assert!(matches("h[^e]llo", "hallo"));
        assert!(!matches("h[^e]llo", "hello"));
        assert!(matches("key[0-9]", "key5"));
        assert!(!matches("key[0-9]", "keyx"));
    }

    #[test]
    fn test_glob_escape() {
        assert!(matches("a\\*b", "a*b"));
        assert!(!matches("a\\*b", "axb"));
    }

    #[test]
    fn test_keys_filters_pattern_and_expiry() {
        let store = Store::new();
        store.set(Bytes::from("user:1"), Value::String(Bytes::from("a")), None);
        store.set(Bytes::from("user:2"), Value::String(Bytes::from("b")), None);
        store.set(Bytes::from("other"), Value::String(Bytes::from("c")), None);
        store.set(
            Bytes::from("user:3"),
            Value::String(Bytes::from("d")),
            Some(SystemTime::now() - Duration::from_millis(5)),
        );

        let reply = keys(&store, "user:*");
        let arr = reply.as_array().unwrap();
        let mut found: Vec<&str> = arr.iter().filter_map(|f| f.as_str()).collect();
        found.sort_unstable();
        assert_eq!(found, vec!["user:1", "user:2"]);
    }
}
