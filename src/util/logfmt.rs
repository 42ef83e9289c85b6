//! Formatting helpers for wire traffic in logs.

/// Bodies longer than this are abbreviated in logs.
pub const LOG_BODY_LIMIT: usize = 1000;

const LOG_EDGE: usize = LOG_BODY_LIMIT / 2;

/// Abbreviate a long log body to its first and last 500 characters.
#[must_use]
pub fn abbreviate(body: &str) -> String {
    let count = body.chars().count();
    if count <= LOG_BODY_LIMIT {
        return body.to_string();
    }
    let head: String = body.chars().take(LOG_EDGE).collect();
    let tail: String = body.chars().skip(count - LOG_EDGE).collect();
    format!("{head} ... {tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_bodies_are_untouched() {
        assert_eq!(abbreviate("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn long_bodies_keep_both_edges() {
        let body = format!("{}{}", "a".repeat(600), "b".repeat(600));
        let out = abbreviate(&body);
        assert!(out.starts_with(&"a".repeat(500)));
        assert!(out.ends_with(&"b".repeat(500)));
        assert!(out.contains(" ... "));
        assert_eq!(out.chars().count(), 1000 + " ... ".len());
    }
}
