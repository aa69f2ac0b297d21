/// Well-known key of the single queue document.
pub const QUEUE_STATE_KEY: &str = "queue.json";

/// Join an optional object prefix and a key with a single `/`.
pub fn prefixed_key(prefix: Option<&str>, key: &str) -> String {
    match prefix.map(|p| p.trim_matches('/')) {
        Some(p) if !p.is_empty() => format!("{}/{}", p, key.trim_start_matches('/')),
        _ => key.trim_start_matches('/').to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_joining() {
        assert_eq!(prefixed_key(None, QUEUE_STATE_KEY), "queue.json");
        assert_eq!(prefixed_key(Some(""), "queue.json"), "queue.json");
        assert_eq!(prefixed_key(Some("prod/"), "queue.json"), "prod/queue.json");
        assert_eq!(prefixed_key(Some("/a/b/"), "/queue.json"), "a/b/queue.json");
    }
}
