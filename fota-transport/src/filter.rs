//! MQTT topic-filter matching
//!
//! `+` matches exactly one level, `#` matches any remaining levels and is
//! only valid as the final segment.

/// Returns true when `topic` matches the subscription `filter`.
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
