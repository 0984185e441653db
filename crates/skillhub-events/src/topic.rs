//! Naming rules shared by both channels.

/// Derive the stream topic for an event type.
///
/// Dots become underscores, an underscore is inserted at every
/// lower-case/upper-case boundary, and the result is lower-cased:
/// `skill.created` → `skill_created`, `userProfileUpdated` → `user_profile_updated`.
#[must_use]
pub fn derive_topic(event_type: &str) -> String {
    let mut topic = String::with_capacity(event_type.len() + 4);
    let mut prev_lower = false;

    for ch in event_type.chars() {
        if ch == '.' {
            topic.push('_');
            prev_lower = false;
            continue;
        }
        if prev_lower && ch.is_uppercase() {
            topic.push('_');
        }
        prev_lower = ch.is_lowercase();
        topic.extend(ch.to_lowercase());
    }

    topic
}

/// Default queue name for a reliable subscription: `"{group}.{pattern}"`.
#[must_use]
pub fn default_queue_name(group_id: &str, pattern: &str) -> String {
    format!("{group_id}.{pattern}")
}

/// Topic-exchange matching: `*` matches exactly one segment, `#` zero or more.
#[must_use]
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    segments_match(&pattern, &key)
}

fn segments_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| segments_match(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && segments_match(rest, &key[1..]),
        Some((segment, rest)) => {
            key.first() == Some(segment) && segments_match(rest, &key[1..])
        }
    }
}
