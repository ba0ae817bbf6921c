use thiserror::Error;

/// Separator between topic segments.
pub const SEPARATOR: char = '/';

/// Wildcard matching exactly one segment.
pub const SINGLE_LEVEL_WILDCARD: &str = "+";

/// Wildcard matching every remaining segment (last segment only).
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// Errors produced when validating topics and patterns.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    /// The topic is empty.
    #[error("topic must not be empty")]
    Empty,

    /// The topic contains an empty segment (`a//b`, leading or trailing `/`).
    #[error("topic `{0}` contains an empty segment")]
    EmptySegment(String),

    /// A concrete topic contains a wildcard.
    #[error("topic `{0}` contains a wildcard")]
    Wildcard(String),

    /// A pattern uses `#` somewhere other than its last segment, or mixes a
    /// wildcard with other characters in one segment.
    #[error("pattern `{0}` uses a wildcard incorrectly")]
    MisplacedWildcard(String),

    /// The value is not a single topic segment.
    #[error("`{0}` is not a single topic segment")]
    InvalidSegment(String),
}

fn has_wildcard(segment: &str) -> bool {
    segment.contains(['+', '#'])
}

/// Validate a concrete topic that may be published to.
///
/// # Errors
///
/// Returns an error if the topic is empty, has empty segments or contains a
/// wildcard.
pub fn validate_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }

    for segment in topic.split(SEPARATOR) {
        if segment.is_empty() {
            return Err(TopicError::EmptySegment(topic.to_string()));
        }
        if has_wildcard(segment) {
            return Err(TopicError::Wildcard(topic.to_string()));
        }
    }

    Ok(())
}

/// Validate a subscription pattern.
///
/// # Errors
///
/// Returns an error if the pattern is empty, has empty segments or places a
/// wildcard incorrectly.
pub fn validate_pattern(pattern: &str) -> Result<(), TopicError> {
    if pattern.is_empty() {
        return Err(TopicError::Empty);
    }

    let segments: Vec<&str> = pattern.split(SEPARATOR).collect();
    let last = segments.len() - 1;

    for (index, segment) in segments.iter().enumerate() {
        match *segment {
            "" => return Err(TopicError::EmptySegment(pattern.to_string())),
            SINGLE_LEVEL_WILDCARD => {}
            MULTI_LEVEL_WILDCARD if index == last => {}
            s if has_wildcard(s) => {
                return Err(TopicError::MisplacedWildcard(pattern.to_string()));
            }
            _ => {}
        }
    }

    Ok(())
}

/// Validate a value used as one topic segment (service names, request kinds,
/// correlation ids).
///
/// # Errors
///
/// Returns an error if the value is empty or contains `/`, `+` or `#`.
pub fn validate_segment(segment: &str) -> Result<(), TopicError> {
    if segment.is_empty() {
        return Err(TopicError::Empty);
    }
    if segment.contains(SEPARATOR) || has_wildcard(segment) {
        return Err(TopicError::InvalidSegment(segment.to_string()));
    }
    Ok(())
}

/// Whether `topic` is selected by `pattern`.
#[must_use]
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_segments = pattern.split(SEPARATOR);
    let mut topic_segments = topic.split(SEPARATOR);

    loop {
        match (pattern_segments.next(), topic_segments.next()) {
            (Some(MULTI_LEVEL_WILDCARD), _) | (None, None) => return true,
            (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            _ => return false,
        }
    }
}

/// Join segments into a topic, skipping empty ones.
///
/// An empty topic prefix therefore disappears: `join(["", "diskd"])` is
/// `"diskd"`.
pub fn join<I, S>(segments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut topic = String::new();
    for segment in segments {
        let segment = segment.as_ref();
        if segment.is_empty() {
            continue;
        }
        if !topic.is_empty() {
            topic.push(SEPARATOR);
        }
        topic.push_str(segment);
    }
    topic
}
