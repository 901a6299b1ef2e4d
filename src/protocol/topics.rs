//! Topic validation and wildcard matching
//!
//! Publish topics are concrete names; subscription patterns may use the MQTT
//! wildcards `+` (exactly one level) and `#` (the remainder, including zero
//! levels, final level only).

use crate::error::ValidationError;

/// Maximum topic length in bytes (MQTT UTF-8 string length prefix is 16 bits)
pub const MAX_TOPIC_LENGTH: usize = 65535;

const SINGLE_LEVEL_WILDCARD: char = '+';
const MULTI_LEVEL_WILDCARD: char = '#';

/// Checks shared by publish topics and subscription patterns
pub fn validate_topic(topic: &str) -> Result<(), ValidationError> {
    if topic.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }

    if topic.len() > MAX_TOPIC_LENGTH {
        return Err(ValidationError::TopicTooLong {
            length: topic.len(),
            max: MAX_TOPIC_LENGTH,
        });
    }

    if topic.contains('\0') {
        return Err(ValidationError::NullCharacter {
            topic: topic.to_string(),
        });
    }

    Ok(())
}

/// A topic messages can be published to: valid and wildcard-free
pub fn validate_publish_topic(topic: &str) -> Result<(), ValidationError> {
    validate_topic(topic)?;

    if has_wildcards(topic) {
        return Err(ValidationError::WildcardNotAllowed {
            topic: topic.to_string(),
        });
    }

    Ok(())
}

/// A subscription filter: valid, with wildcards occupying whole levels
pub fn validate_subscription_pattern(pattern: &str) -> Result<(), ValidationError> {
    validate_topic(pattern)?;

    let levels: Vec<&str> = pattern.split('/').collect();
    let last = levels.len() - 1;

    for (index, level) in levels.iter().enumerate() {
        if level.contains(MULTI_LEVEL_WILDCARD) && (*level != "#" || index != last) {
            return Err(ValidationError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "'#' must occupy the whole final level".to_string(),
            });
        }
        if level.contains(SINGLE_LEVEL_WILDCARD) && *level != "+" {
            return Err(ValidationError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "'+' must occupy a whole level".to_string(),
            });
        }
    }

    Ok(())
}

pub fn has_wildcards(topic: &str) -> bool {
    topic.contains(SINGLE_LEVEL_WILDCARD) || topic.contains(MULTI_LEVEL_WILDCARD)
}

/// Match a concrete topic against a subscription pattern.
///
/// Topics starting with `$` are not matched by a leading wildcard.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (pattern.starts_with('+') || pattern.starts_with('#')) {
        return false;
    }

    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Device topic conventions shared by instruments and the services that talk to them
pub struct DeviceTopics;

impl DeviceTopics {
    pub fn telemetry(device_id: &str) -> String {
        format!("devices/{device_id}/telemetry")
    }

    /// Status topic, also the default LWT topic
    pub fn status(device_id: &str) -> String {
        format!("devices/{device_id}/status")
    }

    pub fn config(device_id: &str) -> String {
        format!("devices/{device_id}/config")
    }

    pub fn firmware(device_id: &str) -> String {
        format!("devices/{device_id}/firmware")
    }

    pub fn command(device_id: &str) -> String {
        format!("devices/{device_id}/command")
    }

    /// Pattern covering one topic kind across every device, e.g. `devices/+/telemetry`
    pub fn all(kind: &str) -> String {
        format!("devices/+/{kind}")
    }
}
