//! MQTT protocol helpers: topics, return codes, payloads

pub mod codes;
pub mod payload;
pub mod topics;

pub use codes::{qos_from_u8, qos_to_u8, ReturnCode};
pub use payload::{sanitize_payload_for_logging, Payload};
pub use topics::{
    has_wildcards, topic_matches, validate_publish_topic, validate_subscription_pattern,
    validate_topic, DeviceTopics, MAX_TOPIC_LENGTH,
};
