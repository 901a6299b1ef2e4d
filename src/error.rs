//! Error taxonomy for the ELIMS MQTT client
//!
//! Four families of errors, each mapped to what the caller can do about it:
//! - [`ConfigError`]: invalid settings, fix the input and rebuild the client
//! - [`ConnectionError`]: broker/network/pool trouble, the caller may retry
//! - [`ValidationError`]: bad topic or payload, the caller must fix the input
//! - [`CallbackError`]: a subscriber callback failed; contained and logged
//!
//! [`MqttError`] wraps all of them for APIs that can fail in more than one way.

pub use crate::config::ConfigError;
use crate::protocol::ReturnCode;
use crate::transport::mqtt::ConnectionState;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use thiserror::Error;

/// Connection-level failures. The caller may retry.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection to {broker} timed out after {timeout:?} waiting for CONNACK")]
    Timeout { broker: String, timeout: Duration },

    #[error("Connection to {broker} refused: {code} (return code {})", code.as_u8())]
    Rejected { broker: String, code: ReturnCode },

    #[error("Network error on connection to {broker}: {reason}")]
    Network { broker: String, reason: String },

    #[error("Connect to {broker} aborted by disconnect")]
    Aborted { broker: String },

    #[error("Security policy violation for {broker}: {reason}")]
    SecurityPolicy { broker: String, reason: String },

    #[error("Request to {broker} failed for topic {topic}: {reason}")]
    Request {
        broker: String,
        topic: String,
        reason: String,
    },

    #[error("Acknowledgement for {topic} (qos {qos}) lost: connection to {broker} closed")]
    AckLost {
        broker: String,
        topic: String,
        qos: u8,
    },

    #[error("No connection available and pool is full ({max_size})")]
    PoolFull { max_size: usize },

    #[error("Timeout waiting for connection from pool ({timeout:?})")]
    CheckoutTimeout { timeout: Duration },

    #[error("Connection pool is closed")]
    PoolClosed,
}

impl ConnectionError {
    /// Network error with the reason sanitized for logging
    pub fn network<B: Into<String>, R: AsRef<str>>(broker: B, reason: R) -> Self {
        Self::Network {
            broker: broker.into(),
            reason: sanitize_error_message(reason.as_ref()),
        }
    }

    /// Failed publish/subscribe/unsubscribe request
    pub fn request<B, T, R>(broker: B, topic: T, reason: R) -> Self
    where
        B: Into<String>,
        T: Into<String>,
        R: AsRef<str>,
    {
        Self::Request {
            broker: broker.into(),
            topic: topic.into(),
            reason: sanitize_error_message(reason.as_ref()),
        }
    }

    pub fn security_policy<B: Into<String>, R: Into<String>>(broker: B, reason: R) -> Self {
        Self::SecurityPolicy {
            broker: broker.into(),
            reason: reason.into(),
        }
    }

    /// Broker-reported return code, when the failure was a rejection
    pub fn return_code(&self) -> Option<ReturnCode> {
        match self {
            Self::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Caller input errors: bad topics, oversized payloads, misuse of the pool
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Invalid topic: empty topic")]
    EmptyTopic,

    #[error("Invalid topic: length {length} exceeds maximum {max} bytes")]
    TopicTooLong { length: usize, max: usize },

    #[error("Invalid topic {topic:?}: contains null character")]
    NullCharacter { topic: String },

    #[error("Invalid publish topic {topic}: wildcards (+ or #) are only allowed in subscriptions")]
    WildcardNotAllowed { topic: String },

    #[error("Invalid subscription pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Payload for {topic} is {size} bytes, exceeding the maximum of {max}")]
    PayloadTooLarge {
        topic: String,
        size: usize,
        max: usize,
    },

    #[error("Payload for {topic} could not be serialized: {reason}")]
    Serialization { topic: String, reason: String },

    #[error("Cannot publish to {topic}: not connected to {broker} (state: {state})")]
    NotConnected {
        topic: String,
        broker: String,
        state: ConnectionState,
    },

    #[error("Invalid QoS level {0}, expected 0, 1 or 2")]
    InvalidQos(u8),

    #[error("Connection {id} does not belong to this pool")]
    ForeignConnection { id: String },

    #[error("Connection {id} is not checked out of this pool")]
    NotCheckedOut { id: String },

    #[error("pool_size must be >= 1, got {0}")]
    InvalidPoolSize(usize),
}

/// A subscriber callback failed. Never propagated to the network loop.
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("Callback for pattern {pattern} failed on topic {topic}: {reason}")]
    Failed {
        pattern: String,
        topic: String,
        reason: String,
    },

    #[error("Callback for pattern {pattern} panicked on topic {topic}: {reason}")]
    Panicked {
        pattern: String,
        topic: String,
        reason: String,
    },
}

/// Umbrella error for operations that can fail in more than one family
#[derive(Debug, Error)]
pub enum MqttError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Callback(#[from] CallbackError),
}

impl MqttError {
    /// Connection failures are transient; everything else needs new input
    pub fn is_retryable(&self) -> bool {
        matches!(self, MqttError::Connection(_))
    }

    pub fn as_connection(&self) -> Option<&ConnectionError> {
        match self {
            MqttError::Connection(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            MqttError::Validation(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for MQTT client operations
pub type MqttResult<T> = Result<T, MqttError>;

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|token|key|secret)[=:]\s*\S+").expect("valid secret regex")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|private|\.ssh)/[a-zA-Z0-9._/-]+")
        .expect("valid path regex")
});

const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Redact credentials and sensitive key paths from error text before it is logged
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_ERROR_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}
