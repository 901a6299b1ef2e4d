//! Pure connection state management for the MQTT client
//!
//! Connection states, identity, the reconnection policy and translation of a
//! validated [`MqttConfig`] into rumqttc [`MqttOptions`].

use super::tls::build_tls_configuration;
use crate::config::{ConfigError, MqttConfig, MQTT_MAX_PAYLOAD_SIZE};
use crate::protocol::MAX_TOPIC_LENGTH;
use rumqttc::{LastWill, MqttOptions, Transport};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle state of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting to retry after an unexpected loss (attempt number)
    Reconnecting(u32),
    Disconnecting,
    /// Broker rejection or reconnection exhausted; terminal until `connect()`
    Failed(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting(_) => "reconnecting",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Reconnecting(attempt) => write!(f, "reconnecting (attempt {attempt})"),
            ConnectionState::Failed(reason) => write!(f, "failed: {reason}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Which specialization a connection serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientRole {
    Publisher,
    Subscriber,
}

impl ClientRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientRole::Publisher => "publisher",
            ClientRole::Subscriber => "subscriber",
        }
    }
}

impl fmt::Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a connection instance, used for pool membership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Linear reconnection policy: a fixed delay before every attempt
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub delay: Duration,
    /// Maximum reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    pub fn from_config(config: &MqttConfig) -> Self {
        Self {
            enabled: config.reconnect_on_failure(),
            delay: config.reconnect_delay(),
            max_attempts: config.max_reconnect_attempts(),
        }
    }

    pub fn delay_for_attempt(&self, _attempt: u32) -> Duration {
        self.delay
    }

    /// Total waiting time across all attempts; None if unlimited
    pub fn calculate_max_total_time(&self) -> Option<Duration> {
        self.max_attempts
            .map(|max| (1..=max).map(|attempt| self.delay_for_attempt(attempt)).sum())
    }
}

/// Client id used on the wire: explicit override, configured id, or generated
pub fn resolve_client_id(config: &MqttConfig, role: ClientRole, explicit: Option<String>) -> String {
    explicit
        .or_else(|| config.client_id().map(str::to_string))
        .unwrap_or_else(|| {
            let suffix = Uuid::new_v4().simple().to_string();
            format!("elims-{}-{}-{}", config.client_type(), role, &suffix[..8])
        })
}

/// Fixed header plus topic length prefix and packet id
const PACKET_OVERHEAD: usize = 16;

/// Build rumqttc options (auth, TLS, LWT, limits) from a validated config.
///
/// TLS material is read here, so missing or malformed files surface when the
/// connection is constructed rather than on first connect.
pub fn configure_mqtt_options(
    config: &MqttConfig,
    client_id: &str,
) -> Result<MqttOptions, ConfigError> {
    let mut options = MqttOptions::new(client_id, config.broker_host(), config.broker_port());
    options.set_keep_alive(config.keepalive());
    options.set_clean_session(config.clean_session());

    if let (Some(username), Some(password)) = (config.username(), config.password()) {
        options.set_credentials(username, password.expose());
    } else if let Some(username) = config.username() {
        options.set_credentials(username, "");
    }

    if let Some(tls) = build_tls_configuration(config)? {
        options.set_transport(Transport::tls_with_config(tls));
    }

    if let Some(will) = config.last_will() {
        options.set_last_will(LastWill::new(
            will.topic.clone(),
            will.payload.clone(),
            will.qos,
            will.retain,
        ));
    }

    // Incoming limit stays at the protocol maximum so oversized messages reach
    // the dispatcher, which drops them with a warning.
    let outgoing = config
        .max_payload_size()
        .saturating_add(MAX_TOPIC_LENGTH + PACKET_OVERHEAD)
        .min(MQTT_MAX_PAYLOAD_SIZE);
    options.set_max_packet_size(MQTT_MAX_PAYLOAD_SIZE, outgoing);

    Ok(options)
}
