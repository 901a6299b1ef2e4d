//! Publishing connection

use super::acks::{AckTracker, PublishHandle};
use super::client::{ConnectionCore, DEFAULT_CONNECT_TIMEOUT};
use super::connection::ClientRole;
use super::network::{Connector, RumqttcConnector};
use crate::config::{ConfigError, MqttConfig};
use crate::error::{ConnectionError, MqttResult, ValidationError};
use crate::protocol::{qos_to_u8, sanitize_payload_for_logging, validate_publish_topic, Payload};
use rumqttc::QoS;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A connection that publishes validated payloads
#[derive(Debug)]
pub struct Publisher {
    core: ConnectionCore,
    acks: Arc<AckTracker>,
}

impl Publisher {
    /// Publisher over a real rumqttc session
    pub fn new(config: Arc<MqttConfig>) -> Result<Self, ConfigError> {
        let connector = Arc::new(RumqttcConnector::new(config.request_channel_capacity()));
        Self::with_connector(config, connector, None)
    }

    pub fn with_connector(
        config: Arc<MqttConfig>,
        connector: Arc<dyn Connector>,
        client_id: Option<String>,
    ) -> Result<Self, ConfigError> {
        let acks = Arc::new(AckTracker::new());
        let core = ConnectionCore::new(
            config,
            ClientRole::Publisher,
            client_id,
            connector,
            acks.clone(),
        )?;
        Ok(Self { core, acks })
    }

    pub fn core(&self) -> &ConnectionCore {
        &self.core
    }

    pub async fn connect(&self, timeout: Duration) -> Result<(), ConnectionError> {
        self.core.connect(timeout).await
    }

    pub async fn connect_default(&self) -> Result<(), ConnectionError> {
        self.core.connect(DEFAULT_CONNECT_TIMEOUT).await
    }

    pub async fn disconnect(&self) {
        self.core.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    /// Publishes awaiting acknowledgement
    pub fn pending_acks(&self) -> usize {
        self.acks.inflight()
    }

    /// Publish `payload` to `topic`.
    ///
    /// JSON payloads are serialized compactly before the size check; text and
    /// bytes pass through unchanged. `qos` defaults to the configured level.
    /// Returns once the request is queued; await [`PublishHandle::wait`] for
    /// the broker's acknowledgement.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Payload>,
        qos: Option<QoS>,
        retain: bool,
    ) -> MqttResult<PublishHandle> {
        let config = self.core.config();
        let network = self
            .core
            .connected_network()
            .ok_or_else(|| ValidationError::NotConnected {
                topic: topic.to_string(),
                broker: self.core.broker().to_string(),
                state: self.core.state(),
            })?;

        validate_publish_topic(topic)?;

        let bytes = payload
            .into()
            .into_bytes()
            .map_err(|e| ValidationError::Serialization {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        let max = config.max_payload_size();
        if bytes.len() > max {
            return Err(ValidationError::PayloadTooLarge {
                topic: topic.to_string(),
                size: bytes.len(),
                max,
            }
            .into());
        }

        let qos = qos.unwrap_or_else(|| config.qos());
        if config.log_payloads() {
            debug!(
                topic,
                qos = qos_to_u8(qos),
                retain,
                payload = %sanitize_payload_for_logging(&bytes, config.max_payload_log_length()),
                "Publishing message"
            );
        } else {
            debug!(
                topic,
                qos = qos_to_u8(qos),
                retain,
                size = bytes.len(),
                "Publishing message"
            );
        }

        let ack = self
            .acks
            .track(qos, || network.publish(topic, qos, retain, bytes))
            .await
            .map_err(|reason| ConnectionError::request(self.core.broker(), topic, reason))?;

        Ok(PublishHandle::new(
            topic.to_string(),
            qos,
            self.core.broker().to_string(),
            ack,
        ))
    }
}
