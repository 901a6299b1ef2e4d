//! Transport layer
//!
//! The MQTT implementation lives in [`mqtt`]; [`ManagedConnection`] is the
//! abstraction the connection pool manages, implemented by both roles.

use crate::config::MqttConfig;
use crate::error::MqttResult;
use std::sync::Arc;

pub mod mqtt;

use mqtt::{ClientRole, ConnectionCore, Connector, Publisher, Subscriber};

/// A connection role the pool can create, health-check and dispose of
pub trait ManagedConnection: Send + Sync + Sized + 'static {
    const ROLE: ClientRole;

    fn create(
        config: Arc<MqttConfig>,
        connector: Arc<dyn Connector>,
        client_id: Option<String>,
    ) -> MqttResult<Self>;

    fn core(&self) -> &ConnectionCore;
}

impl ManagedConnection for Publisher {
    const ROLE: ClientRole = ClientRole::Publisher;

    fn create(
        config: Arc<MqttConfig>,
        connector: Arc<dyn Connector>,
        client_id: Option<String>,
    ) -> MqttResult<Self> {
        Ok(Publisher::with_connector(config, connector, client_id)?)
    }

    fn core(&self) -> &ConnectionCore {
        Publisher::core(self)
    }
}

impl ManagedConnection for Subscriber {
    const ROLE: ClientRole = ClientRole::Subscriber;

    fn create(
        config: Arc<MqttConfig>,
        connector: Arc<dyn Connector>,
        client_id: Option<String>,
    ) -> MqttResult<Self> {
        Ok(Subscriber::with_connector(config, connector, client_id)?)
    }

    fn core(&self) -> &ConnectionCore {
        Subscriber::core(self)
    }
}
