//! ELIMS MQTT client
//!
//! A publish/subscribe client over MQTT v3.1.1 for laboratory devices,
//! built on rumqttc.
//!
//! # Overview
//!
//! - [`config`] - validated connection settings (broker, credentials, TLS, LWT, reconnect policy)
//! - [`protocol`] - topic validation, wildcard matching, payloads, CONNACK codes
//! - [`transport::mqtt`] - the connection core and its two roles, [`Publisher`] and [`Subscriber`]
//! - [`pool`] - bounded pools of reusable connections
//! - [`observability`] - structured logging setup
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use elims_mqtt::{MqttConfig, MqttSettings, PoolSettings, PublisherPool};
//! use elims_mqtt::protocol::DeviceTopics;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = Arc::new(MqttConfig::new(MqttSettings::new("localhost", 1883))?);
//! let pool = PublisherPool::new(config, PoolSettings::default())?;
//!
//! pool.with_connection(|publisher| async move {
//!     publisher
//!         .publish(&DeviceTopics::telemetry("fridge-01"), json!({"temperature": 4.2}), None, false)
//!         .await?;
//!     Ok::<_, elims_mqtt::MqttError>(())
//! })
//! .await?;
//!
//! pool.close_all().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod pool;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, MqttConfig, MqttSettings, Secret, TlsVersion};
pub use error::{CallbackError, ConnectionError, MqttError, MqttResult, ValidationError};
pub use pool::{ConnectionPool, PoolSettings, PublisherPool, SubscriberPool};
pub use rumqttc::QoS;
pub use transport::mqtt::{
    ConnectionState, PublishHandle, PublishReceipt, Publisher, Subscriber, SubscriptionHandle,
};
pub use transport::ManagedConnection;
