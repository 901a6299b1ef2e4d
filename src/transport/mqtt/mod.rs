//! MQTT connection implementation
//!
//! Pure decision logic is kept apart from the I/O so it can be tested
//! without a broker:
//!
//! - [`connection`] - connection state, identity, reconnect policy, rumqttc options
//! - [`tls`] - rustls client configuration from certificate files
//! - [`message_handler`] - translation of rumqttc events and incoming payload checks
//! - [`health_monitor`] - state transitions, reconnection decisions, health metrics
//! - [`network`] - the `Connector`/`NetworkClient`/`EventSource` seams
//! - [`client`] - [`ConnectionCore`], the impure lifecycle and network task
//! - [`publisher`], [`subscriber`] - the two connection roles
//!
//! # Usage
//!
//! ```rust,no_run
//! use elims_mqtt::config::{MqttConfig, MqttSettings};
//! use elims_mqtt::transport::mqtt::{Publisher, DEFAULT_CONNECT_TIMEOUT};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = Arc::new(MqttConfig::new(MqttSettings::new("broker.local", 1883))?);
//! let publisher = Publisher::new(config)?;
//! publisher.connect(DEFAULT_CONNECT_TIMEOUT).await?;
//! let handle = publisher
//!     .publish("devices/d1/telemetry", serde_json::json!({"t": 21.5}), None, false)
//!     .await?;
//! handle.wait().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod acks;
pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;
pub mod network;
pub mod publisher;
pub mod registry;
pub mod subscriber;
pub mod tls;

pub use acks::{PublishHandle, PublishReceipt};
pub use client::{ConnectionCore, EventHandler, NoopHandler, DEFAULT_CONNECT_TIMEOUT};
pub use connection::{ClientRole, ConnectionId, ConnectionState, ReconnectPolicy};
pub use health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision};
pub use message_handler::{DropReason, MessageHandler, NetworkEvent, NetworkFailure};
pub use network::{Connector, EventSource, NetworkClient, NetworkSession, RumqttcConnector};
pub use publisher::Publisher;
pub use registry::{
    message_callback, CallbackResult, MessageCallback, Removal, SubscriptionHandle,
    SubscriptionRegistry,
};
pub use subscriber::Subscriber;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a panicking holder poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
