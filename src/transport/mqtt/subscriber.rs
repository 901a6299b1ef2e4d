//! Subscribing connection

use super::client::{ConnectionCore, DEFAULT_CONNECT_TIMEOUT};
use super::connection::ClientRole;
use super::network::{Connector, RumqttcConnector};
use super::registry::{CallbackResult, Removal, SubscriptionHandle, SubscriptionRegistry};
use crate::config::{ConfigError, MqttConfig};
use crate::error::{ConnectionError, MqttResult};
use crate::protocol::{qos_to_u8, validate_subscription_pattern};
use rumqttc::QoS;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A connection that dispatches incoming messages to registered callbacks.
///
/// Registrations survive disconnects; every successful (re)connect
/// subscribes all registered patterns again.
#[derive(Debug)]
pub struct Subscriber {
    core: ConnectionCore,
    registry: Arc<SubscriptionRegistry>,
}

impl Subscriber {
    /// Subscriber over a real rumqttc session
    pub fn new(config: Arc<MqttConfig>) -> Result<Self, ConfigError> {
        let connector = Arc::new(RumqttcConnector::new(config.request_channel_capacity()));
        Self::with_connector(config, connector, None)
    }

    pub fn with_connector(
        config: Arc<MqttConfig>,
        connector: Arc<dyn Connector>,
        client_id: Option<String>,
    ) -> Result<Self, ConfigError> {
        let registry = Arc::new(SubscriptionRegistry::new(config.clone()));
        let core = ConnectionCore::new(
            config,
            ClientRole::Subscriber,
            client_id,
            connector,
            registry.clone(),
        )?;
        Ok(Self { core, registry })
    }

    pub fn core(&self) -> &ConnectionCore {
        &self.core
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
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

    /// Registered patterns, ordered
    pub fn subscriptions(&self) -> Vec<String> {
        self.registry
            .patterns()
            .into_iter()
            .map(|(pattern, _)| pattern)
            .collect()
    }

    /// Register `callback` for messages matching `pattern`.
    ///
    /// The callback is registered whatever the connection state. When
    /// connected the broker subscription is requested immediately; a failed
    /// request is logged and retried on the next reconnect.
    pub async fn subscribe<F>(
        &self,
        pattern: &str,
        callback: F,
        qos: Option<QoS>,
    ) -> MqttResult<SubscriptionHandle>
    where
        F: Fn(&str, &str) -> CallbackResult + Send + Sync + 'static,
    {
        validate_subscription_pattern(pattern)?;
        let qos = qos.unwrap_or_else(|| self.core.config().qos());
        let handle = self.registry.register(pattern, qos, Arc::new(callback));

        match self.core.connected_network() {
            Some(network) => {
                match network.subscribe(vec![(pattern.to_string(), qos)]).await {
                    Ok(()) => info!(pattern, qos = qos_to_u8(qos), "Subscribed"),
                    Err(reason) => warn!(
                        pattern,
                        broker = %self.core.broker(),
                        reason = %reason,
                        "Subscribe request failed, will retry on reconnect"
                    ),
                }
            }
            None => info!(
                pattern,
                qos = qos_to_u8(qos),
                "Registered subscription, will subscribe on connect"
            ),
        }
        Ok(handle)
    }

    /// Remove one callback (by handle) or all callbacks for `pattern`.
    /// Returns false when nothing was registered.
    pub async fn unsubscribe(&self, pattern: &str, handle: Option<&SubscriptionHandle>) -> bool {
        match self.registry.remove(pattern, handle) {
            Removal::Nothing => false,
            Removal::Callback => true,
            Removal::Pattern => {
                if let Some(network) = self.core.connected_network() {
                    match network.unsubscribe(pattern).await {
                        Ok(()) => info!(pattern, "Unsubscribed"),
                        Err(reason) => warn!(
                            pattern,
                            reason = %reason,
                            "Unsubscribe request failed"
                        ),
                    }
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqttSettings;
    use crate::testing::mocks::{MockBroker, NetworkCall};
    use crate::transport::mqtt::ConnectionState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn subscriber(broker: &MockBroker) -> Subscriber {
        let config = Arc::new(MqttConfig::new(MqttSettings::default()).unwrap());
        Subscriber::with_connector(config, broker.connector(), Some("sub-test".to_string()))
            .unwrap()
    }

    fn forwarder() -> (
        impl Fn(&str, &str) -> CallbackResult + Clone + Send + Sync + 'static,
        mpsc::UnboundedReceiver<(String, String)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback = move |topic: &str, payload: &str| -> CallbackResult {
            tx.send((topic.to_string(), payload.to_string()))?;
            Ok(())
        };
        (callback, rx)
    }

    #[tokio::test]
    async fn test_subscribe_while_disconnected_registers_only() {
        let broker = MockBroker::new();
        let subscriber = subscriber(&broker);
        let (callback, _rx) = forwarder();

        subscriber
            .subscribe("sensor/+/temperature", callback, None)
            .await
            .unwrap();
        assert_eq!(subscriber.subscriptions(), vec!["sensor/+/temperature"]);
        assert!(broker.subscribe_calls().is_empty());

        subscriber.connect_default().await.unwrap();
        assert_eq!(
            broker.subscribe_calls(),
            vec![vec![("sensor/+/temperature".to_string(), QoS::AtLeastOnce)]]
        );
    }

    #[tokio::test]
    async fn test_messages_dispatched_by_pattern() {
        let broker = MockBroker::new();
        let subscriber = subscriber(&broker);
        subscriber.connect_default().await.unwrap();
        let (callback, mut rx) = forwarder();

        subscriber
            .subscribe("sensor/+/temperature", callback, Some(QoS::ExactlyOnce))
            .await
            .unwrap();
        assert_eq!(broker.subscribe_count("sensor/+/temperature"), 1);

        assert_eq!(broker.deliver("sensor/room1/temperature", "21.5"), 1);
        assert_eq!(broker.deliver("sensor/room1/room2/temperature", "0"), 0);

        let (topic, payload) = rx.recv().await.unwrap();
        assert_eq!(topic, "sensor/room1/temperature");
        assert_eq!(payload, "21.5");
    }

    #[tokio::test]
    async fn test_wildcards_allowed_but_malformed_patterns_rejected() {
        let broker = MockBroker::new();
        let subscriber = subscriber(&broker);
        let (callback, _rx) = forwarder();

        for pattern in ["sensor/#", "+/status", "#"] {
            subscriber
                .subscribe(pattern, callback.clone(), None)
                .await
                .unwrap();
        }
        for pattern in ["", "sensor/#/x", "sensor/te+mp"] {
            assert!(subscriber
                .subscribe(pattern, callback.clone(), None)
                .await
                .is_err());
        }
    }

    #[tokio::test]
    async fn test_same_callback_twice_fires_twice() {
        let broker = MockBroker::new();
        let subscriber = subscriber(&broker);
        subscriber.connect_default().await.unwrap();
        let (callback, mut rx) = forwarder();

        subscriber
            .subscribe("alerts/#", callback.clone(), None)
            .await
            .unwrap();
        subscriber.subscribe("alerts/#", callback, None).await.unwrap();
        broker.deliver("alerts/fire", "!");

        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        assert_eq!(subscriber.registry().callback_count("alerts/#"), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_by_handle_then_all() {
        let broker = MockBroker::new();
        let subscriber = subscriber(&broker);
        subscriber.connect_default().await.unwrap();
        let (callback, _rx) = forwarder();

        let first = subscriber
            .subscribe("alerts/#", callback.clone(), None)
            .await
            .unwrap();
        subscriber.subscribe("alerts/#", callback, None).await.unwrap();

        assert!(subscriber.unsubscribe("alerts/#", Some(&first)).await);
        assert!(!broker
            .calls()
            .iter()
            .any(|call| matches!(call, NetworkCall::Unsubscribe { .. })));

        assert!(subscriber.unsubscribe("alerts/#", None).await);
        assert!(broker.calls().contains(&NetworkCall::Unsubscribe {
            client_id: "sub-test".to_string(),
            topic: "alerts/#".to_string(),
        }));
        assert!(!subscriber.unsubscribe("alerts/#", None).await);
        assert!(subscriber.subscriptions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_once_per_pattern_after_reconnect() {
        let broker = MockBroker::new();
        let subscriber = subscriber(&broker);
        let count = Arc::new(AtomicUsize::new(0));
        for pattern in ["sensor/+/temperature", "devices/#"] {
            let count = count.clone();
            subscriber
                .subscribe(
                    pattern,
                    move |_: &str, _: &str| -> CallbackResult {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    },
                    None,
                )
                .await
                .unwrap();
        }
        subscriber.connect_default().await.unwrap();
        assert_eq!(broker.subscribe_calls().len(), 1);

        let mut state = subscriber.core().watch_state();
        broker.drop_connection();
        state
            .wait_for(|s| matches!(s, ConnectionState::Reconnecting(_)))
            .await
            .unwrap();
        assert_eq!(broker.deliver("devices/d1/status", "lost"), 0);

        state.wait_for(|s| s.is_connected()).await.unwrap();
        assert_eq!(broker.subscribe_count("sensor/+/temperature"), 2);
        assert_eq!(broker.subscribe_count("devices/#"), 2);
        assert_eq!(broker.subscribe_calls().len(), 2);

        assert_eq!(broker.deliver("devices/d1/status", "back"), 1);
        subscriber.disconnect().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
