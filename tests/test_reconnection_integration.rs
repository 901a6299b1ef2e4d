//! Reconnection behaviour across broker outages
//!
//! Runs on a paused clock so reconnect delays elapse instantly.

use elims_mqtt::testing::{ConnAckBehavior, MockBroker};
use elims_mqtt::{
    ConnectionState, MqttConfig, MqttError, MqttSettings, Publisher, Subscriber, ValidationError,
};
use std::sync::Arc;
use tokio::sync::mpsc;

fn config(client_id: &str, max_reconnect_attempts: Option<u32>) -> Arc<MqttConfig> {
    let mut settings = MqttSettings::default();
    settings.client_id = Some(client_id.to_string());
    settings.reconnect_delay_secs = 1;
    settings.max_reconnect_attempts = max_reconnect_attempts;
    Arc::new(MqttConfig::new(settings).unwrap())
}

/// Subscriber whose callbacks forward received topics; callbacks run on the
/// network task, so tests wait on the channel rather than reading shared state
async fn forwarding_subscriber(
    broker: &MockBroker,
    patterns: &[&str],
) -> (Subscriber, mpsc::UnboundedReceiver<String>) {
    let subscriber =
        Subscriber::with_connector(config("reconnect-sub", None), broker.connector(), None)
            .unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    for pattern in patterns {
        let tx = tx.clone();
        subscriber
            .subscribe(
                pattern,
                move |topic: &str, _: &str| {
                    tx.send(topic.to_string())?;
                    Ok(())
                },
                None,
            )
            .await
            .unwrap();
    }
    (subscriber, rx)
}

#[tokio::test(start_paused = true)]
async fn test_repeated_outages_resubscribe_each_pattern_once() {
    let broker = MockBroker::new();
    let patterns = ["lab/+/temperature", "lab/+/humidity", "alerts/#"];
    let (subscriber, mut received) = forwarding_subscriber(&broker, &patterns).await;
    subscriber.connect_default().await.unwrap();

    let mut state = subscriber.core().watch_state();
    for outage in 1..=3 {
        broker.drop_connection();
        state
            .wait_for(|s| matches!(s, ConnectionState::Reconnecting(_)))
            .await
            .unwrap();
        state.wait_for(|s| s.is_connected()).await.unwrap();

        for pattern in patterns {
            assert_eq!(broker.subscribe_count(pattern), outage + 1);
        }
        assert_eq!(subscriber.core().health_metrics().reconnect_count, outage as u32);
    }

    assert_eq!(broker.deliver("lab/incubator-3/temperature", "37.0"), 1);
    assert_eq!(broker.deliver("alerts/door/open", "true"), 1);
    assert_eq!(
        received.recv().await.as_deref(),
        Some("lab/incubator-3/temperature")
    );
    assert_eq!(received.recv().await.as_deref(), Some("alerts/door/open"));
    assert_eq!(subscriber.subscriptions().len(), 3);

    subscriber.disconnect().await;
    assert!(received.try_recv().is_err());
    assert_eq!(subscriber.core().state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_publish_during_outage_is_rejected_then_recovers() {
    let broker = MockBroker::new();
    let publisher =
        Publisher::with_connector(config("reconnect-pub", None), broker.connector(), None)
            .unwrap();
    publisher.connect_default().await.unwrap();

    let mut state = publisher.core().watch_state();
    broker.set_connack(ConnAckBehavior::Unreachable);
    broker.drop_connection();
    state
        .wait_for(|s| matches!(s, ConnectionState::Reconnecting(_)))
        .await
        .unwrap();

    let err = publisher
        .publish("lab/fridge-1/temperature", "4.1", None, false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MqttError::Validation(ValidationError::NotConnected { .. })
    ));

    broker.set_connack(ConnAckBehavior::Accept {
        session_present: false,
    });
    state.wait_for(|s| s.is_connected()).await.unwrap();

    let receipt = publisher
        .publish("lab/fridge-1/temperature", "4.0", None, false)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(receipt.topic, "lab/fridge-1/temperature");
    assert_eq!(broker.published().len(), 1);

    publisher.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_reconnection_recovers_with_explicit_connect() {
    let broker = MockBroker::new();
    let subscriber =
        Subscriber::with_connector(config("exhaust-sub", Some(3)), broker.connector(), None)
            .unwrap();
    subscriber
        .subscribe("lab/#", |_: &str, _: &str| Ok(()), None)
        .await
        .unwrap();
    subscriber.connect_default().await.unwrap();

    let mut state = subscriber.core().watch_state();
    broker.set_connack(ConnAckBehavior::Unreachable);
    broker.drop_connection();
    state
        .wait_for(|s| matches!(s, ConnectionState::Failed(_)))
        .await
        .unwrap();
    assert!(subscriber
        .core()
        .last_error()
        .unwrap()
        .contains("after 3 attempts"));
    assert_eq!(broker.deliver("lab/door", "open"), 0);

    broker.set_connack(ConnAckBehavior::Accept {
        session_present: false,
    });
    subscriber.connect_default().await.unwrap();

    assert!(subscriber.is_connected());
    assert_eq!(broker.subscribe_count("lab/#"), 2);
    assert_eq!(broker.deliver("lab/door", "open"), 1);

    subscriber.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnection_disabled_fails_on_loss() {
    let broker = MockBroker::new();
    let mut settings = MqttSettings::default();
    settings.reconnect_on_failure = false;
    let publisher = Publisher::with_connector(
        Arc::new(MqttConfig::new(settings).unwrap()),
        broker.connector(),
        None,
    )
    .unwrap();
    publisher.connect_default().await.unwrap();

    let mut state = publisher.core().watch_state();
    broker.drop_connection();
    state
        .wait_for(|s| matches!(s, ConnectionState::Failed(_)))
        .await
        .unwrap();

    assert_eq!(broker.sessions_opened(), 1);
    assert_eq!(publisher.core().health_metrics().reconnect_count, 0);
    assert!(!publisher.core().health_metrics().is_healthy);
}
