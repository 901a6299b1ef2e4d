//! Connection pool behaviour against the in-memory broker
//!
//! Covers checkout/return bookkeeping, capacity under arbitrary sequences of
//! operations, and end-to-end delivery from a publisher pool to a subscriber.

use elims_mqtt::testing::{ConnAckBehavior, MockBroker};
use elims_mqtt::transport::mqtt::Subscriber;
use elims_mqtt::{
    ConnectionError, MqttConfig, MqttError, MqttSettings, PoolSettings, Publisher, PublisherPool,
    QoS, SubscriberPool,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn config(client_id: &str) -> Arc<MqttConfig> {
    let mut settings = MqttSettings::default();
    settings.client_id = Some(client_id.to_string());
    Arc::new(MqttConfig::new(settings).unwrap())
}

fn publisher_pool(broker: &MockBroker, max_size: usize) -> PublisherPool {
    PublisherPool::with_connector(
        config("pool-it"),
        PoolSettings {
            max_size,
            connection_timeout: Duration::from_secs(2),
            checkout_timeout: Duration::from_secs(1),
        },
        broker.connector(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_two_checkouts_then_pool_is_full_until_return() {
    let broker = MockBroker::new();
    let pool = publisher_pool(&broker, 2);

    let a = pool.get_connection(false).await.unwrap();
    let b = pool.get_connection(false).await.unwrap();
    assert_ne!(a.core().id(), b.core().id());

    let err = pool.get_connection(false).await.unwrap_err();
    assert!(matches!(
        err,
        MqttError::Connection(ConnectionError::PoolFull { max_size: 2 })
    ));
    assert!(err.is_retryable());

    pool.return_connection(b).await.unwrap();
    let c = pool.get_connection(false).await.unwrap();
    assert!(c.is_connected());
    assert_eq!(pool.size(), 2);
}

#[tokio::test]
async fn test_publisher_pool_delivers_to_subscriber() {
    let broker = MockBroker::new();
    let pool = publisher_pool(&broker, 3);

    let subscriber =
        Subscriber::with_connector(config("lims-ingest"), broker.connector(), None).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    subscriber
        .subscribe(
            "devices/+/telemetry",
            move |topic: &str, payload: &str| {
                tx.send((topic.to_string(), payload.to_string()))?;
                Ok(())
            },
            Some(QoS::AtLeastOnce),
        )
        .await
        .unwrap();
    subscriber.connect_default().await.unwrap();

    for device in ["fridge-01", "incubator-02"] {
        pool.with_connection(|publisher: Arc<Publisher>| async move {
            publisher
                .publish(
                    &format!("devices/{device}/telemetry"),
                    serde_json::json!({"temperature": 4.2}),
                    None,
                    false,
                )
                .await?
                .wait()
                .await?;
            Ok::<_, MqttError>(())
        })
        .await
        .unwrap();
    }

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(first.0, "devices/fridge-01/telemetry");
    assert_eq!(second.0, "devices/incubator-02/telemetry");
    assert_eq!(second.1, r#"{"temperature":4.2}"#);

    // Sequential use reuses one member
    assert_eq!(pool.size(), 1);

    subscriber.disconnect().await;
    pool.close_all().await;
}

#[tokio::test]
async fn test_concurrent_checkouts_never_exceed_capacity() {
    let broker = MockBroker::new();
    let pool = Arc::new(publisher_pool(&broker, 3));

    let mut tasks = Vec::new();
    for i in 0..12 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            pool.with_connection(|publisher| async move {
                publisher
                    .publish("devices/d1/telemetry", format!("{i}"), None, false)
                    .await?;
                tokio::task::yield_now().await;
                Ok::<_, MqttError>(())
            })
            .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert!(pool.size() <= 3);
    assert_eq!(pool.available(), pool.size());
    assert_eq!(broker.published().len(), 12);
    assert!(broker.sessions_opened() <= 3);
}

#[tokio::test]
async fn test_subscriber_pool_members_keep_their_own_subscriptions() {
    let broker = MockBroker::new();
    let pool = SubscriberPool::with_connector(
        config("sub-pool"),
        PoolSettings {
            max_size: 2,
            ..PoolSettings::default()
        },
        broker.connector(),
    )
    .unwrap();

    let first = pool.get_connection(true).await.unwrap();
    let second = pool.get_connection(true).await.unwrap();
    first
        .subscribe("alerts/#", |_: &str, _: &str| Ok(()), None)
        .await
        .unwrap();

    assert_eq!(first.subscriptions(), vec!["alerts/#"]);
    assert!(second.subscriptions().is_empty());
    assert_eq!(broker.deliver("alerts/door", "open"), 1);

    pool.close_all().await;
    assert!(broker.online_clients().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_broker_outage_during_creation_surfaces_connection_error() {
    let broker = MockBroker::new();
    broker.set_connack(ConnAckBehavior::Silent);
    let pool = publisher_pool(&broker, 1);

    let err = pool.get_connection(false).await.unwrap_err();
    assert!(matches!(
        err,
        MqttError::Connection(ConnectionError::Timeout { .. })
    ));
    assert_eq!(pool.size(), 0);
}

#[derive(Debug, Clone)]
enum PoolOp {
    Get,
    ReturnHealthy,
    ReturnUnhealthy,
}

fn pool_op() -> impl Strategy<Value = PoolOp> {
    prop_oneof![
        3 => Just(PoolOp::Get),
        2 => Just(PoolOp::ReturnHealthy),
        1 => Just(PoolOp::ReturnUnhealthy),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_size_never_exceeds_max(max_size in 1usize..4, ops in prop::collection::vec(pool_op(), 1..24)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let broker = MockBroker::new();
            let pool = publisher_pool(&broker, max_size);
            let mut held = Vec::new();

            for op in ops {
                match op {
                    PoolOp::Get => {
                        if let Ok(connection) = pool.get_connection(false).await {
                            held.push(connection);
                        }
                    }
                    PoolOp::ReturnHealthy => {
                        if let Some(connection) = held.pop() {
                            pool.return_connection(connection).await.unwrap();
                        }
                    }
                    PoolOp::ReturnUnhealthy => {
                        if let Some(connection) = held.pop() {
                            connection.disconnect().await;
                            pool.return_connection(connection).await.unwrap();
                        }
                    }
                }
                prop_assert!(pool.size() <= max_size);
                prop_assert!(pool.available() <= pool.size());
                prop_assert!(held.len() + pool.available() == pool.size());
            }
            pool.close_all().await;
            Ok::<(), TestCaseError>(())
        })?;
    }
}
