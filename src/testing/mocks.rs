//! In-memory broker implementing the network seams
//!
//! [`MockBroker`] hands out sessions through its [`Connector`]. Each session
//! is a [`MockNetwork`] request handle plus a [`MockEventSource`] fed by an
//! unbounded channel, so the whole connection lifecycle (CONNACK, publish
//! acknowledgements, subscriptions, outages, reconnects) runs without a
//! real broker. Publishes are routed to every online session with a
//! matching subscription.

use crate::protocol::{topic_matches, ReturnCode};
use crate::transport::mqtt::lock;
use crate::transport::mqtt::{
    Connector, EventSource, NetworkClient, NetworkEvent, NetworkFailure, NetworkSession,
};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{MqttOptions, QoS};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

type EventTx = mpsc::UnboundedSender<Result<NetworkEvent, NetworkFailure>>;
type EventRx = mpsc::UnboundedReceiver<Result<NetworkEvent, NetworkFailure>>;

/// How the broker answers a connection attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnAckBehavior {
    Accept { session_present: bool },
    /// Refuse with a return code
    Reject(ReturnCode),
    /// Never answer
    Silent,
    /// Fail at the socket level
    Unreachable,
}

/// A request a client sent to the broker
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkCall {
    Publish {
        client_id: String,
        topic: String,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    },
    Subscribe {
        client_id: String,
        filters: Vec<(String, QoS)>,
    },
    Unsubscribe {
        client_id: String,
        topic: String,
    },
    Disconnect {
        client_id: String,
    },
}

struct MockSession {
    client_id: String,
    tx: EventTx,
    online: bool,
    subscriptions: Vec<String>,
}

struct BrokerState {
    connack: ConnAckBehavior,
    auto_ack: bool,
    reject_requests: bool,
    sessions: Vec<MockSession>,
    calls: Vec<NetworkCall>,
    next_pkid: u16,
}

impl BrokerState {
    fn next_pkid(&mut self) -> u16 {
        self.next_pkid = self.next_pkid.checked_add(1).unwrap_or(1);
        self.next_pkid
    }
}

/// Shared handle to the in-memory broker
#[derive(Clone)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    /// Accepts connections and acknowledges every publish
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                connack: ConnAckBehavior::Accept {
                    session_present: false,
                },
                auto_ack: true,
                reject_requests: false,
                sessions: Vec::new(),
                calls: Vec::new(),
                next_pkid: 0,
            })),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            broker: self.clone(),
        })
    }

    pub fn set_connack(&self, behavior: ConnAckBehavior) {
        lock(&self.state).connack = behavior;
    }

    /// Whether QoS 1/2 publishes are acknowledged automatically
    pub fn set_auto_ack(&self, auto_ack: bool) {
        lock(&self.state).auto_ack = auto_ack;
    }

    /// Make every client request fail as if the request queue were closed
    pub fn set_reject_requests(&self, reject: bool) {
        lock(&self.state).reject_requests = reject;
    }

    /// Deliver a message to every online session subscribed to a matching
    /// filter. Returns the number of sessions reached.
    pub fn deliver(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        let state = lock(&self.state);
        let mut delivered = 0;
        for session in state.sessions.iter().filter(|s| s.online) {
            if session
                .subscriptions
                .iter()
                .any(|filter| topic_matches(filter, topic))
            {
                let message = NetworkEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                    qos: QoS::AtLeastOnce,
                    retain: false,
                };
                if session.tx.send(Ok(message)).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Simulate an outage: every online session loses its socket and, as
    /// with a clean session, its subscriptions
    pub fn drop_connection(&self) {
        let mut state = lock(&self.state);
        for session in state.sessions.iter_mut().filter(|s| s.online) {
            session.online = false;
            session.subscriptions.clear();
            let _ = session.tx.send(Err(NetworkFailure::Io(
                "connection reset by peer".to_string(),
            )));
        }
    }

    /// Acknowledge an outstanding QoS 1/2 publish by packet id
    pub fn acknowledge(&self, client_id: &str, pkid: u16) {
        let state = lock(&self.state);
        for session in state.sessions.iter().filter(|s| s.client_id == client_id) {
            let _ = session
                .tx
                .send(Ok(NetworkEvent::PublishAcknowledged { pkid }));
        }
    }

    pub fn calls(&self) -> Vec<NetworkCall> {
        lock(&self.state).calls.clone()
    }

    /// `(topic, payload)` of every publish, in order
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                NetworkCall::Publish { topic, payload, .. } => Some((topic, payload)),
                _ => None,
            })
            .collect()
    }

    /// Filters of every subscribe request, in order
    pub fn subscribe_calls(&self) -> Vec<Vec<(String, QoS)>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                NetworkCall::Subscribe { filters, .. } => Some(filters),
                _ => None,
            })
            .collect()
    }

    /// Number of subscribe requests that included `pattern`
    pub fn subscribe_count(&self, pattern: &str) -> usize {
        self.subscribe_calls()
            .iter()
            .flatten()
            .filter(|(filter, _)| filter == pattern)
            .count()
    }

    pub fn disconnects(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, NetworkCall::Disconnect { .. }))
            .count()
    }

    pub fn sessions_opened(&self) -> usize {
        lock(&self.state).sessions.len()
    }

    /// Client ids of sessions that have completed CONNACK and not dropped
    pub fn online_clients(&self) -> Vec<String> {
        lock(&self.state)
            .sessions
            .iter()
            .filter(|s| s.online)
            .map(|s| s.client_id.clone())
            .collect()
    }

    fn open_session(&self, client_id: String) -> (usize, EventTx, EventRx) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = lock(&self.state);
        state.sessions.push(MockSession {
            client_id,
            tx: tx.clone(),
            online: false,
            subscriptions: Vec::new(),
        });
        (state.sessions.len() - 1, tx, rx)
    }

    fn with_session<R>(&self, index: usize, f: impl FnOnce(&mut MockSession) -> R) -> Option<R> {
        lock(&self.state).sessions.get_mut(index).map(f)
    }
}

/// Opens sessions on a [`MockBroker`]
pub struct MockConnector {
    broker: MockBroker,
}

impl Connector for MockConnector {
    fn open(&self, options: &MqttOptions) -> NetworkSession {
        let client_id = options.client_id();
        let (index, tx, rx) = self.broker.open_session(client_id.clone());
        NetworkSession {
            client: Arc::new(MockNetwork {
                broker: self.broker.clone(),
                index,
                client_id,
                tx,
            }),
            events: Box::new(MockEventSource {
                broker: self.broker.clone(),
                index,
                rx,
                awaiting_connack: true,
            }),
        }
    }
}

/// Request side of a mock session
pub struct MockNetwork {
    broker: MockBroker,
    index: usize,
    client_id: String,
    tx: EventTx,
}

impl MockNetwork {
    fn check_accepting(&self) -> Result<(), String> {
        if lock(&self.broker.state).reject_requests {
            Err("request channel closed".to_string())
        } else {
            Ok(())
        }
    }

    fn record_subscribe(&self, filters: Vec<(String, QoS)>) -> Result<(), String> {
        self.check_accepting()?;
        let pkid = {
            let mut state = lock(&self.broker.state);
            state.calls.push(NetworkCall::Subscribe {
                client_id: self.client_id.clone(),
                filters: filters.clone(),
            });
            state.next_pkid()
        };
        self.broker.with_session(self.index, |session| {
            for (filter, _) in &filters {
                if !session.subscriptions.contains(filter) {
                    session.subscriptions.push(filter.clone());
                }
            }
        });
        let _ = self.tx.send(Ok(NetworkEvent::SubscribeAcknowledged {
            pkid,
            failures: 0,
        }));
        Ok(())
    }
}

#[async_trait]
impl NetworkClient for MockNetwork {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), String> {
        self.check_accepting()?;
        let routed = Bytes::from(payload.clone());
        let (pkid, auto_ack) = {
            let mut state = lock(&self.broker.state);
            state.calls.push(NetworkCall::Publish {
                client_id: self.client_id.clone(),
                topic: topic.to_string(),
                qos,
                retain,
                payload,
            });
            let pkid = match qos {
                QoS::AtMostOnce => 0,
                _ => state.next_pkid(),
            };
            (pkid, state.auto_ack)
        };

        let _ = self.tx.send(Ok(NetworkEvent::PublishSent { pkid }));
        if pkid != 0 && auto_ack {
            let _ = self
                .tx
                .send(Ok(NetworkEvent::PublishAcknowledged { pkid }));
        }
        self.broker.deliver(topic, routed);
        Ok(())
    }

    async fn subscribe(&self, filters: Vec<(String, QoS)>) -> Result<(), String> {
        self.record_subscribe(filters)
    }

    fn try_subscribe(&self, filters: Vec<(String, QoS)>) -> Result<(), String> {
        self.record_subscribe(filters)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), String> {
        self.check_accepting()?;
        let pkid = {
            let mut state = lock(&self.broker.state);
            state.calls.push(NetworkCall::Unsubscribe {
                client_id: self.client_id.clone(),
                topic: topic.to_string(),
            });
            state.next_pkid()
        };
        self.broker.with_session(self.index, |session| {
            session.subscriptions.retain(|filter| filter != topic);
        });
        let _ = self
            .tx
            .send(Ok(NetworkEvent::UnsubscribeAcknowledged { pkid }));
        Ok(())
    }

    fn try_disconnect(&self) -> Result<(), String> {
        lock(&self.broker.state).calls.push(NetworkCall::Disconnect {
            client_id: self.client_id.clone(),
        });
        self.broker.with_session(self.index, |session| {
            session.online = false;
        });
        self.tx
            .send(Ok(NetworkEvent::DisconnectSent))
            .map_err(|e| e.to_string())
    }
}

/// Event side of a mock session. After a failure the next poll reconnects,
/// the way rumqttc's event loop does.
pub struct MockEventSource {
    broker: MockBroker,
    index: usize,
    rx: EventRx,
    awaiting_connack: bool,
}

#[async_trait]
impl EventSource for MockEventSource {
    async fn poll(&mut self) -> Result<NetworkEvent, NetworkFailure> {
        if self.awaiting_connack {
            let behavior = lock(&self.broker.state).connack;
            match behavior {
                ConnAckBehavior::Accept { session_present } => {
                    self.awaiting_connack = false;
                    self.broker
                        .with_session(self.index, |session| session.online = true);
                    return Ok(NetworkEvent::ConnAck {
                        code: ReturnCode::Success,
                        session_present,
                    });
                }
                ConnAckBehavior::Reject(code) => return Err(NetworkFailure::Refused(code)),
                ConnAckBehavior::Silent => return std::future::pending().await,
                ConnAckBehavior::Unreachable => {
                    return Err(NetworkFailure::Io("connection refused".to_string()))
                }
            }
        }

        match self.rx.recv().await {
            Some(Err(failure)) => {
                self.awaiting_connack = true;
                Err(failure)
            }
            Some(Ok(event)) => Ok(event),
            None => std::future::pending().await,
        }
    }
}
