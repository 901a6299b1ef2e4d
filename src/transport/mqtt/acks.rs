//! Publish acknowledgement tracking
//!
//! rumqttc reports each outgoing PUBLISH (with its packet id) in request
//! order, then the PUBACK/PUBCOMP by packet id. The tracker keeps one queue
//! entry per publish request in that same order, moves it to the in-flight
//! map when the packet id is known, and resolves it on acknowledgement.

use super::client::EventHandler;
use super::lock;
use crate::error::ConnectionError;
use crate::protocol::qos_to_u8;
use rumqttc::QoS;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

type AckSender = oneshot::Sender<u16>;

#[derive(Default)]
struct AckState {
    /// Requests queued to the network loop but not yet written; `None` for QoS 0
    queued: VecDeque<Option<AckSender>>,
    inflight: HashMap<u16, AckSender>,
}

#[derive(Default)]
pub struct AckTracker {
    /// Held across enqueue + network send so queue order matches request order
    order: tokio::sync::Mutex<()>,
    state: Mutex<AckState>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `send` with an acknowledgement slot reserved for it.
    ///
    /// Returns the receiver for QoS 1/2, `None` for QoS 0. The slot is released
    /// again when `send` fails.
    pub async fn track<F, Fut, E>(
        &self,
        qos: QoS,
        send: F,
    ) -> Result<Option<oneshot::Receiver<u16>>, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), E>>,
    {
        let _order = self.order.lock().await;

        let (entry, receiver) = match qos {
            QoS::AtMostOnce => (None, None),
            _ => {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            }
        };
        lock(&self.state).queued.push_back(entry);

        if let Err(e) = send().await {
            lock(&self.state).queued.pop_back();
            return Err(e);
        }
        Ok(receiver)
    }

    pub fn inflight(&self) -> usize {
        let state = lock(&self.state);
        state.inflight.len() + state.queued.iter().flatten().count()
    }
}

impl std::fmt::Debug for AckTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckTracker")
            .field("inflight", &self.inflight())
            .finish()
    }
}

impl EventHandler for AckTracker {
    fn on_publish_sent(&self, pkid: u16) {
        let mut state = lock(&self.state);
        if pkid != 0 && state.inflight.contains_key(&pkid) {
            trace!(pkid, "Retransmitted PUBLISH");
            return;
        }
        match state.queued.pop_front() {
            Some(Some(tx)) if pkid != 0 => {
                state.inflight.insert(pkid, tx);
            }
            Some(_) => {}
            None => trace!(pkid, "PUBLISH sent with no tracked request"),
        }
    }

    fn on_publish_acknowledged(&self, pkid: u16) {
        if let Some(tx) = lock(&self.state).inflight.remove(&pkid) {
            let _ = tx.send(pkid);
        }
    }

    fn on_stopped(&self) {
        let mut state = lock(&self.state);
        let dropped = state.inflight.len() + state.queued.iter().flatten().count();
        state.inflight.clear();
        state.queued.clear();
        if dropped > 0 {
            debug!(dropped, "Network loop stopped with unacknowledged publishes");
        }
    }
}

/// Broker confirmation of a publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub topic: String,
    pub qos: QoS,
    /// Packet id; 0 for QoS 0
    pub packet_id: u16,
}

/// Returned by `Publisher::publish`; await `wait()` for the broker's acknowledgement
#[derive(Debug)]
pub struct PublishHandle {
    topic: String,
    qos: QoS,
    broker: String,
    ack: Option<oneshot::Receiver<u16>>,
}

impl PublishHandle {
    pub(crate) fn new(
        topic: String,
        qos: QoS,
        broker: String,
        ack: Option<oneshot::Receiver<u16>>,
    ) -> Self {
        Self {
            topic,
            qos,
            broker,
            ack,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Resolves on PUBACK (QoS 1) or PUBCOMP (QoS 2), immediately for QoS 0.
    /// Fails if the connection stops first.
    pub async fn wait(self) -> Result<PublishReceipt, ConnectionError> {
        let packet_id = match self.ack {
            None => 0,
            Some(rx) => rx.await.map_err(|_| ConnectionError::AckLost {
                broker: self.broker.clone(),
                topic: self.topic.clone(),
                qos: qos_to_u8(self.qos),
            })?,
        };
        Ok(PublishReceipt {
            topic: self.topic,
            qos: self.qos,
            packet_id,
        })
    }
}
