//! Pure message routing for MQTT events
//!
//! Translates rumqttc events and errors into the crate's own [`NetworkEvent`]
//! and [`NetworkFailure`] vocabulary, and decides whether an incoming message
//! is fit for dispatch. Nothing here performs I/O.

use crate::protocol::ReturnCode;
use bytes::Bytes;
use rumqttc::{ConnectionError, Event, Outgoing, Packet, QoS, SubscribeReasonCode};

/// Network-loop events the connection core reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    /// CONNACK received
    ConnAck {
        code: ReturnCode,
        session_present: bool,
    },
    /// PUBLISH received on a subscribed topic
    Message {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    /// A PUBLISH left the client (pkid 0 for QoS 0)
    PublishSent { pkid: u16 },
    /// PUBACK (QoS 1) or PUBCOMP (QoS 2) received
    PublishAcknowledged { pkid: u16 },
    SubscribeAcknowledged { pkid: u16, failures: usize },
    UnsubscribeAcknowledged { pkid: u16 },
    /// Clean DISCONNECT written to the socket
    DisconnectSent,
    /// Keepalive and other protocol traffic
    Other(String),
}

/// Why the network loop could not produce an event
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkFailure {
    /// Broker answered CONNECT with a non-zero return code
    Refused(ReturnCode),
    /// Every client handle was dropped; the loop cannot receive requests
    Closed,
    /// Socket, TLS or protocol error
    Io(String),
}

/// Why an incoming message was not dispatched
#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    TooLarge { size: usize, max: usize },
    NotUtf8,
}

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route an MQTT event into the crate's event vocabulary (pure function)
    pub fn route_mqtt_event(event: Event) -> NetworkEvent {
        match event {
            Event::Incoming(packet) => match packet {
                Packet::ConnAck(connack) => NetworkEvent::ConnAck {
                    code: connack.code.into(),
                    session_present: connack.session_present,
                },
                Packet::Publish(publish) => NetworkEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload,
                    qos: publish.qos,
                    retain: publish.retain,
                },
                Packet::PubAck(ack) => NetworkEvent::PublishAcknowledged { pkid: ack.pkid },
                Packet::PubComp(comp) => NetworkEvent::PublishAcknowledged { pkid: comp.pkid },
                Packet::SubAck(suback) => NetworkEvent::SubscribeAcknowledged {
                    pkid: suback.pkid,
                    failures: Self::count_subscription_failures(&suback.return_codes),
                },
                Packet::UnsubAck(unsuback) => {
                    NetworkEvent::UnsubscribeAcknowledged { pkid: unsuback.pkid }
                }
                other => NetworkEvent::Other(format!("incoming {other:?}")),
            },
            Event::Outgoing(outgoing) => match outgoing {
                Outgoing::Publish(pkid) => NetworkEvent::PublishSent { pkid },
                Outgoing::Disconnect => NetworkEvent::DisconnectSent,
                other => NetworkEvent::Other(format!("outgoing {other:?}")),
            },
        }
    }

    /// Classify an event-loop error (pure function)
    pub fn route_connection_error(error: &ConnectionError) -> NetworkFailure {
        match error {
            ConnectionError::ConnectionRefused(code) => NetworkFailure::Refused((*code).into()),
            ConnectionError::RequestsDone => NetworkFailure::Closed,
            other => NetworkFailure::Io(other.to_string()),
        }
    }

    pub fn count_subscription_failures(return_codes: &[SubscribeReasonCode]) -> usize {
        return_codes
            .iter()
            .filter(|code| matches!(code, SubscribeReasonCode::Failure))
            .count()
    }

    /// Decide whether an incoming payload can be handed to callbacks (pure function)
    pub fn inspect_payload(payload: &[u8], max_payload_size: usize) -> Result<&str, DropReason> {
        if payload.len() > max_payload_size {
            return Err(DropReason::TooLarge {
                size: payload.len(),
                max: max_payload_size,
            });
        }
        std::str::from_utf8(payload).map_err(|_| DropReason::NotUtf8)
    }
}
