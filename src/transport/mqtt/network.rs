//! Seams between the connection core and the wire
//!
//! A [`Connector`] opens a [`NetworkSession`]: a request handle
//! ([`NetworkClient`]) plus the event stream driving it ([`EventSource`]).
//! Production code uses rumqttc; tests substitute the mocks in
//! `crate::testing::mocks`.

use super::message_handler::{MessageHandler, NetworkEvent, NetworkFailure};
use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS, SubscribeFilter};
use std::sync::Arc;

/// Request side of a live network session
#[async_trait]
pub trait NetworkClient: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), String>;

    /// Subscribe to several filters in one request
    async fn subscribe(&self, filters: Vec<(String, QoS)>) -> Result<(), String>;

    /// Like `subscribe` but fails instead of waiting when the request queue
    /// is full. Required on the network task, which is what drains the queue.
    fn try_subscribe(&self, filters: Vec<(String, QoS)>) -> Result<(), String>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), String>;

    /// Queue a clean DISCONNECT without waiting for channel capacity
    fn try_disconnect(&self) -> Result<(), String>;
}

/// Event side of a live network session; polled by the connection's task
#[async_trait]
pub trait EventSource: Send {
    async fn poll(&mut self) -> Result<NetworkEvent, NetworkFailure>;
}

pub struct NetworkSession {
    pub client: Arc<dyn NetworkClient>,
    pub events: Box<dyn EventSource>,
}

/// Opens a fresh network session for each connect attempt
pub trait Connector: Send + Sync {
    fn open(&self, options: &MqttOptions) -> NetworkSession;
}

/// Connector backed by rumqttc's `AsyncClient`/`EventLoop`
#[derive(Debug, Clone)]
pub struct RumqttcConnector {
    request_capacity: usize,
}

impl RumqttcConnector {
    pub fn new(request_capacity: usize) -> Self {
        Self {
            request_capacity: request_capacity.max(1),
        }
    }
}

impl Connector for RumqttcConnector {
    fn open(&self, options: &MqttOptions) -> NetworkSession {
        let (client, event_loop) = AsyncClient::new(options.clone(), self.request_capacity);
        NetworkSession {
            client: Arc::new(client),
            events: Box::new(event_loop),
        }
    }
}

#[async_trait]
impl NetworkClient for AsyncClient {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), String> {
        AsyncClient::publish(self, topic, qos, retain, payload)
            .await
            .map_err(|e| e.to_string())
    }

    async fn subscribe(&self, filters: Vec<(String, QoS)>) -> Result<(), String> {
        if filters.is_empty() {
            return Ok(());
        }
        let filters = filters
            .into_iter()
            .map(|(path, qos)| SubscribeFilter::new(path, qos));
        self.subscribe_many(filters).await.map_err(|e| e.to_string())
    }

    fn try_subscribe(&self, filters: Vec<(String, QoS)>) -> Result<(), String> {
        if filters.is_empty() {
            return Ok(());
        }
        let filters = filters
            .into_iter()
            .map(|(path, qos)| SubscribeFilter::new(path, qos));
        self.try_subscribe_many(filters).map_err(|e| e.to_string())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), String> {
        AsyncClient::unsubscribe(self, topic)
            .await
            .map_err(|e| e.to_string())
    }

    fn try_disconnect(&self) -> Result<(), String> {
        AsyncClient::try_disconnect(self).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl EventSource for EventLoop {
    async fn poll(&mut self) -> Result<NetworkEvent, NetworkFailure> {
        match EventLoop::poll(self).await {
            Ok(event) => Ok(MessageHandler::route_mqtt_event(event)),
            Err(error) => Err(MessageHandler::route_connection_error(&error)),
        }
    }
}
