//! Bounded pool of reusable MQTT connections
//!
//! Connections are created lazily up to `max_size`, checked out as
//! `Arc<C>`, and handed back with [`ConnectionPool::return_connection`].
//! Tracking (all members, checked-out set, in-progress creations) lives under
//! one lock that is never held across an await; checked-in members wait in a
//! separate bounded queue so blocked checkouts never hold the lock.

use crate::config::MqttConfig;
use crate::error::{ConnectionError, MqttResult, ValidationError};
use crate::transport::mqtt::{lock, ConnectionId, Connector, Publisher, RumqttcConnector, Subscriber};
use crate::transport::ManagedConnection;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

pub type PublisherPool = ConnectionPool<Publisher>;
pub type SubscriberPool = ConnectionPool<Subscriber>;

/// Pool sizing and timeouts
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub max_size: usize,
    /// Passed to `connect()` for new and revalidated connections
    pub connection_timeout: Duration,
    /// Longest a blocking checkout waits at capacity
    pub checkout_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 5,
            connection_timeout: Duration::from_secs(5),
            checkout_timeout: Duration::from_secs(30),
        }
    }
}

struct Tracking<C> {
    all: HashMap<ConnectionId, Arc<C>>,
    checked_out: HashSet<ConnectionId>,
    /// Slots reserved by creations in progress
    creating: usize,
}

impl<C> Tracking<C> {
    fn occupied(&self) -> usize {
        self.all.len() + self.creating
    }
}

pub struct ConnectionPool<C: ManagedConnection> {
    config: Arc<MqttConfig>,
    connector: Arc<dyn Connector>,
    settings: PoolSettings,
    tracking: Mutex<Tracking<C>>,
    available_tx: mpsc::Sender<Arc<C>>,
    available_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<C>>>,
    /// A member was discarded or a creation failed
    capacity_freed: Notify,
    closed: watch::Sender<bool>,
    next_index: AtomicUsize,
}

impl<C: ManagedConnection> ConnectionPool<C> {
    /// Pool of rumqttc-backed connections
    pub fn new(config: Arc<MqttConfig>, settings: PoolSettings) -> MqttResult<Self> {
        let connector = Arc::new(RumqttcConnector::new(config.request_channel_capacity()));
        Self::with_connector(config, settings, connector)
    }

    pub fn with_connector(
        config: Arc<MqttConfig>,
        settings: PoolSettings,
        connector: Arc<dyn Connector>,
    ) -> MqttResult<Self> {
        if settings.max_size == 0 {
            return Err(ValidationError::InvalidPoolSize(settings.max_size).into());
        }

        let (available_tx, available_rx) = mpsc::channel(settings.max_size);
        let (closed, _) = watch::channel(false);

        info!(
            role = %C::ROLE,
            max_size = settings.max_size,
            connection_timeout = ?settings.connection_timeout,
            broker = %config.broker_address(),
            "Initialized MQTT connection pool"
        );

        Ok(Self {
            config,
            connector,
            settings,
            tracking: Mutex::new(Tracking {
                all: HashMap::new(),
                checked_out: HashSet::new(),
                creating: 0,
            }),
            available_tx,
            available_rx: tokio::sync::Mutex::new(available_rx),
            capacity_freed: Notify::new(),
            closed,
            next_index: AtomicUsize::new(0),
        })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Connections currently owned by the pool, checked out or not
    pub fn size(&self) -> usize {
        lock(&self.tracking).all.len()
    }

    /// Connections waiting in the queue
    pub fn available(&self) -> usize {
        self.available_tx.max_capacity() - self.available_tx.capacity()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Check out a connection.
    ///
    /// Reuses a checked-in connection (reconnecting it once if unhealthy),
    /// otherwise creates one while below `max_size`. At capacity, waits up to
    /// `checkout_timeout` when `block` is set and fails with `PoolFull`
    /// otherwise.
    pub async fn get_connection(&self, block: bool) -> MqttResult<Arc<C>> {
        let span = crate::pool_span!(role = %C::ROLE, block);
        self.checkout(block).instrument(span).await
    }

    async fn checkout(&self, block: bool) -> MqttResult<Arc<C>> {
        let deadline = Instant::now() + self.settings.checkout_timeout;
        let mut closed_rx = self.closed.subscribe();

        loop {
            if self.is_closed() {
                return Err(ConnectionError::PoolClosed.into());
            }

            if let Some(connection) = self.take_available() {
                match self.revalidate(connection).await {
                    Some(connection) => return Ok(connection),
                    None => continue,
                }
            }

            if self.try_reserve() {
                return self.create().await;
            }

            if !block {
                return Err(ConnectionError::PoolFull {
                    max_size: self.settings.max_size,
                }
                .into());
            }

            debug!("Pool at capacity, waiting for a connection");
            let received = tokio::select! {
                _ = closed_rx.changed() => None,
                _ = self.capacity_freed.notified() => None,
                connection = async { self.available_rx.lock().await.recv().await } => connection,
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(ConnectionError::CheckoutTimeout {
                        timeout: self.settings.checkout_timeout,
                    }
                    .into());
                }
            };

            if let Some(connection) = received {
                self.mark_checked_out(&connection);
                if let Some(connection) = self.revalidate(connection).await {
                    return Ok(connection);
                }
            }
        }
    }

    /// Pop a checked-in connection without waiting
    fn take_available(&self) -> Option<Arc<C>> {
        // A waiter holding the receiver gets the next connection itself
        let mut rx = self.available_rx.try_lock().ok()?;
        let connection = rx.try_recv().ok()?;
        drop(rx);
        self.mark_checked_out(&connection);
        Some(connection)
    }

    fn mark_checked_out(&self, connection: &Arc<C>) {
        lock(&self.tracking)
            .checked_out
            .insert(connection.core().id());
    }

    /// Hand back a healthy connection, or reconnect it once in place.
    /// On failure the connection is discarded and None returned.
    async fn revalidate(&self, connection: Arc<C>) -> Option<Arc<C>> {
        let core = connection.core();
        if core.is_connected() {
            debug!(client_id = %core.client_id(), "Reusing pooled connection");
            return Some(connection);
        }

        warn!(
            client_id = %core.client_id(),
            state = %core.state(),
            "Unhealthy pooled connection, reconnecting"
        );
        core.disconnect().await;
        match core.connect(self.settings.connection_timeout).await {
            Ok(()) => Some(connection),
            Err(e) => {
                error!(
                    client_id = %core.client_id(),
                    "Failed to reconnect unhealthy connection: {}", e
                );
                self.discard(&connection).await;
                None
            }
        }
    }

    fn try_reserve(&self) -> bool {
        let mut tracking = lock(&self.tracking);
        if tracking.occupied() < self.settings.max_size {
            tracking.creating += 1;
            true
        } else {
            false
        }
    }

    fn release_reservation(&self) {
        lock(&self.tracking).creating -= 1;
        self.capacity_freed.notify_one();
    }

    /// Create and connect a member in a slot reserved by `try_reserve`
    async fn create(&self) -> MqttResult<Arc<C>> {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        // Members need distinct client ids or the broker evicts all but one
        let client_id = self.config.client_id().map(|id| format!("{id}-{index}"));

        let connection = match C::create(self.config.clone(), self.connector.clone(), client_id) {
            Ok(connection) => Arc::new(connection),
            Err(e) => {
                self.release_reservation();
                return Err(e);
            }
        };

        if let Err(e) = connection
            .core()
            .connect(self.settings.connection_timeout)
            .await
        {
            error!(
                client_id = %connection.core().client_id(),
                "Failed to create pooled connection: {}", e
            );
            self.release_reservation();
            return Err(e.into());
        }

        let accepted = {
            let mut tracking = lock(&self.tracking);
            tracking.creating -= 1;
            if self.is_closed() {
                false
            } else {
                let id = connection.core().id();
                tracking.all.insert(id, connection.clone());
                tracking.checked_out.insert(id);
                true
            }
        };

        if !accepted {
            connection.core().disconnect().await;
            return Err(ConnectionError::PoolClosed.into());
        }

        debug!(
            client_id = %connection.core().client_id(),
            size = self.size(),
            "Created pooled connection"
        );
        Ok(connection)
    }

    /// Remove a member from tracking and disconnect it
    async fn discard(&self, connection: &Arc<C>) {
        let id = connection.core().id();
        {
            let mut tracking = lock(&self.tracking);
            tracking.all.remove(&id);
            tracking.checked_out.remove(&id);
        }
        self.capacity_freed.notify_one();
        connection.core().disconnect().await;
    }

    /// Check a connection back in.
    ///
    /// Healthy connections are queued for reuse; unhealthy ones are
    /// disconnected and removed, freeing their slot.
    pub async fn return_connection(&self, connection: Arc<C>) -> MqttResult<()> {
        if self.is_closed() {
            warn!("Attempted to return connection to closed pool");
            return Ok(());
        }

        let id = connection.core().id();
        let healthy = connection.core().is_connected();
        {
            let mut tracking = lock(&self.tracking);
            if !tracking.all.contains_key(&id) {
                return Err(ValidationError::ForeignConnection { id: id.to_string() }.into());
            }
            if !tracking.checked_out.remove(&id) {
                return Err(ValidationError::NotCheckedOut { id: id.to_string() }.into());
            }
            if !healthy {
                tracking.all.remove(&id);
            }
        }

        if !healthy {
            warn!(
                client_id = %connection.core().client_id(),
                state = %connection.core().state(),
                "Unhealthy connection not returned to pool"
            );
            self.capacity_freed.notify_one();
            connection.core().disconnect().await;
            return Ok(());
        }

        match self.available_tx.try_send(connection) {
            Ok(()) => debug!(role = %C::ROLE, "Returned connection to pool"),
            Err(e) => {
                let connection = e.into_inner();
                warn!("Pool queue full, connection not returned");
                self.discard(&connection).await;
            }
        }
        Ok(())
    }

    /// Check out a connection, run `f`, and return the connection even if `f` fails
    pub async fn with_connection<F, Fut, T>(&self, f: F) -> MqttResult<T>
    where
        F: FnOnce(Arc<C>) -> Fut,
        Fut: Future<Output = MqttResult<T>>,
    {
        let connection = self.get_connection(true).await?;
        let result = f(connection.clone()).await;
        let returned = self.return_connection(connection).await;
        let value = result?;
        returned?;
        Ok(value)
    }

    /// Disconnect every member and close the pool. Idempotent.
    pub async fn close_all(&self) {
        if self.closed.send_replace(true) {
            warn!("Pool already closed");
            return;
        }

        let connections: Vec<Arc<C>> = {
            let mut tracking = lock(&self.tracking);
            tracking.checked_out.clear();
            tracking.all.drain().map(|(_, connection)| connection).collect()
        };

        for connection in &connections {
            connection.core().disconnect().await;
        }

        let mut rx = self.available_rx.lock().await;
        while rx.try_recv().is_ok() {}

        info!(role = %C::ROLE, closed = connections.len(), "Closed MQTT connection pool");
    }
}

impl<C: ManagedConnection> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("role", &C::ROLE)
            .field("max_size", &self.settings.max_size)
            .field("size", &self.size())
            .field("available", &self.available())
            .field("closed", &self.is_closed())
            .finish()
    }
}
