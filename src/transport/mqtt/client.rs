//! Impure I/O for one MQTT connection
//!
//! [`ConnectionCore`] owns a single broker session: it opens the network
//! session, drives it from a background tokio task, and keeps the watched
//! [`ConnectionState`] current. Role-specific behaviour (publish tracking,
//! subscription dispatch) plugs in through [`EventHandler`].
//!
//! `connect()` waits on a oneshot installed for that attempt and resolved by
//! the network task on CONNACK, rejection or terminal failure. Everything else
//! is observed through the state channel.

use super::connection::{
    configure_mqtt_options, resolve_client_id, ClientRole, ConnectionId, ConnectionState,
    ReconnectPolicy,
};
use super::health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision};
use super::lock;
use super::message_handler::{NetworkEvent, NetworkFailure};
use super::network::{Connector, EventSource, NetworkClient};
use crate::config::{ConfigError, MqttConfig};
use crate::error::{sanitize_error_message, ConnectionError};
use crate::protocol::ReturnCode;
use rumqttc::MqttOptions;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn, Instrument};

/// Default wait for CONNACK
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `disconnect()` lets the loop flush the DISCONNECT packet
const DISCONNECT_DRAIN: Duration = Duration::from_secs(1);

/// How long a signalled loop gets to exit before it is aborted
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Role-specific reactions to network events.
///
/// Hooks run on the connection's network task and must not block.
pub trait EventHandler: Send + Sync {
    /// Session (re)established. Runs before a pending `connect()` returns.
    fn on_connected(&self, _network: &dyn NetworkClient, _session_present: bool) {}

    fn on_message(&self, _topic: &str, _payload: &[u8], _retain: bool) {}

    fn on_publish_sent(&self, _pkid: u16) {}

    fn on_publish_acknowledged(&self, _pkid: u16) {}

    /// Network loop stopped; in-flight work will not complete
    fn on_stopped(&self) {}
}

/// Handler for connections without role-specific behaviour
#[derive(Debug, Default)]
pub struct NoopHandler;

impl EventHandler for NoopHandler {}

#[derive(Debug)]
enum ConnectOutcome {
    Connected,
    Rejected(ReturnCode),
    Failed(String),
}

#[derive(Debug, Default)]
struct Activity {
    connect_time: Option<Instant>,
    last_message_time: Option<Instant>,
}

/// State shared between the core and its network task
struct Shared {
    client_id: String,
    role: ClientRole,
    broker: String,
    policy: ReconnectPolicy,
    handler: Arc<dyn EventHandler>,
    state_tx: watch::Sender<ConnectionState>,
    last_error: Mutex<Option<String>>,
    network: RwLock<Option<Arc<dyn NetworkClient>>>,
    pending_connect: Mutex<Option<oneshot::Sender<ConnectOutcome>>>,
    intentional_disconnect: AtomicBool,
    /// Bumped by every `disconnect()`; a `connect()` that sees it move aborts
    disconnects: AtomicU64,
    /// `disconnect()` calls still running
    disconnecting: AtomicU32,
    reconnect_attempts: AtomicU32,
    reconnect_count: AtomicU32,
    activity: Mutex<Activity>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    fn transition(&self, event: ConnectionEvent) {
        let next = HealthMonitor::determine_next_state(event);
        let previous = self.state_tx.send_replace(next.clone());
        if previous != next {
            HealthMonitor::log_state_transition(&self.client_id, &previous, &next);
        }
    }

    fn network(&self) -> Option<Arc<dyn NetworkClient>> {
        self.network
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn set_network(&self, network: Option<Arc<dyn NetworkClient>>) {
        *self
            .network
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = network;
    }

    fn record_error(&self, reason: String) {
        *lock(&self.last_error) = Some(reason);
    }

    fn take_pending(&self) -> Option<oneshot::Sender<ConnectOutcome>> {
        lock(&self.pending_connect).take()
    }

    fn has_pending(&self) -> bool {
        lock(&self.pending_connect).is_some()
    }

    fn resolve_pending(&self, outcome: ConnectOutcome) {
        if let Some(tx) = self.take_pending() {
            let _ = tx.send(outcome);
        }
    }

    fn begin_connect(&self, outcome_tx: oneshot::Sender<ConnectOutcome>) {
        self.intentional_disconnect.store(false, Ordering::SeqCst);
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        *lock(&self.last_error) = None;
        // A superseded connect() observes its sender dropping and returns Aborted
        *lock(&self.pending_connect) = Some(outcome_tx);
        self.transition(ConnectionEvent::ConnectRequested);
    }

    fn fail(&self, reason: String) {
        self.record_error(reason.clone());
        self.transition(ConnectionEvent::PermanentFailure(reason.clone()));
        self.resolve_pending(ConnectOutcome::Failed(reason));
    }

    fn reject(&self, code: ReturnCode) -> bool {
        error!(return_code = code.as_u8(), "{}", code.message());
        self.record_error(code.message().to_string());
        self.transition(ConnectionEvent::ConnAckRejected(code));
        self.resolve_pending(ConnectOutcome::Rejected(code));
        false
    }

    /// Returns false when the loop should stop
    fn handle_event(&self, event: NetworkEvent) -> bool {
        match event {
            NetworkEvent::ConnAck {
                code,
                session_present,
            } if code.is_success() => {
                if matches!(self.state(), ConnectionState::Reconnecting(_)) {
                    self.reconnect_count.fetch_add(1, Ordering::SeqCst);
                }
                self.reconnect_attempts.store(0, Ordering::SeqCst);
                lock(&self.activity).connect_time = Some(Instant::now());
                *lock(&self.last_error) = None;
                self.transition(ConnectionEvent::ConnAckAccepted);
                info!(session_present, "Connected to MQTT broker");

                if let Some(network) = self.network() {
                    self.handler.on_connected(network.as_ref(), session_present);
                }
                self.resolve_pending(ConnectOutcome::Connected);
                true
            }
            NetworkEvent::ConnAck { code, .. } => self.reject(code),
            NetworkEvent::Message {
                topic,
                payload,
                retain,
                ..
            } => {
                lock(&self.activity).last_message_time = Some(Instant::now());
                self.handler.on_message(&topic, &payload, retain);
                true
            }
            NetworkEvent::PublishSent { pkid } => {
                self.handler.on_publish_sent(pkid);
                true
            }
            NetworkEvent::PublishAcknowledged { pkid } => {
                debug!(pkid, "Message published");
                self.handler.on_publish_acknowledged(pkid);
                true
            }
            NetworkEvent::SubscribeAcknowledged { pkid, failures } => {
                if failures > 0 {
                    warn!(pkid, failures, "Broker rejected subscription filters");
                } else {
                    debug!(pkid, "Subscription confirmed");
                }
                true
            }
            NetworkEvent::UnsubscribeAcknowledged { pkid } => {
                debug!(pkid, "Unsubscription confirmed");
                true
            }
            NetworkEvent::DisconnectSent => {
                let intentional = self.intentional_disconnect.load(Ordering::SeqCst);
                debug!(intentional, "DISCONNECT sent");
                !intentional
            }
            NetworkEvent::Other(description) => {
                trace!(event = %description, "MQTT event");
                true
            }
        }
    }

    /// Returns false when the loop should stop
    async fn handle_failure(
        &self,
        failure: NetworkFailure,
        shutdown_rx: watch::Receiver<bool>,
    ) -> bool {
        if self.intentional_disconnect.load(Ordering::SeqCst) {
            debug!("Network loop ended during disconnect");
            return false;
        }

        let reason = match failure {
            NetworkFailure::Refused(code) => return self.reject(code),
            NetworkFailure::Closed => {
                self.fail("all client handles dropped".to_string());
                return false;
            }
            NetworkFailure::Io(reason) => sanitize_error_message(&reason),
        };

        let connecting = self.has_pending();
        if self.state().is_connected() {
            warn!(reason = %reason, "Unexpected disconnection from MQTT broker");
        } else {
            warn!(reason = %reason, "MQTT connection attempt failed");
        }
        self.record_error(reason.clone());

        if connecting && !self.policy.enabled {
            self.fail(reason);
            return false;
        }

        let attempts = self.reconnect_attempts.load(Ordering::SeqCst);
        let shutdown_requested = *shutdown_rx.borrow();
        match HealthMonitor::should_attempt_reconnection(attempts, &self.policy, shutdown_requested)
        {
            ReconnectionDecision::Proceed { attempt, delay } => {
                self.reconnect_attempts.store(attempt, Ordering::SeqCst);
                if !connecting {
                    self.transition(ConnectionEvent::ReconnectionStarted(attempt));
                }
                let max_display = self
                    .policy
                    .max_attempts
                    .map_or("∞".to_string(), |max| max.to_string());
                info!(
                    "Attempting reconnection {}/{} after {:?} delay",
                    attempt, max_display, delay
                );
                interruptible_sleep(shutdown_rx, delay).await
            }
            ReconnectionDecision::AbortShutdownRequested => false,
            ReconnectionDecision::AbortDisabled => {
                self.fail(format!("connection lost: {reason}"));
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let budget = self.policy.calculate_max_total_time().unwrap_or_default();
                warn!(
                    attempts,
                    outage_budget = ?budget,
                    "Reconnection attempts exhausted"
                );
                self.fail(format!(
                    "reconnection abandoned after {attempts} attempts ({}s of retries): {reason}",
                    budget.as_secs()
                ));
                false
            }
        }
    }
}

/// Sleep unless shutdown is signalled first. Returns true if the sleep completed.
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                info!("Shutdown signal received during reconnection delay, stopping");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn run_event_loop(
    shared: Arc<Shared>,
    mut events: Box<dyn EventSource>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = crate::mqtt_span!(
        client_id = %shared.client_id,
        role = %shared.role,
        broker = %shared.broker
    );

    async move {
        debug!("Network loop started");
        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Shutdown signal received, stopping network loop");
                        break;
                    }
                }

                polled = events.poll() => {
                    let keep_running = match polled {
                        Ok(event) => shared.handle_event(event),
                        Err(failure) => shared.handle_failure(failure, shutdown_rx.clone()).await,
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }
        shared.handler.on_stopped();
        drop(shared.take_pending());
        debug!("Network loop stopped");
    }
    .instrument(span)
    .await
}

/// Marks a `disconnect()` as running, including when its future is dropped early
struct DisconnectGuard<'a>(&'a AtomicU32);

impl<'a> DisconnectGuard<'a> {
    fn enter(shared: &'a Shared) -> Self {
        shared.disconnecting.fetch_add(1, Ordering::SeqCst);
        Self(&shared.disconnecting)
    }
}

impl Drop for DisconnectGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Lifecycle {
    task: Option<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    /// Connect attempt that owns `task`
    generation: u64,
}

/// One MQTT connection: session setup, lifecycle and watched state
pub struct ConnectionCore {
    id: ConnectionId,
    config: Arc<MqttConfig>,
    options: MqttOptions,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    /// Serializes connect/disconnect; never held while waiting for CONNACK
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl ConnectionCore {
    /// Build a connection. Auth, TLS and LWT are prepared here, so bad TLS
    /// material fails construction.
    pub fn new(
        config: Arc<MqttConfig>,
        role: ClientRole,
        client_id: Option<String>,
        connector: Arc<dyn Connector>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Self, ConfigError> {
        let client_id = resolve_client_id(&config, role, client_id);
        let options = configure_mqtt_options(&config, &client_id)?;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        let shared = Arc::new(Shared {
            client_id,
            role,
            broker: config.broker_address(),
            policy: ReconnectPolicy::from_config(&config),
            handler,
            state_tx,
            last_error: Mutex::new(None),
            network: RwLock::new(None),
            pending_connect: Mutex::new(None),
            intentional_disconnect: AtomicBool::new(false),
            disconnects: AtomicU64::new(0),
            disconnecting: AtomicU32::new(0),
            reconnect_attempts: AtomicU32::new(0),
            reconnect_count: AtomicU32::new(0),
            activity: Mutex::new(Activity::default()),
        });

        debug!(client_id = %shared.client_id, role = %role, "MQTT connection created");

        Ok(Self {
            id: ConnectionId::new(),
            config,
            options,
            connector,
            shared,
            lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    pub fn role(&self) -> ClientRole {
        self.shared.role
    }

    pub fn config(&self) -> &Arc<MqttConfig> {
        &self.config
    }

    /// `host:port` of the broker
    pub fn broker(&self) -> &str {
        &self.shared.broker
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Receiver observing every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Non-blocking, eventually consistent
    pub fn is_connected(&self) -> bool {
        self.shared.state_tx.borrow().is_connected()
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        let activity = lock(&self.shared.activity);
        HealthMonitor::calculate_health_metrics(
            &self.state(),
            activity.connect_time,
            activity.last_message_time,
            self.shared.reconnect_count.load(Ordering::SeqCst),
        )
    }

    /// Network handle, only while the state allows requests
    pub(crate) fn connected_network(&self) -> Option<Arc<dyn NetworkClient>> {
        if HealthMonitor::can_publish(&self.state()) {
            self.shared.network()
        } else {
            None
        }
    }

    fn check_security_policy(&self) -> Result<(), ConnectionError> {
        if self.config.require_tls() && !self.config.use_tls() {
            return Err(ConnectionError::security_policy(
                self.broker(),
                "TLS is required but use_tls is disabled",
            ));
        }
        if self.config.tls_insecure() && !self.config.allow_insecure_tls() {
            return Err(ConnectionError::security_policy(
                self.broker(),
                "insecure TLS requested but allow_insecure_tls is disabled",
            ));
        }
        Ok(())
    }

    /// Connect and wait for the broker's verdict.
    ///
    /// Any previous network loop is stopped first, so this also serves as an
    /// explicit reconnect after `Failed`.
    pub async fn connect(&self, timeout: Duration) -> Result<(), ConnectionError> {
        let disconnects = self.shared.disconnects.load(Ordering::SeqCst);
        if self.shared.disconnecting.load(Ordering::SeqCst) > 0 {
            return Err(self.aborted());
        }
        self.check_security_policy()?;

        let (outcome_rx, generation) = {
            let mut lifecycle = self.lifecycle.lock().await;
            if self.shared.disconnects.load(Ordering::SeqCst) != disconnects {
                debug!(client_id = %self.client_id(), "Connect superseded by disconnect");
                return Err(self.aborted());
            }
            self.stop_task(&mut lifecycle, Duration::ZERO).await;
            lifecycle.generation += 1;

            let (outcome_tx, outcome_rx) = oneshot::channel();
            self.shared.begin_connect(outcome_tx);

            let session = self.connector.open(&self.options);
            self.shared.set_network(Some(session.client));

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            lifecycle.task = Some(tokio::spawn(run_event_loop(
                self.shared.clone(),
                session.events,
                shutdown_rx,
            )));
            lifecycle.shutdown_tx = Some(shutdown_tx);
            (outcome_rx, lifecycle.generation)
        };

        info!(
            client_id = %self.client_id(),
            broker = %self.broker(),
            "Connecting to MQTT broker"
        );

        match tokio::time::timeout(timeout, outcome_rx).await {
            Ok(Ok(ConnectOutcome::Connected)) => Ok(()),
            Ok(Ok(ConnectOutcome::Rejected(code))) => {
                self.halt(generation).await;
                Err(ConnectionError::Rejected {
                    broker: self.broker().to_string(),
                    code,
                })
            }
            Ok(Ok(ConnectOutcome::Failed(reason))) => {
                self.halt(generation).await;
                Err(ConnectionError::network(self.broker(), reason))
            }
            Ok(Err(_)) => Err(self.aborted()),
            Err(_) => {
                warn!(
                    client_id = %self.client_id(),
                    ?timeout,
                    "Timed out waiting for CONNACK"
                );
                if self.halt(generation).await {
                    self.shared.record_error(format!(
                        "timed out after {timeout:?} waiting for CONNACK"
                    ));
                    self.shared.transition(ConnectionEvent::Stopped);
                }
                Err(ConnectionError::Timeout {
                    broker: self.broker().to_string(),
                    timeout,
                })
            }
        }
    }

    fn aborted(&self) -> ConnectionError {
        ConnectionError::Aborted {
            broker: self.broker().to_string(),
        }
    }

    /// Stop the network loop of attempt `generation` without sending
    /// DISCONNECT. Returns false when a newer attempt owns the loop.
    async fn halt(&self, generation: u64) -> bool {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.generation != generation {
            debug!(generation, "Newer connect attempt owns the network loop");
            return false;
        }
        self.stop_task(&mut lifecycle, Duration::ZERO).await;
        drop(self.shared.take_pending());
        true
    }

    /// Disconnect cleanly. Safe at any time, including during `connect()`;
    /// no handler hook runs after this returns.
    pub async fn disconnect(&self) {
        self.shared
            .intentional_disconnect
            .store(true, Ordering::SeqCst);
        let _disconnecting = DisconnectGuard::enter(&self.shared);
        self.shared.disconnects.fetch_add(1, Ordering::SeqCst);
        drop(self.shared.take_pending());

        let mut lifecycle = self.lifecycle.lock().await;
        let running = lifecycle
            .task
            .as_ref()
            .is_some_and(|task| !task.is_finished());

        let mut drain = Duration::ZERO;
        if running && self.is_connected() {
            self.shared.transition(ConnectionEvent::DisconnectRequested);
            if let Some(network) = self.shared.network() {
                match network.try_disconnect() {
                    Ok(()) => drain = DISCONNECT_DRAIN,
                    Err(e) => debug!("Could not queue DISCONNECT: {}", e),
                }
            }
        }

        self.stop_task(&mut lifecycle, drain).await;
        // An aborted loop never reaches its own cleanup
        drop(self.shared.take_pending());
        self.shared.set_network(None);
        lock(&self.shared.activity).connect_time = None;
        self.shared.transition(ConnectionEvent::Stopped);
        info!(
            client_id = %self.client_id(),
            broker = %self.broker(),
            "Disconnected from MQTT broker"
        );
    }

    /// Wait up to `drain` for the loop to exit on its own, then signal and join it
    async fn stop_task(&self, lifecycle: &mut Lifecycle, drain: Duration) {
        let shutdown_tx = lifecycle.shutdown_tx.take();
        let Some(mut task) = lifecycle.task.take() else {
            return;
        };

        if !drain.is_zero() && tokio::time::timeout(drain, &mut task).await.is_ok() {
            return;
        }

        if let Some(shutdown_tx) = shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_panic() => error!("Network loop task panicked: {}", e),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(
                    "Network loop did not stop within {:?}, aborting",
                    SHUTDOWN_GRACE
                );
                task.abort();
                let _ = task.await;
            }
        }
    }
}

impl Drop for ConnectionCore {
    fn drop(&mut self) {
        if let Some(task) = self.lifecycle.get_mut().task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("id", &self.id)
            .field("client_id", &self.shared.client_id)
            .field("role", &self.shared.role)
            .field("broker", &self.shared.broker)
            .field("state", &self.state())
            .finish()
    }
}
