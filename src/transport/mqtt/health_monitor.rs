//! Pure health monitoring and reconnection logic for the MQTT client
//!
//! State transitions, reconnection decisions and health metrics are computed
//! here without I/O; the connection core applies the results.

use super::connection::{ConnectionState, ReconnectPolicy};
use crate::protocol::ReturnCode;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether to retry after an unexpected loss (pure function).
    /// Unlimited retries when `max_attempts` is None.
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        policy: &ReconnectPolicy,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if !policy.enabled {
            return ReconnectionDecision::AbortDisabled;
        }

        if let Some(max_attempts) = policy.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = current_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay: policy.delay_for_attempt(attempt),
        }
    }

    /// Next state after a connection event (pure function)
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnectRequested => ConnectionState::Connecting,
            ConnectionEvent::ConnAckAccepted => ConnectionState::Connected,
            ConnectionEvent::ConnAckRejected(code) => ConnectionState::Failed(code.to_string()),
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::PermanentFailure(reason) => ConnectionState::Failed(reason),
            ConnectionEvent::DisconnectRequested => ConnectionState::Disconnecting,
            ConnectionEvent::Stopped => ConnectionState::Disconnected,
        }
    }

    /// Check if connection state allows publishing (pure function)
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Calculate health metrics for a connection (pure function)
    pub fn calculate_health_metrics(
        state: &ConnectionState,
        connect_time: Option<Instant>,
        last_message_time: Option<Instant>,
        reconnect_count: u32,
    ) -> HealthMetrics {
        let now = Instant::now();
        let is_healthy = state.is_connected();

        HealthMetrics {
            uptime: connect_time
                .filter(|_| is_healthy)
                .map(|t| now.duration_since(t)),
            time_since_last_message: last_message_time.map(|t| now.duration_since(t)),
            reconnect_count,
            is_healthy,
        }
    }

    /// Log connection state transition (pure logging function)
    pub fn log_state_transition(client_id: &str, from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connected, ConnectionState::Reconnecting(attempt)) => {
                warn!(client_id, attempt, "MQTT connection lost, reconnecting");
            }
            (ConnectionState::Reconnecting(_), ConnectionState::Connected) => {
                info!(client_id, "Reconnection successful");
            }
            (_, ConnectionState::Failed(reason)) => {
                error!(client_id, reason = %reason, "MQTT connection failed");
            }
            _ => {
                tracing::debug!(client_id, from = %from, to = %to, "MQTT connection state changed");
            }
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay: Duration },
    AbortShutdownRequested,
    /// `reconnect_on_failure` is off
    AbortDisabled,
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnectRequested,
    ConnAckAccepted,
    ConnAckRejected(ReturnCode),
    ReconnectionStarted(u32),
    PermanentFailure(String),
    DisconnectRequested,
    /// Network loop stopped
    Stopped,
}

/// Health metrics for connection monitoring
#[derive(Debug, Clone)]
pub struct HealthMetrics {
    /// Time since the current session was established
    pub uptime: Option<Duration>,
    pub time_since_last_message: Option<Duration>,
    /// Successful automatic reconnections
    pub reconnect_count: u32,
    pub is_healthy: bool,
}
