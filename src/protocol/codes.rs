//! CONNACK return codes and QoS helpers

use rumqttc::{ConnectReturnCode, QoS};
use std::fmt;

/// Broker verdict carried in a CONNACK packet (MQTT 3.1.1, section 3.2.2.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnCode {
    Success,
    ProtocolVersion,
    ClientIdRejected,
    ServerUnavailable,
    BadCredentials,
    NotAuthorized,
    /// Any code outside the 3.1.1 table
    Unknown(u8),
}

impl ReturnCode {
    pub fn from_u8(code: u8) -> Self {
        match code {
            0 => ReturnCode::Success,
            1 => ReturnCode::ProtocolVersion,
            2 => ReturnCode::ClientIdRejected,
            3 => ReturnCode::ServerUnavailable,
            4 => ReturnCode::BadCredentials,
            5 => ReturnCode::NotAuthorized,
            other => ReturnCode::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            ReturnCode::Success => 0,
            ReturnCode::ProtocolVersion => 1,
            ReturnCode::ClientIdRejected => 2,
            ReturnCode::ServerUnavailable => 3,
            ReturnCode::BadCredentials => 4,
            ReturnCode::NotAuthorized => 5,
            ReturnCode::Unknown(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ReturnCode::Success)
    }

    /// Human-readable reason, as logged and embedded in errors
    pub fn message(&self) -> &'static str {
        match self {
            ReturnCode::Success => "Connection accepted",
            ReturnCode::ProtocolVersion => "Connection refused - incorrect protocol version",
            ReturnCode::ClientIdRejected => "Connection refused - invalid client identifier",
            ReturnCode::ServerUnavailable => "Connection refused - server unavailable",
            ReturnCode::BadCredentials => "Connection refused - bad username or password",
            ReturnCode::NotAuthorized => "Connection refused - not authorized",
            ReturnCode::Unknown(_) => "Connection refused - unknown reason",
        }
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl From<ConnectReturnCode> for ReturnCode {
    fn from(code: ConnectReturnCode) -> Self {
        match code {
            ConnectReturnCode::Success => ReturnCode::Success,
            ConnectReturnCode::RefusedProtocolVersion => ReturnCode::ProtocolVersion,
            ConnectReturnCode::BadClientId => ReturnCode::ClientIdRejected,
            ConnectReturnCode::ServiceUnavailable => ReturnCode::ServerUnavailable,
            ConnectReturnCode::BadUserNamePassword => ReturnCode::BadCredentials,
            ConnectReturnCode::NotAuthorized => ReturnCode::NotAuthorized,
        }
    }
}

/// Map a numeric QoS level onto rumqttc's enum
pub fn qos_from_u8(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

pub fn qos_to_u8(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_return_code_round_trips_known_codes() {
        for code in 0u8..=5 {
            assert_eq!(ReturnCode::from_u8(code).as_u8(), code);
        }
        assert_eq!(ReturnCode::from_u8(42), ReturnCode::Unknown(42));
    }

    #[test]
    fn test_return_code_messages() {
        assert_eq!(
            ReturnCode::BadCredentials.to_string(),
            "Connection refused - bad username or password"
        );
        assert_eq!(
            ReturnCode::ClientIdRejected.message(),
            "Connection refused - invalid client identifier"
        );
        assert!(ReturnCode::Success.is_success());
        assert!(!ReturnCode::NotAuthorized.is_success());
    }

    #[test]
    fn test_rumqttc_code_mapping() {
        assert_eq!(
            ReturnCode::from(ConnectReturnCode::BadUserNamePassword),
            ReturnCode::BadCredentials
        );
        assert_eq!(
            ReturnCode::from(ConnectReturnCode::ServiceUnavailable),
            ReturnCode::ServerUnavailable
        );
    }

    #[test]
    fn test_qos_levels() {
        assert_eq!(qos_from_u8(0), Some(QoS::AtMostOnce));
        assert_eq!(qos_from_u8(2), Some(QoS::ExactlyOnce));
        assert_eq!(qos_from_u8(3), None);
        assert_eq!(qos_to_u8(QoS::AtLeastOnce), 1);
    }
}
