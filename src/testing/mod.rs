//! Testing utilities
//!
//! An in-memory broker so connections, publishers, subscribers and pools can
//! be exercised without a running MQTT server.

pub mod mocks;

pub use mocks::*;
