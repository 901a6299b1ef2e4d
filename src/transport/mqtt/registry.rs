//! Topic pattern → callback registry with wildcard dispatch

use super::client::EventHandler;
use super::lock;
use super::message_handler::{DropReason, MessageHandler};
use super::network::NetworkClient;
use crate::config::MqttConfig;
use crate::error::CallbackError;
use crate::protocol::{qos_to_u8, sanitize_payload_for_logging, topic_matches};
use rumqttc::QoS;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

pub type CallbackResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Invoked with `(topic, payload)` for every matching message
pub type MessageCallback = Arc<dyn Fn(&str, &str) -> CallbackResult + Send + Sync>;

/// Wrap a closure as a [`MessageCallback`]
pub fn message_callback<F>(f: F) -> MessageCallback
where
    F: Fn(&str, &str) -> CallbackResult + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Identifies one registered callback
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pattern: String,
    id: u64,
}

impl SubscriptionHandle {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

/// What `remove` took out of the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Nothing,
    /// Callbacks removed, others remain on the pattern
    Callback,
    /// The pattern has no callbacks left and was removed
    Pattern,
}

struct PatternEntry {
    qos: QoS,
    /// Registration order
    callbacks: Vec<(u64, MessageCallback)>,
}

pub struct SubscriptionRegistry {
    config: Arc<MqttConfig>,
    entries: Mutex<BTreeMap<String, PatternEntry>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new(config: Arc<MqttConfig>) -> Self {
        Self {
            config,
            entries: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a callback. Duplicates are kept and each fires; the latest QoS
    /// wins for the pattern.
    pub fn register(&self, pattern: &str, qos: QoS, callback: MessageCallback) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = lock(&self.entries);
        let entry = entries
            .entry(pattern.to_string())
            .or_insert_with(|| PatternEntry {
                qos,
                callbacks: Vec::new(),
            });
        entry.qos = qos;
        entry.callbacks.push((id, callback));

        SubscriptionHandle {
            pattern: pattern.to_string(),
            id,
        }
    }

    /// Remove one callback by handle, or every callback on `pattern`
    pub fn remove(&self, pattern: &str, handle: Option<&SubscriptionHandle>) -> Removal {
        let mut entries = lock(&self.entries);
        let Some(entry) = entries.get_mut(pattern) else {
            return Removal::Nothing;
        };

        match handle {
            Some(handle) => {
                if handle.pattern != pattern {
                    return Removal::Nothing;
                }
                let before = entry.callbacks.len();
                entry.callbacks.retain(|(id, _)| *id != handle.id);
                if entry.callbacks.len() == before {
                    return Removal::Nothing;
                }
            }
            None => entry.callbacks.clear(),
        }

        if entry.callbacks.is_empty() {
            entries.remove(pattern);
            Removal::Pattern
        } else {
            Removal::Callback
        }
    }

    /// Registered patterns with their QoS, ordered by pattern
    pub fn patterns(&self) -> Vec<(String, QoS)> {
        lock(&self.entries)
            .iter()
            .map(|(pattern, entry)| (pattern.clone(), entry.qos))
            .collect()
    }

    pub fn callback_count(&self, pattern: &str) -> usize {
        lock(&self.entries)
            .get(pattern)
            .map_or(0, |entry| entry.callbacks.len())
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Invoke every callback whose pattern matches `topic`; returns how many ran.
    ///
    /// Callbacks run on a snapshot taken before the first one is invoked, so a
    /// callback may (un)subscribe without affecting this dispatch. Errors and
    /// panics are contained and logged.
    pub fn dispatch(&self, topic: &str, payload: &str) -> usize {
        let matching: Vec<(String, MessageCallback)> = {
            let entries = lock(&self.entries);
            entries
                .iter()
                .filter(|(pattern, _)| topic_matches(pattern, topic))
                .flat_map(|(pattern, entry)| {
                    entry
                        .callbacks
                        .iter()
                        .map(move |(_, callback)| (pattern.clone(), callback.clone()))
                })
                .collect()
        };

        if matching.is_empty() {
            debug!(topic, "No subscription matches message");
            return 0;
        }

        for (pattern, callback) in &matching {
            let failure = match catch_unwind(AssertUnwindSafe(|| callback(topic, payload))) {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(CallbackError::Failed {
                    pattern: pattern.clone(),
                    topic: topic.to_string(),
                    reason: e.to_string(),
                }),
                Err(panic) => Some(CallbackError::Panicked {
                    pattern: pattern.clone(),
                    topic: topic.to_string(),
                    reason: panic_message(panic.as_ref()),
                }),
            };
            if let Some(failure) = failure {
                error!("{}", failure);
            }
        }
        matching.len()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl EventHandler for SubscriptionRegistry {
    fn on_connected(&self, network: &dyn NetworkClient, session_present: bool) {
        let filters = self.patterns();
        if filters.is_empty() {
            return;
        }
        let count = filters.len();
        match network.try_subscribe(filters) {
            Ok(()) => info!(count, session_present, "Resubscribed to registered patterns"),
            Err(e) => error!(count, "Failed to resubscribe after connect: {}", e),
        }
    }

    fn on_message(&self, topic: &str, payload: &[u8], retain: bool) {
        let max = self.config.max_payload_size();
        match MessageHandler::inspect_payload(payload, max) {
            Ok(text) => {
                if self.config.log_payloads() {
                    debug!(
                        topic,
                        retain,
                        payload = %sanitize_payload_for_logging(payload, self.config.max_payload_log_length()),
                        "Message received"
                    );
                } else {
                    debug!(topic, retain, size = payload.len(), "Message received");
                }
                self.dispatch(topic, text);
            }
            Err(DropReason::TooLarge { size, max }) => {
                warn!(topic, size, max, "Dropping message exceeding maximum payload size");
            }
            Err(DropReason::NotUtf8) => {
                warn!(topic, size = payload.len(), "Dropping message with non-UTF-8 payload");
            }
        }
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let patterns: Vec<(String, u8)> = self
            .patterns()
            .into_iter()
            .map(|(pattern, qos)| (pattern, qos_to_u8(qos)))
            .collect();
        f.debug_struct("SubscriptionRegistry")
            .field("patterns", &patterns)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqttSettings;
    use std::sync::atomic::AtomicUsize;

    fn registry() -> SubscriptionRegistry {
        SubscriptionRegistry::new(Arc::new(MqttConfig::new(MqttSettings::default()).unwrap()))
    }

    fn counter() -> (Arc<AtomicUsize>, MessageCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let callback = message_callback(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (count, callback)
    }

    #[test]
    fn test_wildcard_dispatch() {
        let registry = registry();
        let (single, single_cb) = counter();
        let (multi, multi_cb) = counter();
        registry.register("sensor/+/temperature", QoS::AtLeastOnce, single_cb);
        registry.register("sensor/#", QoS::AtLeastOnce, multi_cb);

        assert_eq!(registry.dispatch("sensor/room1/temperature", "21.5"), 2);
        assert_eq!(registry.dispatch("sensor/room1/room2/temperature", "21.5"), 1);
        assert_eq!(registry.dispatch("sensor", "x"), 1);
        assert_eq!(registry.dispatch("actuator/fan", "on"), 0);

        assert_eq!(single.load(Ordering::SeqCst), 1);
        assert_eq!(multi.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_duplicate_callbacks_each_fire_in_order() {
        let registry = registry();
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second"] {
            let order = order.clone();
            registry.register(
                "devices/+/status",
                QoS::AtLeastOnce,
                message_callback(move |_, _| {
                    order.lock().unwrap().push(label);
                    Ok(())
                }),
            );
        }
        let (count, callback) = counter();
        registry.register("devices/+/status", QoS::AtLeastOnce, callback.clone());
        registry.register("devices/+/status", QoS::AtLeastOnce, callback);

        registry.dispatch("devices/d1/status", "online");
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(registry.callback_count("devices/+/status"), 4);
    }

    #[test]
    fn test_failing_callbacks_do_not_block_others() {
        let registry = registry();
        registry.register(
            "devices/#",
            QoS::AtLeastOnce,
            message_callback(|_, _| Err("storage unavailable".into())),
        );
        registry.register(
            "devices/#",
            QoS::AtLeastOnce,
            message_callback(|_, _| panic!("callback bug")),
        );
        let (count, callback) = counter();
        registry.register("devices/#", QoS::AtLeastOnce, callback);

        assert_eq!(registry.dispatch("devices/d1/telemetry", "{}"), 3);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_by_handle_and_all() {
        let registry = registry();
        let (_, callback) = counter();
        let first = registry.register("a/b", QoS::AtMostOnce, callback.clone());
        let second = registry.register("a/b", QoS::AtLeastOnce, callback.clone());
        let other = registry.register("c/d", QoS::AtLeastOnce, callback);

        assert_eq!(registry.remove("a/b", Some(&other)), Removal::Nothing);
        assert_eq!(registry.remove("a/b", Some(&first)), Removal::Callback);
        assert_eq!(registry.remove("a/b", Some(&first)), Removal::Nothing);
        assert_eq!(registry.patterns(), vec![
            ("a/b".to_string(), QoS::AtLeastOnce),
            ("c/d".to_string(), QoS::AtLeastOnce),
        ]);
        assert_eq!(registry.remove("a/b", Some(&second)), Removal::Pattern);
        assert_eq!(registry.remove("c/d", None), Removal::Pattern);
        assert_eq!(registry.remove("missing", None), Removal::Nothing);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_callback_may_unsubscribe_itself() {
        let registry = Arc::new(registry());
        let (count, counting) = counter();
        let handle_slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));

        let self_removing: MessageCallback = {
            let registry = Arc::downgrade(&registry);
            let handle_slot = handle_slot.clone();
            message_callback(move |_, _| {
                let handle = handle_slot.lock().unwrap().clone();
                if let (Some(registry), Some(handle)) = (registry.upgrade(), handle) {
                    registry.remove(handle.pattern(), Some(&handle));
                }
                Ok(())
            })
        };
        let handle = registry.register("alerts/#", QoS::AtLeastOnce, self_removing);
        *handle_slot.lock().unwrap() = Some(handle);
        registry.register("alerts/#", QoS::AtLeastOnce, counting);

        assert_eq!(registry.dispatch("alerts/fire", "!"), 2);
        assert_eq!(registry.dispatch("alerts/fire", "!"), 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_invalid_payloads_are_dropped() {
        let mut settings = MqttSettings::default();
        settings.max_payload_size = 4;
        let registry =
            SubscriptionRegistry::new(Arc::new(MqttConfig::new(settings).unwrap()));
        let (count, callback) = counter();
        registry.register("#", QoS::AtLeastOnce, callback);

        registry.on_message("a", b"12345", false);
        registry.on_message("a", &[0xff, 0xfe], false);
        registry.on_message("a", b"ok", false);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
