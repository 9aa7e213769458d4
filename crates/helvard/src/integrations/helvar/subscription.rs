//! Change notifications from the router model to light adapters.
//!
//! The router client owns a [`SubscriptionRegistry`] and calls
//! [`SubscriptionRegistry::notify`] whenever it observes a change for a group
//! or device. Adapters hold the returned [`Subscription`] handles; dropping a
//! handle unregisters its callback.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use tokio::sync::mpsc;

use super::address::DeviceAddress;

/// What a subscription is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKey {
    Group(u16),
    Device(DeviceAddress),
}

/// Callback invoked with the key that changed. Must not block.
pub type Callback = Arc<dyn Fn(SubscriptionKey) + Send + Sync>;

/// Sender half adapters use to ask the integration to re-read and report them.
pub type RepaintSender = mpsc::UnboundedSender<String>;
pub type RepaintReceiver = mpsc::UnboundedReceiver<String>;

#[derive(Default)]
struct Inner {
    next_id: u64,
    callbacks: HashMap<SubscriptionKey, Vec<(u64, Callback)>>,
}

/// Registry of callbacks keyed by group id or device address.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for `key`. The callback stays registered until the
    /// returned handle is released or dropped.
    pub fn register(&self, key: SubscriptionKey, callback: Callback) -> Subscription {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = inner.next_id;
        inner.next_id += 1;
        inner.callbacks.entry(key).or_default().push((id, callback));

        Subscription {
            key,
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Invoke every callback registered for `key`.
    ///
    /// Callbacks run outside the registry lock so they may register or
    /// release subscriptions themselves.
    pub fn notify(&self, key: SubscriptionKey) {
        let callbacks: Vec<Callback> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            match inner.callbacks.get(&key) {
                Some(entries) => entries.iter().map(|(_, cb)| cb.clone()).collect(),
                None => return,
            }
        };
        for callback in callbacks {
            callback(key);
        }
    }

    /// Number of live callbacks for `key`.
    #[cfg(test)]
    pub fn subscriber_count(&self, key: SubscriptionKey) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.callbacks.get(&key).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys = self
            .inner
            .lock()
            .map(|inner| inner.callbacks.len())
            .unwrap_or_default();
        f.debug_struct("SubscriptionRegistry")
            .field("keys", &keys)
            .finish()
    }
}

/// Owned registration handle. Unregisters on drop.
#[derive(Debug)]
pub struct Subscription {
    key: SubscriptionKey,
    id: u64,
    registry: Weak<Mutex<Inner>>,
}

impl Subscription {
    /// Explicitly unregister. Equivalent to dropping the handle.
    pub fn release(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entries) = inner.callbacks.get_mut(&self.key) {
            entries.retain(|(id, _)| *id != self.id);
            if entries.is_empty() {
                inner.callbacks.remove(&self.key);
            }
        }
    }
}

/// Callback that turns every notification into exactly one repaint request
/// for `entity_id`. Requests are not coalesced.
pub fn repaint_callback(entity_id: String, repaint: RepaintSender) -> Callback {
    Arc::new(move |_key| {
        // The receiver only goes away during shutdown; late notifications are moot then.
        let _ = repaint.send(entity_id.clone());
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;

    fn counting_callback(counter: Arc<AtomicUsize>) -> Callback {
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_notify_only_matching_key() {
        let registry = SubscriptionRegistry::new();
        let group_hits = Arc::new(AtomicUsize::new(0));
        let device_hits = Arc::new(AtomicUsize::new(0));
        let device = DeviceAddress::new(1, 1, 1, 4);

        let _g = registry.register(
            SubscriptionKey::Group(3),
            counting_callback(group_hits.clone()),
        );
        let _d = registry.register(
            SubscriptionKey::Device(device),
            counting_callback(device_hits.clone()),
        );

        registry.notify(SubscriptionKey::Group(3));
        registry.notify(SubscriptionKey::Group(4));
        registry.notify(SubscriptionKey::Device(device));
        registry.notify(SubscriptionKey::Device(device));

        assert_eq!(group_hits.load(Ordering::SeqCst), 1);
        assert_eq!(device_hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_drop_unregisters() {
        let registry = SubscriptionRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let sub = registry.register(SubscriptionKey::Group(1), counting_callback(hits.clone()));
        let other = registry.register(SubscriptionKey::Group(1), counting_callback(hits.clone()));
        assert_eq!(registry.subscriber_count(SubscriptionKey::Group(1)), 2);

        sub.release();
        assert_eq!(registry.subscriber_count(SubscriptionKey::Group(1)), 1);

        registry.notify(SubscriptionKey::Group(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        drop(other);
        assert_eq!(registry.subscriber_count(SubscriptionKey::Group(1)), 0);
    }

    #[test]
    fn test_handle_outlives_registry() {
        let registry = SubscriptionRegistry::new();
        let sub = registry.register(SubscriptionKey::Group(1), Arc::new(|_| {}));
        drop(registry);
        drop(sub);
    }

    #[test]
    fn test_repaint_callback_one_request_per_notification() {
        let registry = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = registry.register(
            SubscriptionKey::Group(9),
            repaint_callback("light.office_group_9".to_string(), tx),
        );

        for _ in 0..3 {
            registry.notify(SubscriptionKey::Group(9));
        }

        for _ in 0..3 {
            assert_eq!(rx.try_recv().unwrap(), "light.office_group_9");
        }
        assert!(rx.try_recv().is_err());
    }
}
