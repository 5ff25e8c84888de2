//! Subscriber registry with weak-reference cleanup.
//!
//! The registry never extends a listener's lifetime: it holds [`Weak`]
//! references, and the strong side lives in the [`Subscription`] guard
//! returned to the caller. A component that drops its guard without
//! explicitly unsubscribing simply leaves a dead slot behind, which
//! notification and [`Registry::cleanup`] prune silently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::merge::Equality;

/// Callback invoked with each committed state snapshot.
pub type Listener<S> = dyn Fn(&Arc<S>) + Send + Sync;

struct Slot<S> {
    id: u64,
    callback: Weak<Listener<S>>,
}

/// De-duplicated set of subscribers, keyed by listener identity.
pub struct Registry<S> {
    slots: RwLock<Vec<Slot<S>>>,
    next_id: AtomicU64,
}

/// Keeps a listener alive and registered.
///
/// Dropping the guard releases the listener; the registry notices the dead
/// slot on the next notification or cleanup sweep. Call
/// [`Subscription::unsubscribe`] for immediate removal.
#[must_use = "dropping the subscription unsubscribes the listener"]
pub struct Subscription<S> {
    id: u64,
    // Field order matters only for clarity; the strong Arc is the listener's
    // sole owner outside short-lived notify upgrades.
    _callback: Arc<Listener<S>>,
    registry: Weak<Registry<S>>,
}

impl<S> Subscription<S> {
    /// Remove the listener from the registry immediately.
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

impl<S> Default for Registry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Registry<S> {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener, returning the guard that keeps it alive.
    ///
    /// Registering the same callback `Arc` again reuses the existing slot,
    /// so a listener is never delivered twice per notification.
    pub fn add(self: &Arc<Self>, callback: Arc<Listener<S>>) -> Subscription<S> {
        let mut slots = self.slots.write();
        let existing = slots.iter().find(|slot| {
            slot.callback
                .upgrade()
                .is_some_and(|live| Arc::ptr_eq(&live, &callback))
        });
        let id = match existing {
            Some(slot) => slot.id,
            None => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                slots.push(Slot {
                    id,
                    callback: Arc::downgrade(&callback),
                });
                id
            }
        };
        Subscription {
            id,
            _callback: callback,
            registry: Arc::downgrade(self),
        }
    }

    /// Register a selector-gated listener: `downstream` only re-fires when
    /// the selected slice differs from the previously delivered one under
    /// `equality`.
    pub fn add_selector<F, G>(
        self: &Arc<Self>,
        selector: F,
        equality: Equality,
        downstream: G,
    ) -> Subscription<S>
    where
        S: 'static,
        F: Fn(&S) -> Value + Send + Sync + 'static,
        G: Fn(&Value) + Send + Sync + 'static,
    {
        let last: Mutex<Option<Value>> = Mutex::new(None);
        self.add(Arc::new(move |state: &Arc<S>| {
            let slice = selector(state);
            let mut last = last.lock();
            let changed = match last.as_ref() {
                Some(prev) => !equality.eval(prev, &slice),
                None => true,
            };
            if changed {
                downstream(&slice);
                *last = Some(slice);
            }
        }))
    }

    fn remove(&self, id: u64) {
        self.slots.write().retain(|slot| slot.id != id);
    }

    /// Invoke every live listener with `state`, in registration order.
    /// Dead slots encountered along the way are pruned, not errors.
    pub fn notify(&self, state: &Arc<S>) {
        let snapshot: Vec<(u64, Weak<Listener<S>>)> = self
            .slots
            .read()
            .iter()
            .map(|slot| (slot.id, slot.callback.clone()))
            .collect();

        let mut dead = Vec::new();
        for (id, weak) in snapshot {
            match weak.upgrade() {
                Some(callback) => callback(state),
                None => dead.push(id),
            }
        }
        if !dead.is_empty() {
            self.slots.write().retain(|slot| !dead.contains(&slot.id));
        }
    }

    /// Proactively prune dead slots.
    pub fn cleanup(&self) {
        self.slots
            .write()
            .retain(|slot| slot.callback.strong_count() > 0);
    }

    /// Number of live listeners.
    pub fn len(&self) -> usize {
        self.slots
            .read()
            .iter()
            .filter(|slot| slot.callback.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counting_listener(hits: Arc<AtomicUsize>) -> Arc<Listener<Value>> {
        Arc::new(move |_state: &Arc<Value>| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_notify_reaches_live_listeners() {
        let registry = Arc::new(Registry::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let _sub = registry.add(counting_listener(hits.clone()));

        registry.notify(&Arc::new(json!({"n": 1})));
        registry.notify(&Arc::new(json!({"n": 2})));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dropped_guard_stops_delivery_and_is_pruned() {
        let registry = Arc::new(Registry::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let sub = registry.add(counting_listener(hits.clone()));
        assert_eq!(registry.len(), 1);

        drop(sub);
        assert_eq!(registry.len(), 0);

        // Notify skips the dead slot and prunes it.
        registry.notify(&Arc::new(json!({})));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(registry.slots.read().is_empty());
    }

    #[test]
    fn test_same_callback_registers_once() {
        let registry = Arc::new(Registry::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let callback = counting_listener(hits.clone());

        let first = registry.add(callback.clone());
        let second = registry.add(callback);
        assert_eq!(registry.len(), 1);

        registry.notify(&Arc::new(json!({"n": 1})));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // The slot stays live while either guard remains.
        drop(first);
        registry.notify(&Arc::new(json!({"n": 2})));
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        drop(second);
        registry.cleanup();
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_cleanup_prunes_dead_slots() {
        let registry = Arc::new(Registry::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let keep = registry.add(counting_listener(hits.clone()));
        let dead = registry.add(counting_listener(hits.clone()));
        drop(dead);

        assert_eq!(registry.slots.read().len(), 2);
        registry.cleanup();
        assert_eq!(registry.slots.read().len(), 1);
        assert_eq!(registry.len(), 1);
        drop(keep);
    }

    #[test]
    fn test_explicit_unsubscribe_removes_immediately() {
        let registry: Arc<Registry<Value>> = Arc::new(Registry::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let sub = registry.add(counting_listener(hits.clone()));

        sub.unsubscribe();
        assert!(registry.slots.read().is_empty());
    }

    #[test]
    fn test_selector_gates_redundant_notifications() {
        let registry: Arc<Registry<Value>> = Arc::new(Registry::new());
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        let _sub = registry.add_selector(
            |state: &Value| state["count"].clone(),
            Equality::Deep,
            move |slice| sink.lock().push(slice.clone()),
        );

        registry.notify(&Arc::new(json!({"count": 1, "other": "a"})));
        // Same slice, different unrelated field: no re-fire.
        registry.notify(&Arc::new(json!({"count": 1, "other": "b"})));
        registry.notify(&Arc::new(json!({"count": 2, "other": "b"})));

        assert_eq!(*delivered.lock(), vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_selector_shallow_equality_refires_on_nested_slices() {
        let registry: Arc<Registry<Value>> = Arc::new(Registry::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let hits = fired.clone();
        let _sub = registry.add_selector(
            |state: &Value| state["nested"].clone(),
            Equality::Shallow,
            move |_slice| {
                hits.fetch_add(1, Ordering::SeqCst);
            },
        );

        // Identical nested objects are conservatively treated as changed.
        registry.notify(&Arc::new(json!({"nested": {"a": {"b": 1}}})));
        registry.notify(&Arc::new(json!({"nested": {"a": {"b": 1}}})));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
