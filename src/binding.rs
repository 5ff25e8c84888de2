//! UI-binding boundary.
//!
//! A [`StoreHandle`] is what a view layer holds: a weak reference to the
//! store internals. Views come and go independently of the store's
//! lifetime, so the handle must not keep the store alive, and a call made
//! after the store is gone fails with [`StateError::ProviderMissing`]
//! rather than panicking.

use std::sync::{Arc, Weak};

use serde_json::Value;

use crate::error::{Result, StateError};
use crate::listener::{Listener, Subscription};
use crate::merge::Equality;
use crate::store::{listeners_of, server_snapshot_of, snapshot_of, StoreInner};

/// Weak handle onto a store, for code that observes but does not own it.
pub struct StoreHandle<S> {
    inner: Weak<StoreInner<S>>,
}

impl<S> Clone for StoreHandle<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> StoreHandle<S> {
    pub(crate) fn new(inner: Weak<StoreInner<S>>) -> Self {
        Self { inner }
    }

    fn upgrade(&self) -> Result<Arc<StoreInner<S>>> {
        self.inner.upgrade().ok_or(StateError::ProviderMissing)
    }

    /// Whether the backing store is still alive.
    pub fn is_connected(&self) -> bool {
        self.inner.strong_count() > 0
    }

    /// Current state snapshot.
    pub fn snapshot(&self) -> Result<Arc<S>> {
        let inner = self.upgrade()?;
        Ok(snapshot_of(&inner))
    }

    /// State as of store creation, before any hydration or commit. Serves
    /// renders that must match what a server produced from initial state.
    pub fn server_snapshot(&self) -> Result<Arc<S>> {
        let inner = self.upgrade()?;
        Ok(server_snapshot_of(&inner))
    }

    /// Subscribe to committed transitions through the handle.
    pub fn subscribe(
        &self,
        listener: impl Fn(&Arc<S>) + Send + Sync + 'static,
    ) -> Result<Subscription<S>> {
        let inner = self.upgrade()?;
        let callback: Arc<Listener<S>> = Arc::new(listener);
        Ok(listeners_of(&inner).add(callback))
    }

    /// Subscribe to a selected slice, re-firing only when the slice changes
    /// under `equality`.
    pub fn subscribe_selector<F, G>(
        &self,
        selector: F,
        equality: Equality,
        downstream: G,
    ) -> Result<Subscription<S>>
    where
        S: 'static,
        F: Fn(&S) -> Value + Send + Sync + 'static,
        G: Fn(&Value) + Send + Sync + 'static,
    {
        let inner = self.upgrade()?;
        Ok(listeners_of(&inner).add_selector(selector, equality, downstream))
    }
}
