//! # appstate
//!
//! A client-side application state container: one canonical state value,
//! updated by deep-merged patches through a middleware pipeline, observed
//! by weak-referenced listeners and async streams, persisted through
//! pluggable storage adapters with schema-versioned migration.
//!
//! - **Deep-merge updates**: Partial patches merge recursively into state;
//!   `Patch::Remove` deletes a field
//! - **Middleware**: Priority-ordered hooks that transform or veto a
//!   transition before commit and observe it after
//! - **Subscriptions**: Weak listener registry with RAII guards, selector
//!   subscriptions with shallow/deep equality gating, and async streams
//! - **Persistence**: Async key/value adapters, versioned records, ordered
//!   migration chains, fall-back-to-initial hydration
//! - **Devtools**: Bounded transition recorder with snapshots and
//!   exportable history
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use appstate::prelude::*;
//! use serde::{Deserialize, Serialize};
//! use serde_json::json;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct App {
//!     count: i64,
//!     theme: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> appstate::Result<()> {
//!     let store = Store::builder(App {
//!         count: 0,
//!         theme: "light".to_string(),
//!     })
//!     .build();
//!
//!     // Partial update: only the named fields change.
//!     store.set(json!({"count": 1}))?;
//!
//!     // Functional update: computed from the current state.
//!     store.set(Update::with(|s: &App| {
//!         serde_json::json!({"count": s.count + 1}).into()
//!     }))?;
//!
//!     assert_eq!(store.state().count, 2);
//!     assert_eq!(store.state().theme, "light");
//!     Ok(())
//! }
//! ```
//!
//! ## Persistence and Migration
//!
//! ```rust,no_run
//! use appstate::prelude::*;
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
//! struct App {
//!     count: i64,
//! }
//!
//! #[tokio::main]
//! async fn main() -> appstate::Result<()> {
//!     // v2 renamed the persisted field "n" to "count".
//!     let rename = Migration::new(2, |mut data| {
//!         let n = data["n"].take();
//!         if let Some(map) = data.as_object_mut() {
//!             map.remove("n");
//!             map.insert("count".to_string(), n);
//!         }
//!         Ok(data)
//!     });
//!
//!     let store = Store::builder(App { count: 0 })
//!         .persist(PersistConfig {
//!             adapter: Arc::new(FileAdapter::new("app-state.json")),
//!             key: "app".to_string(),
//!             version: 2,
//!             migrations: vec![rename],
//!         })
//!         .load()
//!         .await;
//!
//!     store.set(serde_json::json!({"count": 1}))?;
//!     store.sync().await;
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod binding;
pub mod cache;
pub mod devtools;
pub mod error;
pub mod listener;
pub mod merge;
pub mod middleware;
pub mod migrate;
pub mod store;
pub mod stream;

// Re-export main types
pub use adapter::{BackoffAdapter, FileAdapter, MemoryAdapter, StorageAdapter};
pub use binding::StoreHandle;
pub use cache::{ServerCache, TtlCache};
pub use devtools::{Recorder, Snapshot, TransitionRecord};
pub use error::{Result, StateError};
pub use listener::Subscription;
pub use merge::{deep_merge, Equality, Patch};
pub use middleware::{Middleware, MiddlewareId, Transition};
pub use migrate::{Migration, Migrator};
pub use store::{
    NotifyMode, PersistConfig, State, Store, StoreBuilder, StorageRecord, Update,
};
pub use stream::{StateChange, StateStream};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::adapter::{FileAdapter, MemoryAdapter, StorageAdapter};
    pub use crate::error::{Result, StateError};
    pub use crate::merge::{Equality, Patch};
    pub use crate::middleware::{Middleware, Transition};
    pub use crate::migrate::Migration;
    pub use crate::store::{NotifyMode, PersistConfig, Store, Update};
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct App {
        count: i64,
    }

    #[tokio::test]
    async fn test_store_basic() {
        let store = Store::builder(App { count: 0 }).build();
        store.set(json!({"count": 7})).unwrap();
        assert_eq!(store.state().count, 7);
    }

    #[test]
    fn test_public_types_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}

        assert_send_sync::<Store<App>>();
        assert_send_sync::<StoreHandle<App>>();
        assert_send_sync::<MemoryAdapter>();
        assert_send_sync::<FileAdapter>();
        assert_send_sync::<Recorder>();
        assert_send_sync::<StateError>();
    }
}
