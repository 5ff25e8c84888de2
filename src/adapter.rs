//! Storage adapters - the persistence boundary of the store.
//!
//! The store only ever talks to the [`StorageAdapter`] trait; concrete
//! backends (browser local storage, on-device databases) live outside this
//! crate. Shipped here: an in-memory adapter for tests and ephemeral use, a
//! single-document JSON file adapter as the durable option, and a bounded
//! exponential-backoff wrapper for flaky backends.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{Result, StateError};

/// Abstract key/value persistence backend.
///
/// Errors surface as [`StateError::Storage`]; the store treats them as
/// best-effort failures, logs, and never rolls back in-memory state.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Read the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Remove every key this adapter holds.
    async fn clear(&self) -> Result<()>;
}

/// In-memory adapter. Not durable; for tests and ephemeral stores.
#[derive(Default)]
pub struct MemoryAdapter {
    data: RwLock<HashMap<String, String>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.data.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.data.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.data.write().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.data.write().clear();
        Ok(())
    }
}

/// Durable adapter storing all keys as fields of one JSON document on disk.
pub struct FileAdapter {
    path: PathBuf,
    // Serializes read-modify-write cycles on the document.
    lock: tokio::sync::Mutex<()>,
}

impl FileAdapter {
    pub fn new(path: impl AsRef<Path>) -> Self {
        debug!(path = %path.as_ref().display(), "opening file adapter");
        Self {
            path: path.as_ref().to_path_buf(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn read_document(&self) -> Result<Map<String, Value>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(map)) => Ok(map),
                Ok(_) | Err(_) => Err(StateError::Storage(format!(
                    "{} is not a JSON object document",
                    self.path.display()
                ))),
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_document(&self, document: &Map<String, Value>) -> Result<()> {
        let text = serde_json::to_string(&Value::Object(document.clone()))?;
        tokio::fs::write(&self.path, text).await.map_err(Into::into)
    }
}

#[async_trait]
impl StorageAdapter for FileAdapter {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        let document = self.read_document().await?;
        Ok(document
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut document = self.read_document().await?;
        document.insert(key.to_string(), Value::String(value.to_string()));
        self.write_document(&document).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut document = self.read_document().await?;
        if document.remove(key).is_some() {
            self.write_document(&document).await?;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Wraps another adapter with bounded exponential-backoff retries.
pub struct BackoffAdapter<A> {
    inner: A,
    max_attempts: u32,
    base_delay: Duration,
}

impl<A: StorageAdapter> BackoffAdapter<A> {
    /// `max_attempts` counts the initial try; it must be at least 1.
    pub fn new(inner: A, max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    async fn retrying<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut delay = self.base_delay;
        let mut last_err = None;
        for attempt in 1..=self.max_attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!(op = op_name, attempt, error = %err, "storage attempt failed");
                    last_err = Some(err);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| StateError::Storage("no attempts made".to_string())))
    }
}

#[async_trait]
impl<A: StorageAdapter> StorageAdapter for BackoffAdapter<A> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.retrying("get", || self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.retrying("set", || self.inner.set(key, value)).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.retrying("remove", || self.inner.remove(key)).await
    }

    async fn clear(&self) -> Result<()> {
        self.retrying("clear", || self.inner.clear()).await
    }
}
