//! Schema-versioned migration of persisted state.
//!
//! A [`Migration`] upgrades persisted data *to* the version it is keyed by.
//! [`Migrator::migrate`] applies the minimal ascending chain between a
//! stored version and the configured current version, failing loudly on any
//! gap rather than skipping steps.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Result, StateError};

/// A pure function upgrading persisted data to one schema version.
type MigrateFn = dyn Fn(Value) -> Result<Value> + Send + Sync;

/// One step of a migration chain.
#[derive(Clone)]
pub struct Migration {
    /// The version this migration upgrades *to*.
    pub version: u64,
    run: Arc<MigrateFn>,
}

impl Migration {
    pub fn new(version: u64, run: impl Fn(Value) -> Result<Value> + Send + Sync + 'static) -> Self {
        Self {
            version,
            run: Arc::new(run),
        }
    }
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Upgrades persisted payloads to the current schema version.
///
/// Built once from configuration, never mutated afterwards.
#[derive(Debug)]
pub struct Migrator {
    current: u64,
    steps: BTreeMap<u64, Migration>,
}

impl Migrator {
    pub fn new(current_version: u64, migrations: impl IntoIterator<Item = Migration>) -> Self {
        Self {
            current: current_version,
            steps: migrations.into_iter().map(|m| (m.version, m)).collect(),
        }
    }

    /// The version this migrator upgrades to.
    pub fn current_version(&self) -> u64 {
        self.current
    }

    /// Upgrade `data` from `from` to the current version.
    ///
    /// Applies every registered step in `(from, current]` in ascending
    /// order, threading the output of one step into the next. Fails with
    /// [`StateError::MissingMigration`] on a gap and
    /// [`StateError::FutureVersion`] when `from` exceeds the current
    /// version; down-migrations are never attempted.
    pub fn migrate(&self, from: u64, data: Value) -> Result<Value> {
        if from == self.current {
            return Ok(data);
        }
        if from > self.current {
            return Err(StateError::FutureVersion {
                found: from,
                current: self.current,
            });
        }

        let mut value = data;
        for version in (from + 1)..=self.current {
            let step = self
                .steps
                .get(&version)
                .ok_or(StateError::MissingMigration { version })?;
            value = (step.run)(value)?;
        }
        Ok(value)
    }
}
