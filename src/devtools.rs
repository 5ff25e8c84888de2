//! Passive transition recorder for developer tooling.
//!
//! The recorder observes committed transitions, keeping a capped action log
//! and periodic state snapshots. It is optional: a store without a recorder
//! pays nothing. Inspector rendering and time-travel UI live outside this
//! crate; only the log and snapshot list are exposed.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::merge::Patch;

/// One recorded transition.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    /// The meta tag the writer attached, if any.
    pub kind: Option<String>,
    /// The partial update that produced the transition.
    pub payload: Patch,
    pub prev_state: Value,
    pub next_state: Value,
    pub duration_ms: f64,
    /// Unix milliseconds.
    pub timestamp: u64,
}

/// A point-in-time copy of the committed state.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub state: Value,
    /// Unix milliseconds.
    pub timestamp: u64,
}

#[derive(Serialize)]
struct History<'a> {
    actions: &'a VecDeque<TransitionRecord>,
    snapshots: &'a Vec<Snapshot>,
}

struct RecorderInner {
    actions: VecDeque<TransitionRecord>,
    snapshots: Vec<Snapshot>,
    since_snapshot: usize,
}

/// Records transitions and periodic snapshots for inspection.
pub struct Recorder {
    inner: Mutex<RecorderInner>,
    capacity: usize,
    snapshot_every: usize,
}

pub(crate) fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Recorder {
    /// `capacity` bounds the action log and saturates to at least 1;
    /// `snapshot_every` takes a snapshot each N transitions (0 disables
    /// periodic snapshots).
    pub fn new(capacity: usize, snapshot_every: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(RecorderInner {
                actions: VecDeque::with_capacity(capacity.min(256)),
                snapshots: Vec::new(),
                since_snapshot: 0,
            }),
            capacity,
            snapshot_every,
        }
    }

    /// Append a transition, evicting the oldest entries past capacity.
    pub fn on_transition(&self, record: TransitionRecord) {
        let mut inner = self.inner.lock();
        while inner.actions.len() >= self.capacity {
            inner.actions.pop_front();
        }
        let next_state = record.next_state.clone();
        let timestamp = record.timestamp;
        inner.actions.push_back(record);

        inner.since_snapshot += 1;
        if self.snapshot_every > 0 && inner.since_snapshot >= self.snapshot_every {
            inner.since_snapshot = 0;
            inner.snapshots.push(Snapshot {
                state: next_state,
                timestamp,
            });
        }
    }

    /// The most recently committed state, if anything was recorded.
    pub fn snapshot(&self) -> Option<Snapshot> {
        let inner = self.inner.lock();
        inner.actions.back().map(|record| Snapshot {
            state: record.next_state.clone(),
            timestamp: record.timestamp,
        })
    }

    /// Serialize the action log and snapshot list as JSON.
    pub fn export_history(&self) -> Result<String> {
        let inner = self.inner.lock();
        let history = History {
            actions: &inner.actions,
            snapshots: &inner.snapshots,
        };
        serde_json::to_string(&history).map_err(Into::into)
    }

    /// Drop all recorded history (used when state is imported wholesale).
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.actions.clear();
        inner.snapshots.clear();
        inner.since_snapshot = 0;
    }

    /// Number of retained action records.
    pub fn len(&self) -> usize {
        self.inner.lock().actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().actions.is_empty()
    }
}
