//! Ordered middleware pipeline around every state transition.
//!
//! Entries are kept sorted by descending priority (stable on ties). The
//! before-phase is a chained left-to-right reduction that may transform or
//! veto the transition; the after-phase is an independent fan-out over the
//! committed state with per-entry error isolation. Both phases iterate a
//! copy-on-write snapshot of the sorted list, so a middleware adding or
//! removing another middleware mid-phase cannot corrupt the iteration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Result, StateError};

/// Identity of a registered middleware entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MiddlewareId(pub u64);

impl std::fmt::Display for MiddlewareId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One accepted update-and-commit cycle, as seen by the before-phase.
///
/// Ephemeral: created on the write path, consumed synchronously, not
/// retained beyond the transition unless the devtools recorder captures it.
#[derive(Debug, Clone)]
pub struct Transition<S> {
    /// State before the update.
    pub prev: Arc<S>,
    /// Candidate state after the merge. Before-hooks may replace it.
    pub next: S,
    /// Optional human-readable tag for logs and devtools.
    pub meta: Option<String>,
    /// When the write path accepted the update.
    pub at: SystemTime,
}

/// Extension hooks around every transition. All hooks default to no-ops.
pub trait Middleware<S>: Send + Sync {
    /// Observe, transform, or veto a pending transition.
    ///
    /// `Ok(Some(_))` continues the chain with the (possibly transformed)
    /// transition, `Ok(None)` vetoes it, `Err(_)` aborts the `set` call.
    fn before(&self, transition: Transition<S>) -> Result<Option<Transition<S>>> {
        Ok(Some(transition))
    }

    /// Side effect on the committed state. Failures are isolated per entry
    /// and routed to [`Middleware::on_error`], never to the `set` caller.
    fn after(&self, _state: &S) -> Result<()> {
        Ok(())
    }

    /// Receives errors raised by this entry's own hooks.
    fn on_error(&self, _error: &StateError) {}
}

/// Outcome of running the before-phase chain.
pub enum BeforeOutcome<S> {
    /// All entries passed; commit this transition.
    Continue(Transition<S>),
    /// The named entry returned no transition; discard the update.
    Veto(MiddlewareId),
}

struct Entry<S> {
    id: MiddlewareId,
    priority: i32,
    middleware: Arc<dyn Middleware<S>>,
}

/// Priority-sorted collection of middleware entries.
pub struct Pipeline<S> {
    entries: RwLock<Vec<Arc<Entry<S>>>>,
    next_id: AtomicU64,
}

impl<S> Default for Pipeline<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Pipeline<S> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a middleware. Higher priority runs earlier; entries with
    /// equal priority keep registration order.
    pub fn add(&self, middleware: Arc<dyn Middleware<S>>, priority: i32) -> MiddlewareId {
        let id = MiddlewareId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut entries = self.entries.write();
        entries.push(Arc::new(Entry {
            id,
            priority,
            middleware,
        }));
        // Stable sort: the appended entry lands after existing ties.
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        id
    }

    /// Remove an entry by id. Unknown ids are ignored.
    pub fn remove(&self, id: MiddlewareId) {
        self.entries.write().retain(|e| e.id != id);
    }

    /// Remove all entries.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<Entry<S>>> {
        self.entries.read().clone()
    }

    /// Run the before-phase chain over a snapshot of the sorted entries.
    pub fn before(&self, transition: Transition<S>) -> Result<BeforeOutcome<S>> {
        let mut current = transition;
        for entry in self.snapshot() {
            match entry.middleware.before(current) {
                Ok(Some(next)) => current = next,
                Ok(None) => return Ok(BeforeOutcome::Veto(entry.id)),
                Err(err) => {
                    entry.middleware.on_error(&err);
                    return Err(err);
                }
            }
        }
        Ok(BeforeOutcome::Continue(current))
    }

    /// Run the after-phase fan-out. Each entry's failure is converted to a
    /// [`StateError::Middleware`], handed to that entry's `on_error`, and
    /// swallowed.
    pub fn after(&self, state: &S) {
        for entry in self.snapshot() {
            if let Err(err) = entry.middleware.after(state) {
                let wrapped = StateError::Middleware {
                    id: entry.id,
                    message: err.to_string(),
                };
                debug!(middleware = %entry.id, error = %err, "after-phase hook failed");
                entry.middleware.on_error(&wrapped);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    fn transition(next: Value) -> Transition<Value> {
        Transition {
            prev: Arc::new(json!({})),
            next,
            meta: None,
            at: SystemTime::now(),
        }
    }

    struct Tracer {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Middleware<Value> for Tracer {
        fn before(&self, transition: Transition<Value>) -> Result<Option<Transition<Value>>> {
            self.log.lock().push(self.label);
            Ok(Some(transition))
        }
    }

    struct Vetoer;

    impl Middleware<Value> for Vetoer {
        fn before(&self, _transition: Transition<Value>) -> Result<Option<Transition<Value>>> {
            Ok(None)
        }
    }

    struct FailingAfter {
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware<Value> for FailingAfter {
        fn after(&self, _state: &Value) -> Result<()> {
            Err(StateError::Storage("side effect failed".to_string()))
        }

        fn on_error(&self, error: &StateError) {
            self.seen.lock().push(error.to_string());
        }
    }

    #[test]
    fn test_priority_order_with_stable_ties() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new();
        let trace = |label| {
            Arc::new(Tracer {
                label,
                log: log.clone(),
            })
        };
        // Registered A, B, C, D with priorities [10, 5, 5, 1]; B and C tie.
        pipeline.add(trace("a"), 10);
        pipeline.add(trace("b"), 5);
        pipeline.add(trace("c"), 5);
        pipeline.add(trace("d"), 1);

        pipeline.before(transition(json!({}))).unwrap();
        assert_eq!(*log.lock(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_higher_priority_runs_first_regardless_of_registration() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new();
        pipeline.add(
            Arc::new(Tracer {
                label: "low",
                log: log.clone(),
            }),
            1,
        );
        pipeline.add(
            Arc::new(Tracer {
                label: "high",
                log: log.clone(),
            }),
            9,
        );

        pipeline.before(transition(json!({}))).unwrap();
        assert_eq!(*log.lock(), vec!["high", "low"]);
    }

    #[test]
    fn test_veto_short_circuits_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new();
        pipeline.add(
            Arc::new(Tracer {
                label: "first",
                log: log.clone(),
            }),
            10,
        );
        let veto_id = pipeline.add(Arc::new(Vetoer), 5);
        pipeline.add(
            Arc::new(Tracer {
                label: "never",
                log: log.clone(),
            }),
            1,
        );

        match pipeline.before(transition(json!({}))).unwrap() {
            BeforeOutcome::Veto(id) => assert_eq!(id, veto_id),
            BeforeOutcome::Continue(_) => panic!("expected veto"),
        }
        assert_eq!(*log.lock(), vec!["first"]);
    }

    #[test]
    fn test_before_transforms_chain() {
        struct Doubler;
        impl Middleware<Value> for Doubler {
            fn before(&self, mut t: Transition<Value>) -> Result<Option<Transition<Value>>> {
                let n = t.next["n"].as_i64().unwrap();
                t.next["n"] = json!(n * 2);
                Ok(Some(t))
            }
        }

        let pipeline = Pipeline::new();
        pipeline.add(Arc::new(Doubler), 2);
        pipeline.add(Arc::new(Doubler), 1);

        match pipeline.before(transition(json!({"n": 3}))).unwrap() {
            BeforeOutcome::Continue(t) => assert_eq!(t.next, json!({"n": 12})),
            BeforeOutcome::Veto(_) => panic!("unexpected veto"),
        }
    }

    #[test]
    fn test_after_failure_is_isolated_and_routed() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new();
        pipeline.add(Arc::new(FailingAfter { seen: seen.clone() }), 10);

        struct AfterTracer {
            log: Arc<Mutex<Vec<&'static str>>>,
        }
        impl Middleware<Value> for AfterTracer {
            fn after(&self, _state: &Value) -> Result<()> {
                self.log.lock().push("ran");
                Ok(())
            }
        }
        pipeline.add(Arc::new(AfterTracer { log: log.clone() }), 1);

        pipeline.after(&json!({"ok": true}));
        // The failing entry reported to its own on_error, the other still ran.
        assert_eq!(seen.lock().len(), 1);
        assert!(seen.lock()[0].contains("side effect failed"));
        assert_eq!(*log.lock(), vec!["ran"]);
    }

    #[test]
    fn test_remove_and_clear() {
        let pipeline: Pipeline<Value> = Pipeline::new();
        let id = pipeline.add(Arc::new(Vetoer), 0);
        pipeline.add(Arc::new(Vetoer), 0);
        assert_eq!(pipeline.len(), 2);

        pipeline.remove(id);
        assert_eq!(pipeline.len(), 1);

        pipeline.clear();
        assert!(pipeline.is_empty());
    }

    #[test]
    fn test_mutation_during_phase_does_not_affect_running_snapshot() {
        struct SelfRemover {
            pipeline: Arc<Pipeline<Value>>,
            own_id: Mutex<Option<MiddlewareId>>,
            log: Arc<Mutex<Vec<&'static str>>>,
        }
        impl Middleware<Value> for SelfRemover {
            fn before(&self, t: Transition<Value>) -> Result<Option<Transition<Value>>> {
                self.log.lock().push("remover");
                if let Some(id) = *self.own_id.lock() {
                    self.pipeline.remove(id);
                }
                Ok(Some(t))
            }
        }

        let pipeline = Arc::new(Pipeline::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let remover = Arc::new(SelfRemover {
            pipeline: pipeline.clone(),
            own_id: Mutex::new(None),
            log: log.clone(),
        });
        let id = pipeline.add(remover.clone(), 10);
        *remover.own_id.lock() = Some(id);
        pipeline.add(
            Arc::new(Tracer {
                label: "tail",
                log: log.clone(),
            }),
            1,
        );

        // The phase snapshot still reaches the tail entry.
        pipeline.before(transition(json!({}))).unwrap();
        assert_eq!(*log.lock(), vec!["remover", "tail"]);
        assert_eq!(pipeline.len(), 1);
    }
}
