//! Error types for state container operations.
//!
//! The taxonomy separates fatal transition errors (merge failure, middleware
//! veto) from contained peripheral errors (persistence, after-phase side
//! effects): the former abort a single `set` call and reach its caller, the
//! latter are logged and never surface.

use thiserror::Error;

use crate::middleware::MiddlewareId;

/// Errors that can occur during state container operations.
#[derive(Debug, Error)]
pub enum StateError {
    /// A before-phase middleware vetoed the transition. State unchanged.
    #[error("transition vetoed by middleware {id}")]
    Vetoed { id: MiddlewareId },

    /// Deep merge or candidate-state decoding failed. State unchanged.
    #[error("merge failed: {0}")]
    Merge(String),

    /// An after-phase middleware hook failed. State remains committed.
    #[error("middleware {id} failed: {message}")]
    Middleware { id: MiddlewareId, message: String },

    /// Storage adapter read/write failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// No migration registered for a version step in the required chain.
    #[error("no migration registered for version {version}")]
    MissingMigration { version: u64 },

    /// Persisted data is newer than this build's configured version.
    #[error("persisted version {found} is newer than current version {current}")]
    FutureVersion { found: u64, current: u64 },

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The store was accessed through a handle after it was dropped.
    /// A programmer error, not a runtime condition to recover from.
    #[error("store accessed outside its lifetime")]
    ProviderMissing,
}

/// Result type alias for state operations.
pub type Result<T> = std::result::Result<T, StateError>;

impl StateError {
    /// Returns true if this error aborts the calling operation rather than
    /// being contained and logged in the background.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StateError::Vetoed { .. }
                | StateError::Merge(_)
                | StateError::Serialization(_)
                | StateError::ProviderMissing
        )
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for StateError {
    fn from(err: std::io::Error) -> Self {
        StateError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StateError::MissingMigration { version: 2 };
        assert!(err.to_string().contains("version 2"));

        let err = StateError::FutureVersion {
            found: 5,
            current: 3,
        };
        assert!(err.to_string().contains("version 5"));
        assert!(err.to_string().contains("current version 3"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(StateError::Merge("bad shape".to_string()).is_fatal());
        assert!(StateError::ProviderMissing.is_fatal());
        assert!(!StateError::Storage("disk".to_string()).is_fatal());
        assert!(!StateError::Middleware {
            id: MiddlewareId(1),
            message: "boom".to_string()
        }
        .is_fatal());
        assert!(!StateError::MissingMigration { version: 2 }.is_fatal());
    }

    #[test]
    fn test_serde_error_conversion() {
        let bad: std::result::Result<u32, _> = serde_json::from_str("not json");
        let err: StateError = bad.unwrap_err().into();
        assert!(matches!(err, StateError::Serialization(_)));
    }
}
