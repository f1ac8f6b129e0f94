//! Error types and handling for the memory-health engine.
//!
//! Monitoring and cleanup failures are contained and logged by their owning
//! component; they never propagate into unrelated request handling. Domain
//! errors from wrapped database operations always propagate unchanged.

use thiserror::Error;

/// Result type alias for memory-health operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration, fatal at startup
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Pool acquire timed out against a saturated pool
    #[error("connection pool exhausted after {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    /// Pool has been shut down
    #[error("connection pool is closed")]
    PoolClosed,

    /// Connection factory failed to produce a connection
    #[error("connection factory error: {0}")]
    Factory(String),

    /// Heap snapshot capture failed; recorded as a failed attempt,
    /// independent of subsequent scheduled attempts
    #[error("heap snapshot capture failed: {0}")]
    SnapshotCapture(String),

    /// A single registered collection's clear failed during cleanup;
    /// isolated per action, never aborts the whole sequence
    #[error("cleanup action '{action}' failed: {reason}")]
    CleanupAction { action: String, reason: String },

    /// Explicit GC was requested but no capability is present
    #[error("garbage collection capability unavailable")]
    GcUnavailable,

    /// Memory statistics could not be read from the host
    #[error("memory stats unavailable: {0}")]
    StatsUnavailable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether the caller can reasonably retry the failed operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::PoolExhausted { .. }
                | Error::SnapshotCapture(_)
                | Error::CleanupAction { .. }
                | Error::StatsUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhausted_is_recoverable() {
        assert!(Error::PoolExhausted { waited_ms: 500 }.is_recoverable());
        assert!(!Error::Configuration("bad".into()).is_recoverable());
        assert!(!Error::GcUnavailable.is_recoverable());
    }

    #[test]
    fn display_includes_context() {
        let err = Error::CleanupAction {
            action: "query-cache".into(),
            reason: "poisoned".into(),
        };
        assert!(err.to_string().contains("query-cache"));
    }
}
