//! Typed error hierarchy for the clamban server.
//!
//! Two top-level enums cover the two stateful subsystems:
//! - `StoreError`: board document, marker-file, and validation failures
//! - `SupervisorError`: agent cycle lifecycle failures

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the board store and request validation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed board JSON at {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize board: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Task {id} not found")]
    TaskNotFound { id: String },

    #[error("Unknown column '{column}'")]
    UnknownColumn { column: String },

    #[error("Path '{path}' resolves outside the project directory")]
    PathEscape { path: String },

    #[error("No team connected")]
    NoTeamConnected,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the cycle supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn lead process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Team is already running")]
    AlreadyRunning,

    #[error("Supervisor is not running")]
    NotRunning,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_task_not_found_carries_id() {
        let err = StoreError::TaskNotFound { id: "a1".into() };
        match &err {
            StoreError::TaskNotFound { id } => assert_eq!(id, "a1"),
            _ => panic!("Expected TaskNotFound"),
        }
        assert!(err.to_string().contains("a1"));
    }

    #[test]
    fn store_error_malformed_carries_path() {
        let source = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err = StoreError::Malformed {
            path: PathBuf::from("/data/board.json"),
            source,
        };
        assert!(err.to_string().contains("board.json"));
    }

    #[test]
    fn supervisor_error_spawn_failed_is_matchable() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "claude not found");
        let err = SupervisorError::SpawnFailed(io_err);
        match &err {
            SupervisorError::SpawnFailed(e) => {
                assert_eq!(e.kind(), std::io::ErrorKind::NotFound);
            }
            _ => panic!("Expected SpawnFailed variant"),
        }
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::NoTeamConnected);
        assert_std_error(&SupervisorError::AlreadyRunning);
    }
}
