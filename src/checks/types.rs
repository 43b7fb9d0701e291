//! Error and status types for the external check executor.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result alias used throughout the check executor.
pub type Result<T, E = CheckError> = std::result::Result<T, E>;

/// Everything that can go wrong while driving one external check.
///
/// Nothing here is retried within an iteration; recovery happens on the next
/// interval tick. The `Display` form of a variant is exactly what lands in
/// the checker's error buffer.
#[derive(Error, Debug)]
pub enum CheckError {
    /// The user-supplied pod template cannot be run as a check.
    #[error("invalid pod spec: {0}")]
    InvalidSpec(String),

    /// A required checker field was left unset by the supervisor.
    #[error("checker misconfigured: {0}")]
    Sanity(String),

    /// Any failure surfaced by the cluster API.
    #[error("kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    /// Stray pods from a prior iteration could not be removed.
    #[error("failed to clean up pods before starting external checker: {0}")]
    StrayCleanup(String),

    /// The check pod could not be created.
    #[error("failed to create pod for checker: {0}")]
    PodCreate(String),

    /// The pod never left the pending phase before the startup deadline.
    #[error("failed to see pod running within timeout{0}")]
    StartupTimeout(CleanupNote),

    /// The pod did not reach a terminal phase before the run deadline.
    #[error("pod ran too long and was shut down{0}")]
    RunTimeout(CleanupNote),

    /// The phase watch was canceled before the target phase was observed.
    #[error("pod phase watch aborted")]
    WatchAborted,

    /// The watch stream ended before the target phase was observed.
    #[error("pod phase watch ended before the pod reached the expected phase")]
    WatchClosed,

    /// The pod was still visible when the shutdown deadline expired.
    #[error("timed out waiting for pod to shut down")]
    ShutdownTimeout,
}

/// Outcome of the best-effort pod delete issued after a timeout.
///
/// Renders as an empty suffix when the delete succeeded, so the timeout
/// message alone reaches the error buffer. When the delete also failed, both
/// errors are concatenated into one surfaced message, joined by a connector
/// word: "and" after a startup timeout, "but" after a run timeout.
#[derive(Debug)]
pub struct CleanupNote {
    connector: &'static str,
    delete_error: Option<String>,
}

impl CleanupNote {
    pub(crate) fn and(delete_error: Option<String>) -> Self {
        Self {
            connector: "and",
            delete_error,
        }
    }

    pub(crate) fn but(delete_error: Option<String>) -> Self {
        Self {
            connector: "but",
            delete_error,
        }
    }
}

impl fmt::Display for CleanupNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.delete_error {
            Some(err) => write!(
                f,
                " {} an error occurred when deleting the pod: {err}",
                self.connector
            ),
            None => Ok(()),
        }
    }
}

/// Point-in-time status of a check, derived from the most recent iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckStatus {
    /// True when the last iteration completed without error.
    pub ok: bool,
    /// Diagnostics from the most recent iteration; empty when `ok`.
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_messages_are_bare_when_cleanup_succeeded() {
        let err = CheckError::StartupTimeout(CleanupNote::and(None));
        assert_eq!(err.to_string(), "failed to see pod running within timeout");

        let err = CheckError::RunTimeout(CleanupNote::but(None));
        assert_eq!(err.to_string(), "pod ran too long and was shut down");
    }

    #[test]
    fn timeout_messages_carry_the_cleanup_failure() {
        let err = CheckError::StartupTimeout(CleanupNote::and(Some(
            "pods \"dns\" is forbidden".to_string(),
        )));
        assert_eq!(
            err.to_string(),
            "failed to see pod running within timeout and an error occurred when deleting the pod: pods \"dns\" is forbidden"
        );

        let err = CheckError::RunTimeout(CleanupNote::but(Some(
            "pods \"dns\" is forbidden".to_string(),
        )));
        assert_eq!(
            err.to_string(),
            "pod ran too long and was shut down but an error occurred when deleting the pod: pods \"dns\" is forbidden"
        );
    }
}
