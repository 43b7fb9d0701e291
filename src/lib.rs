#![allow(clippy::missing_errors_doc)]

//! Executor for user-defined external cluster health checks.
//!
//! A check is a user-authored container image plus a pod template. This crate
//! runs that pod on an interval inside the cluster, supervises its startup and
//! runtime against separate deadlines, collects the outcome, and reaps the pod
//! afterward. It is embedded in a larger control plane and has no command-line
//! surface of its own.

pub mod checks;

// Re-export the public surface of the check executor
pub use checks::api::{KubePodApi, PodApi, PodEventStream};
pub use checks::spec::{
    CHECK_NAME_LABEL, DEFAULT_REPORTING_URL, REPORTING_URL_ENV, RUN_ID_ENV, RUN_ID_LABEL,
};
pub use checks::types::{CheckError, CheckStatus, Result};
pub use checks::{
    Checker, CheckerBuilder, DEFAULT_CHECK_NAME, DEFAULT_MAX_RUN_TIME, DEFAULT_RUN_INTERVAL,
    DEFAULT_STARTUP_TIMEOUT,
};
