//! Validation and decoration of user-supplied pod templates.
//!
//! The template a check author hands us is mostly opaque: node selectors,
//! tolerations, resource requests, volumes and service accounts all pass
//! through unmodified. The executor only stamps on the identity it needs to
//! supervise the pod and the environment the check binary needs to report
//! back.

use k8s_openapi::api::core::v1::{EnvVar, Pod, PodSpec};
use std::collections::BTreeMap;

use super::types::{CheckError, Result};

/// Label holding the name of the check that owns a pod. Stable; external
/// tooling uses it to reap orphans.
pub const CHECK_NAME_LABEL: &str = "kuberhealthy-check-name";

/// Label holding the run ID of the iteration that created a pod.
pub const RUN_ID_LABEL: &str = "kuberhealthy-run-id";

/// Environment variable telling the check pod where to report its result.
pub const REPORTING_URL_ENV: &str = "KUBERHEALTHY_URL";

/// Environment variable carrying the run ID so the report handler can
/// correlate results to an iteration.
pub const RUN_ID_ENV: &str = "KUBERHEALTHY_RUN_ID";

/// Default in-cluster address that check pods report back to.
pub const DEFAULT_REPORTING_URL: &str = "http://kuberhealthy.kuberhealthy.svc.local";

/// Checks run exactly once per iteration; a restart would break the
/// terminal-phase contract.
const RESTART_POLICY_NEVER: &str = "Never";

/// Ensures a user-supplied pod template has enough substance to run as a
/// check: at least one container, every container with an image reference.
pub(crate) fn validate_pod_spec(pod_spec: &PodSpec) -> Result<()> {
    if pod_spec.containers.is_empty() {
        return Err(CheckError::InvalidSpec(
            "no containers found in the check's pod spec".to_string(),
        ));
    }

    for container in &pod_spec.containers {
        if container.image.as_deref().unwrap_or_default().is_empty() {
            return Err(CheckError::InvalidSpec(format!(
                "container \"{}\" has no image set",
                container.name
            )));
        }
    }

    Ok(())
}

/// Applies the fields every check pod must carry: its own check name as the
/// hostname, the report-back environment variables on every container, and a
/// restart policy of `Never`. Caller-supplied env vars are preserved; the
/// injected ones are appended after them.
pub(crate) fn decorate_pod_spec(
    pod_spec: &mut PodSpec,
    check_name: &str,
    run_id: &str,
    reporting_url: &str,
) {
    // Lets the check binary discover its own identity
    pod_spec.hostname = Some(check_name.to_string());

    let injected = [
        EnvVar {
            name: REPORTING_URL_ENV.to_string(),
            value: Some(reporting_url.to_string()),
            ..EnvVar::default()
        },
        EnvVar {
            name: RUN_ID_ENV.to_string(),
            value: Some(run_id.to_string()),
            ..EnvVar::default()
        },
    ];

    for container in &mut pod_spec.containers {
        container
            .env
            .get_or_insert_with(Vec::new)
            .extend(injected.iter().cloned());
    }

    pod_spec.restart_policy = Some(RESTART_POLICY_NEVER.to_string());
}

/// Stacks the two ownership labels on top of whatever labels the pod already
/// carries. The run-id label must be in place before the pod is created so
/// the phase watch can correlate events to this iteration.
pub(crate) fn apply_check_labels(pod: &mut Pod, check_name: &str, run_id: &str) {
    let labels = pod.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(CHECK_NAME_LABEL.to_string(), check_name.to_string());
    labels.insert(RUN_ID_LABEL.to_string(), run_id.to_string());
}
