//! Execution of user-defined external checks.
//!
//! A [`Checker`] owns one configured check: a pod template that is run on an
//! interval, supervised through separate startup and runtime deadlines, and
//! reaped afterward. The checker is effectively a small operator: each
//! iteration materializes the desired pod, correlates watch events to the
//! iteration through a unique run ID, and reconciles cleanup.

pub mod api;
pub mod spec;
pub mod types;
mod watch;

use k8s_openapi::api::core::v1::{Pod, PodSpec};
use kube::{Client, ResourceExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info};
use uuid::Uuid;

use self::api::{KubePodApi, PodApi};
use self::types::{CheckError, CheckStatus, CleanupNote, Result};
use self::watch::{PhaseTarget, PhaseWatch};

/// Default period between check iterations.
pub const DEFAULT_RUN_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Default time a check pod has to leave the pending phase after creation.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default time a check pod may run once it has started.
pub const DEFAULT_MAX_RUN_TIME: Duration = Duration::from_secs(15 * 60);

/// Prefix of every checker's exposed name.
pub const DEFAULT_CHECK_NAME: &str = "external-check";

/// Environment variable consulted for the namespace when none is configured.
const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";

/// How often the shutdown coordinator polls the API for pod absence.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Builder for [`Checker`].
///
/// The check name and the pod template are required up front; a checker
/// cannot exist without them. Everything else defaults to the platform
/// conventions and can be overridden by the driving supervisor.
pub struct CheckerBuilder {
    check_name: String,
    pod_spec: PodSpec,
    namespace: Option<String>,
    run_interval: Duration,
    startup_timeout: Duration,
    max_run_time: Duration,
    reporting_url: String,
    debug: bool,
}

impl CheckerBuilder {
    /// Starts a builder from the two required pieces of a check definition.
    #[must_use]
    pub fn new(check_name: impl Into<String>, pod_spec: PodSpec) -> Self {
        Self {
            check_name: check_name.into(),
            pod_spec,
            namespace: None,
            run_interval: DEFAULT_RUN_INTERVAL,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            max_run_time: DEFAULT_MAX_RUN_TIME,
            reporting_url: spec::DEFAULT_REPORTING_URL.to_string(),
            debug: false,
        }
    }

    /// Namespace check pods are created in. Defaults to the `POD_NAMESPACE`
    /// environment variable.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Wall-clock period between iterations.
    #[must_use]
    pub fn run_interval(mut self, interval: Duration) -> Self {
        self.run_interval = interval;
        self
    }

    /// Maximum time from pod creation to the first non-pending phase.
    #[must_use]
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Maximum time from the pod starting to a terminal phase.
    #[must_use]
    pub fn max_run_time(mut self, max_run_time: Duration) -> Self {
        self.max_run_time = max_run_time;
        self
    }

    /// Address injected into check pods as the report-back target.
    #[must_use]
    pub fn reporting_url(mut self, url: impl Into<String>) -> Self {
        self.reporting_url = url.into();
        self
    }

    /// Debug mode: one iteration with no initial delay, then return.
    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Finishes the builder against a live cluster client.
    #[must_use]
    pub fn build(self, client: Client) -> Checker {
        let namespace = self.resolve_namespace();
        let pod_api = Arc::new(KubePodApi::new(client, &namespace));
        self.assemble(namespace, pod_api)
    }

    /// Finishes the builder with a caller-supplied API adapter.
    #[must_use]
    pub fn build_with_api(self, pod_api: Arc<dyn PodApi>) -> Checker {
        let namespace = self.resolve_namespace();
        self.assemble(namespace, pod_api)
    }

    fn resolve_namespace(&self) -> String {
        self.namespace
            .clone()
            .unwrap_or_else(|| std::env::var(POD_NAMESPACE_ENV).unwrap_or_default())
    }

    fn assemble(self, namespace: String, pod_api: Arc<dyn PodApi>) -> Checker {
        Checker {
            pod_name: Mutex::new(self.check_name.clone()),
            check_name: self.check_name,
            namespace,
            pod_spec: self.pod_spec,
            run_interval: self.run_interval,
            startup_timeout: self.startup_timeout,
            max_run_time: self.max_run_time,
            reporting_url: self.reporting_url,
            debug: self.debug,
            api: pod_api,
            current_run_id: Mutex::new(String::new()),
            pod_deployed: Mutex::new(false),
            errors: Mutex::new(Vec::new()),
        }
    }
}

/// One configured external check and the state of its current iteration.
///
/// Methods take `&self`; callers share the checker via [`Arc`] so the driver
/// task, the shutdown coordinator, and status queries can run concurrently.
pub struct Checker {
    check_name: String,
    namespace: String,
    pod_spec: PodSpec,
    run_interval: Duration,
    startup_timeout: Duration,
    max_run_time: Duration,
    reporting_url: String,
    debug: bool,
    api: Arc<dyn PodApi>,
    /// Name of the most recently created pod; seeded with the check name.
    pod_name: Mutex<String>,
    /// Run ID of the active iteration; empty while idle.
    current_run_id: Mutex<String>,
    /// True between a successful create and a confirmed delete.
    pod_deployed: Mutex<bool>,
    /// Diagnostics from the most recent iteration.
    errors: Mutex<Vec<String>>,
}

impl Checker {
    /// The exposed name of this check, `external-check-<check name>`.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{DEFAULT_CHECK_NAME}-{}", self.check_name)
    }

    /// Namespace this checker creates pods in.
    #[must_use]
    pub fn check_namespace(&self) -> &str {
        &self.namespace
    }

    /// Period between iterations.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.run_interval
    }

    /// Maximum time one pod may run once started.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.max_run_time
    }

    /// Run ID of the active iteration; empty while idle.
    #[must_use]
    pub fn current_run_id(&self) -> String {
        self.current_run_id.lock().unwrap().clone()
    }

    /// Status of the check as of right now, derived from the most recent
    /// iteration's error buffer. Safe to call from any task.
    #[must_use]
    pub fn current_status(&self) -> CheckStatus {
        let errors = self.errors.lock().unwrap().clone();
        CheckStatus {
            ok: errors.is_empty(),
            errors,
        }
    }

    /// Drives the check on its interval, forever.
    ///
    /// Each tick runs one iteration and replaces the error buffer with that
    /// iteration's outcome. In debug mode the initial delay is skipped and
    /// exactly one iteration executes.
    pub async fn run(&self) {
        loop {
            if !self.debug {
                sleep(self.run_interval).await;
            }

            info!(check = %self.name(), "running external check iteration");
            self.clear_errors();
            if let Err(err) = self.execute().await {
                error!(check = %self.name(), error = %err, "external check iteration failed");
                self.set_error(err.to_string());
            }

            if self.debug {
                return;
            }
        }
    }

    /// Executes one iteration: stray cleanup, pod creation, and the two
    /// supervised phases. Steps run in strict sequence; the first failure
    /// aborts the iteration and is surfaced through the error buffer.
    async fn execute(&self) -> Result<()> {
        let run_id = self.mint_run_id();

        debug!(check = %self.name(), run_id = %run_id, "validating pod spec of external check");
        spec::validate_pod_spec(&self.pod_spec)?;

        let mut pod_spec = self.pod_spec.clone();
        spec::decorate_pod_spec(&mut pod_spec, &self.check_name, &run_id, &self.reporting_url);

        self.sanity_check()?;

        debug!(check = %self.name(), "deleting any stray check pods");
        self.delete_check_pods()
            .await
            .map_err(|err| CheckError::StrayCleanup(err.to_string()))?;

        let pod = self.build_pod(pod_spec, &run_id);
        let created = self
            .api
            .create(&pod)
            .await
            .map_err(|err| CheckError::PodCreate(err.to_string()))?;
        let pod_name = created.name_any();
        info!(
            check = %self.name(),
            pod = %pod_name,
            namespace = %self.namespace,
            "created external check pod"
        );
        *self.pod_name.lock().unwrap() = pod_name.clone();

        // Phase 1: wait for the pod to start, bounded by the startup timeout
        let mut startup_watch =
            PhaseWatch::spawn(self.api.clone(), run_id.clone(), PhaseTarget::Started);
        tokio::select! {
            () = sleep(self.startup_timeout) => {
                startup_watch.cancel();
                let delete_error = self.reap_timed_out_pod(&pod_name).await;
                return Err(CheckError::StartupTimeout(CleanupNote::and(delete_error)));
            }
            outcome = startup_watch.outcome() => outcome?,
        }
        info!(check = %self.name(), pod = %pod_name, "external check pod has started");
        self.set_pod_deployed(true);

        // Phase 2: wait for the pod to finish, bounded by the run deadline.
        // Never entered without a phase 1 success.
        let mut completion_watch = PhaseWatch::spawn(self.api.clone(), run_id, PhaseTarget::Completed);
        tokio::select! {
            () = sleep(self.max_run_time) => {
                completion_watch.cancel();
                let delete_error = self.reap_timed_out_pod(&pod_name).await;
                return Err(CheckError::RunTimeout(CleanupNote::but(delete_error)));
            }
            outcome = completion_watch.outcome() => outcome?,
        }
        info!(check = %self.name(), pod = %pod_name, "external check pod is done running");

        // The finished pod is left for the next iteration's stray cleanup.
        Ok(())
    }

    /// Tears the check down in response to an external stop signal: deletes
    /// the deployed pod and waits, bounded by the run deadline, for the
    /// cluster API to confirm it is gone.
    pub async fn shutdown(&self) -> Result<()> {
        if self.pod_deployed() {
            self.delete_check_pods().await?;
            tokio::time::timeout(self.max_run_time, self.wait_for_pod_absent())
                .await
                .map_err(|_| CheckError::ShutdownTimeout)??;
            self.set_pod_deployed(false);
        }

        info!(check = %self.name(), pod = %self.pod_name.lock().unwrap(), "pod ready for shutdown");
        Ok(())
    }

    /// Mints the unique ID that labels every pod and event of one iteration.
    /// Never reused across iterations.
    fn mint_run_id(&self) -> String {
        let run_id = Uuid::new_v4().to_string();
        *self.current_run_id.lock().unwrap() = run_id.clone();
        run_id
    }

    /// Guards invariants the supervisor must have established before driving
    /// the check. Failure here is a programmer error, not a cluster fault.
    fn sanity_check(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(CheckError::Sanity(
                "check namespace can not be empty".to_string(),
            ));
        }
        if self.pod_name.lock().unwrap().is_empty() {
            return Err(CheckError::Sanity("pod name can not be empty".to_string()));
        }
        Ok(())
    }

    /// Assembles the pod object for this iteration from the decorated spec.
    fn build_pod(&self, pod_spec: PodSpec, run_id: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(self.pod_name.lock().unwrap().clone());
        pod.metadata.namespace = Some(self.namespace.clone());
        pod.spec = Some(pod_spec);
        spec::apply_check_labels(&mut pod, &self.check_name, run_id);
        pod
    }

    /// Deletes every pod carrying this check's ownership label. Idempotent;
    /// used both for stray cleanup and for shutdown.
    async fn delete_check_pods(&self) -> kube::Result<()> {
        debug!(check = %self.name(), "deleting all checker pods");
        self.api
            .delete_by_selector(&format!("{}={}", spec::CHECK_NAME_LABEL, self.check_name))
            .await
    }

    /// Best-effort delete of a pod that blew a deadline. Any delete error
    /// rides along on the timeout error rather than replacing it.
    async fn reap_timed_out_pod(&self, pod_name: &str) -> Option<String> {
        match self.api.delete_one(pod_name).await {
            Ok(()) => None,
            Err(err) => {
                error!(check = %self.name(), pod = %pod_name, error = %err, "failed to delete pod after timeout");
                Some(err.to_string())
            }
        }
    }

    /// Polls the API every 500ms until the check pod is no longer visible.
    async fn wait_for_pod_absent(&self) -> Result<()> {
        loop {
            sleep(SHUTDOWN_POLL_INTERVAL).await;
            if !self.pod_present().await? {
                return Ok(());
            }
        }
    }

    /// Whether the check pod is still visible in the API. The pod counts as
    /// gone only once `get` stops returning it; a terminal phase on a still
    /// present object is not enough.
    async fn pod_present(&self) -> Result<bool> {
        let pod_name = self.pod_name.lock().unwrap().clone();
        Ok(self.api.get(&pod_name).await?.is_some())
    }

    fn clear_errors(&self) {
        self.errors.lock().unwrap().clear();
    }

    /// Replaces the buffer wholesale; errors never accrete across iterations.
    fn set_error(&self, message: String) {
        *self.errors.lock().unwrap() = vec![message];
    }

    fn pod_deployed(&self) -> bool {
        *self.pod_deployed.lock().unwrap()
    }

    fn set_pod_deployed(&self, deployed: bool) {
        *self.pod_deployed.lock().unwrap() = deployed;
    }
}
