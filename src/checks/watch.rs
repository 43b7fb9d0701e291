//! Single-shot pod phase watches.
//!
//! Each watch drains a label-filtered event stream on its own task and
//! reports exactly one outcome on a channel the caller can race against a
//! timer: the target phase was reached, the watch was canceled, or the
//! stream ended early.

use futures::StreamExt;
use kube::api::WatchEvent;
use kube::ResourceExt;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::debug;

use super::api::PodApi;
use super::spec::RUN_ID_LABEL;
use super::types::{CheckError, Result};

/// Pod phase transition that ends a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PhaseTarget {
    /// The pod has left the pending phase: Running, or Failed before it ever
    /// ran. A pod that fails to start still counts as started, so the run
    /// phase observes the failure instead of waiting out the startup
    /// deadline.
    Started,
    /// The pod is done: Succeeded or Failed.
    Completed,
}

impl PhaseTarget {
    fn matches(self, phase: &str) -> bool {
        match self {
            Self::Started => matches!(phase, "Running" | "Failed"),
            Self::Completed => matches!(phase, "Succeeded" | "Failed"),
        }
    }
}

/// A phase watch running on its own task.
///
/// Single-shot: one target per watch, a new iteration spawns new watches.
/// Dropping the handle, or calling [`PhaseWatch::cancel`], stops the drain
/// loop at its next event boundary.
pub(crate) struct PhaseWatch {
    outcome: oneshot::Receiver<Result<()>>,
    cancel: watch::Sender<bool>,
}

impl PhaseWatch {
    /// Opens a watch filtered to `run_id` and spawns the drain loop.
    pub(crate) fn spawn(api: Arc<dyn PodApi>, run_id: String, target: PhaseTarget) -> Self {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        tokio::spawn(drain(api, run_id, target, cancel_rx, outcome_tx));
        Self {
            outcome: outcome_rx,
            cancel: cancel_tx,
        }
    }

    /// Signals the drain loop to stop and report [`CheckError::WatchAborted`].
    pub(crate) fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Waits for the single outcome of this watch.
    pub(crate) async fn outcome(&mut self) -> Result<()> {
        // The drain task always reports before exiting; a dropped sender can
        // only mean the task was torn down mid-stream.
        (&mut self.outcome)
            .await
            .unwrap_or(Err(CheckError::WatchClosed))
    }
}

async fn drain(
    api: Arc<dyn PodApi>,
    run_id: String,
    target: PhaseTarget,
    mut cancel: watch::Receiver<bool>,
    outcome: oneshot::Sender<Result<()>>,
) {
    let selector = format!("{RUN_ID_LABEL}={run_id}");
    let mut events = match api.watch(&selector).await {
        Ok(stream) => stream,
        Err(err) => {
            let _ = outcome.send(Err(err.into()));
            return;
        }
    };

    let result = loop {
        tokio::select! {
            _ = cancel.changed() => break Err(CheckError::WatchAborted),
            event = events.next() => match event {
                None => break Err(CheckError::WatchClosed),
                Some(Err(err)) => {
                    // Stream-level errors are not pod events; skip them like
                    // any other non-pod payload.
                    debug!(run_id = %run_id, error = %err, "skipping non-pod watch event");
                }
                Some(Ok(
                    WatchEvent::Added(pod) | WatchEvent::Modified(pod) | WatchEvent::Deleted(pod),
                )) => {
                    // The selector already filters by run ID; re-check the
                    // label anyway to guard against delayed events delivered
                    // after a new run began.
                    if pod.labels().get(RUN_ID_LABEL).map(String::as_str) != Some(run_id.as_str()) {
                        debug!(run_id = %run_id, pod = %pod.name_any(), "skipping event for a different run");
                        continue;
                    }
                    let phase = pod
                        .status
                        .as_ref()
                        .and_then(|status| status.phase.as_deref())
                        .unwrap_or_default();
                    if target.matches(phase) {
                        break Ok(());
                    }
                }
                // Bookmarks and error statuses are not pods
                Some(Ok(_)) => {}
            }
        }
    };

    let _ = outcome.send(result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::api::PodEventStream;
    use async_trait::async_trait;
    use futures::stream;
    use k8s_openapi::api::core::v1::Pod;
    use serde_json::json;
    use std::sync::Mutex;

    /// Hands out one scripted event stream, then panics if asked again.
    struct ScriptedApi {
        events: Mutex<Option<Vec<kube::Result<WatchEvent<Pod>>>>>,
        stay_open: bool,
    }

    impl ScriptedApi {
        fn new(events: Vec<kube::Result<WatchEvent<Pod>>>, stay_open: bool) -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Some(events)),
                stay_open,
            })
        }
    }

    #[async_trait]
    impl PodApi for ScriptedApi {
        async fn create(&self, _pod: &Pod) -> kube::Result<Pod> {
            unimplemented!("not used by phase watches")
        }

        async fn delete_by_selector(&self, _selector: &str) -> kube::Result<()> {
            unimplemented!("not used by phase watches")
        }

        async fn delete_one(&self, _name: &str) -> kube::Result<()> {
            unimplemented!("not used by phase watches")
        }

        async fn get(&self, _name: &str) -> kube::Result<Option<Pod>> {
            unimplemented!("not used by phase watches")
        }

        async fn watch(&self, _selector: &str) -> kube::Result<PodEventStream> {
            let events = self.events.lock().unwrap().take().expect("one watch per test");
            let scripted = stream::iter(events);
            if self.stay_open {
                Ok(scripted.chain(stream::pending()).boxed())
            } else {
                Ok(scripted.boxed())
            }
        }
    }

    fn event_pod(run_id: &str, phase: &str) -> Pod {
        serde_json::from_value(json!({
            "metadata": {
                "name": "external-check-dns",
                "labels": { RUN_ID_LABEL: run_id }
            },
            "status": { "phase": phase }
        }))
        .expect("valid Pod json")
    }

    #[test]
    fn started_includes_pods_that_failed_to_start() {
        assert!(PhaseTarget::Started.matches("Running"));
        assert!(PhaseTarget::Started.matches("Failed"));
        assert!(!PhaseTarget::Started.matches("Pending"));
        assert!(!PhaseTarget::Started.matches("Succeeded"));
    }

    #[test]
    fn completed_means_terminal() {
        assert!(PhaseTarget::Completed.matches("Succeeded"));
        assert!(PhaseTarget::Completed.matches("Failed"));
        assert!(!PhaseTarget::Completed.matches("Running"));
        assert!(!PhaseTarget::Completed.matches("Pending"));
    }

    #[tokio::test]
    async fn resolves_when_the_target_phase_arrives() {
        let api = ScriptedApi::new(
            vec![
                Ok(WatchEvent::Added(event_pod("run-1", "Pending"))),
                Ok(WatchEvent::Modified(event_pod("run-1", "Running"))),
            ],
            true,
        );

        let mut watch = PhaseWatch::spawn(api, "run-1".to_string(), PhaseTarget::Started);
        assert!(watch.outcome().await.is_ok());
    }

    #[tokio::test]
    async fn terminal_phase_on_a_delete_event_still_counts() {
        let api = ScriptedApi::new(
            vec![Ok(WatchEvent::Deleted(event_pod("run-1", "Succeeded")))],
            true,
        );

        let mut watch = PhaseWatch::spawn(api, "run-1".to_string(), PhaseTarget::Completed);
        assert!(watch.outcome().await.is_ok());
    }

    #[tokio::test]
    async fn events_from_another_run_are_ignored() {
        // A stale terminal event from a previous run must not complete this
        // watch; with nothing else on the stream, the close is premature.
        let api = ScriptedApi::new(
            vec![Ok(WatchEvent::Modified(event_pod("run-0", "Succeeded")))],
            false,
        );

        let mut watch = PhaseWatch::spawn(api, "run-1".to_string(), PhaseTarget::Completed);
        assert!(matches!(
            watch.outcome().await,
            Err(CheckError::WatchClosed)
        ));
    }

    #[tokio::test]
    async fn empty_stream_is_a_premature_close() {
        let api = ScriptedApi::new(vec![], false);

        let mut watch = PhaseWatch::spawn(api, "run-1".to_string(), PhaseTarget::Started);
        assert!(matches!(
            watch.outcome().await,
            Err(CheckError::WatchClosed)
        ));
    }

    #[tokio::test]
    async fn cancel_aborts_an_idle_watch() {
        let api = ScriptedApi::new(vec![], true);

        let mut watch = PhaseWatch::spawn(api, "run-1".to_string(), PhaseTarget::Started);
        watch.cancel();
        assert!(matches!(
            watch.outcome().await,
            Err(CheckError::WatchAborted)
        ));
    }
}
