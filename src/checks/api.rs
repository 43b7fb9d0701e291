//! Thin boundary over the cluster API for check pod lifecycle operations.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, PostParams, WatchEvent, WatchParams};
use kube::Client;

/// Stream of raw pod watch events. The stream ends on server disconnect or
/// when the consumer drops it.
pub type PodEventStream = BoxStream<'static, kube::Result<WatchEvent<Pod>>>;

/// The cluster API operations the executor consumes.
///
/// Production code talks to the API server through [`KubePodApi`]; tests
/// substitute a scripted implementation so iterations can be driven without
/// a cluster.
#[async_trait]
pub trait PodApi: Send + Sync {
    /// Creates the pod in the configured namespace and returns the created
    /// object, whose name is authoritative.
    async fn create(&self, pod: &Pod) -> kube::Result<Pod>;

    /// Deletes every pod matching the label selector. Absence of matches is
    /// success.
    async fn delete_by_selector(&self, selector: &str) -> kube::Result<()>;

    /// Deletes a single pod by name. A pod that is already gone counts as
    /// deleted.
    async fn delete_one(&self, name: &str) -> kube::Result<()>;

    /// Fetches a pod by name, or `None` when it does not exist.
    async fn get(&self, name: &str) -> kube::Result<Option<Pod>>;

    /// Opens a watch over pods matching the label selector.
    async fn watch(&self, selector: &str) -> kube::Result<PodEventStream>;
}

/// [`PodApi`] backed by a namespaced kube client.
pub struct KubePodApi {
    pods: Api<Pod>,
}

impl KubePodApi {
    /// Builds the adapter for the namespace the check runs in.
    #[must_use]
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl PodApi for KubePodApi {
    async fn create(&self, pod: &Pod) -> kube::Result<Pod> {
        self.pods.create(&PostParams::default(), pod).await
    }

    async fn delete_by_selector(&self, selector: &str) -> kube::Result<()> {
        self.pods
            .delete_collection(
                &DeleteParams::default(),
                &ListParams::default().labels(selector),
            )
            .await
            .map(|_| ())
    }

    async fn delete_one(&self, name: &str) -> kube::Result<()> {
        match self.pods.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn get(&self, name: &str) -> kube::Result<Option<Pod>> {
        self.pods.get_opt(name).await
    }

    async fn watch(&self, selector: &str) -> kube::Result<PodEventStream> {
        let events = self
            .pods
            .watch(&WatchParams::default().labels(selector), "0")
            .await?;
        Ok(events.boxed())
    }
}
