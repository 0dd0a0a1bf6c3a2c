//! RayCluster controller implementation
//!
//! Converges the head service, head pod and worker pods of a RayCluster to
//! the desired counts, then reports status. Pods are never patched in place:
//! template drift only takes effect when a pod is recreated.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ObjectReference, Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use kuberay_common::backoff::{with_deadline, BackoffConfig, RequeueBackoff};
use kuberay_common::crd::{RayCluster, RayClusterStatus, WorkerGroupSpec};
use kuberay_common::events::{actions, reasons, EventPublisher};
use kuberay_common::kube_utils::patch_status_at_revision;
use kuberay_common::names::{head_service_name, is_autoscaling_enabled, CrdKind, RayNodeType};
use kuberay_common::replicas::cluster_group_desired_replicas;
use kuberay_common::status::update_status;
use kuberay_common::validation::validate_cluster_spec;
use kuberay_common::{Error, ReplicaFailure};

use crate::pods::{build_head_pod, build_worker_pod, group_name, is_terminated, node_type};
use crate::service::build_head_service;
use crate::status::{compute_status, is_running_and_ready};

/// Default interval between reconciles of a healthy cluster
pub const DEFAULT_REQUEUE_INTERVAL: Duration = Duration::from_secs(300);

/// Default deadline for one reconcile
pub const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(30);

/// Trait abstracting Kubernetes client operations for RayCluster
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// List the pods labelled as belonging to `cluster`
    async fn list_pods(&self, namespace: &str, cluster: &str) -> Result<Vec<Pod>, Error>;

    /// Create a pod; an existing pod of the same name counts as success
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), Error>;

    /// Delete a pod; a missing pod counts as success
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Get a Service by name
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    /// Create a Service; an existing one counts as success
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), Error>;

    /// Get a RayCluster by name
    async fn get_cluster(&self, namespace: &str, name: &str)
        -> Result<Option<RayCluster>, Error>;

    /// Write the status of a RayCluster guarded by `resource_version`
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &RayClusterStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn ignore_api_code(result: Result<(), kube::Error>, code: u16) -> Result<(), Error> {
    match result {
        Err(kube::Error::Api(ae)) if ae.code == code => Ok(()),
        other => other.map_err(Error::from),
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn list_pods(&self, namespace: &str, cluster: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&format!(
            "{}={}",
            kuberay_common::RAY_CLUSTER_LABEL_KEY,
            cluster
        ));
        Ok(api.list(&lp).await?.items)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        ignore_api_code(
            api.create(&PostParams::default(), pod).await.map(|_| ()),
            409,
        )
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        ignore_api_code(
            api.delete(name, &DeleteParams::default()).await.map(|_| ()),
            404,
        )
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        ignore_api_code(
            api.create(&PostParams::default(), service).await.map(|_| ()),
            409,
        )
    }

    async fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RayCluster>, Error> {
        let api: Api<RayCluster> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &RayClusterStatus,
    ) -> Result<(), Error> {
        patch_status_at_revision::<RayCluster>(
            &self.client,
            namespace,
            name,
            resource_version.as_deref(),
            status,
        )
        .await?;
        Ok(())
    }
}

/// Controller context for RayCluster reconciliation
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Event publisher for operator-facing events
    pub events: Arc<dyn EventPublisher>,
    /// Per-key failure tracking for error requeues
    pub backoff: RequeueBackoff,
    /// Requeue interval after a successful reconcile
    pub requeue_interval: Duration,
    /// Deadline for a single reconcile
    pub reconcile_timeout: Duration,
}

impl Context {
    /// Create a controller context backed by the given Kubernetes client
    pub fn new(client: Client, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            kube: Arc::new(KubeClientImpl::new(client)),
            events,
            backoff: RequeueBackoff::default(),
            requeue_interval: DEFAULT_REQUEUE_INTERVAL,
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
        }
    }

    /// Set the healthy requeue interval
    pub fn with_requeue_interval(mut self, interval: Duration) -> Self {
        self.requeue_interval = interval;
        self
    }

    /// Set the per-reconcile deadline
    pub fn with_reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = timeout;
        self
    }

    /// Set the error backoff tuning
    pub fn with_backoff(mut self, config: BackoffConfig) -> Self {
        self.backoff = RequeueBackoff::new(config);
        self
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            kube,
            events,
            backoff: RequeueBackoff::default(),
            requeue_interval: DEFAULT_REQUEUE_INTERVAL,
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
        }
    }
}

fn object_key(cluster: &RayCluster) -> String {
    format!(
        "{}/{}",
        cluster.namespace().unwrap_or_default(),
        cluster.name_any()
    )
}

/// Reconcile a RayCluster
///
/// Creates missing children, removes excess and terminated pods, and writes
/// status when it changed. Requeues after the configured interval.
#[instrument(
    skip(cluster, ctx),
    fields(cluster = %cluster.name_any(), namespace = ?cluster.namespace())
)]
pub async fn reconcile(cluster: Arc<RayCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let action = with_deadline(
        ctx.reconcile_timeout,
        "reconcile RayCluster",
        reconcile_cluster(&cluster, &ctx),
    )
    .await?;
    ctx.backoff.reset(&object_key(&cluster));
    Ok(action)
}

/// Error policy for the controller
///
/// Configuration errors wait for the object to change. Everything else is
/// requeued with per-key exponential backoff.
pub fn error_policy(cluster: Arc<RayCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    if !error.is_retryable() {
        warn!(
            %error,
            cluster = %cluster.name_any(),
            "reconciliation failed, waiting for a spec change"
        );
        return Action::await_change();
    }

    let delay = ctx.backoff.next_delay(&object_key(&cluster));
    error!(
        ?error,
        cluster = %cluster.name_any(),
        retry_in = ?delay,
        "reconciliation failed"
    );
    Action::requeue(delay)
}

async fn reconcile_cluster(cluster: &RayCluster, ctx: &Context) -> Result<Action, Error> {
    let name = cluster.name_any();
    let Some(namespace) = cluster.namespace() else {
        return Err(Error::validation_for(&name, "RayCluster must be namespaced"));
    };

    if cluster.metadata.deletion_timestamp.is_some() {
        debug!("cluster is being deleted, children go with it");
        return Ok(Action::await_change());
    }

    let reconciler = PodReconciler {
        cluster,
        ctx,
        namespace: &namespace,
        name: &name,
        object_ref: cluster.object_ref(&()),
    };

    if let Err(e) = validate_cluster_spec(&name, &cluster.spec) {
        warn!(error = %e, "invalid RayCluster spec");
        reconciler
            .event(
                EventType::Warning,
                reasons::INVALID_RAY_CLUSTER_SPEC,
                actions::VALIDATE,
                e.to_string(),
            )
            .await;
        return Err(e);
    }

    let head_svc_name = head_service_name(CrdKind::RayCluster, &cluster.spec, &name)?;

    let children = if cluster.spec.is_suspended() {
        reconciler.delete_all_pods().await
    } else {
        reconciler.reconcile_children(&head_svc_name).await
    };
    if let Err(e) = &children {
        warn!(error = %e, "failed to converge cluster children");
    }

    let pods = live_pods(ctx.kube.list_pods(&namespace, &name).await?);
    let service = ctx.kube.get_service(&namespace, &head_svc_name).await?;
    let desired = compute_status(
        cluster,
        &pods,
        service.as_ref(),
        &head_svc_name,
        children.as_ref().err(),
    );

    let written = update_status(
        cluster,
        &desired,
        || ctx.kube.get_cluster(&namespace, &name),
        |rv, status| {
            let (namespace, name) = (namespace.as_str(), name.as_str());
            async move { ctx.kube.patch_status(namespace, name, rv, &status).await }
        },
    )
    .await?;
    if written {
        info!(state = %desired.state, "updated cluster status");
    }

    children?;
    Ok(Action::requeue(ctx.requeue_interval))
}

/// Pods not already on their way out
fn live_pods(pods: Vec<Pod>) -> Vec<Pod> {
    pods.into_iter()
        .filter(|p| p.metadata.deletion_timestamp.is_none())
        .collect()
}

/// Order pods so the ones to remove first come first: not ready, then ready
fn deletion_order<'a>(mut pods: Vec<&'a Pod>) -> Vec<&'a Pod> {
    pods.sort_by_key(|p| is_running_and_ready(p));
    pods
}

struct PodReconciler<'a> {
    cluster: &'a RayCluster,
    ctx: &'a Context,
    namespace: &'a str,
    name: &'a str,
    object_ref: ObjectReference,
}

impl PodReconciler<'_> {
    async fn event(&self, type_: EventType, reason: &str, action: &str, note: String) {
        self.ctx
            .events
            .publish(&self.object_ref, type_, reason, action, Some(note))
            .await;
    }

    async fn delete_all_pods(&self) -> Result<(), Error> {
        let pods = live_pods(self.ctx.kube.list_pods(self.namespace, self.name).await?);
        for pod in &pods {
            let node = node_type(pod).unwrap_or(RayNodeType::Worker);
            self.delete_pod(pod, node)
                .await
                .map_err(|e| Error::replica(ReplicaFailure::DeleteAllPods, self.name, e))?;
        }
        if !pods.is_empty() {
            info!(count = pods.len(), "deleted all pods of suspended cluster");
        }
        Ok(())
    }

    async fn reconcile_children(&self, head_svc_name: &str) -> Result<(), Error> {
        self.ensure_head_service(head_svc_name).await?;

        let pods = live_pods(self.ctx.kube.list_pods(self.namespace, self.name).await?);
        self.reconcile_head(&pods).await?;

        let desired = cluster_group_desired_replicas(self.cluster);
        for group in &self.cluster.spec.worker_group_specs {
            let target = desired.get(&group.group_name).copied().unwrap_or(0);
            self.reconcile_worker_group(group, target, &pods, head_svc_name)
                .await?;
        }
        Ok(())
    }

    async fn ensure_head_service(&self, svc_name: &str) -> Result<(), Error> {
        if self
            .ctx
            .kube
            .get_service(self.namespace, svc_name)
            .await?
            .is_some()
        {
            return Ok(());
        }

        let service = build_head_service(self.cluster, svc_name)?;
        match self.ctx.kube.create_service(self.namespace, &service).await {
            Ok(()) => {
                info!(service = %svc_name, "created head service");
                self.event(
                    EventType::Normal,
                    reasons::CREATED_SERVICE,
                    actions::CREATE,
                    format!("Created service {}/{}", self.namespace, svc_name),
                )
                .await;
                Ok(())
            }
            Err(e) => {
                self.event(
                    EventType::Warning,
                    reasons::FAILED_TO_CREATE_SERVICE,
                    actions::CREATE,
                    format!(
                        "Failed to create service {}/{}: {e}",
                        self.namespace, svc_name
                    ),
                )
                .await;
                Err(Error::child_operation("create", "Service", svc_name, e))
            }
        }
    }

    async fn reconcile_head(&self, pods: &[Pod]) -> Result<(), Error> {
        let (terminated, running): (Vec<&Pod>, Vec<&Pod>) = pods
            .iter()
            .filter(|p| node_type(p) == Some(RayNodeType::Head))
            .partition(|p| is_terminated(p));

        for pod in terminated {
            info!(pod = %pod.name_any(), "deleting terminated head pod");
            self.delete_pod(pod, RayNodeType::Head)
                .await
                .map_err(|e| Error::replica(ReplicaFailure::DeleteHeadPod, self.name, e))?;
        }

        match running.len() {
            0 => {
                let pod = build_head_pod(self.cluster)?;
                self.create_pod(&pod, RayNodeType::Head)
                    .await
                    .map_err(|e| Error::replica(ReplicaFailure::CreateHeadPod, self.name, e))
            }
            1 => Ok(()),
            n => {
                warn!(count = n, "found more than one head pod, deleting extras");
                for pod in deletion_order(running).into_iter().take(n - 1) {
                    self.delete_pod(pod, RayNodeType::Head)
                        .await
                        .map_err(|e| {
                            Error::replica(ReplicaFailure::DeleteHeadPod, self.name, e)
                        })?;
                }
                Ok(())
            }
        }
    }

    async fn reconcile_worker_group(
        &self,
        group: &WorkerGroupSpec,
        desired: i32,
        pods: &[Pod],
        head_svc_name: &str,
    ) -> Result<(), Error> {
        let delete_failed =
            |e: Error| Error::replica(ReplicaFailure::DeleteWorkerPod, self.name, e);

        let (terminated, mut running): (Vec<&Pod>, Vec<&Pod>) = pods
            .iter()
            .filter(|p| {
                node_type(p) == Some(RayNodeType::Worker)
                    && group_name(p) == Some(group.group_name.as_str())
            })
            .partition(|p| is_terminated(p));

        for pod in terminated {
            info!(group = %group.group_name, pod = %pod.name_any(), "deleting terminated worker pod");
            self.delete_pod(pod, RayNodeType::Worker)
                .await
                .map_err(delete_failed)?;
        }

        if is_autoscaling_enabled(Some(&self.cluster.spec)) {
            let to_delete = group
                .scale_strategy
                .as_ref()
                .map(|s| s.workers_to_delete.as_slice())
                .unwrap_or_default();
            let (doomed, kept): (Vec<&Pod>, Vec<&Pod>) = running
                .into_iter()
                .partition(|p| to_delete.iter().any(|n| *n == p.name_any()));
            for pod in doomed {
                info!(group = %group.group_name, pod = %pod.name_any(), "deleting worker requested by autoscaler");
                self.delete_pod(pod, RayNodeType::Worker)
                    .await
                    .map_err(delete_failed)?;
            }
            running = kept;
        }

        let current = running.len() as i32;
        if current < desired {
            let missing = desired - current;
            debug!(group = %group.group_name, current, desired, "scaling worker group up");
            for _ in 0..missing {
                let pod = build_worker_pod(self.cluster, group, head_svc_name)?;
                self.create_pod(&pod, RayNodeType::Worker)
                    .await
                    .map_err(|e| Error::replica(ReplicaFailure::CreateWorkerPod, self.name, e))?;
            }
        } else if current > desired {
            let excess = (current - desired) as usize;
            debug!(group = %group.group_name, current, desired, "scaling worker group down");
            for pod in deletion_order(running).into_iter().take(excess) {
                self.delete_pod(pod, RayNodeType::Worker)
                    .await
                    .map_err(delete_failed)?;
            }
        }
        Ok(())
    }

    async fn create_pod(&self, pod: &Pod, node: RayNodeType) -> Result<(), Error> {
        let (ok, failed) = match node {
            RayNodeType::Head => (reasons::CREATED_HEAD_POD, reasons::FAILED_TO_CREATE_HEAD_POD),
            RayNodeType::Worker => (
                reasons::CREATED_WORKER_POD,
                reasons::FAILED_TO_CREATE_WORKER_POD,
            ),
        };
        let pod_name = pod.name_any();
        match self.ctx.kube.create_pod(self.namespace, pod).await {
            Ok(()) => {
                info!(pod = %pod_name, node_type = %node, "created pod");
                self.event(
                    EventType::Normal,
                    ok,
                    actions::CREATE,
                    format!("Created {node} pod {}/{pod_name}", self.namespace),
                )
                .await;
                Ok(())
            }
            Err(e) => {
                self.event(
                    EventType::Warning,
                    failed,
                    actions::CREATE,
                    format!(
                        "Failed to create {node} pod {}/{pod_name}: {e}",
                        self.namespace
                    ),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn delete_pod(&self, pod: &Pod, node: RayNodeType) -> Result<(), Error> {
        let (ok, failed) = match node {
            RayNodeType::Head => (reasons::DELETED_HEAD_POD, reasons::FAILED_TO_DELETE_HEAD_POD),
            RayNodeType::Worker => (
                reasons::DELETED_WORKER_POD,
                reasons::FAILED_TO_DELETE_WORKER_POD,
            ),
        };
        let pod_name = pod.name_any();
        match self.ctx.kube.delete_pod(self.namespace, &pod_name).await {
            Ok(()) => {
                self.event(
                    EventType::Normal,
                    ok,
                    actions::DELETE,
                    format!("Deleted {node} pod {}/{pod_name}", self.namespace),
                )
                .await;
                Ok(())
            }
            Err(e) => {
                self.event(
                    EventType::Warning,
                    failed,
                    actions::DELETE,
                    format!(
                        "Failed to delete {node} pod {}/{pod_name}: {e}",
                        self.namespace
                    ),
                )
                .await;
                Err(e)
            }
        }
    }
}
