//! Controller runner - builds the controller futures for each kind
//!
//! Each `build_*` function returns a boxed future that runs one
//! `kube::runtime::Controller` until SIGTERM/SIGINT. The runtime serialises
//! reconciles per object and coalesces triggers that arrive mid-reconcile.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};

use kuberay_common::crd::{RayCluster, RayJob};
use kuberay_common::events::KubeEventPublisher;
use kuberay_job::HttpDashboardClient;

use crate::config::OperatorConfig;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Watch only children the operator labelled
fn child_watcher_config(label: &str) -> WatcherConfig {
    watcher_config().labels(label)
}

fn controller_config(config: &OperatorConfig) -> ControllerConfig {
    ControllerConfig::default().concurrency(config.reconcile_concurrency)
}

/// Build the RayCluster controller: owns Pods and Services
pub fn build_cluster_controller(client: Client, config: &OperatorConfig) -> ControllerFuture {
    let events = Arc::new(KubeEventPublisher::new(
        client.clone(),
        "raycluster-controller",
    ));
    let ctx = Arc::new(
        kuberay_cluster::Context::new(client.clone(), events)
            .with_requeue_interval(config.cluster_requeue_interval())
            .with_reconcile_timeout(config.reconcile_timeout())
            .with_backoff(config.backoff()),
    );
    let namespace = config.namespace();

    tracing::info!(namespace = ?namespace, "- RayCluster controller");

    Box::pin(
        Controller::new(scoped_api::<RayCluster>(&client, namespace), watcher_config())
            .owns(
                scoped_api::<Pod>(&client, namespace),
                child_watcher_config(kuberay_common::RAY_CLUSTER_LABEL_KEY),
            )
            .owns(
                scoped_api::<Service>(&client, namespace),
                child_watcher_config(kuberay_common::RAY_CLUSTER_LABEL_KEY),
            )
            .with_config(controller_config(config))
            .shutdown_on_signal()
            .run(
                kuberay_cluster::reconcile,
                kuberay_cluster::error_policy,
                ctx,
            )
            .for_each(log_reconcile_result("RayCluster")),
    )
}

/// Build the RayJob controller: owns RayClusters and submitter batch Jobs
pub fn build_job_controller(
    client: Client,
    config: &OperatorConfig,
) -> anyhow::Result<ControllerFuture> {
    let events = Arc::new(KubeEventPublisher::new(client.clone(), "rayjob-controller"));
    let dashboard = Arc::new(
        HttpDashboardClient::new(config.dashboard_timeout())
            .map_err(|e| anyhow::anyhow!("failed to build dashboard client: {}", e))?,
    );
    let ctx = Arc::new(
        kuberay_job::Context::new(client.clone(), dashboard, events)
            .with_requeue_interval(config.job_requeue_interval())
            .with_reconcile_timeout(config.reconcile_timeout())
            .with_backoff(config.backoff())
            .with_delete_job_after_finish(config.delete_rayjob_after_job_finishes),
    );
    let namespace = config.namespace();

    tracing::info!(
        namespace = ?namespace,
        delete_after_finish = config.delete_rayjob_after_job_finishes,
        "- RayJob controller"
    );

    Ok(Box::pin(
        Controller::new(scoped_api::<RayJob>(&client, namespace), watcher_config())
            .owns(
                scoped_api::<RayCluster>(&client, namespace),
                child_watcher_config(kuberay_common::RAY_ORIGINATED_FROM_CRD_LABEL_KEY),
            )
            .owns(
                scoped_api::<Job>(&client, namespace),
                child_watcher_config(kuberay_common::RAY_ORIGINATED_FROM_CRD_LABEL_KEY),
            )
            .with_config(controller_config(config))
            .shutdown_on_signal()
            .run(kuberay_job::reconcile, kuberay_job::error_policy, ctx)
            .for_each(log_reconcile_result("RayJob")),
    ))
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
