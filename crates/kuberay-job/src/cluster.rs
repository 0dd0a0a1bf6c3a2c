//! The RayCluster a RayJob runs on
//!
//! A job either owns a cluster built from `rayClusterSpec`, or borrows one
//! named by `clusterSelector`. Owned clusters carry the job's owner
//! reference and are removed with it.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use kuberay_common::crd::{ClusterState, RayCluster, RayClusterSpec, RayJob};
use kuberay_common::kube_utils::owner_reference;
use kuberay_common::names::{
    find_container_port, head_service_name, job_cluster_name, service_fqdn, CrdKind,
};
use kuberay_common::{Error, Result};

/// Name of the cluster the job's current attempt uses
pub fn cluster_name_for(job: &RayJob) -> String {
    if let Some(selected) = job.spec.selected_cluster() {
        return selected.to_string();
    }
    job.status
        .as_ref()
        .and_then(|s| s.ray_cluster_name.clone())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| job_cluster_name(job))
}

/// Whether the job owns its cluster rather than borrowing one
pub fn owns_cluster(job: &RayJob) -> bool {
    job.spec.selected_cluster().is_none()
}

/// Labels marking a child as created for `job`
pub fn originated_from_labels(job: &RayJob) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            kuberay_common::RAY_ORIGINATED_FROM_CRD_LABEL_KEY.to_string(),
            CrdKind::RayJob.to_string(),
        ),
        (
            kuberay_common::RAY_ORIGINATED_FROM_CR_NAME_LABEL_KEY.to_string(),
            job.name_any(),
        ),
        (
            kuberay_common::KUBERNETES_CREATED_BY_LABEL_KEY.to_string(),
            kuberay_common::COMPONENT_NAME.to_string(),
        ),
    ])
}

/// Build the cluster owned by `job`
pub fn build_ray_cluster(job: &RayJob, name: &str) -> Result<RayCluster> {
    let spec = job.spec.ray_cluster_spec.clone().ok_or_else(|| {
        Error::validation_for(job.name_any(), "rayClusterSpec is required to create a cluster")
    })?;

    Ok(RayCluster {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: job.namespace(),
            labels: Some(originated_from_labels(job)),
            owner_references: Some(vec![owner_reference(job)?]),
            ..Default::default()
        },
        spec,
        status: None,
    })
}

/// Whether the cluster reports itself ready
pub fn is_cluster_ready(cluster: &RayCluster) -> bool {
    cluster.state() == ClusterState::Ready
}

fn dashboard_port(spec: &RayClusterSpec) -> i32 {
    spec.head_group_spec
        .template
        .spec
        .as_ref()
        .and_then(|s| s.containers.get(kuberay_common::RAY_CONTAINER_INDEX))
        .map_or(kuberay_common::DEFAULT_DASHBOARD_PORT, |c| {
            find_container_port(
                c,
                kuberay_common::DASHBOARD_PORT_NAME,
                kuberay_common::DEFAULT_DASHBOARD_PORT,
            )
        })
}

/// Dashboard `host:port` of `cluster`, addressed through its head service
pub fn dashboard_url(cluster: &RayCluster) -> Result<String> {
    let name = cluster.name_any();
    let namespace = cluster
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "RayCluster must be namespaced"))?;
    let service = head_service_name(CrdKind::RayCluster, &cluster.spec, &name)?;
    Ok(format!(
        "{}:{}",
        service_fqdn(&service, &namespace),
        dashboard_port(&cluster.spec)
    ))
}

/// Head image of the cluster spec the job runs on, for the submitter
pub fn submitter_image(spec: &RayClusterSpec) -> Option<String> {
    spec.head_image().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec};
    use kuberay_common::crd::{RayClusterStatus, RayJobSpec, RayJobStatus};

    fn cluster_spec(dashboard: Option<i32>) -> RayClusterSpec {
        let mut spec = RayClusterSpec::default();
        spec.head_group_spec.template = PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "ray-head".to_string(),
                    image: Some("rayproject/ray:2.9.0".to_string()),
                    ports: dashboard.map(|p| {
                        vec![ContainerPort {
                            name: Some("dashboard".to_string()),
                            container_port: p,
                            ..Default::default()
                        }]
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        };
        spec
    }

    fn job() -> RayJob {
        let mut job = RayJob::new(
            "rayjob-sample",
            RayJobSpec {
                entrypoint: "python script.py".to_string(),
                ray_cluster_spec: Some(cluster_spec(None)),
                ..Default::default()
            },
        );
        job.metadata.namespace = Some("default".to_string());
        job.metadata.uid = Some("uid-job".to_string());
        job
    }

    #[test]
    fn owned_cluster_carries_owner_and_labels() {
        let job = job();
        let rc = build_ray_cluster(&job, "rayjob-sample-raycluster-abcde").unwrap();
        assert_eq!(rc.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(rc.owner_references()[0].kind, "RayJob");
        assert_eq!(rc.labels()["ray.io/originated-from-crd"], "RayJob");
        assert_eq!(rc.labels()["ray.io/originated-from-cr-name"], "rayjob-sample");
        assert_eq!(submitter_image(&rc.spec).as_deref(), Some("rayproject/ray:2.9.0"));
    }

    #[test]
    fn cluster_name_prefers_selector_then_status() {
        let mut job = job();
        let generated = cluster_name_for(&job);
        assert!(generated.starts_with("rayjob-sample-raycluster-"));
        assert!(owns_cluster(&job));

        job.status = Some(RayJobStatus {
            ray_cluster_name: Some("recorded".to_string()),
            ..Default::default()
        });
        assert_eq!(cluster_name_for(&job), "recorded");

        job.spec.ray_cluster_spec = None;
        job.spec.cluster_selector = BTreeMap::from([(
            "ray.io/cluster".to_string(),
            "shared".to_string(),
        )]);
        assert_eq!(cluster_name_for(&job), "shared");
        assert!(!owns_cluster(&job));
    }

    #[test]
    fn dashboard_url_uses_head_service_and_port() {
        let mut rc = RayCluster::new("rc", cluster_spec(Some(9265)));
        rc.metadata.namespace = Some("ml".to_string());
        let url = dashboard_url(&rc).unwrap();
        assert!(url.starts_with("rc-head-svc.ml.svc."));
        assert!(url.ends_with(":9265"));

        let rc = RayCluster::new("rc", cluster_spec(None));
        assert!(dashboard_url(&rc).is_err());
    }

    #[test]
    fn readiness_follows_cluster_state() {
        let mut rc = RayCluster::new("rc", cluster_spec(None));
        assert!(!is_cluster_ready(&rc));
        rc.status = Some(RayClusterStatus {
            state: ClusterState::Ready,
            ..Default::default()
        });
        assert!(is_cluster_ready(&rc));
    }
}
