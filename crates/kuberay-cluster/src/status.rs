//! RayCluster status accounting
//!
//! Pure functions over the observed pods and head service. The controller
//! feeds them the post-reconcile listing and hands the result to the status
//! reporter.

use k8s_openapi::api::core::v1::{Pod, Service};
use kube::ResourceExt;

use kuberay_common::crd::{
    condition_types, find_condition, remove_condition, set_condition, ClusterState, Condition,
    ConditionStatus, HeadInfo, RayCluster, RayClusterStatus,
};
use kuberay_common::kube_utils::find_condition_status;
use kuberay_common::names::RayNodeType;
use kuberay_common::replicas::cluster_replica_totals;
use kuberay_common::Error;

use crate::pods::node_type;

fn phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

fn ready_status(pod: &Pod) -> Option<&str> {
    find_condition_status(
        pod.status.as_ref().and_then(|s| s.conditions.as_deref()),
        "Ready",
    )
}

/// Running, and either without a Ready condition or with Ready=True
pub fn is_running_and_ready(pod: &Pod) -> bool {
    phase(pod) == Some("Running") && ready_status(pod).map_or(true, |s| s == "True")
}

/// Ready condition explicitly True
pub fn is_ready(pod: &Pod) -> bool {
    ready_status(pod) == Some("True")
}

fn workers(pods: &[Pod]) -> impl Iterator<Item = &Pod> {
    pods.iter()
        .filter(|p| node_type(p) == Some(RayNodeType::Worker))
}

/// Worker pods that count as available
pub fn calculate_available_replicas(pods: &[Pod]) -> i32 {
    workers(pods).filter(|p| is_running_and_ready(p)).count() as i32
}

/// Available worker pods that also report Ready=True
pub fn calculate_ready_replicas(pods: &[Pod]) -> i32 {
    workers(pods)
        .filter(|p| is_running_and_ready(p) && is_ready(p))
        .count() as i32
}

/// Every pod is running; false for an empty set
pub fn check_all_pods_running(pods: &[Pod]) -> bool {
    !pods.is_empty() && pods.iter().all(is_running_and_ready)
}

/// The head pod among `pods`
pub fn find_head_pod(pods: &[Pod]) -> Option<&Pod> {
    pods.iter()
        .find(|p| node_type(p) == Some(RayNodeType::Head))
}

/// HeadPodReady condition for the observed head pod
pub fn head_pod_ready_condition(head: Option<&Pod>) -> Condition {
    match head {
        Some(pod) if is_running_and_ready(pod) => Condition::new(
            condition_types::HEAD_POD_READY,
            ConditionStatus::True,
            "HeadPodRunningAndReady",
            "Head pod is running and ready",
        ),
        Some(_) => Condition::new(
            condition_types::HEAD_POD_READY,
            ConditionStatus::False,
            "HeadPodNotReady",
            "Head pod is not running and ready",
        ),
        None => Condition::new(
            condition_types::HEAD_POD_READY,
            ConditionStatus::False,
            "HeadPodNotFound",
            "Head pod does not exist",
        ),
    }
}

fn head_info(head: Option<&Pod>, service: Option<&Service>, service_name: &str) -> HeadInfo {
    HeadInfo {
        pod_name: head.map(|p| p.name_any()),
        pod_ip: head
            .and_then(|p| p.status.as_ref())
            .and_then(|s| s.pod_ip.clone()),
        service_name: Some(service_name.to_string()),
        service_ip: service
            .and_then(|s| s.spec.as_ref())
            .and_then(|s| s.cluster_ip.clone())
            .filter(|ip| !ip.is_empty() && ip != "None"),
    }
}

/// Compute the status of `cluster` from its observed children.
///
/// `failure` is the error returned by this reconcile's pod operations, if any.
pub fn compute_status(
    cluster: &RayCluster,
    pods: &[Pod],
    head_service: Option<&Service>,
    head_service_name: &str,
    failure: Option<&Error>,
) -> RayClusterStatus {
    let previous = cluster.status.clone().unwrap_or_default();
    let totals = cluster_replica_totals(cluster);
    let head = find_head_pod(pods);

    let mut status = RayClusterStatus {
        state: previous.state.clone(),
        reason: None,
        head: Some(head_info(head, head_service, head_service_name)),
        available_worker_replicas: calculate_available_replicas(pods),
        ready_worker_replicas: calculate_ready_replicas(pods),
        desired_worker_replicas: totals.desired,
        min_worker_replicas: totals.min,
        max_worker_replicas: totals.max,
        conditions: previous.conditions,
        observed_generation: cluster.metadata.generation,
    };

    let head_condition = head_pod_ready_condition(head);
    let head_ready = head_condition.status == ConditionStatus::True;
    set_condition(&mut status.conditions, head_condition);

    match failure.map(Error::replica_failure_reason) {
        Some(reason) if !reason.is_empty() => {
            status.state = ClusterState::Failed;
            status.reason = Some(reason.to_string());
            set_condition(
                &mut status.conditions,
                Condition::new(
                    condition_types::REPLICA_FAILURE,
                    ConditionStatus::True,
                    reason,
                    failure.map(ToString::to_string).unwrap_or_default(),
                ),
            );
        }
        _ => remove_condition(&mut status.conditions, condition_types::REPLICA_FAILURE),
    }

    let suspended = cluster.spec.is_suspended();
    if suspended {
        set_condition(
            &mut status.conditions,
            Condition::new(
                condition_types::SUSPENDED,
                ConditionStatus::True,
                "RayClusterSuspended",
                "Cluster is suspended",
            ),
        );
    } else {
        remove_condition(&mut status.conditions, condition_types::SUSPENDED);
    }

    let all_running = check_all_pods_running(pods);
    let converged =
        head_ready && all_running && status.available_worker_replicas == totals.desired;

    if status.reason.is_none() {
        status.state = if suspended {
            if pods.is_empty() {
                ClusterState::Suspended
            } else {
                previous.state
            }
        } else if converged || previous.state == ClusterState::Ready {
            ClusterState::Ready
        } else {
            ClusterState::Uninitialized
        };
    }

    let provisioned = find_condition(&status.conditions, condition_types::PROVISIONED)
        .is_some_and(|c| c.status == ConditionStatus::True);
    if !provisioned {
        let condition = if converged {
            Condition::new(
                condition_types::PROVISIONED,
                ConditionStatus::True,
                "AllPodsRunningAndReady",
                "All pods reached running and ready",
            )
        } else {
            Condition::new(
                condition_types::PROVISIONED,
                ConditionStatus::False,
                "PodsProvisioning",
                "Waiting for pods to become running and ready",
            )
        };
        set_condition(&mut status.conditions, condition);
    }

    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kuberay_common::crd::{RayClusterSpec, WorkerGroupSpec};
    use kuberay_common::ReplicaFailure;
    use rstest::rstest;
    use std::collections::BTreeMap;

    fn pod(name: &str, node: &str, phase: &str, ready: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([(
                    "ray.io/node-type".to_string(),
                    node.to_string(),
                )])),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                pod_ip: Some("10.0.0.7".to_string()),
                conditions: ready.map(|s| {
                    vec![PodCondition {
                        type_: "Ready".to_string(),
                        status: s.to_string(),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
        }
    }

    fn cluster(workers: i32) -> RayCluster {
        let mut rc = RayCluster::new(
            "rc",
            RayClusterSpec {
                worker_group_specs: vec![WorkerGroupSpec {
                    group_name: "small".to_string(),
                    replicas: Some(workers),
                    min_replicas: Some(0),
                    max_replicas: Some(10),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        rc.metadata.generation = Some(3);
        rc
    }

    #[rstest]
    #[case::running_no_condition("Running", None, true)]
    #[case::running_ready("Running", Some("True"), true)]
    #[case::running_unready("Running", Some("False"), false)]
    #[case::pending("Pending", None, false)]
    fn running_and_ready(#[case] phase: &str, #[case] ready: Option<&str>, #[case] expected: bool) {
        assert_eq!(is_running_and_ready(&pod("p", "worker", phase, ready)), expected);
    }

    #[test]
    fn ready_count_requires_explicit_condition() {
        let pods = vec![
            pod("h", "head", "Running", Some("True")),
            pod("w1", "worker", "Running", None),
            pod("w2", "worker", "Running", Some("True")),
            pod("w3", "worker", "Pending", Some("False")),
        ];
        assert_eq!(calculate_available_replicas(&pods), 2);
        assert_eq!(calculate_ready_replicas(&pods), 1);
        assert!(!check_all_pods_running(&pods));
    }

    #[test]
    fn empty_pod_set_is_not_all_running() {
        assert!(!check_all_pods_running(&[]));
    }

    #[test]
    fn converged_cluster_is_ready_and_provisioned() {
        let rc = cluster(1);
        let pods = vec![
            pod("h", "head", "Running", Some("True")),
            pod("w1", "worker", "Running", Some("True")),
        ];
        let svc = Service {
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.96.0.10".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let status = compute_status(&rc, &pods, Some(&svc), "rc-head-svc", None);

        assert_eq!(status.state, ClusterState::Ready);
        assert_eq!(status.available_worker_replicas, 1);
        assert_eq!(status.desired_worker_replicas, 1);
        assert_eq!(status.observed_generation, Some(3));
        let head = status.head.as_ref().unwrap();
        assert_eq!(head.pod_name.as_deref(), Some("h"));
        assert_eq!(head.service_ip.as_deref(), Some("10.96.0.10"));
        assert_eq!(
            find_condition(&status.conditions, condition_types::PROVISIONED)
                .unwrap()
                .status,
            ConditionStatus::True
        );
    }

    #[test]
    fn headless_service_ip_is_not_reported() {
        let svc = Service {
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let status = compute_status(&cluster(0), &[], Some(&svc), "svc", None);
        assert_eq!(status.head.unwrap().service_ip, None);
    }

    #[test]
    fn missing_workers_keep_cluster_uninitialized() {
        let status = compute_status(
            &cluster(2),
            &[pod("h", "head", "Running", Some("True"))],
            None,
            "svc",
            None,
        );
        assert_eq!(status.state, ClusterState::Uninitialized);
        assert_eq!(
            find_condition(&status.conditions, condition_types::HEAD_POD_READY)
                .unwrap()
                .status,
            ConditionStatus::True
        );
    }

    #[test]
    fn replica_failure_marks_cluster_failed_then_clears() {
        let mut rc = cluster(1);
        let err = Error::replica(
            ReplicaFailure::CreateWorkerPod,
            "rc",
            Error::internal("quota exceeded"),
        );
        let failed = compute_status(&rc, &[], None, "svc", Some(&err));
        assert_eq!(failed.state, ClusterState::Failed);
        assert_eq!(failed.reason.as_deref(), Some("FailedCreateWorkerPod"));
        assert_eq!(
            find_condition(&failed.conditions, condition_types::REPLICA_FAILURE)
                .unwrap()
                .reason,
            "FailedCreateWorkerPod"
        );

        rc.status = Some(failed);
        let recovered = compute_status(&rc, &[], None, "svc", None);
        assert_eq!(recovered.reason, None);
        assert!(find_condition(&recovered.conditions, condition_types::REPLICA_FAILURE).is_none());
    }

    #[test]
    fn unclassified_error_does_not_fail_cluster() {
        let err = Error::internal("list failed");
        let status = compute_status(&cluster(0), &[], None, "svc", Some(&err));
        assert_ne!(status.state, ClusterState::Failed);
        assert_eq!(status.reason, None);
    }

    #[test]
    fn suspended_cluster_without_pods_is_suspended() {
        let mut rc = cluster(1);
        rc.spec.suspend = Some(true);
        let status = compute_status(&rc, &[], None, "svc", None);
        assert_eq!(status.state, ClusterState::Suspended);
        assert_eq!(status.desired_worker_replicas, 0);
        assert!(find_condition(&status.conditions, condition_types::SUSPENDED).is_some());
    }

    #[test]
    fn ready_state_is_sticky_once_reached() {
        let mut rc = cluster(1);
        rc.status = Some(RayClusterStatus {
            state: ClusterState::Ready,
            ..Default::default()
        });
        let status = compute_status(&rc, &[pod("h", "head", "Pending", None)], None, "svc", None);
        assert_eq!(status.state, ClusterState::Ready);
    }

    #[test]
    fn recomputing_unchanged_status_is_stable() {
        let mut rc = cluster(1);
        let pods = vec![
            pod("h", "head", "Running", Some("True")),
            pod("w1", "worker", "Running", Some("True")),
        ];
        let first = compute_status(&rc, &pods, None, "svc", None);
        rc.status = Some(first.clone());
        let second = compute_status(&rc, &pods, None, "svc", None);
        assert_eq!(first, second);
    }
}
