//! RayCluster CRD types
//!
//! A RayCluster is one head pod plus any number of independently scaled
//! worker groups. The spec is user-owned; the cluster controller only writes
//! status.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVarSource, PodTemplateSpec, Service};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

// =============================================================================
// Spec
// =============================================================================

/// Desired state of a Ray cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ray.io",
    version = "v1",
    kind = "RayCluster",
    plural = "rayclusters",
    shortname = "rc",
    namespaced,
    status = "RayClusterStatus",
    printcolumn = r#"{"name":"Desired Workers","type":"integer","jsonPath":".status.desiredWorkerReplicas"}"#,
    printcolumn = r#"{"name":"Available Workers","type":"integer","jsonPath":".status.availableWorkerReplicas"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RayClusterSpec {
    /// Ray version used by the images, informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ray_version: Option<String>,

    /// Head group: one pod template and its start parameters
    pub head_group_spec: HeadGroupSpec,

    /// Worker groups, names unique within the cluster
    #[serde(default)]
    pub worker_group_specs: Vec<WorkerGroupSpec>,

    /// Whether an in-tree autoscaler drives worker replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_in_tree_autoscaling: Option<bool>,

    /// External Redis backing for GCS fault tolerance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcs_fault_tolerance_options: Option<GcsFaultToleranceOptions>,

    /// Delete every pod of the cluster while true
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
}

impl RayClusterSpec {
    /// Whether the whole cluster is suspended
    pub fn is_suspended(&self) -> bool {
        self.suspend.unwrap_or(false)
    }

    /// Image of the head group's Ray container, if any
    pub fn head_image(&self) -> Option<&str> {
        self.head_group_spec
            .template
            .spec
            .as_ref()
            .and_then(|s| s.containers.get(crate::RAY_CONTAINER_INDEX))
            .and_then(|c| c.image.as_deref())
    }
}

/// Head group specification
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeadGroupSpec {
    /// Pod template for the head pod
    pub template: PodTemplateSpec,

    /// Parameters rendered into `ray start` as `--key=value`
    #[serde(default)]
    pub ray_start_params: BTreeMap<String, String>,

    /// Optional template for the head service; its name overrides the default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_service: Option<Service>,

    /// Service type of the head service (ClusterIP when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
}

/// A named, independently scaled pool of identical workers
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerGroupSpec {
    /// Group name, unique within the cluster
    pub group_name: String,

    /// Requested replicas; minReplicas is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Lower bound for replicas (default 0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,

    /// Upper bound for replicas (default unbounded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,

    /// Scale this group to zero while true
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,

    /// Pod template for workers of this group
    pub template: PodTemplateSpec,

    /// Parameters rendered into `ray start` as `--key=value`
    #[serde(default)]
    pub ray_start_params: BTreeMap<String, String>,

    /// Autoscaler-directed deletions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_strategy: Option<ScaleStrategy>,
}

impl WorkerGroupSpec {
    /// Whether this group is suspended
    pub fn is_suspended(&self) -> bool {
        self.suspend.unwrap_or(false)
    }
}

/// Explicit scale-down instructions from the autoscaler
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleStrategy {
    /// Pod names to delete before replica diffing
    #[serde(default)]
    pub workers_to_delete: Vec<String>,
}

/// External Redis configuration for GCS fault tolerance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GcsFaultToleranceOptions {
    /// Redis address, `host:port`
    #[serde(default)]
    pub redis_address: String,

    /// Redis password, literal or from a secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_password: Option<RedisCredential>,

    /// Storage namespace; defaults to the cluster uid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_storage_namespace: Option<String>,
}

/// Literal value or env source for a Redis credential
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RedisCredential {
    /// Literal value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Value taken from a secret or config map
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<EnvVarSource>,
}

// =============================================================================
// Status
// =============================================================================

/// Coarse cluster state
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    /// Pods are still converging
    #[default]
    Uninitialized,
    /// Head is ready and every pod is running
    Ready,
    /// The last reconcile hit a classified replica failure
    Failed,
    /// The cluster is suspended
    Suspended,
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
            Self::Suspended => write!(f, "suspended"),
        }
    }
}

/// Head pod and service addresses
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeadInfo {
    /// Name of the head pod
    pub pod_name: Option<String>,
    /// IP of the head pod
    #[serde(rename = "podIP")]
    pub pod_ip: Option<String>,
    /// Name of the head service
    pub service_name: Option<String>,
    /// Cluster IP of the head service
    #[serde(rename = "serviceIP")]
    pub service_ip: Option<String>,
}

/// Condition types reported on RayCluster status
pub mod condition_types {
    /// Head pod is running and ready
    pub const HEAD_POD_READY: &str = "HeadPodReady";
    /// All pods reached running and ready at least once
    pub const PROVISIONED: &str = "RayClusterProvisioned";
    /// A pod create/delete failed; reason carries the classification
    pub const REPLICA_FAILURE: &str = "ReplicaFailure";
    /// Cluster is suspended
    pub const SUSPENDED: &str = "RayClusterSuspended";
}

/// Observed state of a Ray cluster
///
/// Optional fields are serialized as null so a merge patch clears them.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RayClusterStatus {
    /// Coarse cluster state
    #[serde(default)]
    pub state: ClusterState,

    /// Replica failure reason from the last reconcile
    #[serde(default)]
    pub reason: Option<String>,

    /// Head pod and service
    #[serde(default)]
    pub head: Option<HeadInfo>,

    /// Workers running and not reporting unready
    #[serde(default)]
    pub available_worker_replicas: i32,

    /// Workers with Ready=True
    #[serde(default)]
    pub ready_worker_replicas: i32,

    /// Sum of desired replicas over non-suspended groups
    #[serde(default)]
    pub desired_worker_replicas: i32,

    /// Sum of minReplicas over non-suspended groups
    #[serde(default)]
    pub min_worker_replicas: i32,

    /// Sum of maxReplicas over non-suspended groups
    #[serde(default)]
    pub max_worker_replicas: i32,

    /// Kubernetes-style conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generation this status was computed from
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

impl RayCluster {
    /// Current state, `uninitialized` when no status was written yet
    pub fn state(&self) -> ClusterState {
        self.status
            .as_ref()
            .map(|s| s.state.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn spec_round_trips_camel_case_fields() {
        let yaml = r#"
headGroupSpec:
  rayStartParams:
    num-cpus: "0"
  template:
    spec:
      containers:
        - name: ray-head
          image: rayproject/ray:2.9.0
workerGroupSpecs:
  - groupName: small
    replicas: 2
    minReplicas: 1
    maxReplicas: 5
    template:
      spec:
        containers:
          - name: ray-worker
enableInTreeAutoscaling: true
"#;
        let spec: RayClusterSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.head_image(), Some("rayproject/ray:2.9.0"));
        assert_eq!(spec.worker_group_specs[0].group_name, "small");
        assert_eq!(spec.worker_group_specs[0].max_replicas, Some(5));
        assert_eq!(spec.enable_in_tree_autoscaling, Some(true));
        assert!(!spec.is_suspended());
    }

    #[test]
    fn status_serializes_state_lowercase_and_clears_optionals() {
        let status = RayClusterStatus {
            state: ClusterState::Ready,
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "ready");
        assert!(json["reason"].is_null());
        assert!(json.get("reason").is_some());
    }

    #[test]
    fn missing_status_reads_as_uninitialized() {
        let cluster = RayCluster::new("rc", RayClusterSpec::default());
        assert_eq!(cluster.state(), ClusterState::Uninitialized);
    }

    #[test]
    fn crd_is_namespaced_under_ray_io() {
        let crd = RayCluster::crd();
        assert_eq!(crd.spec.group, "ray.io");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.names.kind, "RayCluster");
    }
}
