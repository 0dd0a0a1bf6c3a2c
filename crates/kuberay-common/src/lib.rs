//! Common types for KubeRay: CRDs, errors, events, status reporting and the
//! naming/replica helpers shared by the cluster and job controllers.

#![warn(missing_docs)]

pub mod backoff;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod names;
pub mod replicas;
pub mod status;
pub mod telemetry;
pub mod validation;

pub use error::{Error, ReplicaFailure};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every write the operator makes
pub const FIELD_MANAGER: &str = "kuberay-operator";

// =============================================================================
// Labels
// =============================================================================

/// Label carrying the owning RayCluster name on pods and services
pub const RAY_CLUSTER_LABEL_KEY: &str = "ray.io/cluster";

/// Label carrying the node type (`head` or `worker`)
pub const RAY_NODE_TYPE_LABEL_KEY: &str = "ray.io/node-type";

/// Label carrying the worker group name (`headgroup` for the head pod)
pub const RAY_NODE_GROUP_LABEL_KEY: &str = "ray.io/group";

/// Label identifying `<cluster>-<node type>` for selectors
pub const RAY_ID_LABEL_KEY: &str = "ray.io/identifier";

/// Label naming the CRD kind a resource was created from
pub const RAY_ORIGINATED_FROM_CRD_LABEL_KEY: &str = "ray.io/originated-from-crd";

/// Label naming the custom resource a resource was created from
pub const RAY_ORIGINATED_FROM_CR_NAME_LABEL_KEY: &str = "ray.io/originated-from-cr-name";

/// Standard created-by label
pub const KUBERNETES_CREATED_BY_LABEL_KEY: &str = "app.kubernetes.io/created-by";

/// Value of the created-by label
pub const COMPONENT_NAME: &str = "kuberay-operator";

/// Group label value used for the head pod
pub const HEAD_GROUP_NAME: &str = "headgroup";

/// Key inside `RayJob.spec.clusterSelector` that names an existing cluster
pub const RAY_JOB_CLUSTER_SELECTOR_KEY: &str = "ray.io/cluster";

// =============================================================================
// Annotations
// =============================================================================

/// Annotation that enables GCS fault tolerance when set to "true"
pub const RAY_FT_ENABLED_ANNOTATION_KEY: &str = "ray.io/ft-enabled";

/// Annotation holding the autoscaler's per-group replica recommendation
///
/// The value is a JSON object mapping worker group name to replica count.
pub const AUTOSCALER_REPLICAS_ANNOTATION_KEY: &str = "ray.io/autoscaler-replicas";

// =============================================================================
// Environment
// =============================================================================

/// Environment variable overriding the cluster DNS domain
pub const CLUSTER_DOMAIN_ENV_KEY: &str = "CLUSTER_DOMAIN";

/// Cluster DNS domain used when `CLUSTER_DOMAIN` is unset
pub const DEFAULT_DOMAIN_NAME: &str = "cluster.local";

/// Unbuffered python output for the submitter
pub const PYTHON_UNBUFFERED_ENV: &str = "PYTHONUNBUFFERED";

/// Dashboard address handed to the submitter
pub const RAY_DASHBOARD_ADDRESS_ENV: &str = "RAY_DASHBOARD_ADDRESS";

/// Submission id handed to the submitter
pub const RAY_JOB_SUBMISSION_ID_ENV: &str = "RAY_JOB_SUBMISSION_ID";

/// Cluster name injected into every Ray container
pub const RAY_CLUSTER_NAME_ENV: &str = "RAY_CLUSTER_NAME";

/// Redis address for GCS fault tolerance
pub const RAY_REDIS_ADDRESS_ENV: &str = "RAY_REDIS_ADDRESS";

/// Redis password for GCS fault tolerance
pub const REDIS_PASSWORD_ENV: &str = "REDIS_PASSWORD";

/// External storage namespace for GCS fault tolerance
pub const RAY_EXTERNAL_STORAGE_NS_ENV: &str = "RAY_external_storage_namespace";

// =============================================================================
// Ports
// =============================================================================

/// Index of the Ray container inside head/worker/submitter templates
pub const RAY_CONTAINER_INDEX: usize = 0;

/// GCS server port name and default
pub const GCS_PORT_NAME: &str = "gcs";
/// Default GCS server port
pub const DEFAULT_GCS_PORT: i32 = 6379;

/// Dashboard port name
pub const DASHBOARD_PORT_NAME: &str = "dashboard";
/// Default dashboard port
pub const DEFAULT_DASHBOARD_PORT: i32 = 8265;

/// Ray client port name
pub const CLIENT_PORT_NAME: &str = "client";
/// Default Ray client port
pub const DEFAULT_CLIENT_PORT: i32 = 10001;

/// Metrics port name
pub const METRICS_PORT_NAME: &str = "metrics";
/// Default metrics port
pub const DEFAULT_METRICS_PORT: i32 = 8080;

/// Serve port name
pub const SERVE_PORT_NAME: &str = "serve";
/// Default serve port
pub const DEFAULT_SERVE_PORT: i32 = 8000;
