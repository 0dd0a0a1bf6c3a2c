//! Custom Resource Definitions for KubeRay
//!
//! This module contains the RayCluster and RayJob CRDs used by the operator.

mod cluster;
mod job;
mod types;

pub use cluster::{
    condition_types, ClusterState, GcsFaultToleranceOptions, HeadGroupSpec, HeadInfo, RayCluster,
    RayClusterSpec, RayClusterStatus, RedisCredential, ScaleStrategy, WorkerGroupSpec,
};
pub use job::{
    JobDeploymentStatus, JobFailedReason, JobStatus, JobSubmissionMode, RayJob, RayJobSpec,
    RayJobStatus, SubmitterConfig, DEFAULT_SUBMITTER_BACKOFF_LIMIT,
};
pub use types::{find_condition, remove_condition, set_condition, Condition, ConditionStatus};
