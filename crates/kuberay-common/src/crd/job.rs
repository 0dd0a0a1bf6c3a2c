//! RayJob CRD types
//!
//! A RayJob runs one entrypoint against a RayCluster it either creates
//! (`rayClusterSpec`) or borrows (`clusterSelector`). `jobDeploymentStatus`
//! tracks the operator's lifecycle, `jobStatus` mirrors the remote run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::cluster::{RayClusterSpec, RayClusterStatus};

/// Submitter backoff limit used when `submitterConfig.backoffLimit` is unset
pub const DEFAULT_SUBMITTER_BACKOFF_LIMIT: i32 = 2;

// =============================================================================
// Submission mode
// =============================================================================

/// How the entrypoint reaches the cluster
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum JobSubmissionMode {
    /// A submitter batch Job runs `ray job submit` and tails the logs
    #[default]
    K8sJobMode,
    /// The operator submits through the dashboard REST API
    #[serde(rename = "HTTPMode")]
    HttpMode,
    /// The user submits; the operator waits for `spec.jobId`
    InteractiveMode,
}

impl std::fmt::Display for JobSubmissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::K8sJobMode => write!(f, "K8sJobMode"),
            Self::HttpMode => write!(f, "HTTPMode"),
            Self::InteractiveMode => write!(f, "InteractiveMode"),
        }
    }
}

// =============================================================================
// Spec
// =============================================================================

/// Submitter workload settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubmitterConfig {
    /// Retries of the submitter batch Job itself (default 2)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,
}

/// Desired state of a Ray job
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ray.io",
    version = "v1",
    kind = "RayJob",
    plural = "rayjobs",
    shortname = "rj",
    namespaced,
    status = "RayJobStatus",
    printcolumn = r#"{"name":"Job Status","type":"string","jsonPath":".status.jobStatus"}"#,
    printcolumn = r#"{"name":"Deployment Status","type":"string","jsonPath":".status.jobDeploymentStatus"}"#,
    printcolumn = r#"{"name":"Ray Cluster Name","type":"string","jsonPath":".status.rayClusterName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RayJobSpec {
    /// Command submitted to the cluster
    #[serde(default)]
    pub entrypoint: String,

    /// Cluster to create for this job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ray_cluster_spec: Option<RayClusterSpec>,

    /// Existing cluster to run on, `ray.io/cluster: <name>`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cluster_selector: BTreeMap<String, String>,

    /// How the entrypoint is submitted
    #[serde(default)]
    pub submission_mode: JobSubmissionMode,

    /// Submission id; required in InteractiveMode, derived otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    /// Metadata attached to the Ray job
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,

    /// Ray runtime environment as YAML
    #[serde(
        rename = "runtimeEnvYAML",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub runtime_env_yaml: Option<String>,

    /// Job-level retries after a failed attempt (default 0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,

    /// Submitter workload settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitter_config: Option<SubmitterConfig>,

    /// Delete the cluster once the job reaches Complete or Failed
    #[serde(default)]
    pub shutdown_after_job_finishes: bool,

    /// Tear down cluster and submitter while true
    #[serde(default)]
    pub suspend: bool,

    /// Deadline for an attempt, counted from its start time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i32>,

    /// TTL copied onto the finished submitter
    #[serde(default)]
    pub ttl_seconds_after_finished: i32,

    /// Submitter pod template; synthesized from the head image when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitter_pod_template: Option<PodTemplateSpec>,
}

impl RayJobSpec {
    /// Name of the cluster referenced through `clusterSelector`
    pub fn selected_cluster(&self) -> Option<&str> {
        self.cluster_selector
            .get(crate::RAY_JOB_CLUSTER_SELECTOR_KEY)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Effective submitter backoff limit
    pub fn submitter_backoff_limit(&self) -> i32 {
        self.submitter_config
            .as_ref()
            .and_then(|c| c.backoff_limit)
            .unwrap_or(DEFAULT_SUBMITTER_BACKOFF_LIMIT)
    }
}

// =============================================================================
// Status
// =============================================================================

/// Status of the remote Ray job, as reported by the dashboard
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    /// Not submitted or not yet observed
    #[default]
    #[serde(rename = "")]
    New,
    /// Accepted, waiting for resources
    Pending,
    /// Running on the cluster
    Running,
    /// Stopped by a user
    Stopped,
    /// Finished successfully
    Succeeded,
    /// Finished with an error
    Failed,
}

impl JobStatus {
    /// No further transitions are possible from a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "NEW"),
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Operator-facing lifecycle of a RayJob
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum JobDeploymentStatus {
    /// Not reconciled yet
    #[default]
    #[serde(rename = "")]
    New,
    /// Creating the cluster and submitter
    Initializing,
    /// InteractiveMode: waiting for the user to provide a job id
    Waiting,
    /// Remote run observed
    Running,
    /// Finished successfully
    Complete,
    /// Finished with a terminal failure
    Failed,
    /// Tearing down for suspension
    Suspending,
    /// Suspended, nothing running
    Suspended,
    /// Tearing down for another attempt
    Retrying,
}

impl JobDeploymentStatus {
    /// Complete and Failed only change through suspend/resume
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl std::fmt::Display for JobDeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "New"),
            Self::Initializing => write!(f, "Initializing"),
            Self::Waiting => write!(f, "Waiting"),
            Self::Running => write!(f, "Running"),
            Self::Complete => write!(f, "Complete"),
            Self::Failed => write!(f, "Failed"),
            Self::Suspending => write!(f, "Suspending"),
            Self::Suspended => write!(f, "Suspended"),
            Self::Retrying => write!(f, "Retrying"),
        }
    }
}

/// Why a RayJob failed
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum JobFailedReason {
    /// The submitter exhausted its retries without a remote failure
    SubmissionFailed,
    /// `activeDeadlineSeconds` elapsed
    DeadlineExceeded,
    /// The remote job reported FAILED
    AppFailed,
}

impl std::fmt::Display for JobFailedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SubmissionFailed => write!(f, "SubmissionFailed"),
            Self::DeadlineExceeded => write!(f, "DeadlineExceeded"),
            Self::AppFailed => write!(f, "AppFailed"),
        }
    }
}

/// Observed state of a Ray job
///
/// Optional fields are serialized as null so a merge patch clears them.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RayJobStatus {
    /// Operator-facing lifecycle state
    #[serde(default)]
    pub job_deployment_status: JobDeploymentStatus,

    /// Remote run state
    #[serde(default)]
    pub job_status: JobStatus,

    /// Terminal failure classification
    #[serde(default)]
    pub reason: Option<JobFailedReason>,

    /// Human-readable detail
    #[serde(default)]
    pub message: Option<String>,

    /// Submission id of the current attempt
    #[serde(default)]
    pub job_id: Option<String>,

    /// Cluster the current attempt runs on
    #[serde(default)]
    pub ray_cluster_name: Option<String>,

    /// Dashboard `host:port` of that cluster
    #[serde(default, rename = "dashboardURL")]
    pub dashboard_url: Option<String>,

    /// Start of the current attempt
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,

    /// When the job reached Complete or Failed
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,

    /// Successful attempts
    #[serde(default)]
    pub succeeded: Option<i32>,

    /// Failed attempts
    #[serde(default)]
    pub failed: Option<i32>,

    /// Snapshot of the cluster status
    #[serde(default)]
    pub ray_cluster_status: Option<RayClusterStatus>,

    /// Generation this status was computed from
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

impl RayJob {
    /// Current deployment status, `New` when no status was written yet
    pub fn deployment_status(&self) -> JobDeploymentStatus {
        self.status
            .as_ref()
            .map(|s| s.job_deployment_status)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_statuses_serialize_as_empty_strings() {
        let status = RayJobStatus::default();
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["jobDeploymentStatus"], "");
        assert_eq!(json["jobStatus"], "");
        assert!(json["dashboardURL"].is_null());
    }

    #[test]
    fn remote_statuses_use_dashboard_spelling() {
        let parsed: JobStatus = serde_json::from_str("\"SUCCEEDED\"").unwrap();
        assert_eq!(parsed, JobStatus::Succeeded);
        assert!(parsed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::New.is_terminal());
    }

    #[test]
    fn submission_modes_use_wire_names() {
        let mode: JobSubmissionMode = serde_json::from_str("\"HTTPMode\"").unwrap();
        assert_eq!(mode, JobSubmissionMode::HttpMode);
        assert_eq!(
            serde_json::to_string(&JobSubmissionMode::K8sJobMode).unwrap(),
            "\"K8sJobMode\""
        );
    }

    #[test]
    fn spec_defaults() {
        let spec: RayJobSpec = serde_yaml::from_str(
            r#"
entrypoint: python /home/ray/samples/sample_code.py
clusterSelector:
  ray.io/cluster: shared
runtimeEnvYAML: |
  pip: ["requests"]
"#,
        )
        .unwrap();
        assert_eq!(spec.submission_mode, JobSubmissionMode::K8sJobMode);
        assert_eq!(spec.selected_cluster(), Some("shared"));
        assert_eq!(spec.submitter_backoff_limit(), DEFAULT_SUBMITTER_BACKOFF_LIMIT);
        assert!(spec.runtime_env_yaml.is_some());
        assert!(!spec.suspend);
    }

    #[test]
    fn only_complete_and_failed_are_terminal() {
        assert!(JobDeploymentStatus::Complete.is_terminal());
        assert!(JobDeploymentStatus::Failed.is_terminal());
        assert!(!JobDeploymentStatus::Retrying.is_terminal());
        assert!(!JobDeploymentStatus::Suspended.is_terminal());
    }
}
