//! Submitter batch Job for K8sJobMode
//!
//! The submitter runs one shell command against the cluster's dashboard: it
//! submits the entrypoint under the attempt's submission id unless the
//! cluster already knows that id, then follows the job's logs. Re-running it
//! after a pod restart therefore never submits twice.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use kuberay_common::crd::RayJob;
use kuberay_common::kube_utils::{find_condition_status, merge_labels, owner_reference};
use kuberay_common::names::job_submitter_name;
use kuberay_common::{Error, Result};

use crate::cluster::originated_from_labels;

/// Name of the synthesized submitter container
pub const SUBMITTER_CONTAINER_NAME: &str = "ray-job-submitter";

/// Parse `runtimeEnvYAML` into a JSON object.
///
/// Empty input means no runtime env. Anything but a mapping is rejected.
pub fn runtime_env_json(job: &RayJob) -> Result<Option<serde_json::Value>> {
    let Some(raw) = job.spec.runtime_env_yaml.as_deref() else {
        return Ok(None);
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }

    let value: serde_yaml::Value = serde_yaml::from_str(raw).map_err(|e| {
        Error::validation_for_field(
            job.name_any(),
            "spec.runtimeEnvYAML",
            format!("invalid YAML: {e}"),
        )
    })?;
    if !value.is_mapping() {
        return Err(Error::validation_for_field(
            job.name_any(),
            "spec.runtimeEnvYAML",
            "runtime env must be a mapping",
        ));
    }
    let json = serde_json::to_value(value)
        .map_err(|e| Error::serialization_for_kind("RayJob", e.to_string()))?;
    Ok(Some(json))
}

/// Single-quote `s` for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Shell script that submits once and then follows the logs
///
/// Everything but the entrypoint is quoted; the entrypoint is a shell command
/// line of its own.
pub fn submitter_script(job: &RayJob, submission_id: &str, address: &str) -> Result<String> {
    let address = shell_quote(&format!("http://{address}"));
    let id = shell_quote(submission_id);
    let mut submit = vec![
        "ray job submit".to_string(),
        format!("--address {address}"),
        "--no-wait".to_string(),
    ];
    if let Some(env) = runtime_env_json(job)? {
        submit.push(format!("--runtime-env-json {}", shell_quote(&env.to_string())));
    }
    if !job.spec.metadata.is_empty() {
        let metadata = serde_json::to_string(&job.spec.metadata)?;
        submit.push(format!("--metadata-json {}", shell_quote(&metadata)));
    }
    submit.push(format!("--submission-id {id}"));
    submit.push("--".to_string());
    submit.push(job.spec.entrypoint.clone());

    Ok(format!(
        "if ! ray job status --address {address} {id} >/dev/null 2>&1 ; \
         then {} ; fi ; ray job logs --address {address} --follow {id}",
        submit.join(" ")
    ))
}

/// `["/bin/sh", "-c", <script>]`
pub fn submitter_command(job: &RayJob, submission_id: &str, address: &str) -> Result<Vec<String>> {
    Ok(vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        submitter_script(job, submission_id, address)?,
    ])
}

fn set_env_if_absent(container: &mut Container, name: &str, value: &str) {
    let env = container.env.get_or_insert_with(Vec::new);
    if env.iter().any(|e| e.name == name) {
        return;
    }
    env.push(EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    });
}

fn default_resources() -> ResourceRequirements {
    ResourceRequirements {
        limits: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity("1".to_string())),
            ("memory".to_string(), Quantity("1Gi".to_string())),
        ])),
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity("500m".to_string())),
            ("memory".to_string(), Quantity("200Mi".to_string())),
        ])),
        ..Default::default()
    }
}

/// Pod template of the submitter.
///
/// A user-supplied template is kept as is apart from filling in the command
/// when its first container has none. The dashboard address, submission id
/// and unbuffered-output variables are added without overriding user values.
pub fn submitter_pod_template(
    job: &RayJob,
    submission_id: &str,
    address: &str,
    image: Option<String>,
) -> Result<PodTemplateSpec> {
    let mut template = match job.spec.submitter_pod_template.clone() {
        Some(template) => template,
        None => {
            let image = image.ok_or_else(|| {
                Error::validation_for(
                    job.name_any(),
                    "cannot synthesize a submitter without a head container image",
                )
            })?;
            PodTemplateSpec {
                metadata: Some(ObjectMeta::default()),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: SUBMITTER_CONTAINER_NAME.to_string(),
                        image: Some(image),
                        resources: Some(default_resources()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            }
        }
    };

    let metadata = template.metadata.get_or_insert_with(ObjectMeta::default);
    metadata.labels = Some(merge_labels(
        metadata.labels.take(),
        originated_from_labels(job),
    ));

    let command = submitter_command(job, submission_id, address)?;
    let spec = template.spec.as_mut().ok_or_else(|| {
        Error::validation_for_field(
            job.name_any(),
            "spec.submitterPodTemplate.spec",
            "submitter pod template has no spec",
        )
    })?;
    spec.restart_policy.get_or_insert_with(|| "Never".to_string());

    let container = spec.containers.first_mut().ok_or_else(|| {
        Error::validation_for_field(
            job.name_any(),
            "spec.submitterPodTemplate.spec.containers",
            "submitter pod template has no containers",
        )
    })?;
    if container.command.as_ref().map_or(true, Vec::is_empty) {
        container.command = Some(command);
    }
    set_env_if_absent(container, kuberay_common::PYTHON_UNBUFFERED_ENV, "1");
    set_env_if_absent(container, kuberay_common::RAY_DASHBOARD_ADDRESS_ENV, address);
    set_env_if_absent(container, kuberay_common::RAY_JOB_SUBMISSION_ID_ENV, submission_id);

    Ok(template)
}

/// Submitter batch Job for `job` running `template`
pub fn build_submitter_job(job: &RayJob, template: PodTemplateSpec) -> Result<Job> {
    let ttl = job.spec.ttl_seconds_after_finished;
    Ok(Job {
        metadata: ObjectMeta {
            name: Some(job_submitter_name(job)),
            namespace: job.namespace(),
            labels: Some(originated_from_labels(job)),
            owner_references: Some(vec![owner_reference(job)?]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(job.spec.submitter_backoff_limit()),
            ttl_seconds_after_finished: (ttl > 0).then_some(ttl),
            template,
            ..Default::default()
        }),
        status: None,
    })
}

/// Where the submitter batch Job stands
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitterState {
    /// Still running or retrying pods
    Active,
    /// Exited successfully
    Complete,
    /// Gave up after its backoff limit
    Failed {
        /// Condition reason
        reason: String,
        /// Condition message
        message: String,
    },
}

impl SubmitterState {
    /// Whether the batch Job stopped running pods
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// Read the submitter's state from its conditions
pub fn submitter_state(submitter: &Job) -> SubmitterState {
    let conditions = submitter
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref());

    if find_condition_status(conditions, "Failed") == Some("True") {
        let failed = conditions
            .unwrap_or_default()
            .iter()
            .find(|c| c.type_ == "Failed");
        return SubmitterState::Failed {
            reason: failed.and_then(|c| c.reason.clone()).unwrap_or_default(),
            message: failed.and_then(|c| c.message.clone()).unwrap_or_default(),
        };
    }
    if find_condition_status(conditions, "Complete") == Some("True") {
        return SubmitterState::Complete;
    }
    SubmitterState::Active
}
