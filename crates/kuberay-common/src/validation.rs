//! Spec validation for RayCluster and RayJob
//!
//! Failures are configuration errors: the reconcile stops before mutating
//! anything and the object is not retried until it changes.

use std::collections::HashSet;

use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::ResourceExt;

use crate::crd::{JobSubmissionMode, RayClusterSpec, RayJob};
use crate::{Error, Result};

fn has_containers(template: &PodTemplateSpec) -> bool {
    template
        .spec
        .as_ref()
        .map(|s| !s.containers.is_empty())
        .unwrap_or(false)
}

/// Validate a cluster spec owned by `resource`
pub fn validate_cluster_spec(resource: &str, spec: &RayClusterSpec) -> Result<()> {
    if !has_containers(&spec.head_group_spec.template) {
        return Err(Error::validation_for_field(
            resource,
            "spec.headGroupSpec.template.spec.containers",
            "head group template must have at least one container",
        ));
    }

    let mut seen = HashSet::new();
    for (i, group) in spec.worker_group_specs.iter().enumerate() {
        if group.group_name.is_empty() {
            return Err(Error::validation_for_field(
                resource,
                format!("spec.workerGroupSpecs[{i}].groupName"),
                "worker group name must not be empty",
            ));
        }
        if !seen.insert(group.group_name.as_str()) {
            return Err(Error::validation_for_field(
                resource,
                format!("spec.workerGroupSpecs[{i}].groupName"),
                format!("duplicate worker group name '{}'", group.group_name),
            ));
        }
        if !has_containers(&group.template) {
            return Err(Error::validation_for_field(
                resource,
                format!("spec.workerGroupSpecs[{i}].template.spec.containers"),
                format!(
                    "worker group '{}' template must have at least one container",
                    group.group_name
                ),
            ));
        }
    }
    Ok(())
}

/// Validate a RayJob spec
pub fn validate_job_spec(job: &RayJob) -> Result<()> {
    let name = job.name_any();
    let spec = &job.spec;
    let has_selector = !spec.cluster_selector.is_empty();

    match (&spec.ray_cluster_spec, has_selector) {
        (None, false) => {
            return Err(Error::validation_for(
                &name,
                "one of rayClusterSpec or clusterSelector must be set",
            ))
        }
        (Some(_), true) => {
            return Err(Error::validation_for(
                &name,
                "rayClusterSpec and clusterSelector are mutually exclusive",
            ))
        }
        _ => {}
    }

    if has_selector && spec.selected_cluster().is_none() {
        return Err(Error::validation_for_field(
            &name,
            "spec.clusterSelector",
            format!(
                "clusterSelector must name a cluster with key {}",
                crate::RAY_JOB_CLUSTER_SELECTOR_KEY
            ),
        ));
    }

    if spec.entrypoint.trim().is_empty() && spec.submission_mode != JobSubmissionMode::InteractiveMode
    {
        return Err(Error::validation_for_field(
            &name,
            "spec.entrypoint",
            "entrypoint must be set",
        ));
    }

    if spec.suspend && has_selector {
        return Err(Error::validation_for_field(
            &name,
            "spec.suspend",
            "suspend is not supported together with clusterSelector",
        ));
    }

    if spec.backoff_limit.is_some_and(|b| b < 0) {
        return Err(Error::validation_for_field(
            &name,
            "spec.backoffLimit",
            "backoffLimit must not be negative",
        ));
    }

    if let Some(cluster_spec) = &spec.ray_cluster_spec {
        validate_cluster_spec(&name, cluster_spec)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{RayJobSpec, WorkerGroupSpec};
    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use std::collections::BTreeMap;

    fn template() -> PodTemplateSpec {
        PodTemplateSpec {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "ray".to_string(),
                    image: Some("rayproject/ray:2.9.0".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn cluster_spec(groups: &[&str]) -> RayClusterSpec {
        let mut spec = RayClusterSpec::default();
        spec.head_group_spec.template = template();
        spec.worker_group_specs = groups
            .iter()
            .map(|g| WorkerGroupSpec {
                group_name: g.to_string(),
                template: template(),
                ..Default::default()
            })
            .collect();
        spec
    }

    fn job(spec: RayJobSpec) -> RayJob {
        RayJob::new("rayjob-sample", spec)
    }

    fn valid_job_spec() -> RayJobSpec {
        RayJobSpec {
            entrypoint: "python /home/ray/samples/sample_code.py".to_string(),
            ray_cluster_spec: Some(cluster_spec(&["small"])),
            ..Default::default()
        }
    }

    fn selector() -> BTreeMap<String, String> {
        BTreeMap::from([(
            crate::RAY_JOB_CLUSTER_SELECTOR_KEY.to_string(),
            "shared".to_string(),
        )])
    }

    #[test]
    fn valid_cluster_passes() {
        assert!(validate_cluster_spec("rc", &cluster_spec(&["a", "b"])).is_ok());
    }

    #[test]
    fn duplicate_group_names_are_rejected() {
        let err = validate_cluster_spec("rc", &cluster_spec(&["a", "a"])).unwrap_err();
        assert!(err.to_string().contains("duplicate worker group name 'a'"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn head_without_containers_is_rejected() {
        let mut spec = cluster_spec(&[]);
        spec.head_group_spec.template = PodTemplateSpec::default();
        match validate_cluster_spec("rc", &spec).unwrap_err() {
            Error::Validation { field, .. } => assert_eq!(
                field.as_deref(),
                Some("spec.headGroupSpec.template.spec.containers")
            ),
            other => panic!("Expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn valid_job_passes() {
        assert!(validate_job_spec(&job(valid_job_spec())).is_ok());
    }

    #[test]
    fn job_needs_exactly_one_cluster_source() {
        let mut neither = valid_job_spec();
        neither.ray_cluster_spec = None;
        assert!(validate_job_spec(&job(neither)).is_err());

        let mut both = valid_job_spec();
        both.cluster_selector = selector();
        assert!(validate_job_spec(&job(both)).is_err());

        let mut selector_only = valid_job_spec();
        selector_only.ray_cluster_spec = None;
        selector_only.cluster_selector = selector();
        assert!(validate_job_spec(&job(selector_only)).is_ok());
    }

    #[test]
    fn entrypoint_required_outside_interactive_mode() {
        let mut spec = valid_job_spec();
        spec.entrypoint = String::new();
        assert!(validate_job_spec(&job(spec.clone())).is_err());

        spec.submission_mode = JobSubmissionMode::InteractiveMode;
        assert!(validate_job_spec(&job(spec)).is_ok());
    }

    #[test]
    fn suspend_with_selector_is_rejected() {
        let mut spec = valid_job_spec();
        spec.ray_cluster_spec = None;
        spec.cluster_selector = selector();
        spec.suspend = true;
        assert!(validate_job_spec(&job(spec)).is_err());
    }

    #[test]
    fn negative_backoff_limit_is_rejected() {
        let mut spec = valid_job_spec();
        spec.backoff_limit = Some(-1);
        assert!(validate_job_spec(&job(spec)).is_err());
    }

    #[test]
    fn embedded_cluster_spec_is_validated() {
        let mut spec = valid_job_spec();
        spec.ray_cluster_spec = Some(cluster_spec(&["x", "x"]));
        assert!(validate_job_spec(&job(spec)).is_err());
    }
}
