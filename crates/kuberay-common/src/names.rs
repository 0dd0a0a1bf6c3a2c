//! Naming helpers and label/annotation interpretation
//!
//! Child names are derived from the parent's identity so that two reconciles
//! of the same object always address the same children.

use k8s_openapi::api::core::v1::Container;
use kube::ResourceExt;
use rand::Rng;

use crate::crd::{RayCluster, RayClusterSpec, RayJob};
use crate::kube_utils::deterministic_hash;
use crate::{Error, Result};

/// Longest name kept by [`check_name`]
pub const MAX_NAME_LENGTH: usize = 50;

/// Longest prefix used for generated pod names
pub const MAX_POD_PREFIX_LENGTH: usize = 50;

/// Length of the random suffix appended to pod names
pub const POD_NAME_SUFFIX_LENGTH: usize = 5;

/// Hex characters of the owner hash kept in job cluster names
const JOB_CLUSTER_HASH_LENGTH: usize = 5;

/// Suffix alphabet, the one the API server uses for generateName
const SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Role of a Ray pod
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RayNodeType {
    /// The single head pod
    Head,
    /// A worker pod
    Worker,
}

impl RayNodeType {
    /// Label value for `ray.io/node-type`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Head => "head",
            Self::Worker => "worker",
        }
    }
}

impl std::fmt::Display for RayNodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of custom resource a name is generated for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrdKind {
    /// RayCluster
    RayCluster,
    /// RayJob
    RayJob,
    /// RayService
    RayService,
}

impl std::fmt::Display for CrdKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RayCluster => write!(f, "RayCluster"),
            Self::RayJob => write!(f, "RayJob"),
            Self::RayService => write!(f, "RayService"),
        }
    }
}

/// Make a derived name acceptable to the API server.
///
/// Keeps the trailing [`MAX_NAME_LENGTH`] characters, then replaces a
/// leading digit and then a leading punctuation character with `r`.
pub fn check_name(s: &str) -> String {
    let count = s.chars().count();
    let mut name: String = if count > MAX_NAME_LENGTH {
        s.chars().skip(count - MAX_NAME_LENGTH).collect()
    } else {
        s.to_string()
    };

    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.replace_range(..1, "r");
    }
    if name.starts_with(|c: char| c.is_ascii_punctuation()) {
        name.replace_range(..1, "r");
    }
    name
}

/// `generateName` prefix for a pod, `<prefix>-head-` or `<prefix>-worker-`
pub fn pod_generate_name(prefix: &str, node_type: RayNodeType) -> String {
    let prefix: String = prefix.chars().take(MAX_POD_PREFIX_LENGTH).collect();
    format!("{prefix}-{node_type}-").to_lowercase()
}

/// Concrete pod name: the generate-name prefix plus a random suffix
pub fn pod_name(generate_name: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..POD_NAME_SUFFIX_LENGTH)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect();
    format!("{generate_name}{suffix}")
}

/// Head service name for the given owner kind
pub fn head_service_name(kind: CrdKind, spec: &RayClusterSpec, owner_name: &str) -> Result<String> {
    match kind {
        CrdKind::RayCluster => {
            let explicit = spec
                .head_group_spec
                .head_service
                .as_ref()
                .and_then(|svc| svc.metadata.name.as_deref())
                .filter(|n| !n.is_empty());
            Ok(match explicit {
                Some(name) => name.to_string(),
                None => check_name(&format!("{owner_name}-head-svc")),
            })
        }
        CrdKind::RayService => Ok(format!("{owner_name}-head-svc")),
        CrdKind::RayJob => Err(Error::validation_for(
            owner_name,
            format!("cannot generate a head service name for kind {kind}"),
        )),
    }
}

/// Service account of the head pod, defaulting to the cluster name
pub fn head_service_account_name(cluster: &RayCluster) -> String {
    cluster
        .spec
        .head_group_spec
        .template
        .spec
        .as_ref()
        .and_then(|s| s.service_account_name.as_deref())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| cluster.name_any())
}

/// Container port with the given name, or `default`
pub fn find_container_port(container: &Container, port_name: &str, default: i32) -> i32 {
    container
        .ports
        .as_ref()
        .and_then(|ports| {
            ports
                .iter()
                .find(|p| p.name.as_deref() == Some(port_name))
                .map(|p| p.container_port)
        })
        .unwrap_or(default)
}

/// Cluster DNS domain from an optional override
pub fn cluster_domain_from(value: Option<String>) -> String {
    value
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| crate::DEFAULT_DOMAIN_NAME.to_string())
}

/// Cluster DNS domain from `CLUSTER_DOMAIN`, default `cluster.local`
pub fn cluster_domain() -> String {
    cluster_domain_from(std::env::var(crate::CLUSTER_DOMAIN_ENV_KEY).ok())
}

/// `<service>.<namespace>.svc.<domain>`
pub fn service_fqdn(service: &str, namespace: &str) -> String {
    format!("{service}.{namespace}.svc.{}", cluster_domain())
}

/// Whether the in-tree autoscaler drives this cluster spec
pub fn is_autoscaling_enabled(spec: Option<&RayClusterSpec>) -> bool {
    spec.and_then(|s| s.enable_in_tree_autoscaling)
        .unwrap_or(false)
}

/// Whether GCS fault tolerance is on, by annotation or options
pub fn is_gcs_fault_tolerance_enabled(cluster: &RayCluster) -> bool {
    let annotated = cluster
        .annotations()
        .get(crate::RAY_FT_ENABLED_ANNOTATION_KEY)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    annotated || cluster.spec.gcs_fault_tolerance_options.is_some()
}

/// Name of the cluster a RayJob creates: `<job>-raycluster-<hash of uid>`
pub fn job_cluster_name(job: &RayJob) -> String {
    let name = job.name_any();
    let identity = job.uid().unwrap_or_else(|| name.clone());
    let hash = deterministic_hash(&identity);
    check_name(&format!(
        "{name}-raycluster-{}",
        &hash[..JOB_CLUSTER_HASH_LENGTH]
    ))
}

/// Name of the submitter batch Job of a RayJob
pub fn job_submitter_name(job: &RayJob) -> String {
    job.name_any()
}

/// Submission id for the current attempt.
///
/// `spec.jobId` when set. Otherwise the job name for the first attempt and
/// `<name>-attempt-<n>` after `n` failures, since Ray refuses to reuse a
/// submission id.
pub fn job_submission_id(job: &RayJob) -> String {
    if let Some(id) = job.spec.job_id.as_deref().filter(|id| !id.is_empty()) {
        return id.to_string();
    }
    let failed = job.status.as_ref().and_then(|s| s.failed).unwrap_or(0);
    if failed == 0 {
        job.name_any()
    } else {
        format!("{}-attempt-{failed}", job.name_any())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{GcsFaultToleranceOptions, RayJobSpec, RayJobStatus};
    use k8s_openapi::api::core::v1::{ContainerPort, PodSpec, Service};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use rstest::rstest;
    use std::collections::BTreeMap;

    #[rstest]
    #[case::long_numeric_start(
        "72fbcc7e-a661-4b18e-ca41-e903-fc3ae634b18e-lazer090scholar-director-s",
        "rca41-e903-fc3ae634b18e-lazer090scholar-director-s"
    )]
    #[case::long_punctuation_start(
        "--------566666--------444433-----------222222----------4444",
        "r6666--------444433-----------222222----------4444"
    )]
    #[case::unchanged("acceptable-name-head-12345", "acceptable-name-head-12345")]
    fn check_name_truncates_and_sanitizes(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(check_name(input), expected);
    }

    #[rstest]
    #[case::short_head("ray-cluster-01", RayNodeType::Head, "ray-cluster-01-head-")]
    #[case::short_worker(
        "ray-cluster-group-name-01",
        RayNodeType::Worker,
        "ray-cluster-group-name-01-worker-"
    )]
    #[case::long_head(
        "ray-cluster-0000000000000000000000011111111122222233333333333333",
        RayNodeType::Head,
        "ray-cluster-00000000000000000000000111111111222222-head-"
    )]
    #[case::long_worker(
        "ray-cluster-0000000000000000000000011111111122222233333333333333-group-name",
        RayNodeType::Worker,
        "ray-cluster-00000000000000000000000111111111222222-worker-"
    )]
    fn pod_generate_name_fits_with_suffix(
        #[case] prefix: &str,
        #[case] node_type: RayNodeType,
        #[case] expected: &str,
    ) {
        let generated = pod_generate_name(prefix, node_type);
        assert_eq!(generated, expected);
        assert!(generated.len() + POD_NAME_SUFFIX_LENGTH <= 63);
    }

    #[test]
    fn pod_names_get_a_random_suffix() {
        let a = pod_name("rc-head-");
        let b = pod_name("rc-head-");
        assert!(a.starts_with("rc-head-"));
        assert_eq!(a.len(), "rc-head-".len() + POD_NAME_SUFFIX_LENGTH);
        assert!(a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        // 27^5 suffixes; a collision here means the suffix is not random
        assert_ne!(a, b);
    }

    #[test]
    fn head_service_name_per_kind() {
        let plain = RayClusterSpec::default();
        assert_eq!(
            head_service_name(CrdKind::RayCluster, &plain, "raycluster-sample").unwrap(),
            "raycluster-sample-head-svc"
        );

        let mut named = RayClusterSpec::default();
        named.head_group_spec.head_service = Some(Service {
            metadata: ObjectMeta {
                name: Some("my-head-svc".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        assert_eq!(
            head_service_name(CrdKind::RayCluster, &named, "raycluster-sample").unwrap(),
            "my-head-svc"
        );
        assert_eq!(
            head_service_name(CrdKind::RayService, &named, "rayservice-sample").unwrap(),
            "rayservice-sample-head-svc"
        );

        let err = head_service_name(CrdKind::RayJob, &plain, "rayjob-sample").unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn service_account_defaults_to_cluster_name() {
        let mut rc = RayCluster::new("raycluster-sample", RayClusterSpec::default());
        assert_eq!(head_service_account_name(&rc), "raycluster-sample");

        rc.spec.head_group_spec.template.spec = Some(PodSpec {
            service_account_name: Some("my-service-account".to_string()),
            ..Default::default()
        });
        assert_eq!(head_service_account_name(&rc), "my-service-account");
    }

    #[test]
    fn container_port_lookup_by_name() {
        let container = Container {
            name: "ray-head".to_string(),
            ports: Some(vec![
                ContainerPort {
                    name: Some("port1".to_string()),
                    container_port: 10001,
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("port2".to_string()),
                    container_port: 10002,
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };
        assert_eq!(find_container_port(&container, "port1", -1), 10001);
        assert_eq!(find_container_port(&container, "port2", -1), 10002);
        assert_eq!(find_container_port(&container, "port3", -1), -1);
    }

    #[rstest]
    #[case::from_env(Some("abc.com".to_string()), "abc.com")]
    #[case::unset(None, "cluster.local")]
    #[case::empty(Some(String::new()), "cluster.local")]
    fn cluster_domain_override(#[case] value: Option<String>, #[case] expected: &str) {
        assert_eq!(cluster_domain_from(value), expected);
    }

    #[test]
    fn autoscaling_flag() {
        assert!(!is_autoscaling_enabled(None));
        let mut spec = RayClusterSpec::default();
        assert!(!is_autoscaling_enabled(Some(&spec)));
        spec.enable_in_tree_autoscaling = Some(true);
        assert!(is_autoscaling_enabled(Some(&spec)));
    }

    #[rstest]
    #[case::annotation_true(Some("true"), false, true)]
    #[case::annotation_upper(Some("TRUE"), false, true)]
    #[case::options_only(None, true, true)]
    #[case::annotation_false(Some("false"), false, false)]
    #[case::neither(None, false, false)]
    fn gcs_fault_tolerance(
        #[case] annotation: Option<&str>,
        #[case] options: bool,
        #[case] expected: bool,
    ) {
        let mut rc = RayCluster::new("rc", RayClusterSpec::default());
        if let Some(v) = annotation {
            rc.metadata.annotations = Some(BTreeMap::from([(
                crate::RAY_FT_ENABLED_ANNOTATION_KEY.to_string(),
                v.to_string(),
            )]));
        }
        if options {
            rc.spec.gcs_fault_tolerance_options = Some(GcsFaultToleranceOptions::default());
        }
        assert_eq!(is_gcs_fault_tolerance_enabled(&rc), expected);
    }

    fn job(name: &str, uid: &str) -> RayJob {
        let mut job = RayJob::new(name, RayJobSpec::default());
        job.metadata.uid = Some(uid.to_string());
        job
    }

    #[test]
    fn job_children_names_are_deterministic() {
        let a = job("rayjob-sample", "uid-1");
        let name = job_cluster_name(&a);
        assert_eq!(name, job_cluster_name(&a.clone()));
        assert!(name.starts_with("rayjob-sample-raycluster-"));
        assert_eq!(name.len(), "rayjob-sample-raycluster-".len() + 5);

        let b = job("rayjob-sample", "uid-2");
        assert_ne!(name, job_cluster_name(&b));
        assert_eq!(job_submitter_name(&a), "rayjob-sample");
    }

    #[test]
    fn long_job_names_keep_the_hash() {
        let long = job(&"a".repeat(60), "uid-1");
        let name = job_cluster_name(&long);
        assert_eq!(name.len(), MAX_NAME_LENGTH);
        let hash = deterministic_hash("uid-1");
        assert!(name.ends_with(&hash[..5]));
    }

    #[test]
    fn submission_id_per_attempt() {
        let mut j = job("rayjob-sample", "uid-1");
        assert_eq!(job_submission_id(&j), "rayjob-sample");

        j.status = Some(RayJobStatus {
            failed: Some(2),
            ..Default::default()
        });
        assert_eq!(job_submission_id(&j), "rayjob-sample-attempt-2");

        j.spec.job_id = Some("user-id".to_string());
        assert_eq!(job_submission_id(&j), "user-id");
    }
}
