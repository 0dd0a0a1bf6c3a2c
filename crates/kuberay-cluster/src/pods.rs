//! Head and worker pod construction
//!
//! Pods are built from the group template. The operator adds its labels, a
//! controller owner reference, the `ray start` command when the user left the
//! Ray container's command empty, and the environment every Ray container
//! needs.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use kuberay_common::crd::{GcsFaultToleranceOptions, RayCluster, WorkerGroupSpec};
use kuberay_common::kube_utils::{merge_labels, owner_reference};
use kuberay_common::names::{
    find_container_port, head_service_account_name, is_gcs_fault_tolerance_enabled, pod_name,
    pod_generate_name, service_fqdn, RayNodeType,
};
use kuberay_common::{Error, Result};

/// Shell used to run the generated start command
const START_SHELL: [&str; 3] = ["/bin/bash", "-lc", "--"];

/// File descriptor limit raised before `ray start`
const ULIMIT_CMD: &str = "ulimit -n 65536";

/// Pod phases after which a non-restarting pod never runs again
const TERMINAL_PHASES: [&str; 2] = ["Failed", "Succeeded"];

/// Operator-owned labels of a Ray pod
pub fn pod_labels(cluster: &str, node_type: RayNodeType, group: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            kuberay_common::RAY_CLUSTER_LABEL_KEY.to_string(),
            cluster.to_string(),
        ),
        (
            kuberay_common::RAY_NODE_TYPE_LABEL_KEY.to_string(),
            node_type.to_string(),
        ),
        (
            kuberay_common::RAY_NODE_GROUP_LABEL_KEY.to_string(),
            group.to_string(),
        ),
        (
            kuberay_common::RAY_ID_LABEL_KEY.to_string(),
            format!("{cluster}-{node_type}"),
        ),
        (
            kuberay_common::KUBERNETES_CREATED_BY_LABEL_KEY.to_string(),
            kuberay_common::COMPONENT_NAME.to_string(),
        ),
    ])
}

/// Build the head pod of `cluster`
pub fn build_head_pod(cluster: &RayCluster) -> Result<Pod> {
    let name = cluster.name_any();
    let head = &cluster.spec.head_group_spec;

    let mut params = head.ray_start_params.clone();
    params
        .entry("dashboard-host".to_string())
        .or_insert_with(|| "0.0.0.0".to_string());
    params
        .entry("port".to_string())
        .or_insert_with(|| gcs_port(cluster).to_string());
    let command = ray_start_command(RayNodeType::Head, &params);

    let mut pod = build_pod(
        cluster,
        &head.template,
        RayNodeType::Head,
        kuberay_common::HEAD_GROUP_NAME,
        &pod_generate_name(&name, RayNodeType::Head),
        &command,
    )?;

    if let Some(spec) = pod.spec.as_mut() {
        if spec
            .service_account_name
            .as_deref()
            .map_or(true, str::is_empty)
        {
            spec.service_account_name = Some(head_service_account_name(cluster));
        }
        if is_gcs_fault_tolerance_enabled(cluster) {
            if let (Some(container), Some(options)) = (
                spec.containers.get_mut(kuberay_common::RAY_CONTAINER_INDEX),
                cluster.spec.gcs_fault_tolerance_options.as_ref(),
            ) {
                add_fault_tolerance_env(container, options, cluster.uid().as_deref());
            }
        }
    }

    Ok(pod)
}

/// Build one worker pod of `group`
pub fn build_worker_pod(
    cluster: &RayCluster,
    group: &WorkerGroupSpec,
    head_service: &str,
) -> Result<Pod> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();

    let mut params = group.ray_start_params.clone();
    params.entry("address".to_string()).or_insert_with(|| {
        format!(
            "{}:{}",
            service_fqdn(head_service, &namespace),
            gcs_port(cluster)
        )
    });
    let command = ray_start_command(RayNodeType::Worker, &params);

    build_pod(
        cluster,
        &group.template,
        RayNodeType::Worker,
        &group.group_name,
        &pod_generate_name(&format!("{name}-{}", group.group_name), RayNodeType::Worker),
        &command,
    )
}

fn build_pod(
    cluster: &RayCluster,
    template: &PodTemplateSpec,
    node_type: RayNodeType,
    group: &str,
    generate_name: &str,
    start_command: &str,
) -> Result<Pod> {
    let cluster_name = cluster.name_any();
    let mut spec: PodSpec = template.spec.clone().ok_or_else(|| {
        Error::validation_for_field(
            &cluster_name,
            format!("{group}.template.spec"),
            "pod template has no spec",
        )
    })?;

    let container = spec
        .containers
        .get_mut(kuberay_common::RAY_CONTAINER_INDEX)
        .ok_or_else(|| {
            Error::validation_for(
                &cluster_name,
                format!("{group} template has no Ray container"),
            )
        })?;

    let user_command_empty = container.command.as_ref().map_or(true, Vec::is_empty)
        && container.args.as_ref().map_or(true, Vec::is_empty);
    if user_command_empty {
        container.command = Some(START_SHELL.iter().map(|s| s.to_string()).collect());
        container.args = Some(vec![start_command.to_string()]);
    }
    upsert_env(
        container,
        kuberay_common::RAY_CLUSTER_NAME_ENV,
        EnvVar {
            name: kuberay_common::RAY_CLUSTER_NAME_ENV.to_string(),
            value: Some(cluster_name.clone()),
            ..Default::default()
        },
    );

    let template_meta = template.metadata.clone().unwrap_or_default();
    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(pod_name(generate_name)),
            namespace: cluster.namespace(),
            labels: Some(merge_labels(
                template_meta.labels,
                pod_labels(&cluster_name, node_type, group),
            )),
            annotations: template_meta.annotations,
            owner_references: Some(vec![owner_reference(cluster)?]),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    })
}

/// `ulimit -n 65536; ray start --head --block --k=v ...`
pub fn ray_start_command(node_type: RayNodeType, params: &BTreeMap<String, String>) -> String {
    let mut cmd = format!("{ULIMIT_CMD}; ray start");
    if node_type == RayNodeType::Head {
        cmd.push_str(" --head");
    }
    if !params.contains_key("block") {
        cmd.push_str(" --block");
    }
    for (key, value) in params {
        if value.is_empty() || value.eq_ignore_ascii_case("true") {
            cmd.push_str(&format!(" --{key}"));
        } else {
            cmd.push_str(&format!(" --{key}={value}"));
        }
    }
    cmd
}

fn gcs_port(cluster: &RayCluster) -> i32 {
    head_container(cluster)
        .map(|c| {
            find_container_port(
                c,
                kuberay_common::GCS_PORT_NAME,
                kuberay_common::DEFAULT_GCS_PORT,
            )
        })
        .unwrap_or(kuberay_common::DEFAULT_GCS_PORT)
}

/// The Ray container of the head template
pub fn head_container(cluster: &RayCluster) -> Option<&Container> {
    cluster
        .spec
        .head_group_spec
        .template
        .spec
        .as_ref()
        .and_then(|s| s.containers.get(kuberay_common::RAY_CONTAINER_INDEX))
}

fn add_fault_tolerance_env(
    container: &mut Container,
    options: &GcsFaultToleranceOptions,
    uid: Option<&str>,
) {
    upsert_env(
        container,
        kuberay_common::RAY_REDIS_ADDRESS_ENV,
        EnvVar {
            name: kuberay_common::RAY_REDIS_ADDRESS_ENV.to_string(),
            value: Some(options.redis_address.clone()),
            ..Default::default()
        },
    );

    if let Some(storage_ns) = options
        .external_storage_namespace
        .clone()
        .or_else(|| uid.map(str::to_string))
    {
        upsert_env(
            container,
            kuberay_common::RAY_EXTERNAL_STORAGE_NS_ENV,
            EnvVar {
                name: kuberay_common::RAY_EXTERNAL_STORAGE_NS_ENV.to_string(),
                value: Some(storage_ns),
                ..Default::default()
            },
        );
    }

    if let Some(password) = &options.redis_password {
        upsert_env(
            container,
            kuberay_common::REDIS_PASSWORD_ENV,
            EnvVar {
                name: kuberay_common::REDIS_PASSWORD_ENV.to_string(),
                value: password.value.clone(),
                value_from: password.value_from.clone(),
            },
        );
    }
}

/// Add `var` unless the container already defines `name`
pub fn upsert_env(container: &mut Container, name: &str, var: EnvVar) {
    let env = container.env.get_or_insert_with(Vec::new);
    if !env.iter().any(|e| e.name == name) {
        env.push(var);
    }
}

// =============================================================================
// Pod classification
// =============================================================================

/// Node type label of a pod
pub fn node_type(pod: &Pod) -> Option<RayNodeType> {
    match pod
        .labels()
        .get(kuberay_common::RAY_NODE_TYPE_LABEL_KEY)
        .map(String::as_str)
    {
        Some("head") => Some(RayNodeType::Head),
        Some("worker") => Some(RayNodeType::Worker),
        _ => None,
    }
}

/// Group label of a pod
pub fn group_name(pod: &Pod) -> Option<&str> {
    pod.labels()
        .get(kuberay_common::RAY_NODE_GROUP_LABEL_KEY)
        .map(String::as_str)
}

/// Whether the pod finished and will not be restarted by the kubelet
pub fn is_terminated(pod: &Pod) -> bool {
    let restart_always = pod
        .spec
        .as_ref()
        .and_then(|s| s.restart_policy.as_deref())
        .map_or(true, |p| p == "Always");
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    !restart_always && phase.is_some_and(|p| TERMINAL_PHASES.contains(&p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerPort, PodStatus};
    use kuberay_common::crd::{HeadGroupSpec, RayClusterSpec, RedisCredential};

    fn template(image: &str) -> PodTemplateSpec {
        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(BTreeMap::from([("team".to_string(), "ml".to_string())])),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "ray".to_string(),
                    image: Some(image.to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        }
    }

    fn sample_cluster() -> RayCluster {
        let mut rc = RayCluster::new(
            "raycluster-sample",
            RayClusterSpec {
                head_group_spec: HeadGroupSpec {
                    template: template("rayproject/ray:2.9.0"),
                    ray_start_params: BTreeMap::from([("num-cpus".to_string(), "0".to_string())]),
                    ..Default::default()
                },
                worker_group_specs: vec![WorkerGroupSpec {
                    group_name: "small".to_string(),
                    template: template("rayproject/ray:2.9.0"),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        rc.metadata.namespace = Some("default".to_string());
        rc.metadata.uid = Some("uid-rc".to_string());
        rc
    }

    fn ray_container(pod: &Pod) -> &Container {
        &pod.spec.as_ref().unwrap().containers[0]
    }

    fn env_value<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
        container
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value.as_deref())
    }

    #[test]
    fn head_pod_gets_labels_owner_and_start_command() {
        let rc = sample_cluster();
        let pod = build_head_pod(&rc).unwrap();

        let name = pod.metadata.name.as_deref().unwrap();
        assert!(name.starts_with("raycluster-sample-head-"));
        assert_eq!(name.len(), "raycluster-sample-head-".len() + 5);

        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["ray.io/cluster"], "raycluster-sample");
        assert_eq!(labels["ray.io/node-type"], "head");
        assert_eq!(labels["ray.io/group"], "headgroup");
        assert_eq!(labels["ray.io/identifier"], "raycluster-sample-head");
        assert_eq!(labels["team"], "ml");

        let owners = pod.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners[0].uid, "uid-rc");

        let container = ray_container(&pod);
        assert_eq!(
            container.command.as_ref().unwrap(),
            &vec!["/bin/bash", "-lc", "--"]
        );
        let args = &container.args.as_ref().unwrap()[0];
        assert!(args.starts_with("ulimit -n 65536; ray start --head --block"));
        assert!(args.contains("--dashboard-host=0.0.0.0"));
        assert!(args.contains("--port=6379"));
        assert!(args.contains("--num-cpus=0"));
        assert_eq!(env_value(container, "RAY_CLUSTER_NAME"), Some("raycluster-sample"));

        assert_eq!(
            pod.spec.as_ref().unwrap().service_account_name.as_deref(),
            Some("raycluster-sample")
        );
    }

    #[test]
    fn worker_pod_points_at_head_service() {
        let rc = sample_cluster();
        let group = &rc.spec.worker_group_specs[0];
        let pod = build_worker_pod(&rc, group, "raycluster-sample-head-svc").unwrap();

        assert!(pod
            .metadata
            .name
            .as_deref()
            .unwrap()
            .starts_with("raycluster-sample-small-worker-"));
        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["ray.io/node-type"], "worker");
        assert_eq!(labels["ray.io/group"], "small");

        let args = &ray_container(&pod).args.as_ref().unwrap()[0];
        assert!(!args.contains("--head"));
        assert!(args.contains("--address=raycluster-sample-head-svc.default.svc."));
        assert!(args.ends_with(":6379"));
    }

    #[test]
    fn user_command_is_left_alone() {
        let mut rc = sample_cluster();
        rc.spec.head_group_spec.template.spec.as_mut().unwrap().containers[0].command =
            Some(vec!["my-entrypoint".to_string()]);
        let pod = build_head_pod(&rc).unwrap();
        let container = ray_container(&pod);
        assert_eq!(container.command.as_ref().unwrap(), &vec!["my-entrypoint"]);
        assert!(container.args.is_none());
    }

    #[test]
    fn custom_gcs_port_is_used() {
        let mut rc = sample_cluster();
        rc.spec.head_group_spec.template.spec.as_mut().unwrap().containers[0].ports =
            Some(vec![ContainerPort {
                name: Some("gcs".to_string()),
                container_port: 6380,
                ..Default::default()
            }]);
        let head = build_head_pod(&rc).unwrap();
        assert!(ray_container(&head).args.as_ref().unwrap()[0].contains("--port=6380"));

        let group = rc.spec.worker_group_specs[0].clone();
        let worker = build_worker_pod(&rc, &group, "svc").unwrap();
        assert!(ray_container(&worker).args.as_ref().unwrap()[0].ends_with(":6380"));
    }

    #[test]
    fn fault_tolerance_env_on_head_only() {
        let mut rc = sample_cluster();
        rc.spec.gcs_fault_tolerance_options = Some(GcsFaultToleranceOptions {
            redis_address: "redis:6379".to_string(),
            redis_password: Some(RedisCredential {
                value: Some("hunter2".to_string()),
                value_from: None,
            }),
            external_storage_namespace: None,
        });

        let head = build_head_pod(&rc).unwrap();
        let container = ray_container(&head);
        assert_eq!(env_value(container, "RAY_REDIS_ADDRESS"), Some("redis:6379"));
        assert_eq!(
            env_value(container, "RAY_external_storage_namespace"),
            Some("uid-rc")
        );
        assert_eq!(env_value(container, "REDIS_PASSWORD"), Some("hunter2"));

        let group = rc.spec.worker_group_specs[0].clone();
        let worker = build_worker_pod(&rc, &group, "svc").unwrap();
        assert_eq!(env_value(ray_container(&worker), "RAY_REDIS_ADDRESS"), None);
    }

    #[test]
    fn template_without_spec_is_a_configuration_error() {
        let mut rc = sample_cluster();
        rc.spec.head_group_spec.template.spec = None;
        let err = build_head_pod(&rc).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn boolean_params_render_as_flags() {
        let params = BTreeMap::from([
            ("block".to_string(), "true".to_string()),
            ("num-gpus".to_string(), "1".to_string()),
        ]);
        let cmd = ray_start_command(RayNodeType::Worker, &params);
        assert_eq!(cmd, "ulimit -n 65536; ray start --block --num-gpus=1");
    }

    fn pod_in_phase(phase: &str, restart: Option<&str>) -> Pod {
        Pod {
            spec: Some(PodSpec {
                restart_policy: restart.map(str::to_string),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn terminated_pods_need_non_restarting_policy() {
        assert!(is_terminated(&pod_in_phase("Failed", Some("Never"))));
        assert!(is_terminated(&pod_in_phase("Succeeded", Some("OnFailure"))));
        assert!(!is_terminated(&pod_in_phase("Failed", Some("Always"))));
        assert!(!is_terminated(&pod_in_phase("Failed", None)));
        assert!(!is_terminated(&pod_in_phase("Running", Some("Never"))));
    }
}
