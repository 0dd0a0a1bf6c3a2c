//! Head service construction
//!
//! The head service fronts the head pod. An explicit `headService` template
//! is used as the base; the operator fills in selector, ports and ownership.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use kuberay_common::crd::RayCluster;
use kuberay_common::kube_utils::{merge_labels, owner_reference};
use kuberay_common::names::{find_container_port, RayNodeType};
use kuberay_common::Result;

use crate::pods::head_container;

/// Default ports exposed by the head service, by name
pub const DEFAULT_HEAD_PORTS: [(&str, i32); 5] = [
    (kuberay_common::GCS_PORT_NAME, kuberay_common::DEFAULT_GCS_PORT),
    (
        kuberay_common::DASHBOARD_PORT_NAME,
        kuberay_common::DEFAULT_DASHBOARD_PORT,
    ),
    (
        kuberay_common::CLIENT_PORT_NAME,
        kuberay_common::DEFAULT_CLIENT_PORT,
    ),
    (
        kuberay_common::METRICS_PORT_NAME,
        kuberay_common::DEFAULT_METRICS_PORT,
    ),
    (
        kuberay_common::SERVE_PORT_NAME,
        kuberay_common::DEFAULT_SERVE_PORT,
    ),
];

/// Selector matching the head pod of `cluster`
pub fn head_selector(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            kuberay_common::RAY_CLUSTER_LABEL_KEY.to_string(),
            cluster.to_string(),
        ),
        (
            kuberay_common::RAY_NODE_TYPE_LABEL_KEY.to_string(),
            RayNodeType::Head.to_string(),
        ),
    ])
}

/// Ports of the head service: the head container's named ports, with the
/// well-known Ray ports filled in where the container doesn't name them
pub fn head_service_ports(cluster: &RayCluster) -> Vec<ServicePort> {
    let container = head_container(cluster);
    let mut ports: BTreeMap<String, i32> = DEFAULT_HEAD_PORTS
        .iter()
        .map(|(name, default)| {
            let port = container.map_or(*default, |c| find_container_port(c, name, *default));
            (name.to_string(), port)
        })
        .collect();

    if let Some(extra) = container.and_then(|c| c.ports.as_ref()) {
        for p in extra {
            if let Some(name) = p.name.as_ref() {
                ports.entry(name.clone()).or_insert(p.container_port);
            }
        }
    }

    ports
        .into_iter()
        .map(|(name, port)| ServicePort {
            name: Some(name),
            port,
            target_port: Some(IntOrString::Int(port)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect()
}

/// Build the head service named `name` for `cluster`
pub fn build_head_service(cluster: &RayCluster, name: &str) -> Result<Service> {
    let cluster_name = cluster.name_any();
    let base = cluster
        .spec
        .head_group_spec
        .head_service
        .clone()
        .unwrap_or_default();

    let mut spec = base.spec.unwrap_or_default();
    spec.selector = Some(head_selector(&cluster_name));
    if spec.ports.as_ref().map_or(true, Vec::is_empty) {
        spec.ports = Some(head_service_ports(cluster));
    }
    if let Some(service_type) = cluster.spec.head_group_spec.service_type.clone() {
        spec.type_ = Some(service_type);
    } else if spec.type_.is_none() {
        spec.type_ = Some("ClusterIP".to_string());
    }

    let labels = merge_labels(
        base.metadata.labels,
        [
            (
                kuberay_common::RAY_CLUSTER_LABEL_KEY.to_string(),
                cluster_name.clone(),
            ),
            (
                kuberay_common::RAY_NODE_TYPE_LABEL_KEY.to_string(),
                RayNodeType::Head.to_string(),
            ),
            (
                kuberay_common::RAY_ID_LABEL_KEY.to_string(),
                format!("{cluster_name}-{}", RayNodeType::Head),
            ),
            (
                kuberay_common::KUBERNETES_CREATED_BY_LABEL_KEY.to_string(),
                kuberay_common::COMPONENT_NAME.to_string(),
            ),
        ],
    );

    Ok(Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: cluster.namespace(),
            labels: Some(labels),
            annotations: base.metadata.annotations,
            owner_references: Some(vec![owner_reference(cluster)?]),
            ..Default::default()
        },
        spec: Some(ServiceSpec { ..spec }),
        status: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec};
    use kuberay_common::crd::{HeadGroupSpec, RayClusterSpec};

    fn cluster(ports: Option<Vec<ContainerPort>>) -> RayCluster {
        let mut rc = RayCluster::new(
            "raycluster-sample",
            RayClusterSpec {
                head_group_spec: HeadGroupSpec {
                    template: PodTemplateSpec {
                        spec: Some(PodSpec {
                            containers: vec![Container {
                                name: "ray-head".to_string(),
                                ports,
                                ..Default::default()
                            }],
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        rc.metadata.namespace = Some("default".to_string());
        rc.metadata.uid = Some("uid-rc".to_string());
        rc
    }

    fn port_of(svc: &Service, name: &str) -> Option<i32> {
        svc.spec
            .as_ref()?
            .ports
            .as_ref()?
            .iter()
            .find(|p| p.name.as_deref() == Some(name))
            .map(|p| p.port)
    }

    #[test]
    fn defaults_cover_well_known_ports() {
        let svc = build_head_service(&cluster(None), "raycluster-sample-head-svc").unwrap();
        assert_eq!(port_of(&svc, "gcs"), Some(6379));
        assert_eq!(port_of(&svc, "dashboard"), Some(8265));
        assert_eq!(port_of(&svc, "client"), Some(10001));
        assert_eq!(port_of(&svc, "metrics"), Some(8080));
        assert_eq!(port_of(&svc, "serve"), Some(8000));

        let spec = svc.spec.as_ref().unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(
            spec.selector.as_ref().unwrap()["ray.io/node-type"],
            "head"
        );
        assert_eq!(
            svc.metadata.owner_references.as_ref().unwrap()[0].name,
            "raycluster-sample"
        );
    }

    #[test]
    fn container_ports_override_and_extend_defaults() {
        let svc = build_head_service(
            &cluster(Some(vec![
                ContainerPort {
                    name: Some("dashboard".to_string()),
                    container_port: 9265,
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("custom".to_string()),
                    container_port: 7000,
                    ..Default::default()
                },
            ])),
            "svc",
        )
        .unwrap();
        assert_eq!(port_of(&svc, "dashboard"), Some(9265));
        assert_eq!(port_of(&svc, "custom"), Some(7000));
        assert_eq!(port_of(&svc, "gcs"), Some(6379));
    }

    #[test]
    fn service_type_from_head_group() {
        let mut rc = cluster(None);
        rc.spec.head_group_spec.service_type = Some("NodePort".to_string());
        let svc = build_head_service(&rc, "svc").unwrap();
        assert_eq!(svc.spec.unwrap().type_.as_deref(), Some("NodePort"));
    }
}
