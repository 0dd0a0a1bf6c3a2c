//! CRD generation and installation
//!
//! The operator installs its own CRDs with server-side apply, so the schema
//! in the cluster always matches the operator version.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use kuberay_common::crd::{RayCluster, RayJob};

/// CRD definition with name and resource
struct CrdDef {
    name: &'static str,
    crd: CustomResourceDefinition,
}

fn all_crds() -> Vec<CrdDef> {
    vec![
        CrdDef {
            name: "rayclusters.ray.io",
            crd: RayCluster::crd(),
        },
        CrdDef {
            name: "rayjobs.ray.io",
            crd: RayJob::crd(),
        },
    ]
}

/// All CRDs as a multi-document YAML stream
pub fn crds_yaml() -> anyhow::Result<String> {
    let mut docs = Vec::new();
    for def in all_crds() {
        let yaml = serde_yaml::to_string(&def.crd)
            .map_err(|e| anyhow::anyhow!("failed to serialize CRD {}: {}", def.name, e))?;
        docs.push(yaml);
    }
    Ok(docs.join("---\n"))
}

/// Install or update every CRD with server-side apply
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(kuberay_common::FIELD_MANAGER).force();

    for def in all_crds() {
        tracing::info!(crd = def.name, "installing CRD");
        crds.patch(def.name, &params, &Patch::Apply(&def.crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install CRD {}: {}", def.name, e))?;
    }

    tracing::info!("all CRDs installed/updated");
    Ok(())
}
