//! KubeRay Operator - runs Ray clusters and Ray jobs on Kubernetes

use clap::Parser;
use kube::Client;

use kuberay_common::telemetry::{init_telemetry, TelemetryConfig};
use kuberay_operator::controller_runner::{build_cluster_controller, build_job_controller};
use kuberay_operator::crds::{crds_yaml, ensure_crds_installed};
use kuberay_operator::OperatorConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // reqwest and kube both use rustls; pick the provider once for the process
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let config = OperatorConfig::parse();

    if config.crd {
        print!("{}", crds_yaml()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        format: config.log_format,
        ..Default::default()
    })?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;

    if config.install_crds {
        ensure_crds_installed(&client).await?;
    }

    tracing::info!(
        concurrency = config.reconcile_concurrency,
        "starting controllers"
    );
    let controllers = vec![
        build_cluster_controller(client.clone(), &config),
        build_job_controller(client, &config)?,
    ];
    futures::future::join_all(controllers).await;

    tracing::info!("controllers stopped, shutting down");
    Ok(())
}
