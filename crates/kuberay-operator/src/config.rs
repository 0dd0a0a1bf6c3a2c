//! Operator configuration
//!
//! Every setting is a command-line flag with an environment fallback, so the
//! same binary runs from a Deployment manifest or a shell.

use std::time::Duration;

use clap::Parser;

use kuberay_common::backoff::BackoffConfig;
use kuberay_common::telemetry::LogFormat;

/// KubeRay operator - reconciles RayCluster and RayJob resources
#[derive(Parser, Debug, Clone)]
#[command(name = "kuberay-operator", version, about, long_about = None)]
pub struct OperatorConfig {
    /// Print the CRD manifests as YAML and exit
    #[arg(long)]
    pub crd: bool,

    /// Install or update the CRDs with server-side apply at start-up
    #[arg(long, env = "INSTALL_CRDS")]
    pub install_crds: bool,

    /// Namespace to watch; all namespaces when unset
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Reconciles running at once per controller
    #[arg(long, env = "RECONCILE_CONCURRENCY", default_value_t = 10)]
    pub reconcile_concurrency: u16,

    /// Deadline for a single reconcile
    #[arg(long, env = "RECONCILE_TIMEOUT_SECS", default_value_t = 30)]
    pub reconcile_timeout_secs: u64,

    /// Requeue interval of an active RayJob
    #[arg(long, env = "JOB_REQUEUE_SECS", default_value_t = 3)]
    pub job_requeue_secs: u64,

    /// Requeue interval of a healthy RayCluster
    #[arg(long, env = "CLUSTER_REQUEUE_SECS", default_value_t = 300)]
    pub cluster_requeue_secs: u64,

    /// Requeue delay after the first failed reconcile
    #[arg(long, env = "BACKOFF_BASE_MS", default_value_t = 500)]
    pub backoff_base_ms: u64,

    /// Upper bound on the failed-reconcile requeue delay
    #[arg(long, env = "BACKOFF_MAX_SECS", default_value_t = 300)]
    pub backoff_max_secs: u64,

    /// Timeout of Ray dashboard requests
    #[arg(long, env = "DASHBOARD_TIMEOUT_SECS", default_value_t = 2)]
    pub dashboard_timeout_secs: u64,

    /// Delete a finished RayJob itself, not only its cluster, when it has
    /// shutdownAfterJobFinishes set
    #[arg(long, env = "DELETE_RAYJOB_CR_AFTER_JOB_FINISHES")]
    pub delete_rayjob_after_job_finishes: bool,

    /// Log line format: json or text
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,
}

impl OperatorConfig {
    /// Deadline for a single reconcile
    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    /// Requeue interval of an active RayJob
    pub fn job_requeue_interval(&self) -> Duration {
        Duration::from_secs(self.job_requeue_secs)
    }

    /// Requeue interval of a healthy RayCluster
    pub fn cluster_requeue_interval(&self) -> Duration {
        Duration::from_secs(self.cluster_requeue_secs)
    }

    /// Timeout of Ray dashboard requests
    pub fn dashboard_timeout(&self) -> Duration {
        Duration::from_secs(self.dashboard_timeout_secs)
    }

    /// Failed-reconcile backoff tuning
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_secs(self.backoff_max_secs),
            ..Default::default()
        }
    }

    /// Namespace to watch, ignoring a blank value
    pub fn namespace(&self) -> Option<&str> {
        self.watch_namespace
            .as_deref()
            .map(str::trim)
            .filter(|ns| !ns.is_empty())
    }
}
