//! RayJob controller implementation
//!
//! Drives a RayJob through its deployment lifecycle:
//!
//! ```text
//! New -> Initializing -> Running -> Complete | Failed
//!             |             |
//!             |             +-> Retrying -> New
//!             +-> Waiting (InteractiveMode)
//!
//! any non-terminal state -> Suspending -> Suspended -> Initializing
//! ```
//!
//! Each reconcile advances at most one transition, works on a copy of the
//! stored status and persists it through the conditional status writer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{Api, DeleteParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use kuberay_common::backoff::{with_deadline, BackoffConfig, RequeueBackoff};
use kuberay_common::crd::{
    JobDeploymentStatus, JobFailedReason, JobStatus, JobSubmissionMode, RayCluster, RayJob,
    RayJobStatus,
};
use kuberay_common::events::{actions, reasons, EventPublisher};
use kuberay_common::kube_utils::patch_status_at_revision;
use kuberay_common::names::{job_submission_id, job_submitter_name};
use kuberay_common::status::update_status;
use kuberay_common::validation::validate_job_spec;
use kuberay_common::{Error, Result};

use crate::cluster::{
    build_ray_cluster, cluster_name_for, dashboard_url, is_cluster_ready, owns_cluster,
};
use crate::dashboard::{DashboardClient, SubmitJobRequest};
use crate::submitter::{
    build_submitter_job, runtime_env_json, submitter_pod_template, submitter_state, SubmitterState,
};

/// Default interval between reconciles of an active job
pub const DEFAULT_REQUEUE_INTERVAL: Duration = Duration::from_secs(3);

/// Default deadline for one reconcile
pub const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(30);

/// Environment variable that makes finished RayJobs delete themselves
pub const DELETE_RAYJOB_CR_AFTER_JOB_FINISHES_ENV: &str = "DELETE_RAYJOB_CR_AFTER_JOB_FINISHES";

/// Trait abstracting Kubernetes client operations for RayJob
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a RayCluster by name
    async fn get_ray_cluster(&self, namespace: &str, name: &str) -> Result<Option<RayCluster>>;

    /// Create a RayCluster; an existing one counts as success
    async fn create_ray_cluster(&self, namespace: &str, cluster: &RayCluster) -> Result<()>;

    /// Delete a RayCluster; a missing one counts as success
    async fn delete_ray_cluster(&self, namespace: &str, name: &str) -> Result<()>;

    /// Get a submitter batch Job by name
    async fn get_submitter(&self, namespace: &str, name: &str) -> Result<Option<Job>>;

    /// Create a submitter batch Job; an existing one counts as success
    async fn create_submitter(&self, namespace: &str, job: &Job) -> Result<()>;

    /// Delete a submitter batch Job and its pods; a missing one counts as success
    async fn delete_submitter(&self, namespace: &str, name: &str) -> Result<()>;

    /// Get a RayJob by name
    async fn get_ray_job(&self, namespace: &str, name: &str) -> Result<Option<RayJob>>;

    /// Write the status of a RayJob guarded by `resource_version`
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &RayJobStatus,
    ) -> Result<()>;

    /// Delete a RayJob; a missing one counts as success
    async fn delete_ray_job(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn ignore_api_code(result: std::result::Result<(), kube::Error>, code: u16) -> Result<()> {
    match result {
        Err(kube::Error::Api(ae)) if ae.code == code => Ok(()),
        other => other.map_err(Error::from),
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_ray_cluster(&self, namespace: &str, name: &str) -> Result<Option<RayCluster>> {
        Ok(self.api::<RayCluster>(namespace).get_opt(name).await?)
    }

    async fn create_ray_cluster(&self, namespace: &str, cluster: &RayCluster) -> Result<()> {
        ignore_api_code(
            self.api::<RayCluster>(namespace)
                .create(&PostParams::default(), cluster)
                .await
                .map(|_| ()),
            409,
        )
    }

    async fn delete_ray_cluster(&self, namespace: &str, name: &str) -> Result<()> {
        ignore_api_code(
            self.api::<RayCluster>(namespace)
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
            404,
        )
    }

    async fn get_submitter(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        Ok(self.api::<Job>(namespace).get_opt(name).await?)
    }

    async fn create_submitter(&self, namespace: &str, job: &Job) -> Result<()> {
        ignore_api_code(
            self.api::<Job>(namespace)
                .create(&PostParams::default(), job)
                .await
                .map(|_| ()),
            409,
        )
    }

    async fn delete_submitter(&self, namespace: &str, name: &str) -> Result<()> {
        // Background propagation so the submitter pods go too
        ignore_api_code(
            self.api::<Job>(namespace)
                .delete(name, &DeleteParams::background())
                .await
                .map(|_| ()),
            404,
        )
    }

    async fn get_ray_job(&self, namespace: &str, name: &str) -> Result<Option<RayJob>> {
        Ok(self.api::<RayJob>(namespace).get_opt(name).await?)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &RayJobStatus,
    ) -> Result<()> {
        patch_status_at_revision::<RayJob>(
            &self.client,
            namespace,
            name,
            resource_version.as_deref(),
            status,
        )
        .await?;
        Ok(())
    }

    async fn delete_ray_job(&self, namespace: &str, name: &str) -> Result<()> {
        ignore_api_code(
            self.api::<RayJob>(namespace)
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
            404,
        )
    }
}

/// Controller context for RayJob reconciliation
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Ray dashboard job API
    pub dashboard: Arc<dyn DashboardClient>,
    /// Event publisher for operator-facing events
    pub events: Arc<dyn EventPublisher>,
    /// Per-key failure tracking for error requeues
    pub backoff: RequeueBackoff,
    /// Requeue interval while the job is active
    pub requeue_interval: Duration,
    /// Deadline for a single reconcile
    pub reconcile_timeout: Duration,
    /// Delete the RayJob itself, not just its cluster, once it finished
    pub delete_job_after_finish: bool,
}

impl Context {
    /// Create a controller context backed by the given Kubernetes client
    pub fn new(
        client: Client,
        dashboard: Arc<dyn DashboardClient>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            kube: Arc::new(KubeClientImpl::new(client)),
            dashboard,
            events,
            backoff: RequeueBackoff::default(),
            requeue_interval: DEFAULT_REQUEUE_INTERVAL,
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
            delete_job_after_finish: false,
        }
    }

    /// Set the active-job requeue interval
    pub fn with_requeue_interval(mut self, interval: Duration) -> Self {
        self.requeue_interval = interval;
        self
    }

    /// Set the per-reconcile deadline
    pub fn with_reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = timeout;
        self
    }

    /// Set the error backoff tuning
    pub fn with_backoff(mut self, config: BackoffConfig) -> Self {
        self.backoff = RequeueBackoff::new(config);
        self
    }

    /// Delete finished RayJobs that shut their cluster down
    pub fn with_delete_job_after_finish(mut self, enabled: bool) -> Self {
        self.delete_job_after_finish = enabled;
        self
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        dashboard: Arc<dyn DashboardClient>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            kube,
            dashboard,
            events,
            backoff: RequeueBackoff::default(),
            requeue_interval: DEFAULT_REQUEUE_INTERVAL,
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
            delete_job_after_finish: false,
        }
    }
}

fn object_key(job: &RayJob) -> String {
    format!("{}/{}", job.namespace().unwrap_or_default(), job.name_any())
}

/// Reconcile a RayJob
///
/// Advances the deployment state machine by one step and writes status when
/// it changed. Active jobs are requeued; terminal and suspended jobs wait for
/// a change.
#[instrument(
    skip(job, ctx),
    fields(job = %job.name_any(), namespace = ?job.namespace())
)]
pub async fn reconcile(job: Arc<RayJob>, ctx: Arc<Context>) -> Result<Action> {
    let action = with_deadline(
        ctx.reconcile_timeout,
        "reconcile RayJob",
        reconcile_job(&job, &ctx),
    )
    .await?;
    ctx.backoff.reset(&object_key(&job));
    Ok(action)
}

/// Error policy for the controller
///
/// Configuration errors wait for the object to change. Everything else is
/// requeued with per-key exponential backoff.
pub fn error_policy(job: Arc<RayJob>, error: &Error, ctx: Arc<Context>) -> Action {
    if !error.is_retryable() {
        warn!(
            %error,
            job = %job.name_any(),
            "reconciliation failed, waiting for a spec change"
        );
        return Action::await_change();
    }

    let delay = ctx.backoff.next_delay(&object_key(&job));
    error!(
        ?error,
        job = %job.name_any(),
        retry_in = ?delay,
        "reconciliation failed"
    );
    Action::requeue(delay)
}

async fn reconcile_job(job: &RayJob, ctx: &Context) -> Result<Action> {
    let name = job.name_any();
    let Some(namespace) = job.namespace() else {
        return Err(Error::validation_for(&name, "RayJob must be namespaced"));
    };

    if job.metadata.deletion_timestamp.is_some() {
        debug!("job is being deleted, children go with it");
        return Ok(Action::await_change());
    }

    let machine = JobMachine {
        job,
        ctx,
        namespace: &namespace,
        name: &name,
        object_ref: job.object_ref(&()),
    };

    if let Err(e) = validate_job_spec(job).and_then(|()| runtime_env_json(job).map(|_| ())) {
        warn!(error = %e, "invalid RayJob spec");
        machine
            .event(
                EventType::Warning,
                reasons::INVALID_RAY_JOB_SPEC,
                actions::VALIDATE,
                e.to_string(),
            )
            .await;
        return Err(e);
    }

    let previous = job.status.clone().unwrap_or_default();
    let mut status = previous.clone();
    let step = machine.step(&mut status).await;
    if let Err(e) = &step {
        warn!(error = %e, state = %status.job_deployment_status, "job step failed");
    }
    status.observed_generation = job.metadata.generation;

    let (from, to) = (previous.job_deployment_status, status.job_deployment_status);
    if from != to {
        info!(%from, %to, "job deployment status changed");
        machine
            .event(
                EventType::Normal,
                reasons::JOB_DEPLOYMENT_STATUS_TRANSITION,
                actions::RECONCILE,
                format!("{from} -> {to}"),
            )
            .await;
    }

    update_status(
        job,
        &status,
        || ctx.kube.get_ray_job(&namespace, &name),
        |rv, status| {
            let (namespace, name) = (namespace.as_str(), name.as_str());
            async move { ctx.kube.patch_status(namespace, name, rv, &status).await }
        },
    )
    .await?;

    step
}

/// Clear everything that belongs to a single attempt
fn reset_run(status: &mut RayJobStatus) {
    status.job_status = JobStatus::New;
    status.job_id = None;
    status.dashboard_url = None;
    status.reason = None;
    status.message = None;
    status.ray_cluster_status = None;
    status.end_time = None;
}

/// Whether the attempt that started at `start` ran out of time
pub fn deadline_exceeded(
    active_deadline_seconds: Option<i32>,
    start: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    match (active_deadline_seconds, start) {
        (Some(deadline), Some(start)) => {
            now >= start + chrono::Duration::seconds(i64::from(deadline))
        }
        _ => false,
    }
}

/// Count a failed attempt and decide between another attempt and giving up.
///
/// A new attempt starts only while `failed <= backoff_limit`. Deadline
/// failures are final.
pub fn record_failure(
    status: &mut RayJobStatus,
    backoff_limit: i32,
    reason: JobFailedReason,
    message: String,
    now: DateTime<Utc>,
) {
    let failed = status.failed.unwrap_or(0) + 1;
    status.failed = Some(failed);
    status.reason = Some(reason);
    status.message = Some(message);

    if reason != JobFailedReason::DeadlineExceeded && failed <= backoff_limit {
        status.job_deployment_status = JobDeploymentStatus::Retrying;
    } else {
        status.job_deployment_status = JobDeploymentStatus::Failed;
        status.end_time = Some(now);
    }
}

/// Count a successful attempt
pub fn record_success(status: &mut RayJobStatus, now: DateTime<Utc>) {
    status.succeeded = Some(status.succeeded.unwrap_or(0) + 1);
    status.reason = None;
    status.job_deployment_status = JobDeploymentStatus::Complete;
    status.end_time = Some(now);
}

struct JobMachine<'a> {
    job: &'a RayJob,
    ctx: &'a Context,
    namespace: &'a str,
    name: &'a str,
    object_ref: ObjectReference,
}

impl JobMachine<'_> {
    async fn event(&self, type_: EventType, reason: &str, action: &str, note: String) {
        self.ctx
            .events
            .publish(&self.object_ref, type_, reason, action, Some(note))
            .await;
    }

    fn requeue(&self) -> Action {
        Action::requeue(self.ctx.requeue_interval)
    }

    async fn step(&self, status: &mut RayJobStatus) -> Result<Action> {
        use JobDeploymentStatus::*;

        let suspend = self.job.spec.suspend;
        match status.job_deployment_status {
            New if suspend => {
                status.job_deployment_status = Suspended;
                Ok(Action::await_change())
            }
            New => {
                self.begin_attempt(status);
                Ok(self.requeue())
            }
            Initializing | Waiting | Running | Retrying if suspend => {
                status.job_deployment_status = Suspending;
                Ok(self.requeue())
            }
            Initializing => self.initialize(status).await,
            Waiting => {
                if self.check_deadline(status) {
                    return Ok(self.requeue());
                }
                Ok(self.wait_for_job_id(status))
            }
            Running => self.track(status).await,
            Retrying => {
                if !self.tear_down(status).await? {
                    return Ok(self.requeue());
                }
                reset_run(status);
                status.job_deployment_status = New;
                Ok(self.requeue())
            }
            Suspending => {
                if !self.tear_down(status).await? {
                    return Ok(self.requeue());
                }
                reset_run(status);
                status.job_deployment_status = Suspended;
                Ok(Action::await_change())
            }
            Suspended if suspend => Ok(Action::await_change()),
            Suspended => {
                self.begin_attempt(status);
                Ok(self.requeue())
            }
            Complete | Failed => self.finish().await,
        }
    }

    fn begin_attempt(&self, status: &mut RayJobStatus) {
        reset_run(status);
        status.job_deployment_status = JobDeploymentStatus::Initializing;
        status.job_id = Some(job_submission_id(self.job));
        status.ray_cluster_name = Some(cluster_name_for(self.job));
        status.start_time = Some(Utc::now());
        info!(job_id = ?status.job_id, "starting attempt");
    }

    fn check_deadline(&self, status: &mut RayJobStatus) -> bool {
        let deadline = self.job.spec.active_deadline_seconds;
        if !deadline_exceeded(deadline, status.start_time, Utc::now()) {
            return false;
        }
        let message = format!(
            "The RayJob has passed the activeDeadlineSeconds. StartTime: {}. ActiveDeadlineSeconds: {}",
            status
                .start_time
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
            deadline.unwrap_or_default()
        );
        self.fail_attempt(status, JobFailedReason::DeadlineExceeded, message);
        true
    }

    fn fail_attempt(&self, status: &mut RayJobStatus, reason: JobFailedReason, message: String) {
        warn!(%reason, %message, failed = ?status.failed, "attempt failed");
        record_failure(
            status,
            self.job.spec.backoff_limit.unwrap_or(0),
            reason,
            message,
            Utc::now(),
        );
    }

    fn cluster_name(&self, status: &RayJobStatus) -> String {
        status
            .ray_cluster_name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| cluster_name_for(self.job))
    }

    // =========================================================================
    // Initializing
    // =========================================================================

    async fn initialize(&self, status: &mut RayJobStatus) -> Result<Action> {
        if self.check_deadline(status) {
            return Ok(self.requeue());
        }

        let Some(cluster) = self.ensure_cluster(status).await? else {
            return Ok(self.requeue());
        };
        status.ray_cluster_status = cluster.status.clone();
        if !is_cluster_ready(&cluster) {
            debug!(cluster = %cluster.name_any(), "waiting for cluster to become ready");
            return Ok(self.requeue());
        }

        let address = dashboard_url(&cluster)?;
        status.dashboard_url = Some(address.clone());

        match self.job.spec.submission_mode {
            JobSubmissionMode::K8sJobMode => {
                self.ensure_submitter(status, &address).await?;
            }
            JobSubmissionMode::HttpMode => {
                self.submit_if_unknown(status, &address).await?;
            }
            JobSubmissionMode::InteractiveMode => {
                return Ok(self.wait_for_job_id(status));
            }
        }
        status.job_deployment_status = JobDeploymentStatus::Running;
        Ok(self.requeue())
    }

    /// The cluster of this attempt, created when the job owns it.
    ///
    /// Returns `None` right after creating it.
    async fn ensure_cluster(&self, status: &RayJobStatus) -> Result<Option<RayCluster>> {
        let cluster_name = self.cluster_name(status);
        if let Some(cluster) = self.ctx.kube.get_ray_cluster(self.namespace, &cluster_name).await? {
            return Ok(Some(cluster));
        }

        if !owns_cluster(self.job) {
            return Err(Error::internal_with_context(
                format!("{}/{}", self.namespace, self.name),
                format!("RayCluster {cluster_name} selected by clusterSelector does not exist"),
            ));
        }

        let cluster = build_ray_cluster(self.job, &cluster_name)?;
        match self.ctx.kube.create_ray_cluster(self.namespace, &cluster).await {
            Ok(()) => {
                info!(cluster = %cluster_name, "created RayCluster");
                self.event(
                    EventType::Normal,
                    reasons::CREATED_RAY_CLUSTER,
                    actions::CREATE,
                    format!("Created RayCluster {}/{cluster_name}", self.namespace),
                )
                .await;
                Ok(None)
            }
            Err(e) => {
                self.event(
                    EventType::Warning,
                    reasons::FAILED_TO_CREATE_RAY_CLUSTER,
                    actions::CREATE,
                    format!(
                        "Failed to create RayCluster {}/{cluster_name}: {e}",
                        self.namespace
                    ),
                )
                .await;
                Err(Error::child_operation("create", "RayCluster", cluster_name, e))
            }
        }
    }

    async fn submitter_image(&self, status: &RayJobStatus) -> Result<Option<String>> {
        if self.job.spec.submitter_pod_template.is_some() {
            return Ok(None);
        }
        if let Some(spec) = &self.job.spec.ray_cluster_spec {
            return Ok(spec.head_image().map(str::to_string));
        }
        let cluster = self
            .ctx
            .kube
            .get_ray_cluster(self.namespace, &self.cluster_name(status))
            .await?;
        Ok(cluster.and_then(|c| c.spec.head_image().map(str::to_string)))
    }

    async fn ensure_submitter(&self, status: &RayJobStatus, address: &str) -> Result<()> {
        let submitter_name = job_submitter_name(self.job);
        if self
            .ctx
            .kube
            .get_submitter(self.namespace, &submitter_name)
            .await?
            .is_some()
        {
            return Ok(());
        }

        let submission_id = status
            .job_id
            .clone()
            .unwrap_or_else(|| job_submission_id(self.job));
        let image = self.submitter_image(status).await?;
        let template = submitter_pod_template(self.job, &submission_id, address, image)?;
        let submitter = build_submitter_job(self.job, template)?;

        match self.ctx.kube.create_submitter(self.namespace, &submitter).await {
            Ok(()) => {
                info!(submitter = %submitter_name, %submission_id, "created submitter");
                self.event(
                    EventType::Normal,
                    reasons::CREATED_RAY_JOB_SUBMITTER,
                    actions::CREATE,
                    format!("Created Kubernetes Job {}/{submitter_name}", self.namespace),
                )
                .await;
                Ok(())
            }
            Err(e) => {
                self.event(
                    EventType::Warning,
                    reasons::FAILED_TO_CREATE_RAY_JOB_SUBMITTER,
                    actions::CREATE,
                    format!(
                        "Failed to create new Kubernetes Job {}/{submitter_name}: {e}",
                        self.namespace
                    ),
                )
                .await;
                Err(Error::child_operation("create", "Job", submitter_name, e))
            }
        }
    }

    async fn submit_if_unknown(&self, status: &RayJobStatus, address: &str) -> Result<()> {
        let submission_id = status
            .job_id
            .clone()
            .unwrap_or_else(|| job_submission_id(self.job));
        if self
            .ctx
            .dashboard
            .get_job_info(address, &submission_id)
            .await?
            .is_some()
        {
            return Ok(());
        }
        self.submit(address, &submission_id).await
    }

    async fn submit(&self, address: &str, submission_id: &str) -> Result<()> {
        let request = SubmitJobRequest {
            entrypoint: self.job.spec.entrypoint.clone(),
            submission_id: submission_id.to_string(),
            runtime_env: runtime_env_json(self.job)?,
            metadata: self.job.spec.metadata.clone(),
        };
        let submitted = self.ctx.dashboard.submit_job(address, &request).await?;
        info!(submission_id = %submitted, "submitted job through the dashboard");
        Ok(())
    }

    fn wait_for_job_id(&self, status: &mut RayJobStatus) -> Action {
        match self.job.spec.job_id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => {
                status.job_id = Some(id.to_string());
                status.job_deployment_status = JobDeploymentStatus::Running;
            }
            None => {
                status.job_deployment_status = JobDeploymentStatus::Waiting;
            }
        }
        self.requeue()
    }

    // =========================================================================
    // Running
    // =========================================================================

    async fn track(&self, status: &mut RayJobStatus) -> Result<Action> {
        if self.check_deadline(status) {
            return Ok(self.requeue());
        }

        let address = status.dashboard_url.clone().unwrap_or_default();
        let job_id = status
            .job_id
            .clone()
            .unwrap_or_else(|| job_submission_id(self.job));

        let lookup = self.ctx.dashboard.get_job_info(&address, &job_id).await;
        match &lookup {
            Ok(Some(info)) => {
                status.job_status = info.status;
                if info.message.is_some() {
                    status.message = info.message.clone();
                }
            }
            Ok(None) => debug!(%job_id, "dashboard does not know the job yet"),
            Err(e) => warn!(error = %e, %job_id, "failed to query job status"),
        }

        match self.job.spec.submission_mode {
            JobSubmissionMode::K8sJobMode => {
                let submitter = self
                    .ctx
                    .kube
                    .get_submitter(self.namespace, &job_submitter_name(self.job))
                    .await?;
                let Some(submitter) = submitter else {
                    warn!("submitter is missing, recreating it");
                    self.ensure_submitter(status, &address).await?;
                    return Ok(self.requeue());
                };
                match submitter_state(&submitter) {
                    SubmitterState::Failed { reason, message } => {
                        if status.job_status == JobStatus::Failed {
                            let message = status.message.clone().unwrap_or_default();
                            self.fail_attempt(status, JobFailedReason::AppFailed, message);
                        } else {
                            self.fail_attempt(
                                status,
                                JobFailedReason::SubmissionFailed,
                                format!(
                                    "Job submission has failed. Reason: {reason}. Message: {message}"
                                ),
                            );
                        }
                        return Ok(self.requeue());
                    }
                    // Logs are complete only once the submitter exits
                    SubmitterState::Active if status.job_status.is_terminal() => {
                        return Ok(self.requeue());
                    }
                    _ => {}
                }
            }
            JobSubmissionMode::HttpMode => {
                if matches!(lookup, Ok(None)) {
                    self.submit(&address, &job_id).await?;
                    return Ok(self.requeue());
                }
            }
            JobSubmissionMode::InteractiveMode => {}
        }

        match status.job_status {
            JobStatus::Succeeded => {
                info!(%job_id, "job succeeded");
                record_success(status, Utc::now());
            }
            JobStatus::Failed | JobStatus::Stopped => {
                let message = status
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("Ray job {job_id} ended as {}", status.job_status));
                self.fail_attempt(status, JobFailedReason::AppFailed, message);
            }
            _ => {}
        }
        Ok(self.requeue())
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Delete the submitter and the owned cluster; true once both are gone
    async fn tear_down(&self, status: &RayJobStatus) -> Result<bool> {
        if self.job.spec.submission_mode == JobSubmissionMode::HttpMode {
            if let (Some(address), Some(job_id)) = (&status.dashboard_url, &status.job_id) {
                if let Err(e) = self.ctx.dashboard.stop_job(address, job_id).await {
                    warn!(error = %e, %job_id, "failed to stop job, deleting the cluster anyway");
                }
            }
        }

        let submitter_gone = self.delete_submitter().await?;
        let cluster_gone = if owns_cluster(self.job) {
            self.delete_cluster(&self.cluster_name(status)).await?
        } else {
            true
        };
        Ok(submitter_gone && cluster_gone)
    }

    /// Issue a delete if the submitter exists; true when it is already gone
    async fn delete_submitter(&self) -> Result<bool> {
        let submitter_name = job_submitter_name(self.job);
        let Some(submitter) = self
            .ctx
            .kube
            .get_submitter(self.namespace, &submitter_name)
            .await?
        else {
            return Ok(true);
        };
        if submitter.metadata.deletion_timestamp.is_some() {
            return Ok(false);
        }

        match self.ctx.kube.delete_submitter(self.namespace, &submitter_name).await {
            Ok(()) => {
                info!(submitter = %submitter_name, "deleted submitter");
                self.event(
                    EventType::Normal,
                    reasons::DELETED_RAY_JOB_SUBMITTER,
                    actions::DELETE,
                    format!("Deleted submitter K8s Job {}/{submitter_name}", self.namespace),
                )
                .await;
                Ok(false)
            }
            Err(e) => {
                self.event(
                    EventType::Warning,
                    reasons::FAILED_TO_DELETE_RAY_JOB_SUBMITTER,
                    actions::DELETE,
                    format!(
                        "Failed to delete submitter K8s Job {}/{submitter_name}: {e}",
                        self.namespace
                    ),
                )
                .await;
                Err(Error::child_operation("delete", "Job", submitter_name, e))
            }
        }
    }

    /// Issue a delete if the cluster exists; true when it is already gone
    async fn delete_cluster(&self, cluster_name: &str) -> Result<bool> {
        let Some(cluster) = self
            .ctx
            .kube
            .get_ray_cluster(self.namespace, cluster_name)
            .await?
        else {
            return Ok(true);
        };
        if cluster.metadata.deletion_timestamp.is_some() {
            return Ok(false);
        }

        match self.ctx.kube.delete_ray_cluster(self.namespace, cluster_name).await {
            Ok(()) => {
                info!(cluster = %cluster_name, "deleted RayCluster");
                self.event(
                    EventType::Normal,
                    reasons::DELETED_RAY_CLUSTER,
                    actions::DELETE,
                    format!("Deleted cluster {}/{cluster_name}", self.namespace),
                )
                .await;
                Ok(false)
            }
            Err(e) => {
                self.event(
                    EventType::Warning,
                    reasons::FAILED_TO_DELETE_RAY_CLUSTER,
                    actions::DELETE,
                    format!(
                        "Failed to delete cluster {}/{cluster_name}: {e}",
                        self.namespace
                    ),
                )
                .await;
                Err(Error::child_operation("delete", "RayCluster", cluster_name, e))
            }
        }
    }

    /// Terminal cleanup. Finished jobs are never requeued.
    async fn finish(&self) -> Result<Action> {
        if !self.job.spec.shutdown_after_job_finishes || !owns_cluster(self.job) {
            return Ok(Action::await_change());
        }

        if self.ctx.delete_job_after_finish {
            info!("job finished, deleting the RayJob");
            self.ctx.kube.delete_ray_job(self.namespace, self.name).await?;
            return Ok(Action::await_change());
        }

        let status = self.job.status.clone().unwrap_or_default();
        self.delete_cluster(&self.cluster_name(&status)).await?;
        Ok(Action::await_change())
    }
}
