//! Kubernetes Event recording for the KubeRay controllers.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that controllers can emit standard Kubernetes Events visible via
//! `kubectl describe` and `kubectl get events`.
//!
//! Events are buffered and fire-and-forget: `publish()` only enqueues, a
//! background task talks to the API server, and failures are logged as
//! warnings. A failed event never breaks reconciliation.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tokio::sync::mpsc;
use tracing::warn;

/// Events buffered before new ones are dropped
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "CreatedRayCluster")
    /// * `action` - What action was taken (e.g. "Create")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

struct QueuedEvent {
    resource_ref: ObjectReference,
    event: Event,
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
///
/// Events go through a bounded channel drained by a spawned task, so a slow
/// API server never stalls a reconcile.
pub struct KubeEventPublisher {
    tx: mpsc::Sender<QueuedEvent>,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events
    /// (e.g. "raycluster-controller"). Must be called inside a tokio runtime.
    pub fn new(client: Client, controller_name: &str) -> Self {
        Self::with_buffer(client, controller_name, DEFAULT_EVENT_BUFFER)
    }

    /// Create a publisher with an explicit buffer size
    pub fn with_buffer(client: Client, controller_name: &str, buffer: usize) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        let recorder = Recorder::new(client, reporter);
        let (tx, mut rx) = mpsc::channel::<QueuedEvent>(buffer.max(1));

        tokio::spawn(async move {
            while let Some(queued) = rx.recv().await {
                if let Err(e) = recorder.publish(&queued.event, &queued.resource_ref).await {
                    warn!(
                        reason = %queued.event.reason,
                        action = %queued.event.action,
                        error = %e,
                        "Failed to publish Kubernetes event"
                    );
                }
            }
        });

        Self { tx }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let queued = QueuedEvent {
            resource_ref: resource_ref.clone(),
            event: Event {
                type_,
                reason: reason.to_string(),
                note,
                action: action.to_string(),
                secondary: None,
            },
        };
        match self.tx.try_send(queued) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(reason, action, "Event buffer full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(reason, action, "Event recorder stopped, dropping event");
            }
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// An event captured by [`RecordingEventPublisher`]
#[derive(Clone, Debug)]
pub struct RecordedEvent {
    /// Normal or Warning
    pub type_: EventType,
    /// Reason string
    pub reason: String,
    /// Action string
    pub action: String,
    /// Message, if any
    pub note: Option<String>,
}

/// Publisher that keeps every event in memory, for scenario tests
#[derive(Clone, Default)]
pub struct RecordingEventPublisher {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl RecordingEventPublisher {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events published so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Reasons of the events published so far, in order
    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }

    /// Number of events with the given reason
    pub fn count(&self, reason: &str) -> usize {
        self.events().iter().filter(|e| e.reason == reason).count()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        if let Ok(mut events) = self.events.lock() {
            events.push(RecordedEvent {
                type_,
                reason: reason.to_string(),
                action: action.to_string(),
                note,
            });
        }
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column and are
/// relied on by tooling, so they must not change.
pub mod reasons {
    // RayJob children
    /// Cluster created for a RayJob
    pub const CREATED_RAY_CLUSTER: &str = "CreatedRayCluster";
    /// Cluster creation failed
    pub const FAILED_TO_CREATE_RAY_CLUSTER: &str = "FailedToCreateRayCluster";
    /// Cluster deleted by a RayJob
    pub const DELETED_RAY_CLUSTER: &str = "DeletedRayCluster";
    /// Cluster deletion failed
    pub const FAILED_TO_DELETE_RAY_CLUSTER: &str = "FailedToDeleteRayCluster";
    /// Submitter batch Job created
    pub const CREATED_RAY_JOB_SUBMITTER: &str = "CreatedRayJobSubmitter";
    /// Submitter batch Job creation failed
    pub const FAILED_TO_CREATE_RAY_JOB_SUBMITTER: &str = "FailedToCreateRayJobSubmitter";
    /// Submitter batch Job deleted
    pub const DELETED_RAY_JOB_SUBMITTER: &str = "DeletedRayJobSubmitter";
    /// Submitter batch Job deletion failed
    pub const FAILED_TO_DELETE_RAY_JOB_SUBMITTER: &str = "FailedToDeleteRayJobSubmitter";

    // RayCluster children
    /// Head pod created
    pub const CREATED_HEAD_POD: &str = "CreatedHeadPod";
    /// Head pod creation failed
    pub const FAILED_TO_CREATE_HEAD_POD: &str = "FailedToCreateHeadPod";
    /// Head pod deleted
    pub const DELETED_HEAD_POD: &str = "DeletedHeadPod";
    /// Head pod deletion failed
    pub const FAILED_TO_DELETE_HEAD_POD: &str = "FailedToDeleteHeadPod";
    /// Worker pod created
    pub const CREATED_WORKER_POD: &str = "CreatedWorkerPod";
    /// Worker pod creation failed
    pub const FAILED_TO_CREATE_WORKER_POD: &str = "FailedToCreateWorkerPod";
    /// Worker pod deleted
    pub const DELETED_WORKER_POD: &str = "DeletedWorkerPod";
    /// Worker pod deletion failed
    pub const FAILED_TO_DELETE_WORKER_POD: &str = "FailedToDeleteWorkerPod";
    /// Head service created
    pub const CREATED_SERVICE: &str = "CreatedService";
    /// Head service creation failed
    pub const FAILED_TO_CREATE_SERVICE: &str = "FailedToCreateService";

    // Validation
    /// RayJob spec is invalid
    pub const INVALID_RAY_JOB_SPEC: &str = "InvalidRayJobSpec";
    /// RayCluster spec is invalid
    pub const INVALID_RAY_CLUSTER_SPEC: &str = "InvalidRayClusterSpec";

    // RayJob lifecycle
    /// Deployment status moved, note carries `from -> to`
    pub const JOB_DEPLOYMENT_STATUS_TRANSITION: &str = "JobDeploymentStatusTransition";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Creating a child resource
    pub const CREATE: &str = "Create";
    /// Deleting a child resource
    pub const DELETE: &str = "Delete";
    /// Validating the spec
    pub const VALIDATE: &str = "Validate";
}
