//! Error types for the KubeRay operator
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant names the resource it concerns so that reconcile logs and events
//! can point at it directly.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Classified pod-population failure for a RayCluster
///
/// The reason string is recorded on the cluster status and is part of the
/// public contract, so it must not change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReplicaFailure {
    /// The head pod could not be created
    CreateHeadPod,
    /// A worker pod could not be created
    CreateWorkerPod,
    /// The head pod could not be deleted
    DeleteHeadPod,
    /// A worker pod could not be deleted
    DeleteWorkerPod,
    /// Pods could not be deleted while suspending
    DeleteAllPods,
}

impl ReplicaFailure {
    /// Stable machine-readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            Self::CreateHeadPod => "FailedCreateHeadPod",
            Self::CreateWorkerPod => "FailedCreateWorkerPod",
            Self::DeleteHeadPod => "FailedDeleteHeadPod",
            Self::DeleteWorkerPod => "FailedDeleteWorkerPod",
            Self::DeleteAllPods => "FailedDeleteAllPods",
        }
    }
}

impl std::fmt::Display for ReplicaFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.reason())
    }
}

/// Main error type for KubeRay operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs or lookups
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.workerGroupSpecs[1].groupName")
        field: Option<String>,
    },

    /// Pod create/delete failure for a RayCluster
    #[error("{reason} for {resource}: {source}")]
    Replica {
        /// Classification recorded on cluster status
        reason: ReplicaFailure,
        /// Name of the RayCluster
        resource: String,
        /// The failed operation
        #[source]
        source: Box<Error>,
    },

    /// Create/delete failure of a child object other than a pod
    #[error("failed to {operation} {kind} {resource}: {source}")]
    ChildOperation {
        /// "create" or "delete"
        operation: String,
        /// Kind of the child (e.g., "RayCluster", "Job", "Service")
        kind: String,
        /// Name of the child
        resource: String,
        /// The failed API call
        #[source]
        source: Box<Error>,
    },

    /// Ray dashboard request failure
    #[error("dashboard error at {address}: {message}")]
    Dashboard {
        /// Dashboard address that was contacted
        address: String,
        /// Description of what failed
        message: String,
        /// HTTP status, when a response was received
        status: Option<u16>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Reconcile deadline exceeded
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        /// Operation that was abandoned
        operation: String,
        /// Deadline in seconds
        seconds: u64,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "controller")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Wrap a pod operation failure with its replica classification
    pub fn replica(reason: ReplicaFailure, resource: impl Into<String>, source: Error) -> Self {
        Self::Replica {
            reason,
            resource: resource.into(),
            source: Box::new(source),
        }
    }

    /// Wrap a failed create/delete of a child object
    pub fn child_operation(
        operation: impl Into<String>,
        kind: impl Into<String>,
        resource: impl Into<String>,
        source: Error,
    ) -> Self {
        Self::ChildOperation {
            operation: operation.into(),
            kind: kind.into(),
            resource: resource.into(),
            source: Box::new(source),
        }
    }

    /// Create a dashboard error
    pub fn dashboard(
        address: impl Into<String>,
        msg: impl Into<String>,
        status: Option<u16>,
    ) -> Self {
        Self::Dashboard {
            address: address.into(),
            message: msg.into(),
            status,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Conflicts, not-found races and throttling are transient. Other 4xx
    /// responses mean the request itself is wrong and won't succeed until
    /// the resource changes. Child create/delete failures are always
    /// retried: quota and admission rejections clear without the parent
    /// changing.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => {
                    !(400..500).contains(&ae.code) || matches!(ae.code, 404 | 409 | 429)
                }
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Replica { .. } => true,
            Error::ChildOperation { .. } => true,
            Error::Dashboard { .. } => true,
            Error::Serialization { .. } => false,
            Error::Timeout { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// True for an optimistic-concurrency conflict on update
    pub fn is_conflict(&self) -> bool {
        matches!(
            self.api_error(),
            Some((409, reason)) if reason != "AlreadyExists"
        )
    }

    /// True when the API server reports the object is missing
    pub fn is_not_found(&self) -> bool {
        matches!(self.api_error(), Some((404, _)))
    }

    /// True when a create collided with an existing object
    pub fn is_already_exists(&self) -> bool {
        matches!(self.api_error(), Some((409, "AlreadyExists")))
    }

    /// Replica failure reason carried by this error, or "" when unclassified
    pub fn replica_failure_reason(&self) -> &'static str {
        match self {
            Error::Replica { reason, .. } => reason.reason(),
            _ => "",
        }
    }

    /// Get the resource name if this error is associated with one
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::Validation { resource, .. } => Some(resource),
            Error::Replica { resource, .. } => Some(resource),
            Error::ChildOperation { resource, .. } => Some(resource),
            _ => None,
        }
    }

    fn api_error(&self) -> Option<(u16, &str)> {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => Some((ae.code, ae.reason.as_str())),
            Error::Replica { source, .. } => source.api_error(),
            Error::ChildOperation { source, .. } => source.api_error(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn api_error(code: u16, reason: &str) -> Error {
        Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} from test"),
            reason: reason.to_string(),
            code,
        }))
    }

    /// Story: a replica failure keeps its classification through wrapping
    ///
    /// The cluster reconciler wraps pod API errors so the reason can be put
    /// on status. Anything not wrapped has no reason.
    #[rstest]
    #[case::delete_all(ReplicaFailure::DeleteAllPods, "FailedDeleteAllPods")]
    #[case::delete_head(ReplicaFailure::DeleteHeadPod, "FailedDeleteHeadPod")]
    #[case::create_head(ReplicaFailure::CreateHeadPod, "FailedCreateHeadPod")]
    #[case::delete_worker(ReplicaFailure::DeleteWorkerPod, "FailedDeleteWorkerPod")]
    #[case::create_worker(ReplicaFailure::CreateWorkerPod, "FailedCreateWorkerPod")]
    fn story_replica_failures_keep_their_reason(
        #[case] failure: ReplicaFailure,
        #[case] expected: &str,
    ) {
        let err = Error::replica(failure, "raycluster-sample", Error::internal("other error"));
        assert_eq!(err.replica_failure_reason(), expected);
        assert!(err.to_string().contains(expected));
        assert!(err.to_string().contains("other error"));
        assert_eq!(err.resource(), Some("raycluster-sample"));
    }

    #[test]
    fn unclassified_errors_have_no_replica_reason() {
        assert_eq!(Error::internal("other error").replica_failure_reason(), "");
        assert_eq!(api_error(500, "InternalError").replica_failure_reason(), "");
    }

    /// Story: transient store errors are retried, bad requests are not
    #[rstest]
    #[case::conflict(409, "Conflict", true)]
    #[case::not_found(404, "NotFound", true)]
    #[case::throttled(429, "TooManyRequests", true)]
    #[case::server_error(503, "ServiceUnavailable", true)]
    #[case::invalid(422, "Invalid", false)]
    #[case::forbidden(403, "Forbidden", false)]
    fn story_store_errors_are_classified(
        #[case] code: u16,
        #[case] reason: &str,
        #[case] retryable: bool,
    ) {
        assert_eq!(api_error(code, reason).is_retryable(), retryable);
    }

    /// Story: child create/delete failures are retried whatever the status
    ///
    /// A 403 from an exhausted ResourceQuota or a 422 from an admission
    /// webhook is wrong for the child, not for the parent, and the parent
    /// must be retried rather than parked.
    #[rstest]
    #[case::forbidden(403, "Forbidden")]
    #[case::invalid(422, "Invalid")]
    #[case::server_error(500, "InternalError")]
    fn story_child_failures_are_always_retried(#[case] code: u16, #[case] reason: &str) {
        let pod = Error::replica(
            ReplicaFailure::CreateWorkerPod,
            "raycluster-sample",
            api_error(code, reason),
        );
        assert!(pod.is_retryable());

        let cluster = Error::child_operation(
            "create",
            "RayCluster",
            "rayjob-sample-raycluster",
            api_error(code, reason),
        );
        assert!(cluster.is_retryable());
        assert_eq!(cluster.resource(), Some("rayjob-sample-raycluster"));
        assert!(cluster.to_string().starts_with("failed to create RayCluster"));
    }

    #[test]
    fn conflict_and_already_exists_are_distinguished() {
        let conflict = api_error(409, "Conflict");
        assert!(conflict.is_conflict());
        assert!(!conflict.is_already_exists());

        let exists = api_error(409, "AlreadyExists");
        assert!(exists.is_already_exists());
        assert!(!exists.is_conflict());

        assert!(api_error(404, "NotFound").is_not_found());
        assert!(!Error::internal("x").is_not_found());
    }

    #[test]
    fn wrapped_api_errors_are_still_recognized() {
        let err = Error::replica(
            ReplicaFailure::DeleteWorkerPod,
            "rc",
            api_error(404, "NotFound"),
        );
        assert!(err.is_not_found());
        assert!(err.is_retryable());

        let err = Error::replica(ReplicaFailure::CreateHeadPod, "rc", api_error(422, "Invalid"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn configuration_errors_are_not_retryable() {
        let err = Error::validation_for_field("rayjob-sample", "spec.entrypoint", "must be set");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("rayjob-sample"));
        match &err {
            Error::Validation { field, .. } => assert_eq!(field.as_deref(), Some("spec.entrypoint")),
            _ => panic!("Expected Validation variant"),
        }

        assert!(!Error::serialization_for_kind("RayJob", "bad yaml").is_retryable());
    }

    #[test]
    fn timeouts_and_dashboard_errors_are_retryable() {
        let err = Error::timeout("reconcile RayJob default/sample", 30);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("30s"));

        let err = Error::dashboard("rc-head-svc.default.svc.cluster.local:8265", "refused", None);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("refused"));
    }
}
