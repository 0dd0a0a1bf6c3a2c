//! Conditional status writes with optimistic concurrency
//!
//! Reconcilers compute a desired status from what they read. The write only
//! happens when it differs from the stored status, and it carries the
//! resourceVersion that was read so a concurrent writer makes it fail with
//! 409 Conflict instead of being overwritten. A conflict re-fetches and
//! compares again.

use std::future::Future;

use kube::ResourceExt;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::crd::{RayCluster, RayClusterStatus, RayJob, RayJobStatus};
use crate::Result;

/// Attempts made before a conflict is surfaced to the caller
pub const MAX_STATUS_UPDATE_ATTEMPTS: usize = 5;

/// A resource with a status subresource
pub trait HasStatus {
    /// Status type
    type Status: Clone + PartialEq + Serialize + Send + Sync;

    /// Stored status, if any
    fn current_status(&self) -> Option<&Self::Status>;

    /// Revision the status was read at
    fn revision(&self) -> Option<String>;
}

impl HasStatus for RayCluster {
    type Status = RayClusterStatus;

    fn current_status(&self) -> Option<&RayClusterStatus> {
        self.status.as_ref()
    }

    fn revision(&self) -> Option<String> {
        self.resource_version()
    }
}

impl HasStatus for RayJob {
    type Status = RayJobStatus;

    fn current_status(&self) -> Option<&RayJobStatus> {
        self.status.as_ref()
    }

    fn revision(&self) -> Option<String> {
        self.resource_version()
    }
}

/// Merge patch body that writes `status` guarded by `resource_version`
pub fn status_patch<S: Serialize>(resource_version: Option<&str>, status: &S) -> serde_json::Value {
    match resource_version {
        Some(rv) => json!({ "metadata": { "resourceVersion": rv }, "status": status }),
        None => json!({ "status": status }),
    }
}

/// Persist `desired` if it differs from the stored status.
///
/// `refetch` returns the latest copy of the resource (None once deleted) and
/// `write` performs the guarded write for a revision. Returns whether a write
/// landed.
pub async fn update_status<K, R, RFut, W, WFut>(
    current: &K,
    desired: &K::Status,
    mut refetch: R,
    mut write: W,
) -> Result<bool>
where
    K: HasStatus,
    R: FnMut() -> RFut,
    RFut: Future<Output = Result<Option<K>>>,
    W: FnMut(Option<String>, K::Status) -> WFut,
    WFut: Future<Output = Result<()>>,
{
    let mut stored = current.current_status().cloned();
    let mut revision = current.revision();
    let mut attempt = 1;

    loop {
        if stored.as_ref() == Some(desired) {
            return Ok(false);
        }

        match write(revision.clone(), desired.clone()).await {
            Ok(()) => return Ok(true),
            Err(e) if e.is_conflict() && attempt < MAX_STATUS_UPDATE_ATTEMPTS => {
                debug!(attempt, "status write conflicted, re-reading");
                match refetch().await? {
                    Some(latest) => {
                        stored = latest.current_status().cloned();
                        revision = latest.revision();
                    }
                    None => return Ok(false),
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
