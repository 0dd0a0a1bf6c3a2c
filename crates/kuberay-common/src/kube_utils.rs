//! Shared Kubernetes utilities using kube-rs
//!
//! Owner references, condition lookups, label merging and the guarded status
//! patch shared by both controllers.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::JobCondition;
use k8s_openapi::api::core::v1::PodCondition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, Resource};

use crate::{Error, Result};

const STATUS_TRUE: &str = "True";

/// Controller owner reference pointing at `owner`.
///
/// Children carrying it are garbage-collected when the owner is deleted.
pub fn owner_reference<K>(owner: &K) -> Result<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    owner.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context(
            "owner_reference",
            format!("{} has no name or uid yet", K::kind(&())),
        )
    })
}

/// Whether `child` is controlled by the object with `owner_uid`
pub fn is_controlled_by<K: Resource>(child: &K, owner_uid: &str) -> bool {
    child
        .meta()
        .owner_references
        .as_ref()
        .map(|refs| {
            refs.iter()
                .any(|r| r.controller == Some(true) && r.uid == owner_uid)
        })
        .unwrap_or(false)
}

/// Check if a condition with the given type has status "True".
///
/// # Arguments
/// * `conditions` - Optional slice of conditions (e.g., from status.conditions)
/// * `condition_type` - The condition type to check (e.g., "Ready", "Complete")
pub fn has_condition<T>(conditions: Option<&[T]>, condition_type: &str) -> bool
where
    T: HasConditionFields,
{
    find_condition_status(conditions, condition_type) == Some(STATUS_TRUE)
}

/// Status string of the condition with the given type, if present
pub fn find_condition_status<'a, T>(
    conditions: Option<&'a [T]>,
    condition_type: &str,
) -> Option<&'a str>
where
    T: HasConditionFields,
{
    conditions?
        .iter()
        .find(|c| c.type_field() == condition_type)
        .map(|c| c.status_field())
}

/// Trait for types that have condition-like fields (type and status)
pub trait HasConditionFields {
    /// Get the condition type field value
    fn type_field(&self) -> &str;
    /// Get the condition status field value
    fn status_field(&self) -> &str;
}

impl HasConditionFields for PodCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

impl HasConditionFields for JobCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

/// Overlay operator-owned labels on user labels; operator keys win
pub fn merge_labels(
    base: Option<BTreeMap<String, String>>,
    owned: impl IntoIterator<Item = (String, String)>,
) -> BTreeMap<String, String> {
    let mut labels = base.unwrap_or_default();
    labels.extend(owned);
    labels
}

/// Patch the status sub-resource of a namespaced object at a revision.
///
/// Uses a merge patch carrying `metadata.resourceVersion`, so the API server
/// answers 409 Conflict when the object moved on since it was read.
pub async fn patch_status_at_revision<T>(
    client: &Client,
    namespace: &str,
    name: &str,
    resource_version: Option<&str>,
    status: &impl serde::Serialize,
) -> std::result::Result<(), kube::Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = crate::status::status_patch(resource_version, status);
    api.patch_status(
        name,
        &PatchParams::apply(crate::FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 so child names derived from it are stable across
/// restarts and toolchain versions.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}
