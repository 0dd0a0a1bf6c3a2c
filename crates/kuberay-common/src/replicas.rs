//! Desired-replica calculator
//!
//! Pure functions from a worker group spec (and optionally an autoscaler
//! recommendation) to the number of worker pods that should exist. Total over
//! every input, including inverted bounds: the result is clamped to `min`
//! first and `max` second, so `max` wins when `min > max`.

use std::collections::BTreeMap;

use kube::ResourceExt;
use tracing::warn;

use crate::crd::{RayCluster, WorkerGroupSpec};

/// Lower bound when `minReplicas` is unset
pub const DEFAULT_MIN_REPLICAS: i32 = 0;

/// Upper bound when `maxReplicas` is unset
pub const DEFAULT_MAX_REPLICAS: i32 = i32::MAX;

/// Effective lower bound of a group
pub fn min_replicas(group: &WorkerGroupSpec) -> i32 {
    group.min_replicas.unwrap_or(DEFAULT_MIN_REPLICAS)
}

/// Effective upper bound of a group
pub fn max_replicas(group: &WorkerGroupSpec) -> i32 {
    group.max_replicas.unwrap_or(DEFAULT_MAX_REPLICAS)
}

/// Desired replicas of a group.
///
/// A recommendation replaces `replicas` as the value being clamped; suspend
/// and the bounds still apply.
pub fn desired_replicas(group: &WorkerGroupSpec, recommendation: Option<i32>) -> i32 {
    if group.is_suspended() {
        return 0;
    }
    let min = min_replicas(group);
    let max = max_replicas(group);
    let requested = recommendation.or(group.replicas).unwrap_or(min);
    requested.max(min).min(max)
}

/// Desired replicas of a group without autoscaler input
pub fn worker_group_desired_replicas(group: &WorkerGroupSpec) -> i32 {
    desired_replicas(group, None)
}

/// Per-group recommendations published on the cluster by the autoscaler.
///
/// An unparseable annotation is ignored so the cluster falls back to the
/// groups' own `replicas`.
pub fn autoscaler_recommendations(cluster: &RayCluster) -> BTreeMap<String, i32> {
    let Some(raw) = cluster
        .annotations()
        .get(crate::AUTOSCALER_REPLICAS_ANNOTATION_KEY)
    else {
        return BTreeMap::new();
    };
    match serde_json::from_str::<BTreeMap<String, i32>>(raw) {
        Ok(recs) => recs,
        Err(e) => {
            warn!(
                cluster = %cluster.name_any(),
                error = %e,
                "ignoring malformed autoscaler recommendation"
            );
            BTreeMap::new()
        }
    }
}

/// Desired replicas of every group of a cluster, keyed by group name
pub fn cluster_group_desired_replicas(cluster: &RayCluster) -> BTreeMap<String, i32> {
    let recs = autoscaler_recommendations(cluster);
    cluster
        .spec
        .worker_group_specs
        .iter()
        .map(|g| {
            let desired = if cluster.spec.is_suspended() {
                0
            } else {
                desired_replicas(g, recs.get(&g.group_name).copied())
            };
            (g.group_name.clone(), desired)
        })
        .collect()
}

/// Cluster-wide replica totals over non-suspended groups
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplicaTotals {
    /// Sum of desired replicas
    pub desired: i32,
    /// Sum of minReplicas
    pub min: i32,
    /// Sum of maxReplicas, saturating
    pub max: i32,
}

/// Totals for the cluster status
pub fn cluster_replica_totals(cluster: &RayCluster) -> ReplicaTotals {
    let desired_by_group = cluster_group_desired_replicas(cluster);
    cluster
        .spec
        .worker_group_specs
        .iter()
        .filter(|g| !g.is_suspended())
        .fold(ReplicaTotals::default(), |acc, g| ReplicaTotals {
            desired: acc
                .desired
                .saturating_add(desired_by_group.get(&g.group_name).copied().unwrap_or(0)),
            min: acc.min.saturating_add(min_replicas(g)),
            max: acc.max.saturating_add(max_replicas(g)),
        })
}

/// Sum of desired replicas over non-suspended groups
pub fn calculate_desired_replicas(cluster: &RayCluster) -> i32 {
    cluster_replica_totals(cluster).desired
}

/// Sum of minReplicas over non-suspended groups
pub fn calculate_min_replicas(cluster: &RayCluster) -> i32 {
    cluster_replica_totals(cluster).min
}

/// Sum of maxReplicas over non-suspended groups
pub fn calculate_max_replicas(cluster: &RayCluster) -> i32 {
    cluster_replica_totals(cluster).max
}
