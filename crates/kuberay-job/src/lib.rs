//! RayJob controller
//!
//! Runs one entrypoint against a RayCluster and tracks it to a terminal
//! outcome:
//! - The cluster the job creates or borrows
//! - The submitter batch Job and its idempotent submit-then-tail command
//! - The Ray dashboard job API client
//! - The deployment state machine with retries, deadlines and suspension

pub mod cluster;
pub mod controller;
pub mod dashboard;
pub mod submitter;

pub use controller::{error_policy, reconcile, Context, KubeClient, KubeClientImpl};
pub use dashboard::{DashboardClient, HttpDashboardClient};
