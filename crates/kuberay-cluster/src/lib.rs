//! RayCluster controller
//!
//! Drives the head service, head pod and worker pods of a RayCluster toward
//! the desired replica counts and reports cluster status:
//! - Pod and service construction from the group templates
//! - Availability accounting over the observed pods
//! - The reconcile loop and its error policy

pub mod controller;
pub mod pods;
pub mod service;
pub mod status;

pub use controller::{error_policy, reconcile, Context, KubeClient, KubeClientImpl};
