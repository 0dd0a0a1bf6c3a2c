//! KubeRay operator
//!
//! Wires the RayCluster and RayJob controllers into one process:
//! configuration, CRD generation/installation and the controller runner.

pub mod config;
pub mod controller_runner;
pub mod crds;

pub use config::OperatorConfig;
