//! roller - rolling replacement of the instances backing a Kubernetes cluster
//!
//! The roller retires every instance whose provisioning fingerprint differs
//! from a target fingerprint and verifies that a freshly provisioned
//! replacement takes its place, per logical role:
//!
//! - `etcd` and `k8s-master` are replaced terminate-first, one instance at a
//!   time, because their ASGs are small and capacity-capped
//! - `k8s-node` is replaced provision-first: the worker ASG is doubled, the
//!   replacement fleet verified and the old nodes cordoned before any
//!   termination, so workloads always have somewhere to go
//!
//! The cluster stays functional throughout; the cluster autoscaler is
//! disabled around worker replacement so it cannot fight the roller.
//!
//! # Modules
//!
//! - [`compute`] - Cloud data model and the [`compute::ComputeBackend`] seam
//! - [`kube`] - Kubernetes scheduler seam and kube-rs implementation
//! - [`inventory`] - Immutable snapshot of out-of-date instances
//! - [`state`] - Per-role run records and the aggregate state
//! - [`strategy`] - The two replacement algorithms
//! - [`verifier`] - Replacement discovery and health acceptance
//! - [`cordon`] - Batch node cordoning
//! - [`autoscaler`] - Cluster-autoscaler bracket
//! - [`notify`] - Webhook status notifications
//! - [`orchestrator`] - Per-role fan-out and reporting
//! - [`config`] - Environment-driven configuration
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod autoscaler;
pub mod compute;
pub mod config;
pub mod cordon;
pub mod error;
pub mod inventory;
pub mod kube;
pub mod notify;
pub mod orchestrator;
pub mod state;
pub mod strategy;
pub mod verifier;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
