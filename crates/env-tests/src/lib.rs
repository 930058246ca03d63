//! Cluster Conformance Suite
//!
//! End-to-end checks run against a live Kubernetes cluster on top of the
//! `e2e-harness` lifecycle. Each check provisions its objects inside the run's
//! ambient namespace, asserts on them, and cleans up after itself.
//!
//! # Checks
//!
//! | Test | Feature | Verifies |
//! |------|---------|----------|
//! | `TestRealCluster` | `appsv1/deployment` | A deployment can be created and read back |
//! | `TestCSIStorage` | `csi/storage` | A claim binds and a pod can write to it |
//! | `TestNetworkConnectivity` | `network/connectivity` | A pod reaches a ClusterIP service |
//! | `TestRBACPermissions` | `rbac/permissions` | A plain service account is denied cluster-wide access |
//!
//! # Usage
//!
//! ```bash
//! # Run the suite binary against the current kubeconfig
//! cargo run -p env-tests
//!
//! # Unit tests only (no cluster needed)
//! cargo test -p env-tests
//!
//! # Suite integration test against a live cluster
//! cargo test -p env-tests --features live
//! ```

pub mod checks;
pub mod config;
pub mod kube_cluster;
