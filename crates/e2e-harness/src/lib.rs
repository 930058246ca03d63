//! Lifecycle harness for end-to-end checks against a live cluster.
//!
//! The harness provides the pieces every check is built from:
//!
//! - [`poll`]: cancellable "wait until the remote state satisfies a predicate" loop
//! - [`feature`]: named Setup / Assess... / Teardown units with typed per-feature state
//! - [`environment`]: the ambient namespace, test dispatch and the aggregate exit code
//! - [`cluster`]: collaborator traits for namespace provisioning and workload observation
//! - [`observability`]: OpenTelemetry metrics pipeline and per-test collector
//!
//! # Example
//!
//! ```no_run
//! use e2e_harness::feature::{Feature, StepError};
//!
//! #[derive(Default)]
//! struct State {
//!     created: Option<String>,
//! }
//!
//! # struct MyCluster;
//! let feature = Feature::<State, MyCluster>::new("example/feature")
//!     .setup(|state, env| {
//!         Box::pin(async move {
//!             state.created = Some(format!("{}/object", env.namespace()));
//!             Ok(())
//!         })
//!     })
//!     .assess("object exists", |state, _env| {
//!         Box::pin(async move {
//!             state
//!                 .created
//!                 .as_ref()
//!                 .map(|_| ())
//!                 .ok_or_else(|| StepError::failed("object was not created"))
//!         })
//!     });
//! ```

pub mod cluster;
pub mod config;
pub mod environment;
pub mod feature;
pub mod observability;
pub mod poll;
