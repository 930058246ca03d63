//! Named test units with Setup, Assess and Teardown phases.
//!
//! A [`Feature`] owns one Setup step, any number of named Assess steps and one
//! Teardown step. Each step receives a mutable borrow of the feature's state struct
//! `S` and the run's [`EnvHandle`]. The state starts as `S::default()`, so resources a
//! step may not have gotten around to creating are modelled as `Option` fields and
//! Teardown cleans up whatever is present.
//!
//! # Execution Order
//!
//! 1. Setup runs once. If it fails, every Assess step is skipped.
//! 2. Assess steps run in declaration order. The first failure skips the rest.
//! 3. Teardown always runs last. Its failures are logged and recorded in the report
//!    but never change the verdict.
//!
//! A panic inside any step is caught and treated as that step failing.

use crate::cluster::ClusterError;
use crate::environment::EnvHandle;
use crate::poll::PollError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

/// Result of a single step.
pub type StepResult = Result<(), StepError>;

/// Boxed step function.
type StepFn<S, C> =
    Box<dyn for<'a> Fn(&'a mut S, &'a EnvHandle<C>) -> BoxFuture<'a, StepResult> + Send + Sync>;

/// Step failures. Any of these aborts the remaining steps of the feature.
#[derive(Debug, Error)]
pub enum StepError {
    /// Assertion or fatal condition raised by the step itself.
    #[error("{0}")]
    Failed(String),

    /// Call against the cluster failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// Waited resource never reached the expected state.
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },

    /// Run was cancelled while the step was waiting.
    #[error("cancelled while waiting for {what}")]
    Cancelled { what: String },

    /// Condition evaluation failed while waiting.
    #[error("failed while waiting for {what}: {source}")]
    Condition {
        what: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Step panicked.
    #[error("step panicked: {0}")]
    Panicked(String),
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        StepError::Failed(message.into())
    }

    /// Convert a polling error, keeping timeouts distinguishable from check failures.
    pub fn poll<E>(what: impl Into<String>, err: PollError<E>) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let what = what.into();
        match err {
            PollError::Timeout { timeout } => StepError::Timeout { what, timeout },
            PollError::Cancelled => StepError::Cancelled { what },
            PollError::Condition(source) => StepError::Condition {
                what,
                source: Box::new(source),
            },
        }
    }
}

/// Fail the step with `message` unless `condition` holds.
pub fn ensure(condition: bool, message: impl Into<String>) -> StepResult {
    if condition {
        Ok(())
    } else {
        Err(StepError::Failed(message.into()))
    }
}

/// Lifecycle phase a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Assess,
    Teardown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            Phase::Setup => "setup",
            Phase::Assess => "assess",
            Phase::Teardown => "teardown",
        };
        f.write_str(phase)
    }
}

/// Outcome of one executed step.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub phase: Phase,
    pub name: String,
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl StepReport {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of one feature run.
#[derive(Debug, Clone)]
pub struct FeatureReport {
    pub name: String,
    pub passed: bool,
    pub steps: Vec<StepReport>,
}

impl FeatureReport {
    /// Steps that ran in `phase`, in execution order.
    pub fn steps_in(&self, phase: Phase) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter(move |step| step.phase == phase)
    }

    /// True if Teardown ran and reported an error.
    pub fn teardown_failed(&self) -> bool {
        self.steps_in(Phase::Teardown).any(|step| !step.passed())
    }
}

/// A named test unit: Setup, Assess..., Teardown over state `S`.
pub struct Feature<S, C> {
    name: String,
    setup: Option<StepFn<S, C>>,
    assessments: Vec<(String, StepFn<S, C>)>,
    teardown: Option<StepFn<S, C>>,
}

impl<S, C> Feature<S, C>
where
    S: Default + Send,
    C: Send + Sync,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            setup: None,
            assessments: Vec::new(),
            teardown: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the Setup step. Calling this twice replaces the earlier step.
    pub fn setup<F>(mut self, step: F) -> Self
    where
        F: for<'a> Fn(&'a mut S, &'a EnvHandle<C>) -> BoxFuture<'a, StepResult>
            + Send
            + Sync
            + 'static,
    {
        self.setup = Some(Box::new(step));
        self
    }

    /// Append a named Assess step.
    pub fn assess<F>(mut self, name: impl Into<String>, step: F) -> Self
    where
        F: for<'a> Fn(&'a mut S, &'a EnvHandle<C>) -> BoxFuture<'a, StepResult>
            + Send
            + Sync
            + 'static,
    {
        self.assessments.push((name.into(), Box::new(step)));
        self
    }

    /// Set the Teardown step. Calling this twice replaces the earlier step.
    pub fn teardown<F>(mut self, step: F) -> Self
    where
        F: for<'a> Fn(&'a mut S, &'a EnvHandle<C>) -> BoxFuture<'a, StepResult>
            + Send
            + Sync
            + 'static,
    {
        self.teardown = Some(Box::new(step));
        self
    }

    /// Run the feature against `env`.
    pub async fn run(&self, env: &EnvHandle<C>) -> FeatureReport {
        let mut state = S::default();
        let mut steps = Vec::with_capacity(self.assessments.len() + 2);
        let mut failed = false;

        info!(feature = %self.name, namespace = %env.namespace(), "Starting feature");

        if let Some(setup) = &self.setup {
            let report = self
                .run_step(Phase::Setup, "setup", setup, &mut state, env)
                .await;
            failed = !report.passed();
            steps.push(report);
        }

        if failed {
            warn!(
                feature = %self.name,
                skipped = self.assessments.len(),
                "Setup failed, skipping assess steps"
            );
        } else {
            for (name, assess) in &self.assessments {
                let report = self
                    .run_step(Phase::Assess, name, assess, &mut state, env)
                    .await;
                let passed = report.passed();
                steps.push(report);
                if !passed {
                    failed = true;
                    break;
                }
            }
        }

        if let Some(teardown) = &self.teardown {
            let report = self
                .run_step(Phase::Teardown, "teardown", teardown, &mut state, env)
                .await;
            steps.push(report);
        }

        let passed = !failed;
        if passed {
            info!(feature = %self.name, "Feature passed");
        } else {
            error!(feature = %self.name, "Feature failed");
        }

        FeatureReport {
            name: self.name.clone(),
            passed,
            steps,
        }
    }

    async fn run_step(
        &self,
        phase: Phase,
        name: &str,
        step: &StepFn<S, C>,
        state: &mut S,
        env: &EnvHandle<C>,
    ) -> StepReport {
        let start = Instant::now();

        let result = if phase != Phase::Teardown && env.cancel_token().is_cancelled() {
            Err(StepError::Cancelled {
                what: format!("{phase} step {name}"),
            })
        } else {
            match AssertUnwindSafe(step(state, env)).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(StepError::Panicked(panic_message(payload.as_ref()))),
            }
        };

        let elapsed = start.elapsed();
        let error = match result {
            Ok(()) => {
                info!(feature = %self.name, %phase, step = %name, ?elapsed, "Step passed");
                None
            }
            Err(e) if phase == Phase::Teardown => {
                warn!(
                    feature = %self.name,
                    step = %name,
                    error = %e,
                    "Teardown reported an error, continuing"
                );
                Some(e.to_string())
            }
            Err(e) => {
                error!(feature = %self.name, %phase, step = %name, error = %e, "Step failed");
                Some(e.to_string())
            }
        };

        StepReport {
            phase,
            name: name.to_string(),
            elapsed,
            error,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Type-erased feature so one test can hold features with different state types.
#[async_trait]
pub trait RunnableFeature<C>: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, env: &EnvHandle<C>) -> FeatureReport;
}

#[async_trait]
impl<S, C> RunnableFeature<C> for Feature<S, C>
where
    S: Default + Send + 'static,
    C: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, env: &EnvHandle<C>) -> FeatureReport {
        self.run(env).await
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Counters {
        setup_value: Option<u32>,
        seen_by_assess: Vec<u32>,
    }

    struct NoClient;

    fn env() -> EnvHandle<NoClient> {
        EnvHandle::new("test-ns", Arc::new(NoClient), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_state_threads_through_steps() {
        let torn_down_with = Arc::new(AtomicUsize::new(0));
        let observed = torn_down_with.clone();

        let feature = Feature::<Counters, NoClient>::new("state/threading")
            .setup(|state, _env| {
                Box::pin(async move {
                    state.setup_value = Some(7);
                    Ok(())
                })
            })
            .assess("first", |state, _env| {
                Box::pin(async move {
                    let value = state.setup_value.ok_or_else(|| StepError::failed("missing"))?;
                    state.seen_by_assess.push(value);
                    Ok(())
                })
            })
            .assess("second", |state, _env| {
                Box::pin(async move {
                    state.seen_by_assess.push(state.seen_by_assess.len() as u32);
                    Ok(())
                })
            })
            .teardown(move |state, _env| {
                let observed = observed.clone();
                Box::pin(async move {
                    observed.store(state.seen_by_assess.len(), Ordering::SeqCst);
                    Ok(())
                })
            });

        let report = feature.run(&env()).await;

        assert!(report.passed);
        assert_eq!(report.steps.len(), 4);
        assert_eq!(torn_down_with.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_setup_failure_skips_assess_but_runs_teardown() {
        let teardowns = Arc::new(AtomicUsize::new(0));
        let assessed = Arc::new(AtomicUsize::new(0));
        let teardown_counter = teardowns.clone();
        let assess_counter = assessed.clone();

        let feature = Feature::<Counters, NoClient>::new("setup/fails")
            .setup(|_state, _env| Box::pin(async { Err(StepError::failed("create failed")) }))
            .assess("never", move |_state, _env| {
                let assess_counter = assess_counter.clone();
                Box::pin(async move {
                    assess_counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .teardown(move |state, _env| {
                let teardown_counter = teardown_counter.clone();
                Box::pin(async move {
                    // Nothing was created
                    assert!(state.setup_value.is_none());
                    teardown_counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            });

        let report = feature.run(&env()).await;

        assert!(!report.passed);
        assert_eq!(assessed.load(Ordering::SeqCst), 0);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        assert_eq!(report.steps_in(Phase::Assess).count(), 0);
    }

    #[tokio::test]
    async fn test_assess_failure_stops_remaining_assessments() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();

        let feature = Feature::<Counters, NoClient>::new("assess/fails")
            .assess("fails", |_state, _env| {
                Box::pin(async {
                    let ready_replicas = 0;
                    ensure(ready_replicas == 1, "expected 1 ready replica")
                })
            })
            .assess("skipped", move |_state, _env| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            });

        let report = feature.run(&env()).await;

        assert!(!report.passed);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        let failed: Vec<_> = report.steps_in(Phase::Assess).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error.as_deref(), Some("expected 1 ready replica"));
    }

    #[tokio::test]
    async fn test_panicking_step_still_tears_down() {
        let teardowns = Arc::new(AtomicUsize::new(0));
        let counter = teardowns.clone();

        let feature = Feature::<Counters, NoClient>::new("assess/panics")
            .assess("panics", |_state, _env| {
                Box::pin(async {
                    let shape: Option<u32> = None;
                    let _ = shape.expect("unexpected object shape");
                    Ok(())
                })
            })
            .teardown(move |_state, _env| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            });

        let report = feature.run(&env()).await;

        assert!(!report.passed);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        let error = report.steps[0].error.clone().unwrap();
        assert!(error.contains("unexpected object shape"));
    }

    #[tokio::test]
    async fn test_teardown_failure_does_not_change_verdict() {
        let feature = Feature::<Counters, NoClient>::new("teardown/fails")
            .assess("passes", |_state, _env| Box::pin(async { Ok(()) }))
            .teardown(|_state, _env| Box::pin(async { Err(StepError::failed("delete failed")) }));

        let report = feature.run(&env()).await;

        assert!(report.passed);
        assert!(report.teardown_failed());
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_steps_but_tears_down() {
        let teardowns = Arc::new(AtomicUsize::new(0));
        let counter = teardowns.clone();
        let env = env();
        env.cancel_token().cancel();

        let feature = Feature::<Counters, NoClient>::new("cancelled")
            .setup(|state, _env| {
                Box::pin(async move {
                    state.setup_value = Some(1);
                    Ok(())
                })
            })
            .teardown(move |_state, _env| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            });

        let report = feature.run(&env).await;

        assert!(!report.passed);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_poll_errors_stay_distinguishable() {
        let timeout = StepError::poll::<ClusterError>(
            "claim to bind",
            PollError::Timeout {
                timeout: Duration::from_secs(120),
            },
        );
        assert!(matches!(timeout, StepError::Timeout { .. }));
        assert!(timeout.to_string().contains("claim to bind"));

        let condition = StepError::poll(
            "claim to bind",
            PollError::Condition(ClusterError::Client("connection refused".to_string())),
        );
        assert!(matches!(condition, StepError::Condition { .. }));
        assert!(condition.to_string().contains("connection refused"));
    }
}
