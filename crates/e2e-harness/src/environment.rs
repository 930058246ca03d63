//! Test environment: ambient namespace, test dispatch and run summary.
//!
//! An [`Environment`] provisions one uniquely named namespace before the first test,
//! runs every registered [`TestCase`], and deletes the namespace after the last one.
//! Tests share that namespace, so each feature must use its own object names.
//!
//! Every test records exactly one metrics observation, including tests whose task
//! panics or is dropped on cancellation.

use crate::cluster::Cluster;
use crate::feature::{Feature, RunnableFeature};
use crate::observability::MetricsCollector;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Minimum length of the random suffix generated by [`random_name`].
const MIN_SUFFIX_LEN: usize = 5;

/// Handle passed to every step: the ambient namespace, the cluster client and the
/// run-wide cancellation token.
pub struct EnvHandle<C> {
    namespace: String,
    client: Arc<C>,
    cancel: CancellationToken,
}

impl<C> Clone for EnvHandle<C> {
    fn clone(&self) -> Self {
        Self {
            namespace: self.namespace.clone(),
            client: Arc::clone(&self.client),
            cancel: self.cancel.clone(),
        }
    }
}

impl<C> EnvHandle<C> {
    pub fn new(namespace: impl Into<String>, client: Arc<C>, cancel: CancellationToken) -> Self {
        Self {
            namespace: namespace.into(),
            client,
            cancel,
        }
    }

    /// Name of the ambient namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// A named test driving one or more features.
pub struct TestCase<C> {
    name: String,
    features: Vec<Box<dyn RunnableFeature<C>>>,
}

impl<C> TestCase<C>
where
    C: Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            features: Vec::new(),
        }
    }

    /// Add a feature. Features run in the order they were added.
    pub fn feature<S>(mut self, feature: Feature<S, C>) -> Self
    where
        S: Default + Send + 'static,
    {
        self.features.push(Box::new(feature));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Aggregate outcome of a run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub passed: Vec<String>,
    pub failed: Vec<String>,
    /// Set when the run could not start, e.g. the namespace could not be created.
    pub setup_error: Option<String>,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        self.failed.is_empty() && self.setup_error.is_none()
    }

    /// Process exit code: 0 iff every test passed and the run started cleanly.
    pub fn exit_code(&self) -> u8 {
        if self.success() {
            0
        } else {
            1
        }
    }
}

/// Records one observation when dropped, so the hook fires however the test ends.
struct ObservationGuard {
    collector: MetricsCollector,
    test_name: String,
    start: Instant,
    passed: bool,
}

impl ObservationGuard {
    fn new(collector: MetricsCollector, test_name: &str) -> Self {
        Self {
            collector,
            test_name: test_name.to_string(),
            start: Instant::now(),
            passed: false,
        }
    }
}

impl Drop for ObservationGuard {
    fn drop(&mut self) {
        self.collector
            .record_test_execution(&self.test_name, self.start.elapsed(), !self.passed);
    }
}

/// Runs tests inside one ambient namespace.
pub struct Environment<C> {
    handle: EnvHandle<C>,
    collector: MetricsCollector,
    parallel: bool,
}

impl<C> Environment<C>
where
    C: Cluster,
{
    pub fn new(
        client: Arc<C>,
        namespace: impl Into<String>,
        collector: MetricsCollector,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            handle: EnvHandle::new(namespace, client, cancel),
            collector,
            parallel: false,
        }
    }

    /// Run each test on its own task instead of one after another.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn namespace(&self) -> &str {
        self.handle.namespace()
    }

    pub fn handle(&self) -> &EnvHandle<C> {
        &self.handle
    }

    /// Provision the namespace, run `tests`, then delete the namespace.
    ///
    /// Namespace creation failure aborts the run before any test starts. Deletion
    /// failure is logged and does not affect the summary.
    pub async fn run(&self, tests: Vec<TestCase<C>>) -> RunSummary {
        let namespace = self.handle.namespace();
        let mut summary = RunSummary::default();

        info!(%namespace, tests = tests.len(), "Creating ambient namespace");
        if let Err(e) = self.handle.client().create_namespace(namespace).await {
            error!(%namespace, error = %e, "Failed to create ambient namespace, aborting run");
            summary.setup_error = Some(format!("failed to create namespace {namespace}: {e}"));
            return summary;
        }

        if self.parallel {
            self.run_parallel(tests, &mut summary).await;
        } else {
            for test in tests {
                let name = test.name.clone();
                if self.test(test).await {
                    summary.passed.push(name);
                } else {
                    summary.failed.push(name);
                }
            }
        }

        info!(%namespace, "Deleting ambient namespace");
        if let Err(e) = self.handle.client().delete_namespace(namespace).await {
            error!(%namespace, error = %e, "Failed to delete ambient namespace");
        }

        info!(
            passed = summary.passed.len(),
            failed = summary.failed.len(),
            "Run complete"
        );
        summary
    }

    /// Run one test and record its observation. Returns whether it passed.
    pub async fn test(&self, test: TestCase<C>) -> bool {
        run_test(self.handle.clone(), self.collector.clone(), test).await
    }

    async fn run_parallel(&self, tests: Vec<TestCase<C>>, summary: &mut RunSummary) {
        let mut tasks = JoinSet::new();
        let mut names = HashMap::with_capacity(tests.len());
        for test in tests {
            let handle = self.handle.clone();
            let collector = self.collector.clone();
            let name = test.name.clone();
            let task = tasks.spawn(run_test(handle, collector, test));
            names.insert(task.id(), name);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, outcome) = match joined {
                Ok((id, passed)) => (id, Ok(passed)),
                Err(e) => (e.id(), Err(e)),
            };
            let name = names
                .remove(&id)
                .unwrap_or_else(|| format!("<unknown test task {id}>"));
            let passed = outcome.unwrap_or_else(|e| {
                error!(test = %name, error = %e, "Test task did not complete");
                false
            });
            if passed {
                summary.passed.push(name);
            } else {
                summary.failed.push(name);
            }
        }
    }
}

async fn run_test<C>(handle: EnvHandle<C>, collector: MetricsCollector, test: TestCase<C>) -> bool
where
    C: Send + Sync + 'static,
{
    let mut guard = ObservationGuard::new(collector, &test.name);
    info!(test = %test.name, features = test.features.len(), "Running test");

    let mut passed = true;
    for feature in &test.features {
        let report = feature.execute(&handle).await;
        if !report.passed {
            warn!(test = %test.name, feature = %feature.name(), "Feature failed");
        }
        passed &= report.passed;
    }

    guard.passed = passed;
    passed
}

/// Generate `prefix-<suffix>` of total length `len` with a random lowercase
/// alphanumeric suffix. The suffix is never shorter than five characters.
pub fn random_name(prefix: &str, len: usize) -> String {
    let suffix_len = len
        .saturating_sub(prefix.len() + 1)
        .max(MIN_SUFFIX_LEN);
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(suffix_len)
        .map(|byte| char::from(byte).to_ascii_lowercase())
        .collect();
    format!("{prefix}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_name_length_and_charset() {
        let name = random_name("sample-ns", 16);
        assert_eq!(name.len(), 16);
        assert!(name.starts_with("sample-ns-"));
        assert!(name
            .chars()
            .all(|c| c == '-' || c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_random_name_keeps_minimum_suffix() {
        let name = random_name("a-very-long-prefix", 8);
        assert_eq!(name.len(), "a-very-long-prefix-".len() + MIN_SUFFIX_LEN);
    }

    #[test]
    fn test_random_names_differ() {
        assert_ne!(random_name("e2e-ns", 20), random_name("e2e-ns", 20));
    }

    #[test]
    fn test_exit_code() {
        let mut summary = RunSummary::default();
        assert_eq!(summary.exit_code(), 0);

        summary.passed.push("TestRealCluster".to_string());
        assert_eq!(summary.exit_code(), 0);

        summary.failed.push("TestCSIStorage".to_string());
        assert_eq!(summary.exit_code(), 1);

        let setup_failed = RunSummary {
            setup_error: Some("namespace".to_string()),
            ..RunSummary::default()
        };
        assert_eq!(setup_failed.exit_code(), 1);
    }
}
