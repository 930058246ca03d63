//! Condition polling for checks that wait on remote state.
//!
//! This module provides a bounded retry loop for checks that depend on the cluster
//! converging: a volume claim becoming bound, a deployment reporting ready replicas,
//! a workload reaching a terminal phase.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Smallest spacing allowed between two evaluations.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Stand-in for deadlines that overflow `Instant`; never reached during a run.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Polling errors.
///
/// `Timeout` and `Condition` are separate variants so callers can report
/// "did not become ready" distinctly from "the check itself failed".
#[derive(Debug, Error)]
pub enum PollError<E> {
    #[error("condition not met within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("polling cancelled")]
    Cancelled,

    #[error("condition check failed: {0}")]
    Condition(#[source] E),
}

impl<E> PollError<E> {
    /// True if the condition never became satisfied within the budget.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PollError::Timeout { .. })
    }
}

/// Named polling budgets sized to the expected convergence latency of the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollBudget {
    /// Deployment rollout to ready replicas (5s interval, 1min)
    DeploymentReady,

    /// Persistent volume claim binding (5s interval, 2min)
    VolumeBinding,

    /// One-shot workload running to a terminal phase (5s interval, 5min)
    WorkloadCompletion,

    /// Short-lived permission-check pod running to a terminal phase (2s interval, 2min)
    PermissionCheckCompletion,
}

impl PollBudget {
    /// Spacing between two evaluations.
    pub fn interval(&self) -> Duration {
        match self {
            PollBudget::PermissionCheckCompletion => Duration::from_secs(2),
            _ => Duration::from_secs(5),
        }
    }

    /// Total time allowed before giving up.
    pub fn timeout(&self) -> Duration {
        match self {
            PollBudget::DeploymentReady => Duration::from_secs(60),
            PollBudget::VolumeBinding => Duration::from_secs(120),
            PollBudget::WorkloadCompletion => Duration::from_secs(300),
            PollBudget::PermissionCheckCompletion => Duration::from_secs(120),
        }
    }

    /// Poll `condition` with this budget, evaluating immediately.
    pub async fn poll<F, Fut, E>(
        self,
        cancel: &CancellationToken,
        condition: F,
    ) -> Result<(), PollError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
    {
        poll_until(cancel, self.interval(), self.timeout(), true, condition).await
    }
}

/// Evaluate `condition` until it reports satisfied, fails, times out, or `cancel` fires.
///
/// - `Ok(true)` stops with success.
/// - `Ok(false)` retries after `interval`.
/// - `Err(e)` stops immediately with [`PollError::Condition`]; errors are never retried.
///
/// With `immediate` set the first evaluation happens right away, otherwise after one
/// `interval`. Evaluations are spaced at least `interval` apart, and an evaluation still in
/// flight when the deadline passes or the token is cancelled is abandoned.
///
/// # Example
///
/// ```no_run
/// use e2e_harness::poll::poll_until;
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn fetch_phase() -> Result<String, std::io::Error> { Ok("Bound".into()) }
/// # async fn example() {
/// let cancel = CancellationToken::new();
/// poll_until(&cancel, Duration::from_secs(5), Duration::from_secs(120), true, || async {
///     Ok::<_, std::io::Error>(fetch_phase().await? == "Bound")
/// })
/// .await
/// .expect("claim should bind");
/// # }
/// ```
pub async fn poll_until<F, Fut, E>(
    cancel: &CancellationToken,
    interval: Duration,
    timeout: Duration,
    immediate: bool,
    mut condition: F,
) -> Result<(), PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let interval = interval.max(MIN_INTERVAL);
    let start = Instant::now();
    let deadline = instant_after(start, timeout);

    let mut ticker = time::interval_at(instant_after(start, interval), interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut attempts: u32 = 0;
    let mut evaluate_now = immediate;

    loop {
        if evaluate_now {
            attempts += 1;
            let satisfied = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PollError::Cancelled),
                _ = time::sleep_until(deadline) => return Err(PollError::Timeout { timeout }),
                result = condition() => result.map_err(PollError::Condition)?,
            };

            if satisfied {
                debug!(attempts, elapsed = ?start.elapsed(), "Condition satisfied");
                return Ok(());
            }
        }
        evaluate_now = true;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = time::sleep_until(deadline) => {
                debug!(attempts, ?timeout, "Condition not met before deadline");
                return Err(PollError::Timeout { timeout });
            }
            _ = ticker.tick() => {}
        }
    }
}

fn instant_after(start: Instant, after: Duration) -> Instant {
    start
        .checked_add(after)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    struct FetchFailed;

    impl std::fmt::Display for FetchFailed {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "fetch failed")
        }
    }

    impl std::error::Error for FetchFailed {}

    /// Condition that reports satisfied on the `succeed_on`-th evaluation.
    fn counting_condition(
        attempts: Arc<AtomicUsize>,
        succeed_on: usize,
    ) -> impl FnMut() -> std::future::Ready<Result<bool, FetchFailed>> {
        move || {
            let count = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(Ok(count >= succeed_on))
        }
    }

    /// Paused-clock timers fire on millisecond boundaries.
    fn assert_within(elapsed: Duration, expected: Duration) {
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(10),
            "elapsed {elapsed:?}, expected about {expected:?}"
        );
    }

    #[test]
    fn test_poll_budgets() {
        assert_eq!(PollBudget::DeploymentReady.timeout(), Duration::from_secs(60));
        assert_eq!(PollBudget::VolumeBinding.timeout(), Duration::from_secs(120));
        assert_eq!(
            PollBudget::WorkloadCompletion.timeout(),
            Duration::from_secs(300)
        );
        assert_eq!(PollBudget::VolumeBinding.interval(), Duration::from_secs(5));
        assert_eq!(PollBudget::PermissionCheckCompletion.interval(), Duration::from_secs(2));
        assert_eq!(PollBudget::PermissionCheckCompletion.timeout(), Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_fourth_evaluation() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let result = poll_until(
            &cancel,
            Duration::from_secs(1),
            Duration::from_secs(10),
            true,
            counting_condition(attempts.clone(), 4),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_within(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_first_evaluation_waits_one_interval() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let result = poll_until(
            &cancel,
            Duration::from_secs(2),
            Duration::from_secs(10),
            false,
            counting_condition(attempts.clone(), 1),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_within(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_at_deadline() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let result = poll_until(
            &cancel,
            Duration::from_secs(1),
            Duration::from_secs(3),
            true,
            counting_condition(attempts.clone(), usize::MAX),
        )
        .await;

        let err = result.expect_err("condition never satisfied");
        assert!(err.is_timeout());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed <= Duration::from_secs(4));
        // ceil(timeout / interval) + 1 is the upper bound on evaluations
        assert!(attempts.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_condition_error_is_not_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let cancel = CancellationToken::new();

        let result = poll_until(
            &cancel,
            Duration::from_secs(1),
            Duration::from_secs(10),
            true,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Err::<bool, _>(FetchFailed))
            },
        )
        .await;

        match result {
            Err(PollError::Condition(e)) => assert_eq!(e, FetchFailed),
            other => panic!("expected condition error, got {other:?}"),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_wait() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let start = Instant::now();

        tokio::spawn(async move {
            time::sleep(Duration::from_millis(1500)).await;
            trigger.cancel();
        });

        let result = poll_until(
            &cancel,
            Duration::from_secs(60),
            Duration::from_secs(600),
            true,
            || std::future::ready(Ok::<_, FetchFailed>(false)),
        )
        .await;

        assert!(matches!(result, Err(PollError::Cancelled)));
        assert_within(start.elapsed(), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_condition_is_bounded_by_timeout() {
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let result = poll_until(
            &cancel,
            Duration::from_secs(1),
            Duration::from_secs(5),
            true,
            || std::future::pending::<Result<bool, FetchFailed>>(),
        )
        .await;

        assert!(matches!(result, Err(PollError::Timeout { .. })));
        assert_within(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_does_not_spin() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let result = poll_until(
            &cancel,
            Duration::ZERO,
            Duration::from_millis(10),
            true,
            counting_condition(attempts.clone(), usize::MAX),
        )
        .await;

        assert!(result.is_err());
        assert!(attempts.load(Ordering::SeqCst) <= 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_durations_do_not_overflow() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let result = poll_until(
            &cancel,
            Duration::MAX,
            Duration::MAX,
            true,
            counting_condition(attempts.clone(), 1),
        )
        .await;
        assert!(result.is_ok());

        // Deferred first evaluation never comes; cancellation still ends the wait
        let canceller = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(30)).await;
            canceller.cancel();
        });
        let result = poll_until(
            &cancel,
            Duration::MAX,
            Duration::MAX,
            false,
            counting_condition(attempts.clone(), 1),
        )
        .await;
        assert!(matches!(result, Err(PollError::Cancelled)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
