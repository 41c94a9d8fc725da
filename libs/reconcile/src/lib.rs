//! Convergence primitives for provisioning workflows.
//!
//! Provisioning a virtual cluster is a sequence of writes followed by waits:
//! the control plane accepts a declaration long before the workload behind it
//! is serving. This library provides the wait half:
//!
//! - **Poll policy**: how often to look and how long to keep looking.
//! - **Poll outcome**: converged, timed out, or cancelled by shutdown.
//! - **Convergence status**: classification of an observed workload.
//!
//! # Invariants
//!
//! - A bounded wait never runs past its ceiling by more than one check.
//! - A wait observes shutdown between checks, never mid-check.
//! - Check errors abort the wait; only "not yet" is retried.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Default interval between readiness checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default ceiling for pod readiness.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(300);

/// How a wait polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay between two checks.
    pub interval: Duration,

    /// Total time budget. `None` waits until converged or cancelled.
    pub timeout: Option<Duration>,
}

impl PollPolicy {
    /// Bounded policy.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout: Some(timeout),
        }
    }
}

/// Result of a wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The check reported a value.
    Converged {
        value: T,
        elapsed: Duration,
        attempts: u32,
    },

    /// The ceiling elapsed before the check reported a value.
    TimedOut { elapsed: Duration, attempts: u32 },

    /// Shutdown was signalled while waiting.
    Cancelled,
}

/// Repeatedly run `check` until it yields `Some`, the policy's ceiling
/// elapses, or `shutdown` flips to `true`.
///
/// The first check runs immediately. Errors returned by `check` end the wait
/// and are passed through unchanged.
pub async fn poll_until<T, E, F, Fut>(
    policy: &PollPolicy,
    mut shutdown: watch::Receiver<bool>,
    mut check: F,
) -> Result<PollOutcome<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let started = Instant::now();
    let deadline = policy.timeout.map(|t| started + t);
    let mut attempts = 0u32;

    loop {
        if *shutdown.borrow() {
            return Ok(PollOutcome::Cancelled);
        }

        attempts += 1;
        if let Some(value) = check().await? {
            return Ok(PollOutcome::Converged {
                value,
                elapsed: started.elapsed(),
                attempts,
            });
        }

        let now = Instant::now();
        let wait = match deadline {
            Some(deadline) if now >= deadline => {
                return Ok(PollOutcome::TimedOut {
                    elapsed: now - started,
                    attempts,
                });
            }
            Some(deadline) => policy.interval.min(deadline - now),
            None => policy.interval,
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = signalled(&mut shutdown) => return Ok(PollOutcome::Cancelled),
        }
    }
}

/// Resolves once the shutdown flag is set. Pends forever if the sender is
/// gone, so a dropped sender never cancels a wait.
async fn signalled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Convergence status of an observed workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Every member reports the target state.
    Converged,

    /// Some members are still moving toward the target state.
    Converging,

    /// Nothing to judge yet (no members observed).
    Unknown,
}

impl ConvergenceStatus {
    /// Classify a set of member observations against a predicate.
    pub fn from_members<I, F>(members: I, ready: F) -> Self
    where
        I: IntoIterator,
        F: Fn(&I::Item) -> bool,
    {
        let mut seen = false;
        for member in members {
            seen = true;
            if !ready(&member) {
                return Self::Converging;
            }
        }
        if seen {
            Self::Converged
        } else {
            Self::Unknown
        }
    }

    /// Returns true if the workload has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(interval: u64, timeout: u64) -> PollPolicy {
        PollPolicy::new(Duration::from_secs(interval), Duration::from_secs(timeout))
    }

    #[tokio::test(start_paused = true)]
    async fn test_converges_on_first_check() {
        let (_tx, rx) = watch::channel(false);
        let outcome = poll_until(&policy(5, 300), rx, || async { Ok::<_, ()>(Some(7)) })
            .await
            .unwrap();

        assert_eq!(
            outcome,
            PollOutcome::Converged {
                value: 7,
                elapsed: Duration::ZERO,
                attempts: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_converges_after_several_checks() {
        let (_tx, rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));

        let outcome = poll_until(&policy(5, 300), rx, || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok::<_, ()>((n == 4).then_some(n))
            }
        })
        .await
        .unwrap();

        match outcome {
            PollOutcome::Converged {
                value,
                elapsed,
                attempts,
            } => {
                assert_eq!(value, 4);
                assert_eq!(attempts, 4);
                assert_eq!(elapsed, Duration::from_secs(15));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_at_ceiling() {
        let (_tx, rx) = watch::channel(false);
        let outcome = poll_until(&policy(5, 300), rx, || async { Ok::<Option<()>, ()>(None) })
            .await
            .unwrap();

        match outcome {
            PollOutcome::TimedOut { elapsed, attempts } => {
                assert!(elapsed >= Duration::from_secs(300));
                assert!(elapsed < Duration::from_secs(305));
                assert_eq!(attempts, 61);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_sleep_is_clamped_to_deadline() {
        let (_tx, rx) = watch::channel(false);
        let outcome = poll_until(&policy(5, 12), rx, || async { Ok::<Option<()>, ()>(None) })
            .await
            .unwrap();

        assert_eq!(
            outcome,
            PollOutcome::TimedOut {
                elapsed: Duration::from_secs(12),
                attempts: 4
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_error_aborts() {
        let (_tx, rx) = watch::channel(false);
        let err = poll_until(&policy(5, 300), rx, || async {
            Err::<Option<()>, _>("boom")
        })
        .await
        .unwrap_err();
        assert_eq!(err, "boom");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_unbounded_wait() {
        let (tx, rx) = watch::channel(false);
        let wait = tokio::spawn(async move {
            let policy = PollPolicy {
                interval: Duration::from_secs(5),
                timeout: None,
            };
            poll_until(&policy, rx, || async {
                Ok::<Option<()>, ()>(None)
            })
            .await
        });

        tokio::time::sleep(Duration::from_secs(42)).await;
        tx.send(true).unwrap();

        assert_eq!(wait.await.unwrap().unwrap(), PollOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_shut_down_skips_check() {
        let (_tx, rx) = watch::channel(true);
        let calls = Arc::new(AtomicU32::new(0));
        let outcome = poll_until(&policy(5, 300), rx, || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<Option<()>, ()>(None)
            }
        })
        .await
        .unwrap();
        assert_eq!(outcome, PollOutcome::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sender_does_not_cancel() {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        let outcome = poll_until(&policy(5, 20), rx, || async { Ok::<Option<()>, ()>(None) })
            .await
            .unwrap();
        assert!(matches!(outcome, PollOutcome::TimedOut { .. }));
    }

    #[test]
    fn test_convergence_from_members() {
        let running = ["Running", "Running"];
        let mixed = ["Running", "Pending"];
        let none: [&str; 0] = [];

        assert_eq!(
            ConvergenceStatus::from_members(running, |p| *p == "Running"),
            ConvergenceStatus::Converged
        );
        assert_eq!(
            ConvergenceStatus::from_members(mixed, |p| *p == "Running"),
            ConvergenceStatus::Converging
        );
        assert_eq!(
            ConvergenceStatus::from_members(none, |p| *p == "Running"),
            ConvergenceStatus::Unknown
        );
        assert!(!ConvergenceStatus::Unknown.is_converged());
    }
}
