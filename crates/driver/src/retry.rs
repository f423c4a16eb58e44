//! The `retry` module contains the [RetryPolicy] wrapped around every call to an external
//! collaborator.

use crate::error::{LedgerError, Retryable, SolverError};
use std::{future::Future, time::Duration};
use tokio::time::{sleep, timeout};

/// The longest pause between two attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// The [RetryConfig] struct holds the knobs of the [RetryPolicy].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per call, including the first.
    pub max_attempts: u32,
    /// The pause after the first failed attempt. Doubles on every further failure.
    pub base_backoff: Duration,
    /// The timeout of a single ledger call or a cheap engine query.
    pub call_timeout: Duration,
    /// The timeout of a full task execution.
    pub execution_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(500),
            call_timeout: Duration::from_secs(30),
            execution_timeout: Duration::from_secs(600),
        }
    }
}

/// The [RetryPolicy] bounds every external call with a timeout, retries read-only calls with
/// exponential backoff, and only resubmits a transaction after confirming onchain that the
/// previous attempt did not land.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    /// Creates a new [RetryPolicy].
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.config
            .base_backoff
            .saturating_mul(factor)
            .min(MAX_BACKOFF)
    }

    /// Runs one attempt of `f` under `limit`, folding a timeout into a transient failure.
    async fn attempt<T, E, Fut>(
        op: &'static str,
        limit: Duration,
        fut: Fut,
    ) -> Result<T, (bool, SolverError)>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        match timeout(limit, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) if e.is_transient() => Err((true, e.into_solver_error(op))),
            Ok(Err(e)) => Err((false, e.into_solver_error(op))),
            Err(_) => Err((
                true,
                SolverError::Transient {
                    op,
                    reason: format!("timed out after {limit:?}"),
                },
            )),
        }
    }

    /// Runs the read-only call `f`, retrying transient failures.
    pub async fn read<T, E, F, Fut>(&self, op: &'static str, f: F) -> Result<T, SolverError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        self.read_within(op, self.config.call_timeout, f).await
    }

    /// Runs the read-only call `f` with a per-attempt timeout of `limit`, retrying transient
    /// failures.
    pub async fn read_within<T, E, F, Fut>(
        &self,
        op: &'static str,
        limit: Duration,
        mut f: F,
    ) -> Result<T, SolverError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match Self::attempt(op, limit, f()).await {
                Ok(value) => return Ok(value),
                Err((true, err)) if attempt < self.config.max_attempts => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(target: "retry", op, attempt, ?delay, "Read failed, retrying: {}", err);
                    sleep(delay).await;
                }
                Err((_, err)) => return Err(err),
            }
        }
    }

    /// Submits the state-changing call `send`. After a transient failure, `landed` is asked
    /// whether the previous attempt took effect onchain; the call is only resubmitted if it
    /// did not. Reverts are never resubmitted.
    pub async fn submit<S, SFut, G, GFut>(
        &self,
        op: &'static str,
        mut landed: G,
        mut send: S,
    ) -> Result<(), SolverError>
    where
        S: FnMut() -> SFut,
        SFut: Future<Output = Result<(), LedgerError>>,
        G: FnMut() -> GFut,
        GFut: Future<Output = Result<bool, LedgerError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match Self::attempt(op, self.config.call_timeout, send()).await {
                Ok(()) => return Ok(()),
                Err((true, err)) if attempt < self.config.max_attempts => err,
                Err((_, err)) => return Err(err),
            };

            let delay = self.backoff(attempt);
            tracing::warn!(target: "retry", op, attempt, ?delay, "Submission failed: {}", err);
            sleep(delay).await;

            match Self::attempt(op, self.config.call_timeout, landed()).await {
                Ok(true) => {
                    tracing::info!(target: "retry", op, "Previous submission landed onchain, not resubmitting.");
                    return Ok(());
                }
                Ok(false) => {}
                Err((_, check_err)) => {
                    // Without knowing whether the transaction landed it must not be resent.
                    tracing::error!(target: "retry", op, "Could not inspect onchain state: {}", check_err);
                    return Err(err);
                }
            }
        }
    }

    /// Submits the state-changing call `send` exactly once, bounded by the call timeout.
    pub async fn submit_once<S, SFut>(&self, op: &'static str, send: S) -> Result<(), SolverError>
    where
        S: FnOnce() -> SFut,
        SFut: Future<Output = Result<(), LedgerError>>,
    {
        Self::attempt(op, self.config.call_timeout, send())
            .await
            .map_err(|(_, err)| err)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            call_timeout: Duration::from_millis(50),
            execution_timeout: Duration::from_millis(50),
        })
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(RetryConfig {
            base_backoff: Duration::from_secs(1),
            ..Default::default()
        });
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(40), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn reads_retry_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = policy()
            .read("getIndices", || {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(LedgerError::Transient("connection reset".into()))
                    } else {
                        Ok(7u64)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn reads_give_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<u64, _> = policy()
            .read("getIndices", || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(LedgerError::Transient("connection reset".into()))
                }
            })
            .await;
        assert_eq!(result.unwrap_err().class(), "transient");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn reverts_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = policy()
            .submit(
                "report",
                || async { Ok(false) },
                || {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(LedgerError::Reverted("bad index".into()))
                    }
                },
            )
            .await;
        assert_eq!(result.unwrap_err().class(), "reverted");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn landed_submissions_are_not_resent() {
        let sends = Arc::new(AtomicU32::new(0));
        let result = policy()
            .submit(
                "commitSolution",
                || async { Ok(true) },
                || {
                    let sends = Arc::clone(&sends);
                    async move {
                        sends.fetch_add(1, Ordering::SeqCst);
                        Err(LedgerError::Transient("receipt timeout".into()))
                    }
                },
            )
            .await;
        assert!(result.is_ok());
        assert_eq!(sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unlanded_submissions_are_resent() {
        let sends = Arc::new(AtomicU32::new(0));
        let result = policy()
            .submit(
                "commitSolution",
                || async { Ok(false) },
                || {
                    let sends = Arc::clone(&sends);
                    async move {
                        if sends.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(LedgerError::Transient("receipt timeout".into()))
                        } else {
                            Ok(())
                        }
                    }
                },
            )
            .await;
        assert!(result.is_ok());
        assert_eq!(sends.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let result = policy()
            .submit_once("postPhases", || async {
                sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert_eq!(result.unwrap_err().class(), "transient");
    }
}
