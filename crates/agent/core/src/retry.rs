//! Bounded retry with a fixed interval.
//!
//! The worker's API calls are retried on a fixed cadence rather than with
//! backoff: the service already rate-limits per agent, and the bounded
//! budgets below keep a dead endpoint from wedging the worker for long.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How many times and how often an operation is attempted.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    /// Session connect: 10 attempts, 5 seconds apart.
    pub fn connect() -> Self {
        Self::new(10, Duration::from_secs(5))
    }

    /// Heartbeat delivery: 5 attempts, 5 seconds apart.
    pub fn heartbeat() -> Self {
        Self::new(5, Duration::from_secs(5))
    }

    /// Job acceptance: 30 attempts, 5 seconds apart.
    pub fn accept_job() -> Self {
        Self::new(30, Duration::from_secs(5))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Per-call state handed to the retried thunk.
///
/// Renders as `Attempt 3/10 Retrying in 5s` for log lines.
pub struct RetryStats {
    attempt: AtomicU32,
    max_attempts: u32,
    interval: Duration,
    broken: AtomicBool,
}

impl RetryStats {
    fn new(policy: RetryPolicy) -> Self {
        Self {
            attempt: AtomicU32::new(1),
            max_attempts: policy.max_attempts,
            interval: policy.interval,
            broken: AtomicBool::new(false),
        }
    }

    /// 1-indexed attempt currently executing.
    pub fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::SeqCst)
    }

    /// Stops retrying once the current attempt returns. Lets the thunk
    /// distinguish a transient failure from a terminal one. Calling it on
    /// the final attempt is a no-op.
    pub fn break_out(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    fn advance(&self) {
        self.attempt.fetch_add(1, Ordering::SeqCst);
    }
}

impl fmt::Display for RetryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Attempt {}/{}", self.attempt(), self.max_attempts)?;
        if self.attempt() < self.max_attempts && !self.is_broken() {
            write!(f, " Retrying in {:?}", self.interval)?;
        }
        Ok(())
    }
}

/// Runs `op` until it succeeds, [`RetryStats::break_out`] is called, or the
/// attempt budget is spent. Sequential: the thunk is only ever re-entered
/// from this caller. Returns the first success or the last error observed.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(Arc<RetryStats>) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let stats = Arc::new(RetryStats::new(policy));
    loop {
        match op(stats.clone()).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if stats.is_broken() || stats.attempt() >= policy.max_attempts {
                    return Err(err);
                }
            }
        }
        tokio::time::sleep(policy.interval).await;
        stats.advance();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn quick(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn first_success_returns_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry(quick(5), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(42) }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<&str, &str> = retry(quick(5), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transient")
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausting_the_budget_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry(quick(3), |stats| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("failure {}", stats.attempt())) }
        })
        .await;

        assert_eq!(result, Err("failure 3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn break_out_stops_early() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = retry(quick(30), |stats| {
            calls.fetch_add(1, Ordering::SeqCst);
            stats.break_out();
            async { Err("terminal") }
        })
        .await;

        assert_eq!(result, Err("terminal"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn break_out_on_final_attempt_is_a_noop() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = retry(quick(2), |stats| {
            calls.fetch_add(1, Ordering::SeqCst);
            if stats.attempt() == 2 {
                stats.break_out();
            }
            async { Err("nope") }
        })
        .await;

        assert_eq!(result, Err("nope"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stats_render_for_logs() {
        let stats = RetryStats::new(RetryPolicy::new(10, Duration::from_secs(5)));
        assert_eq!(stats.to_string(), "Attempt 1/10 Retrying in 5s");

        let last = RetryStats::new(RetryPolicy::new(1, Duration::from_secs(5)));
        assert_eq!(last.to_string(), "Attempt 1/1");
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts(), 1);
    }
}
