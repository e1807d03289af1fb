use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Retry budget for one storage operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first attempt.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// A policy with the same attempt budget and no sleeping, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }
}

/// Terminal state returned by the retry runner.
#[derive(Debug)]
pub struct RetryTerminal<E> {
    pub error: E,
    pub attempts: u32,
    pub exhausted_retryable: bool,
    pub cancelled: bool,
}

/// Runs `op` until it succeeds, fails with a non-retryable error, runs out of attempts, or
/// `cancel` fires during a backoff sleep.
///
/// An attempt already in flight is never interrupted; cancellation only cuts the wait
/// between attempts short. `seed` spreads jitter so concurrent callers don't retry in
/// lockstep.
pub async fn run_with_retry<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    seed: u64,
    mut op: F,
    mut is_retryable: R,
) -> Result<(T, u32), RetryTerminal<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok((value, attempt)),
            Err(error) => error,
        };

        let retryable = is_retryable(&error);
        if !retryable || attempt >= max_attempts {
            return Err(RetryTerminal {
                error,
                attempts: attempt,
                exhausted_retryable: retryable,
                cancelled: false,
            });
        }

        let delay = compute_backoff_delay(policy, attempt, seed);
        if !delay.is_zero() || cancel.is_cancelled() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RetryTerminal {
                        error,
                        attempts: attempt,
                        exhausted_retryable: false,
                        cancelled: true,
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        attempt += 1;
    }
}

/// `base * 2^(attempt-1)`, capped at `max_delay`, plus deterministic jitter in `[0, jitter]`.
pub fn compute_backoff_delay(policy: &RetryPolicy, attempt: u32, seed: u64) -> Duration {
    if policy.base_delay.is_zero() && policy.jitter.is_zero() {
        return Duration::ZERO;
    }

    let shift = attempt.saturating_sub(1).min(20);
    let exponential_ms = policy.base_delay.as_millis().saturating_mul(1u128 << shift);
    let capped_ms = exponential_ms.min(policy.max_delay.as_millis());
    let jitter_ms = deterministic_jitter(seed, attempt, policy.jitter.as_millis());

    let total_ms = capped_ms.saturating_add(jitter_ms);
    Duration::from_millis(total_ms.min(u64::MAX as u128) as u64)
}

/// splitmix64 finalizer over `(seed, attempt)`, reduced into `[0, cap]`.
pub fn deterministic_jitter(seed: u64, attempt: u32, cap: u128) -> u128 {
    if cap == 0 {
        return 0;
    }

    let mut x = seed ^ u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^= x >> 33;

    u128::from(x) % (cap + 1)
}
