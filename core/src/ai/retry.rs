use std::time::Duration;

use super::{Completion, CompletionError, CompletionService, GenerationMode};
use crate::run_context::{RunContext, RunEvent};

/// Backoff parameters for transient completion failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay used after the first failed call.
    pub base_delay: Duration,
    /// Upper bound for any computed delay.
    pub max_delay: Duration,
    /// Maximum number of calls, the first one included.
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub const fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 3)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay_ms: u64,
    pub used_hint: bool,
}

impl RetryDecision {
    const fn no_retry() -> Self {
        Self {
            should_retry: false,
            delay_ms: 0,
            used_hint: false,
        }
    }

    fn retry_with(delay: Duration, used_hint: bool) -> Self {
        let millis = delay.as_millis();
        let delay_ms = if millis > u64::MAX as u128 {
            u64::MAX
        } else {
            millis as u64
        };
        Self {
            should_retry: true,
            delay_ms,
            used_hint,
        }
    }
}

/// Decides whether to call again after `failed_attempts` consecutive failures.
///
/// Timeouts back off by a factor of 2 per attempt, rate limits by a factor of 3.
/// A server hint replaces the computed delay when it is longer.
pub fn evaluate_retry(
    error: &CompletionError,
    policy: BackoffPolicy,
    failed_attempts: u32,
) -> RetryDecision {
    if failed_attempts == 0 || failed_attempts >= policy.max_attempts {
        return RetryDecision::no_retry();
    }

    let (factor, hint) = match error {
        CompletionError::Timeout { .. } => (2, None),
        CompletionError::RateLimited { retry_hint, .. } => (3, *retry_hint),
        CompletionError::Permanent { .. } => return RetryDecision::no_retry(),
    };

    let computed = compute_backoff(policy.base_delay, policy.max_delay, factor, failed_attempts - 1);
    match hint {
        Some(hint) if hint > computed => RetryDecision::retry_with(hint, true),
        _ => RetryDecision::retry_with(computed, false),
    }
}

fn compute_backoff(base: Duration, max_delay: Duration, factor: u128, exponent: u32) -> Duration {
    if base.is_zero() {
        return Duration::from_millis(0);
    }

    let mut multiplier: u128 = 1;
    for _ in 0..exponent {
        multiplier = multiplier.saturating_mul(factor);
    }

    let delay_ms = base.as_millis().saturating_mul(multiplier);
    let capped_ms = delay_ms.min(max_delay.as_millis());
    Duration::from_millis(capped_ms as u64)
}

/// Calls the service, sleeping and retrying on timeouts and rate limits.
///
/// Permanent errors are returned immediately; transient ones are returned once
/// the attempt ceiling is reached.
pub async fn complete_with_backoff(
    service: &dyn CompletionService,
    prompt: &str,
    content: &str,
    mode: GenerationMode,
    policy: BackoffPolicy,
    context: &RunContext,
) -> Result<Completion, CompletionError> {
    let mut failed_attempts = 0;
    loop {
        match service.complete(prompt, content, mode).await {
            Ok(completion) => {
                if failed_attempts > 0 {
                    log::info!(
                        "{} request succeeded after {} attempt(s)",
                        service.name(),
                        failed_attempts + 1
                    );
                }
                return Ok(completion);
            }
            Err(error) => {
                failed_attempts += 1;
                let decision = evaluate_retry(&error, policy, failed_attempts);
                if !decision.should_retry {
                    if error.is_transient() {
                        log::error!(
                            "{} request failed after {failed_attempts} attempt(s): {error}",
                            service.name()
                        );
                    } else {
                        log::error!("{} request failed: {error}", service.name());
                    }
                    return Err(error);
                }

                log::warn!(
                    "{} request failed (attempt {failed_attempts}/{}): {error}; retrying in {}ms",
                    service.name(),
                    policy.max_attempts,
                    decision.delay_ms
                );
                context.record(RunEvent::ServiceRetry {
                    attempt: failed_attempts,
                    kind: error.kind().to_string(),
                    delay_ms: decision.delay_ms,
                });
                tokio::time::sleep(Duration::from_millis(decision.delay_ms)).await;
            }
        }
    }
}
