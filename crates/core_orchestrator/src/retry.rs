use std::future::Future;
use std::time::Duration;

use core_types::{ProviderError, ProviderId};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts in total, the first one included.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Wait before the given attempt (2 is the first retry): 2s, 4s, 8s, ...
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(2).min(16);
        self.initial_backoff.saturating_mul(1 << exponent)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy: RetryPolicy {
                max_attempts: policy.max_attempts.max(1),
                ..policy
            },
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// `on_retry(next_attempt, delay)` fires before every wait.
    pub async fn run<T, F, Fut, O>(
        &self,
        provider: ProviderId,
        mut operation: F,
        mut on_retry: O,
    ) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
        O: FnMut(u32, Duration),
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.policy.max_attempts => {
                    attempt += 1;
                    let delay = self.policy.delay_before(attempt);
                    warn!(
                        %provider,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient provider failure, retrying: {err}"
                    );
                    on_retry(attempt, delay);
                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_transient() => {
                    warn!(%provider, attempts = attempt, "retry budget exhausted: {err}");
                    return Err(exhausted(provider));
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn exhausted(provider: ProviderId) -> ProviderError {
    let hint = match provider {
        ProviderId::Local => "Please wait a moment and try again.".to_string(),
        _ => format!(
            "Please wait, or switch to '{}' in Settings for unlimited usage.",
            ProviderId::Local.display_name()
        ),
    };
    ProviderError::with_hint(format!("{provider} quota exceeded or service busy."), hint)
}
