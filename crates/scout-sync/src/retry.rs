use std::future::Future;
use std::time::Duration;

use scout_core::ExternalError;
use tokio::time::{sleep, timeout};
use tracing::warn;

/// Bounded exponential backoff for transient collaborator failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per call, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on a single fetcher or scorer call.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Same attempt bound, no sleeping between attempts.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            call_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn begin<'a>(&'a self, op: &'static str, subject: &'a str) -> Attempts<'a> {
        Attempts {
            policy: self,
            op,
            subject,
            made: 0,
        }
    }

    /// Runs `call` under `call_timeout`. Expiry is a transient failure.
    pub async fn timed<T>(
        &self,
        op: &str,
        call: impl Future<Output = Result<T, ExternalError>>,
    ) -> Result<T, ExternalError> {
        match timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ExternalError::transient(format!(
                "{op} timed out after {}ms",
                self.call_timeout.as_millis()
            ))),
        }
    }
}

/// Attempt bookkeeping for one logical call.
#[derive(Debug)]
pub struct Attempts<'a> {
    policy: &'a RetryPolicy,
    op: &'static str,
    subject: &'a str,
    made: u32,
}

impl Attempts<'_> {
    /// Records a failed attempt. Sleeps and returns `true` when another attempt is allowed.
    pub async fn backoff(&mut self, err: &ExternalError) -> bool {
        self.made += 1;
        if !err.is_transient() || self.made >= self.policy.max_attempts {
            return false;
        }
        let delay = self.policy.delay_for_attempt(self.made - 1);
        warn!(
            op = self.op,
            subject = self.subject,
            attempt = self.made,
            max_attempts = self.policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient failure, retrying"
        );
        sleep(delay).await;
        true
    }

    pub fn made(&self) -> u32 {
        self.made
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(3));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn permanent_errors_stop_immediately() {
        let policy = RetryPolicy::immediate();
        let mut attempts = policy.begin("fetch_profile", "p");
        assert!(!attempts.backoff(&ExternalError::permanent("gone")).await);
        assert_eq!(attempts.made(), 1);
    }

    #[tokio::test]
    async fn transient_errors_stop_at_the_bound() {
        let policy = RetryPolicy::immediate();
        let mut attempts = policy.begin("score", "p");
        let err = ExternalError::transient("429");
        assert!(attempts.backoff(&err).await);
        assert!(attempts.backoff(&err).await);
        assert!(!attempts.backoff(&err).await);
        assert_eq!(attempts.made(), 3);
    }

    #[tokio::test]
    async fn expired_call_is_transient() {
        let policy = RetryPolicy {
            call_timeout: Duration::from_millis(10),
            ..RetryPolicy::immediate()
        };
        let err = policy
            .timed("fetch_profile", async {
                sleep(Duration::from_secs(5)).await;
                Ok::<_, ExternalError>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(err.message.contains("timed out"));
    }
}
