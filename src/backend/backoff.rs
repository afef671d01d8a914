//! Transport-level retry schedule.
//!
//! [`BackoffConfig`] controls how transient provider failures (429, 5xx,
//! 529, connection errors, per-attempt timeouts) are retried. Delays come
//! from an explicit schedule when one is set, otherwise from exponential
//! growth with optional jitter.

use std::time::Duration;

/// Configuration for transport-level retry.
///
/// # Example
///
/// ```
/// use prfaq_pipeline::backend::BackoffConfig;
/// use std::time::Duration;
///
/// let canonical = BackoffConfig::canonical();
/// assert_eq!(canonical.max_retries, 3);
/// assert_eq!(canonical.delay_for_attempt(1), Duration::from_secs(5));
///
/// let none = BackoffConfig::none();
/// assert_eq!(none.max_retries, 0);
/// ```
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,

    /// Explicit delay before retry N (0-indexed). The last entry repeats
    /// when there are more retries than entries. Empty means exponential.
    pub schedule: Vec<Duration>,

    /// Initial delay for exponential growth.
    pub initial_delay: Duration,

    /// Multiplier applied to the delay after each retry.
    pub multiplier: f64,

    /// Upper bound for any single delay, including `Retry-After` hints.
    pub max_delay: Duration,

    /// Jitter strategy applied on top of the base delay.
    pub jitter: JitterStrategy,

    /// HTTP status codes that trigger retry.
    pub retryable_statuses: Vec<u16>,

    /// Whether to respect `Retry-After` headers from the provider.
    pub respect_retry_after: bool,
}

/// Jitter strategy to prevent thundering herd on shared rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterStrategy {
    /// Delay is exactly the calculated value.
    None,

    /// Random value in `[0, calculated_delay]`.
    Full,

    /// `calculated_delay/2 + random in [0, calculated_delay/2]`.
    Equal,
}

const RETRYABLE_STATUSES: [u16; 7] = [408, 429, 500, 502, 503, 504, 529];

impl BackoffConfig {
    /// Pipeline default: 3 retries waiting 2s, 5s, then 10s.
    pub fn canonical() -> Self {
        Self {
            max_retries: 3,
            schedule: vec![
                Duration::from_secs(2),
                Duration::from_secs(5),
                Duration::from_secs(10),
            ],
            initial_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: JitterStrategy::None,
            retryable_statuses: RETRYABLE_STATUSES.to_vec(),
            respect_retry_after: true,
        }
    }

    /// No transport retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::canonical()
        }
    }

    /// Short retry for auxiliary calls the user is not waiting on:
    /// 1 retry, 500ms initial, 2s max, equal jitter.
    pub fn interactive() -> Self {
        Self {
            max_retries: 1,
            schedule: Vec::new(),
            initial_delay: Duration::from_millis(500),
            multiplier: 1.5,
            max_delay: Duration::from_secs(2),
            jitter: JitterStrategy::Equal,
            retryable_statuses: RETRYABLE_STATUSES.to_vec(),
            respect_retry_after: true,
        }
    }

    /// `max_retries` retries with zero delay. Ignores `Retry-After`.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            schedule: vec![Duration::ZERO],
            max_delay: Duration::ZERO,
            respect_retry_after: false,
            ..Self::canonical()
        }
    }

    /// Replace the retry count, keeping everything else.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Total attempts this config allows, first call included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Calculate the delay before retry N (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let capped = if let Some(last) = self.schedule.last() {
            let base = self
                .schedule
                .get(attempt as usize)
                .copied()
                .unwrap_or(*last);
            base.min(self.max_delay).as_secs_f64()
        } else {
            let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
            base.min(self.max_delay.as_secs_f64())
        };

        let jittered = match self.jitter {
            JitterStrategy::None => capped,
            JitterStrategy::Full => fastrand::f64() * capped,
            JitterStrategy::Equal => capped / 2.0 + fastrand::f64() * (capped / 2.0),
        };

        Duration::from_secs_f64(jittered)
    }

    /// Delay before retry N, preferring a provider `Retry-After` hint.
    pub fn delay_with_hint(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) if self.respect_retry_after => hint.min(self.max_delay),
            _ => self.delay_for_attempt(attempt),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::canonical()
    }
}
