//! Same-provider retry schedule
//!
//! Decides how many tries a single provider gets within one request and how
//! long to wait between them. Only `Timeout` and `TransientError` are ever
//! retried; everything else moves straight on to the next provider.
//!
//! ## Usage
//!
//! ```rust
//! use std::time::Duration;
//! use tokio_provider_dispatch::retry::RetryPolicy;
//!
//! let policy = RetryPolicy::exponential(3, Duration::from_millis(100));
//! assert_eq!(policy.delay_for(1), Duration::from_millis(100));
//! assert_eq!(policy.delay_for(2), Duration::from_millis(200));
//! ```

use std::time::Duration;

use crate::provider::FailureKind;

/// Retry policy configuration
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total tries per provider per request, first try included.
    pub tries_per_provider: u32,
    /// Backoff between tries.
    pub strategy: RetryStrategy,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

/// Retry backoff strategy
#[derive(Clone, Debug, PartialEq)]
pub enum RetryStrategy {
    /// Fixed delay between retries
    Fixed(Duration),
    /// Exponential backoff (delay doubles each time)
    Exponential {
        /// Delay before the first retry.
        initial_delay: Duration,
        /// Upper bound on any single delay.
        max_delay: Duration,
        /// Growth factor per retry.
        multiplier: f64,
    },
    /// Linear backoff (delay increases linearly)
    Linear {
        /// Delay before the first retry.
        initial_delay: Duration,
        /// Added per subsequent retry.
        increment: Duration,
    },
}

impl Default for RetryPolicy {
    /// One try per provider: the plain fall-through-to-next behaviour.
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// Never retry the same provider.
    pub fn none() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Create policy with fixed delay
    pub fn fixed(tries_per_provider: u32, delay: Duration) -> Self {
        Self {
            tries_per_provider,
            strategy: RetryStrategy::Fixed(delay),
            jitter: false,
        }
    }

    /// Create policy with exponential backoff
    pub fn exponential(tries_per_provider: u32, initial_delay: Duration) -> Self {
        Self {
            tries_per_provider,
            strategy: RetryStrategy::Exponential {
                initial_delay,
                max_delay: Duration::from_secs(60),
                multiplier: 2.0,
            },
            jitter: false,
        }
    }

    /// Create policy with linear backoff
    pub fn linear(tries_per_provider: u32, initial_delay: Duration, increment: Duration) -> Self {
        Self {
            tries_per_provider,
            strategy: RetryStrategy::Linear {
                initial_delay,
                increment,
            },
            jitter: false,
        }
    }

    /// Cap exponential delays at `max_delay`. No effect on other strategies.
    pub fn with_max_delay(mut self, max: Duration) -> Self {
        if let RetryStrategy::Exponential { max_delay, .. } = &mut self.strategy {
            *max_delay = max;
        }
        self
    }

    /// Enable jitter.
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Whether a provider that has already had `tries` tries and just failed
    /// with `kind` should get another one.
    pub fn should_retry(&self, kind: FailureKind, tries: u32) -> bool {
        kind.is_retryable() && tries < self.tries_per_provider
    }

    /// Delay to wait after the `retry`-th failed try (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let base = match &self.strategy {
            RetryStrategy::Fixed(delay) => *delay,
            RetryStrategy::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                let millis = initial_delay.as_millis() as f64 * multiplier.powi((retry - 1) as i32);
                Duration::from_millis(millis.min(max_delay.as_millis() as f64) as u64)
            }
            RetryStrategy::Linear {
                initial_delay,
                increment,
            } => *initial_delay + *increment * (retry - 1),
        };
        if self.jitter {
            with_jitter(base)
        } else {
            base
        }
    }
}

/// Retry with jitter to prevent thundering herd
pub fn with_jitter(duration: Duration) -> Duration {
    use rand::Rng;
    let quarter = (duration.as_millis() / 4) as u64;
    if quarter == 0 {
        return duration;
    }
    let jitter = rand::thread_rng().gen_range(0..quarter);
    duration + Duration::from_millis(jitter)
}
