//! Backoff strategies
//!
//! A [`BackoffStrategy`] maps a 1-based retry number to the time to wait
//! before that retry. Fixed and incremental strategies are deterministic; the
//! exponential strategy randomizes its delta to spread out retries from many
//! clients hitting the same server, while never exceeding `max_backoff`.

use crate::error::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lower bound of the random factor applied to the exponential delta
const JITTER_LOW: f64 = 0.8;
/// Upper bound of the random factor applied to the exponential delta
const JITTER_HIGH: f64 = 1.2;

/// Delay schedule between retries
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    Fixed {
        /// Delay before each retry
        #[serde(with = "crate::config::duration_ms_serde")]
        interval: Duration,
    },

    /// Delay grows linearly: `initial + increment * (n - 1)`
    Incremental {
        /// Delay before the first retry
        #[serde(with = "crate::config::duration_ms_serde")]
        initial: Duration,
        /// Added to the delay for every subsequent retry
        #[serde(with = "crate::config::duration_ms_serde")]
        increment: Duration,
    },

    /// Randomized exponential growth capped at `max_backoff`
    ///
    /// The delay before retry `n` is
    /// `min(min_backoff + (2^n - 1) * delta_backoff * r, max_backoff)` with `r`
    /// drawn uniformly from `[0.8, 1.2]`.
    Exponential {
        /// Smallest delay ever returned
        #[serde(with = "crate::config::duration_ms_serde")]
        min_backoff: Duration,
        /// Hard ceiling on the delay
        #[serde(with = "crate::config::duration_ms_serde")]
        max_backoff: Duration,
        /// Base unit of the exponential growth
        #[serde(with = "crate::config::duration_ms_serde")]
        delta_backoff: Duration,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Fixed {
            interval: Duration::from_millis(100),
        }
    }
}

impl BackoffStrategy {
    /// Fixed delay between retries
    #[must_use]
    pub fn fixed(interval: Duration) -> Self {
        BackoffStrategy::Fixed { interval }
    }

    /// Linearly growing delay between retries
    #[must_use]
    pub fn incremental(initial: Duration, increment: Duration) -> Self {
        BackoffStrategy::Incremental { initial, increment }
    }

    /// Randomized exponential delay between retries
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `min_backoff` exceeds `max_backoff`.
    pub fn exponential(
        min_backoff: Duration,
        max_backoff: Duration,
        delta_backoff: Duration,
    ) -> Result<Self> {
        let strategy = BackoffStrategy::Exponential {
            min_backoff,
            max_backoff,
            delta_backoff,
        };
        strategy.validate()?;
        Ok(strategy)
    }

    /// No delay at all, useful for tests that must not wait
    #[must_use]
    pub fn none() -> Self {
        BackoffStrategy::Fixed {
            interval: Duration::ZERO,
        }
    }

    /// Check the internal consistency of the strategy
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an exponential strategy whose
    /// `min_backoff` is greater than its `max_backoff`.
    pub fn validate(&self) -> Result<()> {
        match self {
            BackoffStrategy::Exponential {
                min_backoff,
                max_backoff,
                ..
            } if min_backoff > max_backoff => Err(Error::InvalidArgument {
                name: "min_backoff",
                reason: format!(
                    "min_backoff ({min_backoff:?}) must not exceed max_backoff ({max_backoff:?})"
                ),
            }),
            _ => Ok(()),
        }
    }

    /// Delay to wait before retry number `attempt` (1-based)
    ///
    /// An `attempt` of 0 is treated as 1.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match *self {
            BackoffStrategy::Fixed { interval } => interval,
            BackoffStrategy::Incremental { initial, increment } => {
                initial.saturating_add(increment.saturating_mul(attempt - 1))
            }
            BackoffStrategy::Exponential {
                min_backoff,
                max_backoff,
                delta_backoff,
            } => {
                if delta_backoff.is_zero() {
                    return min_backoff.min(max_backoff);
                }
                let factor: f64 = rand::thread_rng().gen_range(JITTER_LOW..=JITTER_HIGH);
                // 2^n overflows f64 precision long before it matters; the cap below wins
                let growth = 2f64.powi(attempt.min(62) as i32) - 1.0;
                let delta_secs = delta_backoff.as_secs_f64() * factor * growth;
                let total_secs = min_backoff.as_secs_f64() + delta_secs;
                if !total_secs.is_finite() || total_secs >= max_backoff.as_secs_f64() {
                    max_backoff
                } else {
                    Duration::from_secs_f64(total_secs)
                }
            }
        }
    }
}
