//! Delay schedule between retry attempts.
//!
//! Attempt `0` is the initial call and never waits. Retry `n` waits
//! `base * multiplier^(n-1)`, capped at `max`.
//!
//! ```rust
//! use std::time::Duration;
//! use authwire::resilience::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100), 2.0)
//!     .unwrap()
//!     .with_max(Duration::from_millis(300))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(200));
//! assert_eq!(backoff.delay(3), Duration::from_millis(300));
//! ```

use std::time::Duration;

/// Upper bound applied when the schedule would overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum BackoffError {
    #[error("multiplier must be a finite number >= 1.0 (got {0})")]
    InvalidMultiplier(f64),
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base: Duration,
    multiplier: f64,
    max: Duration,
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Self { base: delay, multiplier: 1.0, max: delay.min(MAX_BACKOFF) }
    }

    pub fn exponential(base: Duration, multiplier: f64) -> Result<Self, BackoffError> {
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(BackoffError::InvalidMultiplier(multiplier));
        }
        Ok(Self { base, multiplier, max: MAX_BACKOFF })
    }

    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max < self.base {
            return Err(BackoffError::MaxLessThanBase { base: self.base, max });
        }
        self.max = max.min(MAX_BACKOFF);
        Ok(self)
    }

    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let factor = self.multiplier.powi(exponent);
        let millis = self.base.as_secs_f64() * 1000.0 * factor;
        if !millis.is_finite() || millis >= self.max.as_secs_f64() * 1000.0 {
            return self.max;
        }
        Duration::from_micros((millis * 1000.0).round() as u64)
    }
}
