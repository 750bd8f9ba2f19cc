//! Backoff strategies
//!
//! A backoff maps a 0-based retry attempt to the duration to wait before the
//! next attempt. Three shapes are supported, each with optional jitter:
//!
//! - **Fixed**: the same interval every time
//! - **Linear**: `base + step * attempt`, capped at `max`
//! - **Exponential**: `base * factor^attempt`, capped at `max`
//!
//! Jitter multiplies the computed duration by `1 + u` where `u` is drawn
//! uniformly from `[-jitter, +jitter]`. The random source is passed in
//! explicitly so tests can pin it.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Source of uniformly distributed values in `[0, 1)`
pub trait RandomSource: Send + Sync + fmt::Debug {
    /// Returns the next value in `[0, 1)`
    fn unit(&self) -> f64;
}

/// Random source backed by the thread-local generator
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn unit(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// Deterministic source that always yields the same value
///
/// `FixedRandom(0.5)` produces zero jitter, `FixedRandom(0.0)` the largest
/// negative jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedRandom(pub f64);

impl RandomSource for FixedRandom {
    fn unit(&self) -> f64 {
        self.0
    }
}

/// Name of a backoff shape, as it appears in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    #[default]
    Linear,
    Exponential,
}

/// Strategy for computing the wait between retry attempts
///
/// A zero `max` disables the cap. Jitter outside `(0, 1)` is ignored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffPolicy {
    /// Constant interval
    Fixed { interval: Duration, jitter: f64 },
    /// Interval grows by `step` per attempt
    Linear {
        base: Duration,
        step: Duration,
        max: Duration,
        jitter: f64,
    },
    /// Interval grows by `factor` per attempt
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
        jitter: f64,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Linear {
            base: Duration::from_secs(1),
            step: Duration::from_secs(1),
            max: Duration::from_secs(10),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Creates a fixed backoff without jitter
    pub fn fixed(interval: Duration) -> Self {
        BackoffPolicy::Fixed {
            interval,
            jitter: 0.0,
        }
    }

    /// Creates a linear backoff without jitter
    pub fn linear(base: Duration, step: Duration, max: Duration) -> Self {
        BackoffPolicy::Linear {
            base,
            step,
            max,
            jitter: 0.0,
        }
    }

    /// Creates an exponential backoff without jitter
    pub fn exponential(base: Duration, factor: f64, max: Duration) -> Self {
        BackoffPolicy::Exponential {
            base,
            factor,
            max,
            jitter: 0.0,
        }
    }

    /// Returns a copy of this policy with the given jitter fraction
    pub fn with_jitter(self, fraction: f64) -> Self {
        match self {
            BackoffPolicy::Fixed { interval, .. } => BackoffPolicy::Fixed {
                interval,
                jitter: fraction,
            },
            BackoffPolicy::Linear { base, step, max, .. } => BackoffPolicy::Linear {
                base,
                step,
                max,
                jitter: fraction,
            },
            BackoffPolicy::Exponential {
                base, factor, max, ..
            } => BackoffPolicy::Exponential {
                base,
                factor,
                max,
                jitter: fraction,
            },
        }
    }

    /// The configured jitter fraction
    pub fn jitter(&self) -> f64 {
        match self {
            BackoffPolicy::Fixed { jitter, .. }
            | BackoffPolicy::Linear { jitter, .. }
            | BackoffPolicy::Exponential { jitter, .. } => *jitter,
        }
    }

    /// The shape of this policy
    pub fn kind(&self) -> BackoffKind {
        match self {
            BackoffPolicy::Fixed { .. } => BackoffKind::Fixed,
            BackoffPolicy::Linear { .. } => BackoffKind::Linear,
            BackoffPolicy::Exponential { .. } => BackoffKind::Exponential,
        }
    }

    /// Returns the wait before the retry following `attempt`, with jitter applied
    ///
    /// # Arguments
    ///
    /// * `attempt` - 0-based index; the first retry wait uses attempt 0
    /// * `random` - Source for the jitter draw
    pub fn next(&self, attempt: u32, random: &dyn RandomSource) -> Duration {
        match self.capped(attempt) {
            Capped::AtMax(max) => max,
            Capped::Below(delay) => apply_jitter(delay, self.jitter(), random),
        }
    }

    /// Returns the wait for `attempt` before jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        match self.capped(attempt) {
            Capped::AtMax(d) | Capped::Below(d) => d,
        }
    }

    fn capped(&self, attempt: u32) -> Capped {
        match *self {
            BackoffPolicy::Fixed { interval, .. } => Capped::Below(interval),
            BackoffPolicy::Linear { base, step, max, .. } => {
                let delay = base.saturating_add(step.saturating_mul(attempt));
                cap(delay, max)
            }
            BackoffPolicy::Exponential {
                base, factor, max, ..
            } => {
                if base.is_zero() {
                    return Capped::Below(Duration::ZERO);
                }
                let secs = base.as_secs_f64() * factor.powf(f64::from(attempt));
                let delay = if secs.is_nan() || secs <= 0.0 {
                    Duration::ZERO
                } else {
                    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
                };
                cap(delay, max)
            }
        }
    }
}

enum Capped {
    AtMax(Duration),
    Below(Duration),
}

fn cap(delay: Duration, max: Duration) -> Capped {
    if !max.is_zero() && delay > max {
        Capped::AtMax(max)
    } else {
        Capped::Below(delay)
    }
}

fn apply_jitter(delay: Duration, jitter: f64, random: &dyn RandomSource) -> Duration {
    if jitter <= 0.0 || jitter >= 1.0 || jitter.is_nan() {
        return delay;
    }
    let delta = (random.unit() * 2.0 - 1.0) * jitter;
    Duration::try_from_secs_f64(delay.as_secs_f64() * (1.0 + delta)).unwrap_or(delay)
}
