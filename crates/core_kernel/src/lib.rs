//! Core Kernel - Foundational types for the subscriptions service
//!
//! This crate provides the building blocks shared by the domain and
//! infrastructure crates:
//! - Backoff strategies with injectable jitter
//! - A cancellable retry executor
//! - Month-precision dates and inclusive date ranges

pub mod backoff;
pub mod retry;
pub mod temporal;
pub mod error;

pub use backoff::{BackoffKind, BackoffPolicy, FixedRandom, RandomSource, ThreadRandom};
pub use retry::{Retrier, RetryError, RetryPolicy, DEFAULT_MAX_ATTEMPTS};
pub use temporal::{DateRange, MonthDate, TemporalError};
pub use error::CoreError;

pub use tokio_util::sync::CancellationToken;
