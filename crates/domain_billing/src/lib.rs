//! Billing Domain - Subscriptions and Cost Aggregation
//!
//! This crate models user subscriptions to paid services and computes the
//! total amount billed over a month range.
//!
//! # Aggregation
//!
//! Each subscription contributes `price * months_billed`, where
//! `months_billed` counts 30-day buckets in the overlap between the
//! subscription's active days and the query range. See [`overlap`] for the
//! exact rule.
//!
//! # Example
//!
//! ```rust,ignore
//! use domain_billing::{total_billed, SubscriptionPeriod, SummaryRequest};
//!
//! let request = SummaryRequest::new(from, to);
//! let periods: Vec<SubscriptionPeriod> = rows.iter().map(SubscriptionPeriod::from).collect();
//! let total = total_billed(&request.date_range(), &periods);
//! ```

pub mod subscription;
pub mod overlap;
pub mod error;

pub use subscription::{validate, NewSubscription, Subscription, SummaryRequest};
pub use overlap::{
    contribution, months_billed, total_billed, BillingContribution, SubscriptionPeriod,
    DAYS_PER_BUCKET,
};
pub use error::BillingError;
