//! Period-overlap cost aggregation
//!
//! The billed cost of a subscription within a query range is its monthly
//! price times the number of 30-day buckets covered by the overlap of the
//! subscription period and the range. Buckets are counted on the inclusive
//! day span:
//!
//! ```text
//! months_billed = ceil(days / 30),   days = (end - start) + 1
//! ```
//!
//! so 1..=30 days bill one month and 31 days bill two. This is a day-bucket
//! count, not a calendar-month difference, and consumers depend on exactly
//! this rounding.
//!
//! Aggregation never fails: a period that does not intersect the range, or
//! whose end precedes its start, contributes zero.

use chrono::NaiveDate;
use core_kernel::DateRange;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::subscription::Subscription;

/// Days per billing bucket
pub const DAYS_PER_BUCKET: i64 = 30;

/// The billable slice of a subscription: price and active dates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPeriod {
    /// Monthly price
    pub price: u64,
    /// First active day
    pub start: NaiveDate,
    /// Last active day; open-ended when absent
    pub end: Option<NaiveDate>,
}

impl SubscriptionPeriod {
    pub fn new(price: u64, start: NaiveDate, end: Option<NaiveDate>) -> Self {
        Self { price, start, end }
    }

    /// Intersection of this period with `range`, with an open end clamped to `range.to`
    pub fn overlap(&self, range: &DateRange) -> DateRange {
        let end = self.end.unwrap_or(range.to);
        range.intersect(&DateRange::new(self.start, end))
    }
}

impl From<&Subscription> for SubscriptionPeriod {
    /// A stored subscription is active from the first day of its start month
    /// to the last day of its end month. Negative prices bill nothing.
    fn from(sub: &Subscription) -> Self {
        Self {
            price: u64::try_from(sub.price).unwrap_or(0),
            start: sub.start_date.first_day(),
            end: sub.end_date.map(|end| end.last_day()),
        }
    }
}

/// Per-period result of an aggregation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingContribution {
    pub price: u64,
    pub months_billed: u32,
}

impl BillingContribution {
    pub fn amount(&self) -> u64 {
        self.price.saturating_mul(u64::from(self.months_billed))
    }
}

/// Number of 30-day buckets in the inclusive span `start..=end`
///
/// Returns zero when `end` precedes `start`.
pub fn months_billed(start: NaiveDate, end: NaiveDate) -> u32 {
    if end < start {
        return 0;
    }
    let days = (end - start).num_days() + 1;
    let buckets = (days + DAYS_PER_BUCKET - 1) / DAYS_PER_BUCKET;
    u32::try_from(buckets).unwrap_or(u32::MAX)
}

/// The contribution of one period to the total over `range`
pub fn contribution(range: &DateRange, period: &SubscriptionPeriod) -> BillingContribution {
    let overlap = period.overlap(range);
    BillingContribution {
        price: period.price,
        months_billed: months_billed(overlap.from, overlap.to),
    }
}

/// Total billed amount of `periods` within `range`
///
/// Contributions are summed with saturating addition, so the result does
/// not depend on the order of `periods`.
pub fn total_billed<'a, I>(range: &DateRange, periods: I) -> u64
where
    I: IntoIterator<Item = &'a SubscriptionPeriod>,
{
    let mut count = 0usize;
    let total = periods
        .into_iter()
        .inspect(|_| count += 1)
        .map(|period| contribution(range, period).amount())
        .fold(0u64, u64::saturating_add);

    trace!(from = %range.from, to = %range.to, periods = count, total, "Aggregated billed total");
    total
}
