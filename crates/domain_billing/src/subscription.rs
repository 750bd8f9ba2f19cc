//! Subscription entities and summary requests
//!
//! Validation is explicit: each type derives [`Validate`] and callers invoke
//! `validate()` on the value they hold. There is no shared validator state.

use core_kernel::{DateRange, MonthDate};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::error::BillingError;

/// Validates any billing value
///
/// Stateless; the value is passed in and nothing is registered globally.
pub fn validate<T: Validate>(value: &T) -> Result<(), BillingError> {
    value.validate()?;
    Ok(())
}

/// A stored user subscription to a paid service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_subscription_period"))]
pub struct Subscription {
    /// Subscription identifier
    pub id: i64,
    /// Name of the subscribed service
    #[validate(length(min = 1))]
    pub service_name: String,
    /// Monthly price in whole currency units
    #[validate(range(min = 0))]
    pub price: i32,
    /// Owning user
    pub user_id: Uuid,
    /// First billed month
    pub start_date: MonthDate,
    /// Last billed month; open-ended when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<MonthDate>,
}

/// Data for creating a new subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_new_subscription_period"))]
pub struct NewSubscription {
    #[validate(length(min = 1))]
    pub service_name: String,
    #[validate(range(min = 0))]
    pub price: i32,
    pub user_id: Uuid,
    pub start_date: MonthDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<MonthDate>,
}

impl NewSubscription {
    /// Attaches a storage identifier, producing the stored entity
    pub fn with_id(self, id: i64) -> Subscription {
        Subscription {
            id,
            service_name: self.service_name,
            price: self.price,
            user_id: self.user_id,
            start_date: self.start_date,
            end_date: self.end_date,
        }
    }
}

/// Request for the total cost of subscriptions active within a month range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_summary_range"))]
pub struct SummaryRequest {
    /// First month of the period
    pub from: MonthDate,
    /// Last month of the period, inclusive
    pub to: MonthDate,
    /// Restrict to one user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    /// Restrict to one service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1))]
    pub service_name: Option<String>,
}

impl SummaryRequest {
    pub fn new(from: MonthDate, to: MonthDate) -> Self {
        Self {
            from,
            to,
            user_id: None,
            service_name: None,
        }
    }

    /// Parses a request from `MM-YYYY` month texts
    pub fn parse(from: &str, to: &str) -> Result<Self, BillingError> {
        Ok(Self::new(from.parse()?, to.parse()?))
    }

    pub fn for_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn for_service(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    /// The inclusive day range from the first day of `from` to the last day of `to`
    pub fn date_range(&self) -> DateRange {
        DateRange::months(self.from, self.to)
    }
}

fn check_period(start: MonthDate, end: Option<MonthDate>) -> Result<(), ValidationError> {
    match end {
        Some(end) if end < start => Err(ValidationError::new("end_before_start")),
        _ => Ok(()),
    }
}

fn validate_subscription_period(sub: &Subscription) -> Result<(), ValidationError> {
    check_period(sub.start_date, sub.end_date)
}

fn validate_new_subscription_period(sub: &NewSubscription) -> Result<(), ValidationError> {
    check_period(sub.start_date, sub.end_date)
}

fn validate_summary_range(req: &SummaryRequest) -> Result<(), ValidationError> {
    if req.from > req.to {
        return Err(ValidationError::new("from_after_to"));
    }
    Ok(())
}
