//! Billing domain errors

use core_kernel::TemporalError;
use thiserror::Error;
use validator::ValidationErrors;

/// Errors that can occur in the billing domain
#[derive(Debug, Error)]
pub enum BillingError {
    /// A subscription or summary request failed validation
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    /// A month date could not be parsed or built
    #[error("Invalid date: {0}")]
    Temporal(#[from] TemporalError),
}
