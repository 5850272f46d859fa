//! Shape validation errors raised before any state change.

use thiserror::Error;

/// Malformed input to a store mutation.
///
/// Validation failures are synchronous rejections: nothing has been applied
/// in memory, persisted locally, or sent to the remote backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required identifier or key component was blank.
    #[error("{0} must not be empty")]
    EmptyIdentifier(&'static str),

    /// An order was submitted without line items.
    #[error("order has no line items")]
    EmptyOrder,

    /// An order total was below zero.
    #[error("order total must not be negative (got {0})")]
    NegativeTotal(String),

    /// A coupon percentage outside `0..=100`.
    #[error("coupon percent must be between 0 and 100 (got {0})")]
    PercentOutOfRange(i64),
}
