//! Coupon codes, their remote rules, and the per-owner applied coupon.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::entity::Entity;
use super::error::ValidationError;

/// Normalize user input: trimmed and upper-cased. Blank input means "reset".
#[must_use]
pub fn normalize_code(input: &str) -> String {
    input.trim().to_uppercase()
}

/// Server-side rule for a coupon code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponRule {
    pub code: String,
    pub active: bool,
    pub percent: u8,
}

impl CouponRule {
    /// Build a rule, checking the percentage range.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::PercentOutOfRange` if `percent` is outside `0..=100`.
    pub fn new(code: &str, active: bool, percent: i64) -> Result<Self, ValidationError> {
        let percent = u8::try_from(percent)
            .ok()
            .filter(|p| *p <= 100)
            .ok_or(ValidationError::PercentOutOfRange(percent))?;
        Ok(Self {
            code: normalize_code(code),
            active,
            percent,
        })
    }
}

/// The coupon state a consumer sees for the current owner.
///
/// Invariant: `valid == false` implies `percent == 0`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coupon {
    pub code: String,
    pub valid: bool,
    pub percent: u8,
}

impl Coupon {
    /// No coupon applied.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Evaluate `code` against the rule found for it (if any).
    #[must_use]
    pub fn evaluate(code: &str, rule: Option<&CouponRule>) -> Self {
        let valid = rule.is_some_and(|r| r.active);
        Self {
            code: normalize_code(code),
            valid,
            percent: if valid {
                rule.map_or(0, |r| r.percent.min(100))
            } else {
                0
            },
        }
    }

    /// Discount fraction in `0..=1`; zero unless the coupon is valid.
    #[must_use]
    pub fn discount_fraction(&self) -> Decimal {
        if self.valid && self.percent > 0 {
            Decimal::from(self.percent) / Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        }
    }

    /// Whether a code has been entered at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}

/// The coupon code an owner has applied, as stored remotely (one per owner).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedCoupon {
    pub code: String,
}

/// Key of the per-owner coupon slot. There is exactly one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CouponSlot;

impl Entity for AppliedCoupon {
    type Key = CouponSlot;

    fn key(&self) -> CouponSlot {
        CouponSlot
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_code() {
        assert_eq!(normalize_code("  save10 "), "SAVE10");
        assert_eq!(normalize_code("   "), "");
    }

    #[test]
    fn test_evaluate_active_rule() {
        let rule = CouponRule::new("save10", true, 10).unwrap();
        let coupon = Coupon::evaluate("save10", Some(&rule));
        assert!(coupon.valid);
        assert_eq!(coupon.percent, 10);
        assert_eq!(coupon.discount_fraction(), Decimal::new(1, 1));
    }

    #[test]
    fn test_evaluate_inactive_or_missing_rule() {
        let rule = CouponRule::new("SAVE10", false, 10).unwrap();
        let inactive = Coupon::evaluate("SAVE10", Some(&rule));
        assert!(!inactive.valid);
        assert_eq!(inactive.percent, 0);
        assert_eq!(inactive.discount_fraction(), Decimal::ZERO);

        let missing = Coupon::evaluate("NOPE", None);
        assert_eq!(missing.code, "NOPE");
        assert!(!missing.valid);
    }

    #[test]
    fn test_rule_percent_range() {
        assert_eq!(
            CouponRule::new("X", true, 101).unwrap_err(),
            ValidationError::PercentOutOfRange(101)
        );
        assert!(CouponRule::new("X", true, -5).is_err());
    }
}
