//! Orders: immutable financial records created at checkout.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::cart::CartLine;
use super::entity::Entity;
use super::error::ValidationError;
use super::id::{OrderId, ProductId};
use super::price::Price;

/// Where an order ships.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub full_name: String,
    pub phone: String,
    pub city: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip: Option<String>,
}

/// A purchased line, copied from the cart at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub title: String,
    pub unit_price: Price,
    pub color: String,
    pub size: String,
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl From<&CartLine> for OrderLine {
    fn from(line: &CartLine) -> Self {
        Self {
            product_id: line.product_id.clone(),
            title: line.title.clone(),
            unit_price: line.unit_price,
            color: line.color.clone(),
            size: line.size.clone(),
            quantity: line.quantity,
            image: (!line.image.is_empty()).then(|| line.image.clone()),
        }
    }
}

/// Monetary summary of an order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAmounts {
    pub subtotal: Price,
    pub discount: Price,
    pub total: Price,
}

/// What a caller submits to place an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDraft {
    pub delivery: Delivery,
    pub line_items: Vec<OrderLine>,
    pub amounts: OrderAmounts,
    pub coupon_code: Option<String>,
}

impl OrderDraft {
    /// Compose a draft from cart lines and a discount fraction (`0..=1`).
    ///
    /// This is a pure helper for checkout screens; the amounts are computed
    /// from the given values only.
    #[must_use]
    pub fn from_lines(
        delivery: Delivery,
        lines: &[CartLine],
        coupon_code: Option<String>,
        discount_fraction: Decimal,
    ) -> Self {
        let subtotal: Price = lines.iter().map(CartLine::line_total).sum();
        let discount = subtotal.scaled(discount_fraction);
        Self {
            delivery,
            line_items: lines.iter().map(OrderLine::from).collect(),
            amounts: OrderAmounts {
                subtotal,
                discount,
                total: subtotal - discount,
            },
            coupon_code: coupon_code.filter(|c| !c.trim().is_empty()),
        }
    }

    /// Last guard before an immutable record is created.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::EmptyOrder` when there are no line items and
    /// `ValidationError::NegativeTotal` when the total is below zero.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.line_items.is_empty() {
            return Err(ValidationError::EmptyOrder);
        }
        if self.amounts.total.is_negative() {
            return Err(ValidationError::NegativeTotal(
                self.amounts.total.to_string(),
            ));
        }
        Ok(())
    }
}

/// A placed order. Never mutated or deleted by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub delivery: Delivery,
    pub line_items: Vec<OrderLine>,
    pub amounts: OrderAmounts,
    pub coupon_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Stamp a validated draft with an id and creation time.
    #[must_use]
    pub fn from_draft(id: OrderId, draft: OrderDraft, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            delivery: draft.delivery,
            line_items: draft.line_items,
            amounts: draft.amounts,
            coupon_code: draft.coupon_code,
            created_at,
        }
    }
}

impl Entity for Order {
    type Key = OrderId;

    fn key(&self) -> OrderId {
        self.id.clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::cart::CartLineKey;
    use crate::types::product::Product;

    fn line(cents: i64, quantity: u32) -> CartLine {
        let product = Product::new("p1", "Tee", Price::from_cents(cents));
        CartLine::for_product(
            &product,
            CartLineKey::new("p1", "red", "M").unwrap(),
            quantity,
        )
    }

    #[test]
    fn test_from_lines_computes_amounts() {
        let draft = OrderDraft::from_lines(
            Delivery::default(),
            &[line(1000, 2)],
            Some("SAVE10".to_string()),
            Decimal::new(1, 1),
        );
        assert_eq!(draft.amounts.subtotal, Price::from_cents(2000));
        assert_eq!(draft.amounts.discount, Price::from_cents(200));
        assert_eq!(draft.amounts.total, Price::from_cents(1800));
        assert_eq!(draft.coupon_code.as_deref(), Some("SAVE10"));
        assert!(draft.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_order() {
        let draft = OrderDraft::from_lines(Delivery::default(), &[], None, Decimal::ZERO);
        assert_eq!(draft.validate().unwrap_err(), ValidationError::EmptyOrder);
    }

    #[test]
    fn test_validate_rejects_negative_total() {
        let mut draft =
            OrderDraft::from_lines(Delivery::default(), &[line(500, 1)], None, Decimal::ZERO);
        draft.amounts.total = Price::from_cents(-100);
        assert!(matches!(
            draft.validate().unwrap_err(),
            ValidationError::NegativeTotal(_)
        ));
    }

    #[test]
    fn test_blank_coupon_code_dropped() {
        let draft = OrderDraft::from_lines(
            Delivery::default(),
            &[line(500, 1)],
            Some("  ".to_string()),
            Decimal::ZERO,
        );
        assert_eq!(draft.coupon_code, None);
    }
}
