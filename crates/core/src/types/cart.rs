//! Cart lines and their natural key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::Entity;
use super::error::ValidationError;
use super::id::{ProductId, require_non_blank};
use super::price::Price;
use super::product::Product;

/// Identifies a purchasable line: one product in one color and size.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CartLineKey {
    pub product_id: ProductId,
    pub color: String,
    pub size: String,
}

impl CartLineKey {
    /// Build a key, rejecting blank components.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::EmptyIdentifier` if any component is blank.
    pub fn new(
        product_id: impl Into<ProductId>,
        color: impl Into<String>,
        size: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let product_id = product_id.into();
        let color = color.into().trim().to_string();
        let size = size.into().trim().to_string();
        require_non_blank("product_id", product_id.as_str())?;
        require_non_blank("color", &color)?;
        require_non_blank("size", &size)?;
        Ok(Self {
            product_id,
            color,
            size,
        })
    }

    /// Flat string form `"{product}_{color}_{size}"`, stable across guest and owned realms.
    #[must_use]
    pub fn compound_id(&self) -> String {
        format!("{}_{}_{}", self.product_id, self.color, self.size)
    }
}

impl std::fmt::Display for CartLineKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.compound_id())
    }
}

/// A line in a cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: ProductId,
    pub color: String,
    pub size: String,
    /// Always at least 1; a line at zero is removed instead.
    pub quantity: u32,
    pub unit_price: Price,
    pub title: String,
    pub image: String,
    pub added_at: DateTime<Utc>,
}

impl CartLine {
    /// New line for `quantity` units of `product`, priced and titled from the product.
    ///
    /// `quantity` is coerced up to 1.
    #[must_use]
    pub fn for_product(product: &Product, key: CartLineKey, quantity: u32) -> Self {
        Self {
            product_id: key.product_id,
            color: key.color,
            size: key.size,
            quantity: quantity.max(1),
            unit_price: product.price,
            title: product.title.clone(),
            image: product.image_urls.first().cloned().unwrap_or_default(),
            added_at: Utc::now(),
        }
    }

    /// Line total (`unit_price × quantity`).
    #[must_use]
    pub fn line_total(&self) -> Price {
        self.unit_price.times(self.quantity)
    }

    /// Copy of the line with a different quantity (coerced up to 1).
    #[must_use]
    pub fn with_quantity(&self, quantity: u32) -> Self {
        Self {
            quantity: quantity.max(1),
            ..self.clone()
        }
    }
}

impl Entity for CartLine {
    type Key = CartLineKey;

    fn key(&self) -> CartLineKey {
        CartLineKey {
            product_id: self.product_id.clone(),
            color: self.color.clone(),
            size: self.size.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_key_rejects_blank_components() {
        assert_eq!(
            CartLineKey::new("p1", " ", "M").unwrap_err(),
            ValidationError::EmptyIdentifier("color")
        );
        assert_eq!(
            CartLineKey::new("", "red", "M").unwrap_err(),
            ValidationError::EmptyIdentifier("product_id")
        );
    }

    #[test]
    fn test_compound_id() {
        let key = CartLineKey::new("p1", "red", "M").unwrap();
        assert_eq!(key.compound_id(), "p1_red_M");
    }

    #[test]
    fn test_line_key_round_trips_through_entity() {
        let product = Product::new("p1", "Tee", Price::from_cents(1000));
        let key = CartLineKey::new("p1", "red", "M").unwrap();
        let line = CartLine::for_product(&product, key.clone(), 0);
        assert_eq!(line.quantity, 1);
        assert_eq!(line.key(), key);
        assert_eq!(line.with_quantity(3).line_total(), Price::from_cents(3000));
    }
}
