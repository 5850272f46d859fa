//! Wishlist entries (set semantics keyed by product).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::Entity;
use super::id::ProductId;

/// A product saved to the wishlist. Presence is the only meaningful state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WishlistEntry {
    pub product_id: ProductId,
    pub added_at: DateTime<Utc>,
}

impl WishlistEntry {
    /// Entry for `product_id` stamped now.
    #[must_use]
    pub fn now(product_id: ProductId) -> Self {
        Self {
            product_id,
            added_at: Utc::now(),
        }
    }
}

impl Entity for WishlistEntry {
    type Key = ProductId;

    fn key(&self) -> ProductId {
        self.product_id.clone()
    }
}
