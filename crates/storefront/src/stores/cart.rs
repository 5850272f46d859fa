//! Shopping cart.
//!
//! Lines are keyed by (product, color, size). Adding an existing key adds to
//! its quantity; on login, guest quantities are summed into the owner's.

use std::sync::Arc;

use shopstate_core::{CartLine, CartLineKey, Price, Product};
use tracing::instrument;

use crate::engine::{Domain, Items, Mode, SyncEngine};
use crate::error::{Result, StoreError, add_breadcrumb};
use crate::identity::IdentitySignal;
use crate::reactive::{Derived, Observable};
use crate::remote::RemoteStore;
use crate::storage::{GUEST_CART_KEY, LocalStorage};

/// Cart policy for the sync engine.
#[derive(Debug)]
pub struct CartDomain;

impl Domain for CartDomain {
    type Entry = CartLine;
    const NAME: &'static str = "cart";
    const GUEST_KEY: Option<&'static str> = Some(GUEST_CART_KEY);

    fn merge(guest: &CartLine, remote: Option<&CartLine>) -> Option<CartLine> {
        Some(match remote {
            Some(existing) => {
                existing.with_quantity(existing.quantity.saturating_add(guest.quantity))
            }
            None => guest.clone(),
        })
    }
}

/// Cart store handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CartStore {
    engine: SyncEngine<CartDomain>,
    subtotal: Arc<Derived<Items<CartLine>, Price>>,
    count: Arc<Derived<Items<CartLine>, u32>>,
}

impl CartStore {
    #[must_use]
    pub fn new(
        identity: IdentitySignal,
        storage: Arc<dyn LocalStorage>,
        remote: Arc<dyn RemoteStore<CartLine>>,
    ) -> Self {
        let engine = SyncEngine::new(identity, storage, remote);
        let subtotal = Derived::new(engine.items(), |items: &Items<CartLine>| {
            items.values().map(CartLine::line_total).sum()
        });
        let count = Derived::new(engine.items(), |items: &Items<CartLine>| {
            items
                .values()
                .fold(0u32, |total, line| total.saturating_add(line.quantity))
        });
        Self {
            engine,
            subtotal: Arc::new(subtotal),
            count: Arc::new(count),
        }
    }

    /// Load guest state and start following identity changes.
    pub async fn start(&self) {
        self.engine.start().await;
    }

    /// Reload from the authoritative realm.
    pub async fn refresh(&self) {
        self.engine.refresh().await;
    }

    /// Add `quantity` (at least 1) units of `product` in `color` and `size`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Validation` for a blank key component, otherwise
    /// the engine's persistence or remote errors.
    #[instrument(skip(self, product), fields(product_id = %product.id))]
    pub async fn add(
        &self,
        product: &Product,
        color: &str,
        size: &str,
        quantity: u32,
    ) -> Result<()> {
        let key = CartLineKey::new(product.id.clone(), color, size)?;
        let quantity = quantity.max(1);
        let compound = key.compound_id();
        add_breadcrumb("cart", "Added line", Some(&[("line", compound.as_str())]));

        let line_key = key.clone();
        self.engine
            .mutate(key, |current| {
                Some(match current {
                    Some(line) => line.with_quantity(line.quantity.saturating_add(quantity)),
                    None => CartLine::for_product(product, line_key, quantity),
                })
            })
            .await?;
        Ok(())
    }

    /// Set the quantity of an existing line. Zero or less removes it; a
    /// missing line is left alone.
    ///
    /// # Errors
    ///
    /// Same as [`CartStore::add`].
    pub async fn set_quantity(&self, key: &CartLineKey, quantity: i64) -> Result<()> {
        if quantity <= 0 {
            return self.remove(key).await;
        }
        let quantity = u32::try_from(quantity).unwrap_or(u32::MAX);
        self.engine
            .mutate(key.clone(), |current| {
                current.map(|line| line.with_quantity(quantity))
            })
            .await?;
        Ok(())
    }

    /// Remove a line.
    ///
    /// # Errors
    ///
    /// Same as [`CartStore::add`].
    pub async fn remove(&self, key: &CartLineKey) -> Result<()> {
        let compound = key.compound_id();
        add_breadcrumb("cart", "Removed line", Some(&[("line", compound.as_str())]));
        self.engine.mutate(key.clone(), |_| None).await?;
        Ok(())
    }

    /// Remove every line.
    ///
    /// # Errors
    ///
    /// Same as [`CartStore::add`].
    pub async fn clear(&self) -> Result<()> {
        self.engine.clear().await
    }

    /// Lines in key order.
    #[must_use]
    pub fn lines(&self) -> Vec<CartLine> {
        self.engine
            .items()
            .with(|items| items.values().cloned().collect())
    }

    #[must_use]
    pub fn line(&self, key: &CartLineKey) -> Option<CartLine> {
        self.engine.items().with(|items| items.get(key).cloned())
    }

    /// Total number of units across all lines.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count.get()
    }

    /// Sum of line totals.
    #[must_use]
    pub fn subtotal(&self) -> Price {
        self.subtotal.get()
    }

    #[must_use]
    pub fn items(&self) -> &Observable<Items<CartLine>> {
        self.engine.items()
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.engine.mode()
    }

    #[must_use]
    pub fn mode_cell(&self) -> &Observable<Mode> {
        self.engine.mode_cell()
    }

    #[must_use]
    pub fn is_guest(&self) -> bool {
        self.engine.is_guest()
    }

    #[must_use]
    pub fn loading(&self) -> &Observable<bool> {
        self.engine.loading()
    }

    #[must_use]
    pub fn error(&self) -> &Observable<Option<StoreError>> {
        self.engine.error()
    }

    #[must_use]
    pub const fn engine(&self) -> &SyncEngine<CartDomain> {
        &self.engine
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use shopstate_core::{UserId, ValidationError};

    use super::*;
    use crate::remote::memory::MemoryBackend;
    use crate::storage::{MemoryStorage, read_json};

    fn tee() -> Product {
        Product::new("p1", "Tee", Price::from_cents(1500))
    }

    async fn guest_cart(storage: &Arc<MemoryStorage>) -> CartStore {
        let identity = IdentitySignal::new();
        identity.resolve(None);
        let cart = CartStore::new(
            identity,
            Arc::clone(storage) as Arc<dyn LocalStorage>,
            Arc::new(MemoryBackend::new().carts()),
        );
        cart.start().await;
        cart
    }

    #[test]
    fn test_merge_sums_quantities() {
        let key = CartLineKey::new("p1", "red", "M").unwrap();
        let guest = CartLine::for_product(&tee(), key.clone(), 2);
        let remote = CartLine::for_product(&tee(), key, 1);

        let merged = CartDomain::merge(&guest, Some(&remote)).unwrap();
        assert_eq!(merged.quantity, 3);
        assert_eq!(CartDomain::merge(&guest, None).unwrap().quantity, 2);
    }

    #[tokio::test]
    async fn test_add_accumulates_quantity() {
        let storage = Arc::new(MemoryStorage::new());
        let cart = guest_cart(&storage).await;

        cart.add(&tee(), "red", "M", 1).await.unwrap();
        cart.add(&tee(), "red", "M", 2).await.unwrap();

        let key = CartLineKey::new("p1", "red", "M").unwrap();
        assert_eq!(cart.line(&key).unwrap().quantity, 3);
        assert_eq!(cart.lines().len(), 1);
        assert_eq!(cart.count(), 3);
        assert_eq!(cart.subtotal(), Price::from_cents(4500));

        let stored: Vec<CartLine> = read_json(storage.as_ref(), GUEST_CART_KEY)
            .unwrap()
            .unwrap();
        assert_eq!(stored[0].quantity, 3);
    }

    #[tokio::test]
    async fn test_add_rejects_blank_variant() {
        let storage = Arc::new(MemoryStorage::new());
        let cart = guest_cart(&storage).await;

        let err = cart.add(&tee(), "", "M", 1).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::Validation(ValidationError::EmptyIdentifier("color"))
        );
        assert!(cart.lines().is_empty());
        assert_eq!(storage.read(GUEST_CART_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_quantity_zero_removes() {
        let storage = Arc::new(MemoryStorage::new());
        let cart = guest_cart(&storage).await;
        let key = CartLineKey::new("p1", "red", "M").unwrap();

        cart.add(&tee(), "red", "M", 2).await.unwrap();
        cart.set_quantity(&key, 5).await.unwrap();
        assert_eq!(cart.line(&key).unwrap().quantity, 5);

        cart.set_quantity(&key, 0).await.unwrap();
        assert!(cart.line(&key).is_none());
        assert_eq!(cart.subtotal(), Price::ZERO);
    }

    #[tokio::test]
    async fn test_set_quantity_on_missing_line_is_noop() {
        let storage = Arc::new(MemoryStorage::new());
        let cart = guest_cart(&storage).await;
        let key = CartLineKey::new("p9", "blue", "S").unwrap();

        cart.set_quantity(&key, 4).await.unwrap();
        assert!(cart.lines().is_empty());
    }

    #[tokio::test]
    async fn test_owned_clear_empties_remote() {
        let owner = UserId::new("u1");
        let identity = IdentitySignal::new();
        identity.resolve(Some(owner.clone()));
        let backend = MemoryBackend::new();
        let cart = CartStore::new(
            identity,
            Arc::new(MemoryStorage::new()),
            Arc::new(backend.carts()),
        );
        cart.start().await;

        cart.add(&tee(), "red", "M", 1).await.unwrap();
        cart.add(&tee(), "blue", "L", 1).await.unwrap();
        assert_eq!(backend.carts().rows(&owner).len(), 2);

        cart.clear().await.unwrap();
        assert!(cart.lines().is_empty());
        assert!(backend.carts().rows(&owner).is_empty());
    }
}
