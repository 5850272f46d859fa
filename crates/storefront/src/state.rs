//! Storefront context shared by every consumer.

use std::sync::Arc;

use shopstate_core::ProductFilter;
use tracing::{info, warn};

use crate::catalog::ProductCatalog;
use crate::config::StoreConfig;
use crate::identity::IdentitySignal;
use crate::infinite::InfiniteList;
use crate::remote::{Backend, RemoteError};
use crate::storage::{self, LocalStorage, StorageError};
use crate::stores::{CartStore, CouponStore, OrdersStore, WishlistStore};

/// Error building a [`Storefront`] from configuration.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("local storage: {0}")]
    Storage(#[from] StorageError),
    #[error("remote backend: {0}")]
    Remote(#[from] RemoteError),
}

/// One application instance's stores, wired to the same identity, device
/// storage and backend.
///
/// This struct is cheaply cloneable via `Arc`. Separate instances share
/// nothing unless given the same storage or backend.
#[derive(Clone)]
pub struct Storefront {
    inner: Arc<StorefrontInner>,
}

struct StorefrontInner {
    config: StoreConfig,
    identity: IdentitySignal,
    cart: CartStore,
    wishlist: WishlistStore,
    coupon: CouponStore,
    orders: OrdersStore,
    catalog: ProductCatalog,
}

impl std::fmt::Debug for Storefront {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storefront")
            .field("config", &self.inner.config)
            .field("identity", &self.inner.identity.current())
            .finish_non_exhaustive()
    }
}

impl Storefront {
    /// Wire every store to the given collaborators. Nothing is loaded until
    /// [`Storefront::start`].
    #[must_use]
    pub fn new(
        config: StoreConfig,
        identity: IdentitySignal,
        storage: Arc<dyn LocalStorage>,
        backend: &Backend,
    ) -> Self {
        let cart = CartStore::new(
            identity.clone(),
            Arc::clone(&storage),
            Arc::clone(&backend.carts),
        );
        let wishlist = WishlistStore::new(
            identity.clone(),
            Arc::clone(&storage),
            Arc::clone(&backend.wishlists),
        );
        let coupon = CouponStore::new(
            identity.clone(),
            Arc::clone(&storage),
            Arc::clone(&backend.coupons),
            Arc::clone(&backend.coupon_rules),
        );
        let orders = OrdersStore::new(identity.clone(), storage, Arc::clone(&backend.orders));
        let catalog = ProductCatalog::new(Arc::clone(&backend.catalog), &config.catalog);

        Self {
            inner: Arc::new(StorefrontInner {
                config,
                identity,
                cart,
                wishlist,
                coupon,
                orders,
                catalog,
            }),
        }
    }

    /// Build storage and backend from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage directory or HTTP client cannot be set up.
    pub fn from_config(config: StoreConfig, identity: IdentitySignal) -> Result<Self, ContextError> {
        let storage = storage::from_config(&config.storage)?;
        let backend = Backend::from_config(&config)?;
        Ok(Self::new(config, identity, storage, &backend))
    }

    /// Load the catalog and start every domain store.
    ///
    /// A catalog failure is recorded in its error cell and does not stop the
    /// domain stores.
    pub async fn start(&self) {
        let inner = &self.inner;
        let (catalog, (), (), (), ()) = tokio::join!(
            inner.catalog.init(),
            inner.cart.start(),
            inner.wishlist.start(),
            inner.coupon.start(),
            inner.orders.start(),
        );
        if let Err(e) = catalog {
            warn!(error = %e, "Catalog unavailable at startup");
        }
        info!(identity = ?inner.identity.current(), "Storefront started");
    }

    /// Infinite list over the catalog with the configured page size.
    #[must_use]
    pub fn browse(&self, filter: ProductFilter) -> InfiniteList {
        InfiniteList::for_catalog(&self.inner.catalog, self.inner.config.page_size, filter)
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn identity(&self) -> &IdentitySignal {
        &self.inner.identity
    }

    #[must_use]
    pub fn cart(&self) -> &CartStore {
        &self.inner.cart
    }

    #[must_use]
    pub fn wishlist(&self) -> &WishlistStore {
        &self.inner.wishlist
    }

    #[must_use]
    pub fn coupon(&self) -> &CouponStore {
        &self.inner.coupon
    }

    #[must_use]
    pub fn orders(&self) -> &OrdersStore {
        &self.inner.orders
    }

    #[must_use]
    pub fn catalog(&self) -> &ProductCatalog {
        &self.inner.catalog
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use shopstate_core::{Price, Product, UserId};

    use super::*;
    use crate::remote::memory::MemoryBackend;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_start_wires_every_store() {
        let backend = MemoryBackend::new();
        backend.put_product(Product::new("p1", "Tee", Price::from_cents(1000)));
        let identity = IdentitySignal::new();
        identity.resolve(Some(UserId::new("u1")));

        let storefront = Storefront::new(
            StoreConfig::default(),
            identity,
            Arc::new(MemoryStorage::new()),
            &Backend::memory(&backend),
        );
        storefront.start().await;

        assert!(storefront.catalog().loaded());
        assert!(!storefront.cart().is_guest());
        assert!(!storefront.wishlist().is_guest());
        assert_eq!(backend.call_count("carts", "subscribe"), 1);
        assert_eq!(backend.call_count("orders", "list"), 1);

        let list = storefront.browse(ProductFilter::default());
        list.load_more().await;
        assert_eq!(list.items().with(Vec::len), 1);
        assert!(list.is_done());
    }
}
