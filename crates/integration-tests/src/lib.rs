//! Integration tests for the shopstate storefront state layer.
//!
//! Every scenario runs against [`MemoryBackend`], the in-process remote.
//! Several [`Device`]s can share one backend to model a user on more than one
//! device; each device has its own identity signal and local storage.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p shopstate-integration-tests
//! ```
//!
//! # Test Categories
//!
//! - `login_merge` - Guest to owned transitions and merge semantics
//! - `rollback` - Optimistic updates whose remote write fails
//! - `live_sync` - Feeds, echoes, account switches and multiple devices
//! - `coupons` - Rule validation across restarts and logins
//! - `orders` - Order validation and history
//! - `pagination` - Infinite list over the catalog

#![allow(clippy::missing_panics_doc)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use shopstate_core::{CartLineKey, Price, Product, UserId};
use shopstate_storefront::engine::Mode;
use shopstate_storefront::reactive::Observable;
use shopstate_storefront::remote::Backend;
use shopstate_storefront::remote::memory::MemoryBackend;
use shopstate_storefront::storage::{LocalStorage, MemoryStorage};
use shopstate_storefront::stores::CartStore;
use shopstate_storefront::{IdentitySignal, StoreConfig, Storefront};

/// How long a scenario waits for a reactive cell before failing.
pub const WAIT: Duration = Duration::from_secs(2);

/// One application instance: its own identity and device storage.
pub struct Device {
    pub storefront: Storefront,
    pub identity: IdentitySignal,
    pub storage: Arc<MemoryStorage>,
}

impl Device {
    /// Device with empty storage and an unresolved identity.
    #[must_use]
    pub fn new(backend: &MemoryBackend) -> Self {
        Self::with_storage(backend, Arc::new(MemoryStorage::new()))
    }

    /// Device reusing `storage`, as after an application restart.
    #[must_use]
    pub fn with_storage(backend: &MemoryBackend, storage: Arc<MemoryStorage>) -> Self {
        let identity = IdentitySignal::new();
        let storefront = Storefront::new(
            StoreConfig::default(),
            identity.clone(),
            Arc::clone(&storage) as Arc<dyn LocalStorage>,
            &Backend::memory(backend),
        );
        Self {
            storefront,
            identity,
            storage,
        }
    }

    /// Resolve the identity as a guest and start every store.
    pub async fn start_as_guest(&self) {
        self.identity.resolve(None);
        self.storefront.start().await;
    }

    /// Resolve the identity as `user` and start every store.
    pub async fn start_as(&self, user: &UserId) {
        self.identity.resolve(Some(user.clone()));
        self.storefront.start().await;
    }

    #[must_use]
    pub fn cart(&self) -> &CartStore {
        self.storefront.cart()
    }

    /// Sign in and wait until every domain store is bound to `user`.
    pub async fn sign_in(&self, user: &UserId) {
        self.identity.sign_in(user.clone());
        self.settle(&Mode::Owned(user.clone())).await;
    }

    /// Sign out and wait until every domain store shows the guest realm.
    pub async fn sign_out(&self) {
        self.identity.sign_out();
        self.settle(&Mode::Guest).await;
    }

    async fn settle(&self, mode: &Mode) {
        let storefront = &self.storefront;
        eventually(storefront.cart().mode_cell(), |m| m == mode).await;
        eventually(storefront.wishlist().mode_cell(), |m| m == mode).await;
        eventually(storefront.coupon().mode_cell(), |m| m == mode).await;
        eventually(storefront.orders().mode_cell(), |m| m == mode).await;
    }
}

/// Wait until `pred` holds for `cell`, failing the test after [`WAIT`].
pub async fn eventually<T, F>(cell: &Observable<T>, pred: F) -> T
where
    T: Clone + Send + Sync + 'static,
    F: FnMut(&T) -> bool,
{
    tokio::time::timeout(WAIT, cell.wait_until(pred))
        .await
        .unwrap_or_else(|_| panic!("condition not reached within {WAIT:?}"))
}

/// Product with one color and size, priced in cents.
#[must_use]
pub fn product(id: &str, cents: i64) -> Product {
    Product {
        category: "tops".to_string(),
        colors: vec!["black".to_string()],
        sizes: vec!["M".to_string()],
        ..Product::new(id, format!("Product {id}"), Price::from_cents(cents))
    }
}

/// Key of `product`'s black / M line.
#[must_use]
pub fn line_key(product_id: &str) -> CartLineKey {
    CartLineKey::new(product_id, "black", "M")
        .unwrap_or_else(|e| panic!("invalid test key: {e}"))
}

/// Cart quantities by product id.
#[must_use]
pub fn quantities(cart: &CartStore) -> BTreeMap<String, u32> {
    cart.lines()
        .into_iter()
        .map(|line| (line.product_id.to_string(), line.quantity))
        .collect()
}
