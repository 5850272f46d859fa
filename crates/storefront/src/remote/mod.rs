//! Remote backend contracts.
//!
//! Each domain talks to the backend through a [`RemoteStore`]; live changes
//! arrive as a [`ChangeFeed`], a channel of typed events consumed by a single
//! reconciliation loop per store. Two implementations ship with the crate:
//! [`memory::MemoryBackend`] (in-process, used by tests) and
//! [`rest::RestBackend`] (`PostgREST`-style HTTP).

pub mod memory;
pub mod rest;

use std::sync::Arc;

use async_trait::async_trait;
use shopstate_core::{
    AppliedCoupon, CartLine, CouponRule, Entity, Order, Product, ProductFilter, ProductId, UserId,
    WishlistEntry,
};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::StoreConfig;

/// Errors from a remote adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Network failure or backend down.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Backend answered with an error status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Response body could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Backend refused the operation (e.g. a constraint violation).
    #[error("Rejected: {0}")]
    Rejected(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            Self::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

impl From<url::ParseError> for RemoteError {
    fn from(err: url::ParseError) -> Self {
        Self::Unavailable(format!("invalid backend url: {err}"))
    }
}

/// Result type alias for `RemoteError`.
pub type Result<T> = std::result::Result<T, RemoteError>;

/// A change to one remote row.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent<E: Entity> {
    Insert(E),
    Update(E),
    Delete(E::Key),
}

impl<E: Entity> ChangeEvent<E> {
    /// Key of the affected row.
    #[must_use]
    pub fn key(&self) -> E::Key {
        match self {
            Self::Insert(entry) | Self::Update(entry) => entry.key(),
            Self::Delete(key) => key.clone(),
        }
    }
}

/// Live subscription to one owner's rows. Dropping the feed unsubscribes.
pub struct ChangeFeed<E: Entity> {
    rx: mpsc::UnboundedReceiver<Result<ChangeEvent<E>>>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl<E: Entity> ChangeFeed<E> {
    /// Feed over `rx`; `on_drop` runs when the feed is dropped.
    #[must_use]
    pub fn new(
        rx: mpsc::UnboundedReceiver<Result<ChangeEvent<E>>>,
        on_drop: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            rx,
            on_drop: Some(Box::new(on_drop)),
        }
    }

    /// Next event; `None` once the backend closed the feed.
    pub async fn next(&mut self) -> Option<Result<ChangeEvent<E>>> {
        self.rx.recv().await
    }
}

impl<E: Entity> Drop for ChangeFeed<E> {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.on_drop.take() {
            unsubscribe();
        }
    }
}

impl<E: Entity> std::fmt::Debug for ChangeFeed<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed").finish_non_exhaustive()
    }
}

/// Per-domain CRUD on rows owned by a user.
#[async_trait]
pub trait RemoteStore<E: Entity>: Send + Sync {
    /// All rows owned by `owner`.
    async fn list(&self, owner: &UserId) -> Result<Vec<E>>;

    /// Insert or replace the row with `entry`'s key.
    async fn upsert(&self, owner: &UserId, entry: &E) -> Result<()>;

    /// Delete the row with `key`. Deleting a missing row succeeds.
    async fn delete(&self, owner: &UserId, key: &E::Key) -> Result<()>;

    /// Delete every row owned by `owner`.
    async fn clear(&self, owner: &UserId) -> Result<()> {
        for entry in self.list(owner).await? {
            self.delete(owner, &entry.key()).await?;
        }
        Ok(())
    }

    /// Live changes to `owner`'s rows.
    async fn subscribe(&self, owner: &UserId) -> Result<ChangeFeed<E>>;
}

/// Coupon rule lookup.
#[async_trait]
pub trait CouponRules: Send + Sync {
    /// Rule for a normalized code, if one exists.
    async fn lookup(&self, code: &str) -> Result<Option<CouponRule>>;
}

/// A change anywhere in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogChanged;

/// Read access to the product catalog. Only active products are returned,
/// in creation order.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn list_products(&self) -> Result<Vec<Product>>;

    async fn fetch_product(&self, id: &ProductId) -> Result<Option<Product>>;

    /// One page (1-based) of products matching `filter`, in creation order.
    async fn fetch_page(
        &self,
        filter: &ProductFilter,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<Product>>;

    /// Notification of catalog changes. The receiver closes when the source stops.
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<CatalogChanged>>;
}

/// The adapters one storefront instance talks to.
#[derive(Clone)]
pub struct Backend {
    pub carts: Arc<dyn RemoteStore<CartLine>>,
    pub wishlists: Arc<dyn RemoteStore<WishlistEntry>>,
    pub coupons: Arc<dyn RemoteStore<AppliedCoupon>>,
    pub coupon_rules: Arc<dyn CouponRules>,
    pub orders: Arc<dyn RemoteStore<Order>>,
    pub catalog: Arc<dyn CatalogSource>,
}

impl Backend {
    /// Every adapter served by one in-process backend.
    #[must_use]
    pub fn memory(backend: &memory::MemoryBackend) -> Self {
        Self {
            carts: Arc::new(backend.carts()),
            wishlists: Arc::new(backend.wishlists()),
            coupons: Arc::new(backend.coupons()),
            coupon_rules: Arc::new(backend.clone()),
            orders: Arc::new(backend.orders()),
            catalog: Arc::new(backend.clone()),
        }
    }

    /// Every adapter served by one REST backend.
    #[must_use]
    pub fn rest(backend: &rest::RestBackend) -> Self {
        Self {
            carts: Arc::new(backend.table::<CartLine>()),
            wishlists: Arc::new(backend.table::<WishlistEntry>()),
            coupons: Arc::new(backend.table::<AppliedCoupon>()),
            coupon_rules: Arc::new(backend.clone()),
            orders: Arc::new(backend.table::<Order>()),
            catalog: Arc::new(backend.clone()),
        }
    }

    /// Backend selected by configuration: REST when a remote URL is set,
    /// otherwise a fresh in-process backend.
    ///
    /// # Errors
    ///
    /// Returns `RemoteError` if the HTTP client cannot be built.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        match &config.remote {
            Some(remote) => Ok(Self::rest(&rest::RestBackend::new(remote)?)),
            None => Ok(Self::memory(&memory::MemoryBackend::new())),
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").finish_non_exhaustive()
    }
}
