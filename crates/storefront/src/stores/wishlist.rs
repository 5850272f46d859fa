//! Wishlist: a set of saved product ids.

use std::sync::Arc;

use shopstate_core::{ProductId, WishlistEntry, require_non_blank};
use tracing::instrument;

use crate::engine::{Domain, Items, Mode, SyncEngine};
use crate::error::{Result, StoreError, add_breadcrumb};
use crate::identity::IdentitySignal;
use crate::reactive::Observable;
use crate::remote::RemoteStore;
use crate::storage::{GUEST_WISHLIST_KEY, LocalStorage};

#[derive(Debug)]
pub struct WishlistDomain;

impl Domain for WishlistDomain {
    type Entry = WishlistEntry;
    const NAME: &'static str = "wishlist";
    const GUEST_KEY: Option<&'static str> = Some(GUEST_WISHLIST_KEY);

    /// Set union: an id already saved remotely needs no upload.
    fn merge(guest: &WishlistEntry, remote: Option<&WishlistEntry>) -> Option<WishlistEntry> {
        remote.is_none().then(|| guest.clone())
    }
}

/// Wishlist store handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct WishlistStore {
    engine: SyncEngine<WishlistDomain>,
}

impl WishlistStore {
    #[must_use]
    pub fn new(
        identity: IdentitySignal,
        storage: Arc<dyn LocalStorage>,
        remote: Arc<dyn RemoteStore<WishlistEntry>>,
    ) -> Self {
        Self {
            engine: SyncEngine::new(identity, storage, remote),
        }
    }

    pub async fn start(&self) {
        self.engine.start().await;
    }

    pub async fn refresh(&self) {
        self.engine.refresh().await;
    }

    /// Save `product_id` if absent, remove it if present.
    ///
    /// Returns whether the product is saved afterwards.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Validation` for a blank id, otherwise the engine's
    /// persistence or remote errors (a failed remote write is rolled back).
    #[instrument(skip(self), fields(product_id = %product_id))]
    pub async fn toggle(&self, product_id: &ProductId) -> Result<bool> {
        require_non_blank("product_id", product_id.as_str())?;
        let entry = self
            .engine
            .mutate(product_id.clone(), |current| match current {
                Some(_) => None,
                None => Some(WishlistEntry::now(product_id.clone())),
            })
            .await?;

        let saved = entry.is_some();
        add_breadcrumb(
            "wishlist",
            if saved { "Saved product" } else { "Unsaved product" },
            Some(&[("product_id", product_id.as_str())]),
        );
        Ok(saved)
    }

    /// Remove every saved product.
    ///
    /// # Errors
    ///
    /// Same as [`WishlistStore::toggle`].
    pub async fn clear(&self) -> Result<()> {
        self.engine.clear().await
    }

    #[must_use]
    pub fn contains(&self, product_id: &ProductId) -> bool {
        self.engine
            .items()
            .with(|items| items.contains_key(product_id))
    }

    /// Saved product ids in key order.
    #[must_use]
    pub fn ids(&self) -> Vec<ProductId> {
        self.engine.items().with(|items| items.keys().cloned().collect())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.engine.items().with(Items::<WishlistEntry>::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn items(&self) -> &Observable<Items<WishlistEntry>> {
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
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use shopstate_core::UserId;

    use super::*;
    use crate::remote::memory::MemoryBackend;
    use crate::storage::MemoryStorage;

    fn store(identity: &IdentitySignal, backend: &MemoryBackend) -> WishlistStore {
        WishlistStore::new(
            identity.clone(),
            Arc::new(MemoryStorage::new()),
            Arc::new(backend.wishlists()),
        )
    }

    #[tokio::test]
    async fn test_toggle_twice_is_identity() {
        let identity = IdentitySignal::new();
        identity.resolve(None);
        let wishlist = store(&identity, &MemoryBackend::new());
        wishlist.start().await;
        let id = ProductId::new("p1");

        assert!(wishlist.toggle(&id).await.unwrap());
        assert!(wishlist.contains(&id));
        assert!(!wishlist.toggle(&id).await.unwrap());
        assert!(wishlist.is_empty());
    }

    #[tokio::test]
    async fn test_toggle_rejects_blank_id() {
        let identity = IdentitySignal::new();
        identity.resolve(None);
        let wishlist = store(&identity, &MemoryBackend::new());
        wishlist.start().await;

        let err = wishlist.toggle(&ProductId::new("  ")).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_owned_toggle_failure_rolls_back() {
        let owner = UserId::new("u1");
        let identity = IdentitySignal::new();
        identity.resolve(Some(owner.clone()));
        let backend = MemoryBackend::new();
        let wishlist = store(&identity, &backend);
        wishlist.start().await;

        backend.fail_next_writes(1);
        let err = wishlist.toggle(&ProductId::new("p1")).await.unwrap_err();

        assert!(matches!(err, StoreError::RemoteWrite(_)));
        assert!(wishlist.is_empty());
        assert!(backend.wishlists().rows(&owner).is_empty());
        assert_eq!(wishlist.error().get(), Some(err));
    }

    #[test]
    fn test_merge_is_union() {
        let guest = WishlistEntry::now(ProductId::new("p1"));
        assert!(WishlistDomain::merge(&guest, None).is_some());
        assert!(WishlistDomain::merge(&guest, Some(&guest)).is_none());
    }
}
