//! Product catalog.
//!
//! Read-only: the active products are loaded in bulk and kept in memory,
//! refreshed whenever the source reports a change. Single products fetched
//! by id are cached with `moka`, and browsing pages are served from memory
//! once the catalog is loaded or from the source before that.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use moka::future::Cache;
use shopstate_core::{Facets, Product, ProductFilter, ProductId};
use tracing::{debug, info, instrument, warn};

use crate::config::CatalogConfig;
use crate::engine::TaskGuard;
use crate::error::{Result, StoreError, report};
use crate::infinite::{Page, PageSource};
use crate::reactive::{Derived, Observable};
use crate::remote::CatalogSource;

/// Slice out one page (1-based) of `items`. Page 0 reads as page 1.
#[must_use]
pub fn paginate<T: Clone>(items: &[T], page: usize, per_page: usize) -> Vec<T> {
    let start = page.max(1).saturating_sub(1).saturating_mul(per_page);
    items.iter().skip(start).take(per_page).cloned().collect()
}

// =============================================================================
// ProductCatalog
// =============================================================================

/// Catalog handle. Cheap to clone.
#[derive(Clone)]
pub struct ProductCatalog {
    inner: Arc<CatalogInner>,
}

struct CatalogInner {
    source: Arc<dyn CatalogSource>,
    items: Observable<Vec<Product>>,
    loaded: Observable<bool>,
    error: Observable<Option<StoreError>>,
    facets: Derived<Vec<Product>, Facets>,
    cache: Cache<ProductId, Product>,
    /// Bumped per refresh; an older refresh never overwrites a newer one.
    generation: AtomicU64,
    listener: Mutex<Option<TaskGuard>>,
}

impl std::fmt::Debug for ProductCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProductCatalog")
            .field("loaded", &self.loaded())
            .field("products", &self.inner.items.with(Vec::len))
            .finish_non_exhaustive()
    }
}

impl ProductCatalog {
    #[must_use]
    pub fn new(source: Arc<dyn CatalogSource>, config: &CatalogConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(config.cache_ttl)
            .build();
        let items = Observable::new(Vec::new());
        let fallback = config.fallback_price_bounds;
        let facets = Derived::new(&items, move |products: &Vec<Product>| {
            Facets::from_products(products, fallback)
        });

        Self {
            inner: Arc::new(CatalogInner {
                source,
                items,
                loaded: Observable::new(false),
                error: Observable::new(None),
                facets,
                cache,
                generation: AtomicU64::new(0),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Load the catalog and follow changes. Calling it again once
    /// initialized is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::RemoteRead` if the initial load or the change
    /// subscription failed; `init` may be retried.
    #[instrument(skip(self))]
    pub async fn init(&self) -> Result<()> {
        if self.listening() {
            return Ok(());
        }
        self.refresh().await?;

        let mut changes = self
            .inner
            .source
            .subscribe()
            .await
            .map_err(|e| self.fail(StoreError::RemoteRead(e)))?;

        let weak: Weak<CatalogInner> = Arc::downgrade(&self.inner);
        let listener = tokio::spawn(async move {
            while changes.recv().await.is_some() {
                // Collapse a burst of notifications into one refresh
                while changes.try_recv().is_ok() {}
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let catalog = Self { inner };
                if let Err(e) = catalog.refresh().await {
                    warn!(error = %e, "Failed to refresh products");
                }
            }
            debug!("Catalog change feed closed");
        });
        *self.lock_listener() = Some(TaskGuard(listener));
        Ok(())
    }

    fn lock_listener(&self) -> std::sync::MutexGuard<'_, Option<TaskGuard>> {
        self.inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn listening(&self) -> bool {
        self.lock_listener().is_some()
    }

    /// Reload every active product.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::RemoteRead` if the source failed; the previous
    /// products stay visible.
    pub async fn refresh(&self) -> Result<()> {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let products = self
            .inner
            .source
            .list_products()
            .await
            .map_err(|e| self.fail(StoreError::RemoteRead(e)))?;

        if self.inner.generation.load(Ordering::SeqCst) != generation {
            debug!("Discarding superseded catalog load");
            return Ok(());
        }
        info!(count = products.len(), "Catalog loaded");
        self.inner.cache.invalidate_all();
        self.inner.items.set_if_changed(products);
        self.inner.loaded.set_if_changed(true);
        self.inner.error.set_if_changed(None);
        Ok(())
    }

    fn fail(&self, err: StoreError) -> StoreError {
        report("catalog", &err);
        self.inner.error.set(Some(err.clone()));
        err
    }

    /// Loaded product by id, without touching the source.
    #[must_use]
    pub fn by_id(&self, id: &ProductId) -> Option<Product> {
        self.inner
            .items
            .with(|products| products.iter().find(|p| p.id == *id).cloned())
    }

    /// Product by id: from the cache, the loaded catalog, or the source.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::RemoteRead` if the source had to be asked and failed.
    #[instrument(skip(self), fields(product_id = %id))]
    pub async fn fetch_one(&self, id: &ProductId) -> Result<Option<Product>> {
        if let Some(product) = self.inner.cache.get(id).await {
            debug!("Cache hit for product");
            return Ok(Some(product));
        }
        if let Some(product) = self.by_id(id) {
            return Ok(Some(product));
        }

        let fetched = self
            .inner
            .source
            .fetch_product(id)
            .await
            .map_err(|e| self.fail(StoreError::RemoteRead(e)))?;
        if let Some(product) = &fetched {
            self.inner.cache.insert(id.clone(), product.clone()).await;
        }
        Ok(fetched)
    }

    /// Loaded products matching `filter`, in catalog order.
    #[must_use]
    pub fn filtered(&self, filter: &ProductFilter) -> Vec<Product> {
        self.inner.items.with(|products| {
            products
                .iter()
                .filter(|product| filter.matches(product))
                .cloned()
                .collect()
        })
    }

    /// One page (1-based) of products matching `filter`: sliced from memory
    /// once loaded, otherwise queried from the source.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::RemoteRead` if the source failed.
    pub async fn fetch_page(
        &self,
        filter: &ProductFilter,
        page: usize,
        per_page: usize,
    ) -> Result<Page<Product>> {
        if self.loaded() {
            let matching = self.filtered(filter);
            let items = paginate(&matching, page, per_page);
            let seen = page.max(1).saturating_mul(per_page);
            return Ok(Page {
                has_more: seen < matching.len(),
                items,
            });
        }

        let items = self
            .inner
            .source
            .fetch_page(filter, page, per_page)
            .await
            .map_err(|e| self.fail(StoreError::RemoteRead(e)))?;
        Ok(Page {
            has_more: items.len() >= per_page,
            items,
        })
    }

    /// Category, color and size lists plus price bounds of the loaded catalog.
    #[must_use]
    pub fn facets(&self) -> Facets {
        self.inner.facets.get()
    }

    #[must_use]
    pub fn items(&self) -> &Observable<Vec<Product>> {
        &self.inner.items
    }

    #[must_use]
    pub fn loaded(&self) -> bool {
        self.inner.loaded.get()
    }

    #[must_use]
    pub fn loaded_cell(&self) -> &Observable<bool> {
        &self.inner.loaded
    }

    #[must_use]
    pub fn error(&self) -> &Observable<Option<StoreError>> {
        &self.inner.error
    }
}

#[async_trait]
impl PageSource for ProductCatalog {
    async fn page(
        &self,
        filter: &ProductFilter,
        page: usize,
        per_page: usize,
    ) -> Result<Page<Product>> {
        self.fetch_page(filter, page, per_page).await
    }
}
