//! Incremental ("infinite scroll") loading of a filtered product list.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use shopstate_core::{Product, ProductFilter};
use tracing::{debug, instrument};

use crate::catalog::ProductCatalog;
use crate::engine::TaskGuard;
use crate::error::{Result, StoreError, report};
use crate::reactive::Observable;

/// One page of results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Whether later pages may hold more items.
    pub has_more: bool,
}

/// Source of filtered pages (1-based).
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn page(
        &self,
        filter: &ProductFilter,
        page: usize,
        per_page: usize,
    ) -> Result<Page<Product>>;
}

struct ListInner {
    source: Arc<dyn PageSource>,
    per_page: usize,
    filter: Observable<ProductFilter>,
    items: Observable<Vec<Product>>,
    /// Next page to request.
    page: Observable<usize>,
    done: Observable<bool>,
    loading: Observable<bool>,
    error: Observable<Option<StoreError>>,
    /// Bumped on every reset; results of an older generation are dropped.
    generation: AtomicU64,
    follower: Mutex<Option<TaskGuard>>,
}

/// Accumulates pages of a filtered product list. Cheap to clone.
#[derive(Clone)]
pub struct InfiniteList {
    inner: Arc<ListInner>,
}

impl std::fmt::Debug for InfiniteList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfiniteList")
            .field("per_page", &self.inner.per_page)
            .field("page", &self.page())
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}

impl InfiniteList {
    /// Empty list over `source`; `per_page` is at least 1.
    #[must_use]
    pub fn new(source: Arc<dyn PageSource>, per_page: usize, filter: ProductFilter) -> Self {
        Self {
            inner: Arc::new(ListInner {
                source,
                per_page: per_page.max(1),
                filter: Observable::new(filter),
                items: Observable::new(Vec::new()),
                page: Observable::new(1),
                done: Observable::new(false),
                loading: Observable::new(false),
                error: Observable::new(None),
                generation: AtomicU64::new(0),
                follower: Mutex::new(None),
            }),
        }
    }

    /// List over `catalog` that reloads from the first page whenever the
    /// catalog's products change.
    #[must_use]
    pub fn for_catalog(catalog: &ProductCatalog, per_page: usize, filter: ProductFilter) -> Self {
        let list = Self::new(Arc::new(catalog.clone()), per_page, filter);

        let mut products = catalog.items().subscribe();
        let weak: Weak<ListInner> = Arc::downgrade(&list.inner);
        let follower = tokio::spawn(async move {
            while products.changed().await.is_ok() {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                debug!("Catalog changed, reloading list");
                Self { inner }.reset_and_load().await;
            }
        });
        *list
            .inner
            .follower
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(TaskGuard(follower));
        list
    }

    /// Fetch the next page and append it. No-op while a load is in flight or
    /// once the list is done.
    #[instrument(skip(self), fields(page = self.page()))]
    pub async fn load_more(&self) {
        let inner = &self.inner;
        if inner.done.get() {
            return;
        }
        let claimed = inner.loading.update_if(|loading| {
            if *loading {
                return false;
            }
            *loading = true;
            true
        });
        if !claimed {
            return;
        }

        let generation = inner.generation.load(Ordering::SeqCst);
        let page = inner.page.get();
        let filter = inner.filter.get();
        let result = inner.source.page(&filter, page, inner.per_page).await;

        if inner.generation.load(Ordering::SeqCst) != generation {
            debug!("Dropping page from a previous filter");
            return;
        }

        match result {
            Ok(batch) => {
                let finished = batch.items.len() < inner.per_page || !batch.has_more;
                if !batch.items.is_empty() {
                    inner.items.update(|items| items.extend(batch.items));
                    inner.page.set(page + 1);
                }
                if finished {
                    inner.done.set(true);
                }
            }
            Err(e) => {
                report("infinite_list", &e);
                inner.error.set(Some(e));
            }
        }
        inner.loading.set(false);
    }

    /// Forget loaded pages: no items, page 1, not done. An in-flight load is
    /// discarded when it completes.
    pub fn reset(&self) {
        let inner = &self.inner;
        inner.generation.fetch_add(1, Ordering::SeqCst);
        inner.items.set_if_changed(Vec::new());
        inner.page.set_if_changed(1);
        inner.done.set_if_changed(false);
        inner.error.set_if_changed(None);
        inner.loading.set_if_changed(false);
    }

    pub async fn reset_and_load(&self) {
        self.reset();
        self.load_more().await;
    }

    /// Switch to `filter` and load its first page. An unchanged filter is a no-op.
    pub async fn set_filter(&self, filter: ProductFilter) {
        if self.inner.filter.set_if_changed(filter) {
            self.reset_and_load().await;
        }
    }

    #[must_use]
    pub fn filter(&self) -> ProductFilter {
        self.inner.filter.get()
    }

    #[must_use]
    pub fn items(&self) -> &Observable<Vec<Product>> {
        &self.inner.items
    }

    /// Next page to be requested.
    #[must_use]
    pub fn page(&self) -> usize {
        self.inner.page.get()
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.done.get()
    }

    #[must_use]
    pub fn done(&self) -> &Observable<bool> {
        &self.inner.done
    }

    #[must_use]
    pub fn loading(&self) -> &Observable<bool> {
        &self.inner.loading
    }

    #[must_use]
    pub fn error(&self) -> &Observable<Option<StoreError>> {
        &self.inner.error
    }
}
