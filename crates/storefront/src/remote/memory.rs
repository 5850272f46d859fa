//! In-process backend.
//!
//! Behaves like a shared remote database: rows are scoped per owner, every
//! write is published to that owner's live subscribers (including the
//! writer's own, as an echo), and several storefront instances can share one
//! backend to model multiple devices. Tests drive it directly to seed rows,
//! administer coupon rules and the catalog, inject faults and count calls.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use shopstate_core::{
    AppliedCoupon, CartLine, CouponRule, Entity, Order, Product, ProductFilter, ProductId, UserId,
    WishlistEntry, normalize_code,
};
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    CatalogChanged, CatalogSource, ChangeEvent, ChangeFeed, CouponRules, RemoteError, RemoteStore,
    Result,
};
use crate::catalog::paginate;

// =============================================================================
// Fault injection and call accounting
// =============================================================================

#[derive(Debug, Default)]
struct Control {
    failing_writes: AtomicUsize,
    failing_reads: AtomicBool,
    latency_ms: AtomicU64,
    calls: Mutex<HashMap<String, usize>>,
}

impl Control {
    fn record(&self, table: &str, op: &str) {
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        *calls.entry(format!("{table}.{op}")).or_insert(0) += 1;
    }

    async fn delay(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn check_write(&self, table: &str) -> Result<()> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            debug!(table, "Injected write failure");
            return Err(RemoteError::Unavailable(format!("{table}: injected write failure")));
        }
        Ok(())
    }

    fn check_read(&self, table: &str) -> Result<()> {
        if self.failing_reads.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable(format!("{table}: injected read failure")));
        }
        Ok(())
    }

    /// Record the call, apply latency and check the read fault.
    async fn read(&self, table: &str, op: &str) -> Result<()> {
        self.record(table, op);
        self.delay().await;
        self.check_read(table)
    }

    /// Record the call, apply latency and check the write fault.
    async fn write(&self, table: &str, op: &str) -> Result<()> {
        self.record(table, op);
        self.delay().await;
        self.check_write(table)
    }
}

// =============================================================================
// Owner-scoped tables
// =============================================================================

struct Subscriber<E: Entity> {
    id: u64,
    owner: UserId,
    tx: mpsc::UnboundedSender<Result<ChangeEvent<E>>>,
}

struct TableState<E: Entity> {
    rows: HashMap<UserId, BTreeMap<E::Key, E>>,
    subscribers: Vec<Subscriber<E>>,
}

struct TableShared<E: Entity> {
    state: Mutex<TableState<E>>,
    next_subscriber: AtomicU64,
}

impl<E: Entity> TableShared<E> {
    fn lock(&self) -> std::sync::MutexGuard<'_, TableState<E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E: Entity> TableState<E> {
    fn publish(&mut self, owner: &UserId, event: &Result<ChangeEvent<E>>) {
        self.subscribers
            .retain(|sub| sub.owner != *owner || sub.tx.send(event.clone()).is_ok());
    }

    fn upsert(&mut self, owner: &UserId, entry: E) {
        let rows = self.rows.entry(owner.clone()).or_default();
        let event = match rows.insert(entry.key(), entry.clone()) {
            Some(_) => ChangeEvent::Update(entry),
            None => ChangeEvent::Insert(entry),
        };
        self.publish(owner, &Ok(event));
    }

    fn delete(&mut self, owner: &UserId, key: &E::Key) {
        let removed = self
            .rows
            .get_mut(owner)
            .and_then(|rows| rows.remove(key))
            .is_some();
        if removed {
            self.publish(owner, &Ok(ChangeEvent::Delete(key.clone())));
        }
    }
}

/// One owner-scoped table of the in-process backend.
pub struct MemoryTable<E: Entity> {
    name: &'static str,
    shared: Arc<TableShared<E>>,
    control: Arc<Control>,
}

impl<E: Entity> Clone for MemoryTable<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            shared: Arc::clone(&self.shared),
            control: Arc::clone(&self.control),
        }
    }
}

impl<E: Entity> MemoryTable<E> {
    fn new(name: &'static str, control: Arc<Control>) -> Self {
        Self {
            name,
            shared: Arc::new(TableShared {
                state: Mutex::new(TableState {
                    rows: HashMap::new(),
                    subscribers: Vec::new(),
                }),
                next_subscriber: AtomicU64::new(0),
            }),
            control,
        }
    }

    /// Write rows as another device would: no faults, no call accounting,
    /// but published to live subscribers.
    pub fn seed(&self, owner: &UserId, entries: impl IntoIterator<Item = E>) {
        let mut state = self.shared.lock();
        for entry in entries {
            state.upsert(owner, entry);
        }
    }

    /// Delete a row as another device would.
    pub fn remove(&self, owner: &UserId, key: &E::Key) {
        self.shared.lock().delete(owner, key);
    }

    /// Push a feed error to `owner`'s live subscribers.
    pub fn break_feed(&self, owner: &UserId, error: RemoteError) {
        self.shared.lock().publish(owner, &Err(error));
    }

    /// Current rows for `owner`, in key order.
    #[must_use]
    pub fn rows(&self, owner: &UserId) -> Vec<E> {
        self.shared
            .lock()
            .rows
            .get(owner)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Open live subscriptions for `owner`.
    #[must_use]
    pub fn subscriber_count(&self, owner: &UserId) -> usize {
        self.shared
            .lock()
            .subscribers
            .iter()
            .filter(|sub| sub.owner == *owner && !sub.tx.is_closed())
            .count()
    }
}

#[async_trait]
impl<E: Entity> RemoteStore<E> for MemoryTable<E> {
    async fn list(&self, owner: &UserId) -> Result<Vec<E>> {
        self.control.read(self.name, "list").await?;
        Ok(self.rows(owner))
    }

    async fn upsert(&self, owner: &UserId, entry: &E) -> Result<()> {
        self.control.write(self.name, "upsert").await?;
        self.shared.lock().upsert(owner, entry.clone());
        Ok(())
    }

    async fn delete(&self, owner: &UserId, key: &E::Key) -> Result<()> {
        self.control.write(self.name, "delete").await?;
        self.shared.lock().delete(owner, key);
        Ok(())
    }

    async fn clear(&self, owner: &UserId) -> Result<()> {
        self.control.write(self.name, "clear").await?;
        let mut state = self.shared.lock();
        let keys: Vec<E::Key> = state
            .rows
            .get(owner)
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default();
        for key in &keys {
            state.delete(owner, key);
        }
        Ok(())
    }

    async fn subscribe(&self, owner: &UserId) -> Result<ChangeFeed<E>> {
        self.control.read(self.name, "subscribe").await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.shared.lock().subscribers.push(Subscriber {
            id,
            owner: owner.clone(),
            tx,
        });

        let table: Weak<TableShared<E>> = Arc::downgrade(&self.shared);
        Ok(ChangeFeed::new(rx, move || {
            if let Some(table) = table.upgrade() {
                table.lock().subscribers.retain(|sub| sub.id != id);
            }
        }))
    }
}

// =============================================================================
// Catalog
// =============================================================================

#[derive(Default)]
struct CatalogState {
    products: BTreeMap<ProductId, (Product, bool)>,
    subscribers: Vec<mpsc::UnboundedSender<CatalogChanged>>,
}

impl CatalogState {
    fn notify(&mut self) {
        self.subscribers.retain(|tx| tx.send(CatalogChanged).is_ok());
    }

    /// Active products in creation order.
    fn active(&self) -> Vec<Product> {
        let mut products: Vec<Product> = self
            .products
            .values()
            .filter(|(_, active)| *active)
            .map(|(product, _)| product.clone())
            .collect();
        products.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        products
    }
}

// =============================================================================
// Backend
// =============================================================================

/// Shared in-process backend. Clones share state.
#[derive(Clone)]
pub struct MemoryBackend {
    control: Arc<Control>,
    carts: MemoryTable<CartLine>,
    wishlists: MemoryTable<WishlistEntry>,
    coupons: MemoryTable<AppliedCoupon>,
    orders: MemoryTable<Order>,
    rules: Arc<Mutex<HashMap<String, CouponRule>>>,
    catalog: Arc<Mutex<CatalogState>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        let control = Arc::new(Control::default());
        Self {
            carts: MemoryTable::new("carts", Arc::clone(&control)),
            wishlists: MemoryTable::new("wishlists", Arc::clone(&control)),
            coupons: MemoryTable::new("coupons", Arc::clone(&control)),
            orders: MemoryTable::new("orders", Arc::clone(&control)),
            rules: Arc::new(Mutex::new(HashMap::new())),
            catalog: Arc::new(Mutex::new(CatalogState::default())),
            control,
        }
    }

    #[must_use]
    pub fn carts(&self) -> MemoryTable<CartLine> {
        self.carts.clone()
    }

    #[must_use]
    pub fn wishlists(&self) -> MemoryTable<WishlistEntry> {
        self.wishlists.clone()
    }

    #[must_use]
    pub fn coupons(&self) -> MemoryTable<AppliedCoupon> {
        self.coupons.clone()
    }

    #[must_use]
    pub fn orders(&self) -> MemoryTable<Order> {
        self.orders.clone()
    }

    /// Create or replace a coupon rule.
    pub fn put_rule(&self, rule: CouponRule) {
        let mut rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        rules.insert(rule.code.clone(), rule);
    }

    /// Toggle a coupon rule; unknown codes are ignored.
    pub fn set_rule_active(&self, code: &str, active: bool) {
        let mut rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(rule) = rules.get_mut(&normalize_code(code)) {
            rule.active = active;
        }
    }

    /// Create or replace an active product and notify catalog subscribers.
    pub fn put_product(&self, product: Product) {
        let mut catalog = self.catalog.lock().unwrap_or_else(PoisonError::into_inner);
        catalog.products.insert(product.id.clone(), (product, true));
        catalog.notify();
    }

    /// Show or hide a product and notify catalog subscribers.
    pub fn set_product_active(&self, id: &ProductId, active: bool) {
        let mut catalog = self.catalog.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = catalog.products.get_mut(id) {
            entry.1 = active;
            catalog.notify();
        }
    }

    /// Fail the next `n` writes (upsert, delete, clear) on any table.
    pub fn fail_next_writes(&self, n: usize) {
        self.control.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Fail every read (list, subscribe, lookup, catalog) until turned off.
    pub fn fail_reads(&self, failing: bool) {
        self.control.failing_reads.store(failing, Ordering::SeqCst);
    }

    /// Delay every recorded call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.control.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Number of `op` calls made on `table` (e.g. `("orders", "upsert")`).
    #[must_use]
    pub fn call_count(&self, table: &str, op: &str) -> usize {
        let calls = self.control.calls.lock().unwrap_or_else(PoisonError::into_inner);
        calls.get(&format!("{table}.{op}")).copied().unwrap_or(0)
    }

    /// Number of calls of any kind made on `table`.
    #[must_use]
    pub fn total_calls(&self, table: &str) -> usize {
        let prefix = format!("{table}.");
        let calls = self.control.calls.lock().unwrap_or_else(PoisonError::into_inner);
        calls
            .iter()
            .filter(|(name, _)| name.starts_with(&prefix))
            .map(|(_, count)| count)
            .sum()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend").finish_non_exhaustive()
    }
}

#[async_trait]
impl CouponRules for MemoryBackend {
    async fn lookup(&self, code: &str) -> Result<Option<CouponRule>> {
        self.control.read("coupon_rules", "lookup").await?;
        let rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rules.get(&normalize_code(code)).cloned())
    }
}

#[async_trait]
impl CatalogSource for MemoryBackend {
    async fn list_products(&self) -> Result<Vec<Product>> {
        self.control.read("products", "list").await?;
        let catalog = self.catalog.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(catalog.active())
    }

    async fn fetch_product(&self, id: &ProductId) -> Result<Option<Product>> {
        self.control.read("products", "fetch").await?;
        let catalog = self.catalog.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(catalog
            .products
            .get(id)
            .filter(|(_, active)| *active)
            .map(|(product, _)| product.clone()))
    }

    async fn fetch_page(
        &self,
        filter: &ProductFilter,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<Product>> {
        self.control.read("products", "page").await?;
        let catalog = self.catalog.lock().unwrap_or_else(PoisonError::into_inner);
        let matching: Vec<Product> = catalog
            .active()
            .into_iter()
            .filter(|product| filter.matches(product))
            .collect();
        Ok(paginate(&matching, page, per_page))
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<CatalogChanged>> {
        self.control.read("products", "subscribe").await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut catalog = self.catalog.lock().unwrap_or_else(PoisonError::into_inner);
        catalog.subscribers.push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use shopstate_core::{CartLineKey, Price};

    fn line(product: &str, quantity: u32) -> CartLine {
        let item = Product::new(product, "Tee", Price::from_cents(1000));
        CartLine::for_product(&item, CartLineKey::new(product, "red", "M").unwrap(), quantity)
    }

    #[tokio::test]
    async fn test_rows_are_scoped_per_owner() {
        let backend = MemoryBackend::new();
        let carts = backend.carts();
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        carts.upsert(&alice, &line("p1", 2)).await.unwrap();
        assert_eq!(carts.list(&alice).await.unwrap().len(), 1);
        assert!(carts.list(&bob).await.unwrap().is_empty());
        assert_eq!(backend.call_count("carts", "upsert"), 1);
        assert_eq!(backend.call_count("carts", "list"), 2);
    }

    #[tokio::test]
    async fn test_feed_receives_insert_update_delete() {
        let backend = MemoryBackend::new();
        let carts = backend.carts();
        let owner = UserId::new("alice");
        let mut feed = carts.subscribe(&owner).await.unwrap();

        carts.upsert(&owner, &line("p1", 1)).await.unwrap();
        carts.upsert(&owner, &line("p1", 4)).await.unwrap();
        carts.delete(&owner, &line("p1", 1).key()).await.unwrap();

        assert!(matches!(feed.next().await, Some(Ok(ChangeEvent::Insert(_)))));
        assert!(matches!(feed.next().await, Some(Ok(ChangeEvent::Update(l))) if l.quantity == 4));
        assert!(matches!(feed.next().await, Some(Ok(ChangeEvent::Delete(_)))));
    }

    #[tokio::test]
    async fn test_dropping_feed_unsubscribes() {
        let backend = MemoryBackend::new();
        let carts = backend.carts();
        let owner = UserId::new("alice");

        let feed = carts.subscribe(&owner).await.unwrap();
        assert_eq!(carts.subscriber_count(&owner), 1);
        drop(feed);
        assert_eq!(carts.subscriber_count(&owner), 0);
    }

    #[tokio::test]
    async fn test_injected_write_failures_are_consumed() {
        let backend = MemoryBackend::new();
        let carts = backend.carts();
        let owner = UserId::new("alice");

        backend.fail_next_writes(1);
        assert!(carts.upsert(&owner, &line("p1", 1)).await.is_err());
        assert!(carts.upsert(&owner, &line("p1", 1)).await.is_ok());
        assert_eq!(carts.rows(&owner).len(), 1);
    }

    #[tokio::test]
    async fn test_rule_lookup_normalizes_code() {
        let backend = MemoryBackend::new();
        backend.put_rule(CouponRule::new("save10", true, 10).unwrap());
        let rule = backend.lookup(" Save10 ").await.unwrap().unwrap();
        assert_eq!(rule.percent, 10);

        backend.set_rule_active("SAVE10", false);
        assert!(!backend.lookup("SAVE10").await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn test_inactive_products_hidden() {
        let backend = MemoryBackend::new();
        backend.put_product(Product::new("p1", "Tee", Price::from_cents(1000)));
        backend.put_product(Product::new("p2", "Hat", Price::from_cents(500)));
        backend.set_product_active(&ProductId::new("p2"), false);

        assert_eq!(backend.list_products().await.unwrap().len(), 1);
        assert!(
            backend
                .fetch_product(&ProductId::new("p2"))
                .await
                .unwrap()
                .is_none()
        );
    }
}
