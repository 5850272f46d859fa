//! Order placement and history.
//!
//! Orders exist only for signed-in users. Placing one writes an immutable
//! record straight to the remote store; the history is the owner's orders,
//! newest first, kept live by the engine's feed.

use std::sync::Arc;

use chrono::Utc;
use shopstate_core::{Order, OrderDraft, OrderId, UserId};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::engine::{Domain, Items, Mode, SyncEngine};
use crate::error::{Result, StoreError, add_breadcrumb};
use crate::identity::IdentitySignal;
use crate::reactive::{Derived, Observable};
use crate::remote::RemoteStore;
use crate::storage::LocalStorage;

#[derive(Debug)]
pub struct OrdersDomain;

impl Domain for OrdersDomain {
    type Entry = Order;
    const NAME: &'static str = "orders";
    const GUEST_KEY: Option<&'static str> = None;

    fn merge(_guest: &Order, _remote: Option<&Order>) -> Option<Order> {
        None
    }
}

fn newest_first(items: &Items<Order>) -> Vec<Order> {
    let mut orders: Vec<Order> = items.values().cloned().collect();
    orders.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
    orders
}

/// Orders store handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct OrdersStore {
    engine: SyncEngine<OrdersDomain>,
    history: Arc<Derived<Items<Order>, Vec<Order>>>,
}

impl OrdersStore {
    #[must_use]
    pub fn new(
        identity: IdentitySignal,
        storage: Arc<dyn LocalStorage>,
        remote: Arc<dyn RemoteStore<Order>>,
    ) -> Self {
        let engine = SyncEngine::new(identity, storage, remote);
        let history = Derived::new(engine.items(), newest_first);
        Self {
            engine,
            history: Arc::new(history),
        }
    }

    pub async fn start(&self) {
        self.engine.start().await;
    }

    pub async fn refresh(&self) {
        self.engine.refresh().await;
    }

    /// Validate `draft` and record it as an order for the signed-in user.
    ///
    /// # Errors
    ///
    /// - `StoreError::AuthRequired` if nobody is signed in.
    /// - `StoreError::Validation` if the draft has no lines or a negative total.
    /// - `StoreError::RemoteWrite` if the order could not be stored.
    ///
    /// The first two fail before any remote call.
    #[instrument(skip(self, draft), fields(lines = draft.line_items.len()))]
    pub async fn place_order(&self, draft: OrderDraft) -> Result<OrderId> {
        let owner = self.signed_in_user().ok_or(StoreError::AuthRequired)?;
        draft.validate()?;

        let id = OrderId::new(Uuid::new_v4().to_string());
        let order = Order::from_draft(id.clone(), draft, Utc::now());
        let total = order.amounts.total;

        self.engine
            .remote()
            .upsert(&owner, &order)
            .await
            .map_err(|e| self.engine.fail(StoreError::RemoteWrite(e)))?;
        self.engine.remember(&owner, order);

        add_breadcrumb("orders", "Placed order", Some(&[("order_id", id.as_str())]));
        info!(order_id = %id, user_id = %owner, total = %total, "Order placed");
        Ok(id)
    }

    fn signed_in_user(&self) -> Option<UserId> {
        let identity = self.engine.identity().current();
        if identity.ready { identity.id } else { None }
    }

    /// Orders of the current owner, newest first.
    #[must_use]
    pub fn history(&self) -> Vec<Order> {
        self.history.get()
    }

    #[must_use]
    pub fn get(&self, id: &OrderId) -> Option<Order> {
        self.engine.items().with(|items| items.get(id).cloned())
    }

    #[must_use]
    pub fn items(&self) -> &Observable<Items<Order>> {
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
    use rust_decimal::Decimal;
    use shopstate_core::{
        CartLine, CartLineKey, Delivery, Price, Product, ValidationError,
    };

    use super::*;
    use crate::remote::memory::MemoryBackend;
    use crate::storage::MemoryStorage;

    fn draft() -> OrderDraft {
        let product = Product::new("p1", "Tee", Price::from_cents(2000));
        let line = CartLine::for_product(&product, CartLineKey::new("p1", "red", "M").unwrap(), 2);
        OrderDraft::from_lines(Delivery::default(), &[line], None, Decimal::ZERO)
    }

    fn store(identity: &IdentitySignal, backend: &MemoryBackend) -> OrdersStore {
        OrdersStore::new(
            identity.clone(),
            Arc::new(MemoryStorage::new()),
            Arc::new(backend.orders()),
        )
    }

    #[tokio::test]
    async fn test_guest_cannot_place_orders() {
        let identity = IdentitySignal::new();
        identity.resolve(None);
        let backend = MemoryBackend::new();
        let orders = store(&identity, &backend);
        orders.start().await;

        assert!(orders.is_guest());
        let err = orders.place_order(draft()).await.unwrap_err();
        assert_eq!(err, StoreError::AuthRequired);
        assert_eq!(backend.total_calls("orders"), 0);
    }

    #[tokio::test]
    async fn test_invalid_draft_makes_no_remote_calls() {
        let identity = IdentitySignal::new();
        identity.resolve(Some(UserId::new("u1")));
        let backend = MemoryBackend::new();
        let orders = store(&identity, &backend);
        orders.start().await;

        let mut empty = draft();
        empty.line_items.clear();
        let err = orders.place_order(empty).await.unwrap_err();

        assert_eq!(err, StoreError::Validation(ValidationError::EmptyOrder));
        assert_eq!(backend.call_count("orders", "upsert"), 0);
    }

    #[tokio::test]
    async fn test_history_is_newest_first() {
        let owner = UserId::new("u1");
        let identity = IdentitySignal::new();
        identity.resolve(Some(owner.clone()));
        let backend = MemoryBackend::new();
        let orders = store(&identity, &backend);
        orders.start().await;
        assert!(!orders.is_guest());

        let first = orders.place_order(draft()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = orders.place_order(draft()).await.unwrap();

        let history = orders.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, second);
        assert_eq!(history[1].id, first);
        assert_eq!(backend.orders().rows(&owner).len(), 2);
    }

    #[tokio::test]
    async fn test_remote_failure_is_reported() {
        let identity = IdentitySignal::new();
        identity.resolve(Some(UserId::new("u1")));
        let backend = MemoryBackend::new();
        let orders = store(&identity, &backend);
        orders.start().await;

        backend.fail_next_writes(1);
        let err = orders.place_order(draft()).await.unwrap_err();
        assert!(matches!(err, StoreError::RemoteWrite(_)));
        assert!(orders.history().is_empty());
    }
}
