//! `PostgREST`-style HTTP backend.
//!
//! Rows live in one table per domain, scoped by a `user_id` column:
//!
//! | Entity | Table | Conflict target |
//! |---|---|---|
//! | `CartLine` | `cart_items` | `user_id,product_id,color,size` |
//! | `WishlistEntry` | `wishlist_items` | `user_id,product_id` |
//! | `AppliedCoupon` | `user_coupons` | `user_id` |
//! | `Order` | `orders` | `id` |
//!
//! Coupon rules are read from `coupons` and products from `products`.
//! Live feeds poll at the configured interval and diff successive snapshots
//! into change events.

use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use shopstate_core::{
    AppliedCoupon, CartLine, CouponRule, Entity, Gender, Order, Price, Product, ProductFilter,
    ProductId, UserId, WishlistEntry, normalize_code,
};
use tokio::sync::mpsc;
use tracing::{debug, error, instrument, warn};
use url::Url;

use super::{
    CatalogChanged, CatalogSource, ChangeEvent, ChangeFeed, CouponRules, RemoteError, RemoteStore,
    Result,
};
use crate::config::RemoteConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const ERROR_BODY_LIMIT: usize = 200;

/// Table mapping for an entity stored by the REST backend.
pub trait RestEntity: Entity {
    /// Table name under `/rest/v1/`.
    const TABLE: &'static str;

    /// `on_conflict` columns identifying a row for upserts.
    const CONFLICT_COLUMNS: &'static str;

    /// Column filters selecting the row with `key` (owner filter excluded).
    fn key_filter(key: &Self::Key) -> Vec<(&'static str, String)>;
}

impl RestEntity for CartLine {
    const TABLE: &'static str = "cart_items";
    const CONFLICT_COLUMNS: &'static str = "user_id,product_id,color,size";

    fn key_filter(key: &Self::Key) -> Vec<(&'static str, String)> {
        vec![
            ("product_id", eq(key.product_id.as_str())),
            ("color", eq(&key.color)),
            ("size", eq(&key.size)),
        ]
    }
}

impl RestEntity for WishlistEntry {
    const TABLE: &'static str = "wishlist_items";
    const CONFLICT_COLUMNS: &'static str = "user_id,product_id";

    fn key_filter(key: &Self::Key) -> Vec<(&'static str, String)> {
        vec![("product_id", eq(key.as_str()))]
    }
}

impl RestEntity for AppliedCoupon {
    const TABLE: &'static str = "user_coupons";
    const CONFLICT_COLUMNS: &'static str = "user_id";

    fn key_filter(_key: &Self::Key) -> Vec<(&'static str, String)> {
        Vec::new()
    }
}

impl RestEntity for Order {
    const TABLE: &'static str = "orders";
    const CONFLICT_COLUMNS: &'static str = "id";

    fn key_filter(key: &Self::Key) -> Vec<(&'static str, String)> {
        vec![("id", eq(key.as_str()))]
    }
}

fn eq(value: &str) -> String {
    format!("eq.{value}")
}

// =============================================================================
// Client
// =============================================================================

/// HTTP client for the backend. Cheap to clone.
#[derive(Clone)]
pub struct RestBackend {
    inner: Arc<RestBackendInner>,
}

struct RestBackendInner {
    client: reqwest::Client,
    base_url: Url,
    api_key: SecretString,
    poll_interval: Duration,
}

impl RestBackend {
    /// Create a client for the configured backend.
    ///
    /// # Errors
    ///
    /// Returns `RemoteError` if the HTTP client cannot be built.
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("shopstate/0.1")
            .build()?;

        Ok(Self {
            inner: Arc::new(RestBackendInner {
                client,
                base_url: config.base_url.clone(),
                api_key: config.api_key.clone(),
                poll_interval: config.poll_interval,
            }),
        })
    }

    /// Typed handle on one entity table.
    #[must_use]
    pub fn table<E: RestEntity>(&self) -> RestTable<E> {
        RestTable {
            backend: self.clone(),
            _entity: PhantomData,
        }
    }

    /// `{base}/rest/v1/{table}` with `filters` as query parameters.
    fn endpoint(&self, table: &str, filters: &[(&str, String)]) -> Result<Url> {
        let mut url = self.inner.base_url.join(&format!("rest/v1/{table}"))?;
        if !filters.is_empty() {
            let mut query = url.query_pairs_mut();
            for (column, value) in filters {
                query.append_pair(column, value);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let key = self.inner.api_key.expose_secret();
        self.inner
            .client
            .request(method, url)
            .header("apikey", key)
            .header("Authorization", format!("Bearer {key}"))
    }

    /// Send a request and return the body of a successful response.
    async fn send(&self, request: RequestBuilder) -> Result<String> {
        let response = request.send().await?;
        let status = response.status();

        // Get response body as text first for better error diagnostics
        let body = response.text().await?;

        if !status.is_success() {
            error!(
                status = %status,
                body = %body.chars().take(500).collect::<String>(),
                "Backend returned non-success status"
            );
            return Err(RemoteError::Http {
                status: status.as_u16(),
                message: body.chars().take(ERROR_BODY_LIMIT).collect(),
            });
        }

        Ok(body)
    }

    async fn get_rows<T: DeserializeOwned>(&self, url: Url) -> Result<Vec<T>> {
        let body = self.send(self.request(Method::GET, url)).await?;
        serde_json::from_str(&body).map_err(|e| {
            error!(
                error = %e,
                body = %body.chars().take(500).collect::<String>(),
                "Failed to parse backend response"
            );
            RemoteError::Decode(e.to_string())
        })
    }

    async fn active_products(&self, mut filters: Vec<(&'static str, String)>) -> Result<Vec<Product>> {
        filters.insert(0, ("select", "*".to_string()));
        filters.push(("order", "created_at.asc,id.asc".to_string()));
        let url = self.endpoint("products", &filters)?;
        let rows: Vec<ProductRow> = self.get_rows(url).await?;
        Ok(rows
            .into_iter()
            .filter(ProductRow::is_active)
            .map(ProductRow::into_product)
            .collect())
    }
}

impl std::fmt::Debug for RestBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestBackend")
            .field("base_url", &self.inner.base_url.as_str())
            .field("api_key", &"[REDACTED]")
            .field("poll_interval", &self.inner.poll_interval)
            .finish()
    }
}

// =============================================================================
// Owner-scoped tables
// =============================================================================

/// [`RemoteStore`] over one REST table.
pub struct RestTable<E> {
    backend: RestBackend,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for RestTable<E> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E: RestEntity> RestTable<E> {
    fn owner_filter(owner: &UserId) -> (&'static str, String) {
        ("user_id", eq(owner.as_str()))
    }

    async fn snapshot(&self, owner: &UserId) -> Result<BTreeMap<E::Key, E>> {
        Ok(self
            .list(owner)
            .await?
            .into_iter()
            .map(|entry| (entry.key(), entry))
            .collect())
    }
}

#[async_trait]
impl<E: RestEntity> RemoteStore<E> for RestTable<E> {
    #[instrument(skip(self), fields(table = E::TABLE))]
    async fn list(&self, owner: &UserId) -> Result<Vec<E>> {
        let url = self.backend.endpoint(
            E::TABLE,
            &[("select", "*".to_string()), Self::owner_filter(owner)],
        )?;
        self.backend.get_rows(url).await
    }

    #[instrument(skip(self, entry), fields(table = E::TABLE))]
    async fn upsert(&self, owner: &UserId, entry: &E) -> Result<()> {
        let mut row = match serde_json::to_value(entry) {
            Ok(serde_json::Value::Object(row)) => row,
            Ok(_) => return Err(RemoteError::Rejected(format!("{} rows must be objects", E::TABLE))),
            Err(e) => return Err(RemoteError::Rejected(e.to_string())),
        };
        row.insert(
            "user_id".to_string(),
            serde_json::Value::String(owner.to_string()),
        );

        let url = self.backend.endpoint(
            E::TABLE,
            &[("on_conflict", E::CONFLICT_COLUMNS.to_string())],
        )?;
        let request = self
            .backend
            .request(Method::POST, url)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[serde_json::Value::Object(row)]);
        self.backend.send(request).await.map(|_| ())
    }

    #[instrument(skip(self), fields(table = E::TABLE))]
    async fn delete(&self, owner: &UserId, key: &E::Key) -> Result<()> {
        let mut filters = vec![Self::owner_filter(owner)];
        filters.extend(E::key_filter(key));
        let url = self.backend.endpoint(E::TABLE, &filters)?;
        self.backend
            .send(self.backend.request(Method::DELETE, url))
            .await
            .map(|_| ())
    }

    #[instrument(skip(self), fields(table = E::TABLE))]
    async fn clear(&self, owner: &UserId) -> Result<()> {
        let url = self
            .backend
            .endpoint(E::TABLE, &[Self::owner_filter(owner)])?;
        self.backend
            .send(self.backend.request(Method::DELETE, url))
            .await
            .map(|_| ())
    }

    async fn subscribe(&self, owner: &UserId) -> Result<ChangeFeed<E>> {
        let mut previous = self.snapshot(owner).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let table = self.clone();
        let owner = owner.clone();
        let poll_interval = self.backend.inner.poll_interval;

        let poller = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                match table.snapshot(&owner).await {
                    Ok(current) => {
                        for event in diff_snapshots(&previous, &current) {
                            if tx.send(Ok(event)).is_err() {
                                return;
                            }
                        }
                        previous = current;
                    }
                    Err(e) => {
                        warn!(table = E::TABLE, error = %e, "Live feed poll failed");
                        if tx.send(Err(e)).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        debug!(table = E::TABLE, "Live feed started");
        Ok(ChangeFeed::new(rx, move || poller.abort()))
    }
}

/// Change events turning `previous` into `current`.
#[must_use]
pub fn diff_snapshots<E: Entity>(
    previous: &BTreeMap<E::Key, E>,
    current: &BTreeMap<E::Key, E>,
) -> Vec<ChangeEvent<E>> {
    let mut events = Vec::new();
    for (key, entry) in current {
        match previous.get(key) {
            None => events.push(ChangeEvent::Insert(entry.clone())),
            Some(old) if old != entry => events.push(ChangeEvent::Update(entry.clone())),
            Some(_) => {}
        }
    }
    for key in previous.keys() {
        if !current.contains_key(key) {
            events.push(ChangeEvent::Delete(key.clone()));
        }
    }
    events
}

// =============================================================================
// Coupon rules
// =============================================================================

#[derive(Debug, Deserialize)]
struct CouponRuleRow {
    code: String,
    active: Option<bool>,
    percent: Option<i64>,
}

#[async_trait]
impl CouponRules for RestBackend {
    #[instrument(skip(self))]
    async fn lookup(&self, code: &str) -> Result<Option<CouponRule>> {
        let url = self.endpoint(
            "coupons",
            &[
                ("select", "code,active,percent".to_string()),
                ("code", eq(&normalize_code(code))),
                ("limit", "1".to_string()),
            ],
        )?;
        let rows: Vec<CouponRuleRow> = self.get_rows(url).await?;
        rows.into_iter()
            .next()
            .map(|row| {
                CouponRule::new(
                    &row.code,
                    row.active.unwrap_or(false),
                    row.percent.unwrap_or(0),
                )
                .map_err(|e| RemoteError::Decode(e.to_string()))
            })
            .transpose()
    }
}

// =============================================================================
// Catalog
// =============================================================================

/// A list column stored either as an array or as JSON-encoded text.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringList {
    List(Vec<String>),
    Encoded(String),
}

impl StringList {
    fn into_vec(value: Option<Self>) -> Vec<String> {
        match value {
            None => Vec::new(),
            Some(Self::List(items)) => items,
            Some(Self::Encoded(raw)) => serde_json::from_str(&raw).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProductRow {
    id: String,
    title: String,
    gender: Gender,
    category: String,
    price: Option<Decimal>,
    colors: Option<StringList>,
    sizes: Option<StringList>,
    image_urls: Option<StringList>,
    description: Option<String>,
    extra: Option<BTreeMap<String, String>>,
    video_url: Option<String>,
    created_at: Option<DateTime<Utc>>,
    is_active: Option<bool>,
}

impl ProductRow {
    fn is_active(&self) -> bool {
        self.is_active.unwrap_or(true)
    }

    fn into_product(self) -> Product {
        Product {
            id: ProductId::new(self.id),
            title: self.title,
            gender: self.gender,
            category: self.category,
            price: Price::new(self.price.unwrap_or(Decimal::ZERO)),
            colors: StringList::into_vec(self.colors),
            sizes: StringList::into_vec(self.sizes),
            image_urls: StringList::into_vec(self.image_urls),
            description: self.description.unwrap_or_default(),
            extra: self.extra.unwrap_or_default(),
            video_url: self.video_url,
            created_at: self.created_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Query parameters pushing `filter` to the backend.
fn product_filters(filter: &ProductFilter) -> Vec<(&'static str, String)> {
    let mut filters = vec![("is_active", "not.is.false".to_string())];
    if let Some(gender) = filter.gender {
        filters.push(("gender", eq(gender.as_str())));
    }
    if let Some(category) = non_blank(filter.category.as_deref()) {
        filters.push(("category", eq(category)));
    }
    if let Some(color) = non_blank(filter.color.as_deref()) {
        filters.push(("colors", contains_element(color)));
    }
    if let Some(size) = non_blank(filter.size.as_deref()) {
        filters.push(("sizes", contains_element(size)));
    }
    if let Some((min, max)) = filter.price_range {
        filters.push(("price", format!("gte.{}", min.amount())));
        filters.push(("price", format!("lte.{}", max.amount())));
    }
    if let Some(query) = non_blank(filter.query.as_deref()) {
        filters.push(("title", format!("ilike.*{}*", like_literal(query))));
    }
    filters
}

/// `cs` filter for an array column holding `value`. The element is
/// double-quoted so separators and braces stay part of it.
fn contains_element(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("cs.{{\"{escaped}\"}}")
}

/// `value` as literal text inside a LIKE pattern: wildcards are removed and
/// `_` / `\` escaped.
fn like_literal(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '*' | '%'))
        .flat_map(|c| match c {
            '_' | '\\' => vec!['\\', c],
            _ => vec![c],
        })
        .collect()
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[async_trait]
impl CatalogSource for RestBackend {
    #[instrument(skip(self))]
    async fn list_products(&self) -> Result<Vec<Product>> {
        self.active_products(Vec::new()).await
    }

    #[instrument(skip(self))]
    async fn fetch_product(&self, id: &ProductId) -> Result<Option<Product>> {
        let products = self
            .active_products(vec![("id", eq(id.as_str())), ("limit", "1".to_string())])
            .await?;
        Ok(products.into_iter().next())
    }

    #[instrument(skip(self))]
    async fn fetch_page(
        &self,
        filter: &ProductFilter,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<Product>> {
        let offset = page.saturating_sub(1).saturating_mul(per_page);
        let mut filters = product_filters(filter);
        filters.push(("limit", per_page.to_string()));
        filters.push(("offset", offset.to_string()));
        self.active_products(filters).await
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<CatalogChanged>> {
        let fingerprint = |products: &[Product]| -> HashMap<ProductId, Product> {
            products.iter().map(|p| (p.id.clone(), p.clone())).collect()
        };
        let mut previous = fingerprint(&self.list_products().await?);
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(backend.inner.poll_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                match backend.list_products().await {
                    Ok(products) => {
                        let current = fingerprint(&products);
                        if current != previous {
                            previous = current;
                            if tx.send(CatalogChanged).is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "Catalog poll failed"),
                }
            }
        });

        Ok(rx)
    }
}
