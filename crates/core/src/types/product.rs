//! Catalog products and the filter used to browse them.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::Entity;
use super::id::ProductId;
use super::price::Price;

/// Catalog department.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Men,
    Women,
}

impl Gender {
    /// Wire name (`"men"` / `"women"`).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Men => "men",
            Self::Women => "women",
        }
    }
}

impl std::str::FromStr for Gender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "men" => Ok(Self::Men),
            "women" => Ok(Self::Women),
            _ => Err(format!("invalid gender: {s}")),
        }
    }
}

/// A catalog product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub title: String,
    pub gender: Gender,
    pub category: String,
    pub price: Price,
    pub colors: Vec<String>,
    pub sizes: Vec<String>,
    pub image_urls: Vec<String>,
    pub description: String,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Product {
    /// Minimal product with empty attribute lists; fill the rest with struct update syntax.
    #[must_use]
    pub fn new(id: impl Into<ProductId>, title: impl Into<String>, price: Price) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            gender: Gender::Women,
            category: String::new(),
            price,
            colors: Vec::new(),
            sizes: Vec::new(),
            image_urls: Vec::new(),
            description: String::new(),
            extra: BTreeMap::new(),
            video_url: None,
            created_at: Utc::now(),
        }
    }
}

impl Entity for Product {
    type Key = ProductId;

    fn key(&self) -> ProductId {
        self.id.clone()
    }
}

/// Browse filter. Every `None` field matches all products.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductFilter {
    pub gender: Option<Gender>,
    pub category: Option<String>,
    pub color: Option<String>,
    pub size: Option<String>,
    /// Inclusive `(min, max)` price range.
    pub price_range: Option<(Price, Price)>,
    /// Case-insensitive substring of the title.
    pub query: Option<String>,
}

impl ProductFilter {
    /// Whether `product` passes every set criterion.
    #[must_use]
    pub fn matches(&self, product: &Product) -> bool {
        if self.gender.is_some_and(|g| g != product.gender) {
            return false;
        }
        if let Some(category) = non_blank(self.category.as_deref())
            && product.category != category
        {
            return false;
        }
        if let Some(color) = non_blank(self.color.as_deref())
            && !product.colors.iter().any(|c| c == color)
        {
            return false;
        }
        if let Some(size) = non_blank(self.size.as_deref())
            && !product.sizes.iter().any(|s| s == size)
        {
            return false;
        }
        if let Some((min, max)) = self.price_range
            && (product.price < min || product.price > max)
        {
            return false;
        }
        if let Some(query) = non_blank(self.query.as_deref())
            && !product
                .title
                .to_lowercase()
                .contains(&query.to_lowercase())
        {
            return false;
        }
        true
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Filter dimensions derived from a product set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Facets {
    pub categories: Vec<String>,
    pub colors: Vec<String>,
    pub sizes: Vec<String>,
    /// `(min, max)` price, or `fallback` for an empty set.
    pub price_bounds: (Price, Price),
}

impl Facets {
    /// Compute sorted, de-duplicated facets. `fallback` is used as the price
    /// bounds when `products` is empty.
    #[must_use]
    pub fn from_products(products: &[Product], fallback: (Price, Price)) -> Self {
        let categories: BTreeSet<&str> = products.iter().map(|p| p.category.as_str()).collect();
        let colors: BTreeSet<&str> = products
            .iter()
            .flat_map(|p| p.colors.iter().map(String::as_str))
            .collect();
        let sizes: BTreeSet<&str> = products
            .iter()
            .flat_map(|p| p.sizes.iter().map(String::as_str))
            .collect();
        let min = products.iter().map(|p| p.price).min();
        let max = products.iter().map(|p| p.price).max();

        Self {
            categories: categories.into_iter().map(String::from).collect(),
            colors: colors.into_iter().map(String::from).collect(),
            sizes: sizes.into_iter().map(String::from).collect(),
            price_bounds: min.zip(max).unwrap_or(fallback),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(id: &str, title: &str, cents: i64, gender: Gender, category: &str) -> Product {
        Product {
            gender,
            category: category.to_string(),
            colors: vec!["red".to_string(), "blue".to_string()],
            sizes: vec!["M".to_string()],
            ..Product::new(id, title, Price::from_cents(cents))
        }
    }

    #[test]
    fn test_filter_matches_each_dimension() {
        let tee = product("p1", "Linen Tee", 2000, Gender::Men, "tops");

        assert!(ProductFilter::default().matches(&tee));
        assert!(
            ProductFilter {
                gender: Some(Gender::Men),
                category: Some("tops".to_string()),
                color: Some("blue".to_string()),
                size: Some("M".to_string()),
                price_range: Some((Price::from_cents(1000), Price::from_cents(2000))),
                query: Some("linen".to_string()),
            }
            .matches(&tee)
        );
        assert!(
            !ProductFilter {
                gender: Some(Gender::Women),
                ..ProductFilter::default()
            }
            .matches(&tee)
        );
        assert!(
            !ProductFilter {
                size: Some("XL".to_string()),
                ..ProductFilter::default()
            }
            .matches(&tee)
        );
        assert!(
            !ProductFilter {
                price_range: Some((Price::ZERO, Price::from_cents(1999))),
                ..ProductFilter::default()
            }
            .matches(&tee)
        );
    }

    #[test]
    fn test_blank_criteria_are_ignored() {
        let tee = product("p1", "Linen Tee", 2000, Gender::Men, "tops");
        let filter = ProductFilter {
            category: Some("  ".to_string()),
            query: Some(String::new()),
            ..ProductFilter::default()
        };
        assert!(filter.matches(&tee));
    }

    #[test]
    fn test_facets_sorted_and_deduplicated() {
        let products = [
            product("p1", "A", 3000, Gender::Men, "tops"),
            product("p2", "B", 1500, Gender::Women, "dresses"),
            product("p3", "C", 2500, Gender::Women, "tops"),
        ];
        let facets = Facets::from_products(&products, (Price::ZERO, Price::ZERO));
        assert_eq!(facets.categories, vec!["dresses", "tops"]);
        assert_eq!(facets.colors, vec!["blue", "red"]);
        assert_eq!(facets.sizes, vec!["M"]);
        assert_eq!(
            facets.price_bounds,
            (Price::from_cents(1500), Price::from_cents(3000))
        );
    }

    #[test]
    fn test_facets_empty_catalog_uses_fallback() {
        let facets = Facets::from_products(&[], (Price::ZERO, Price::from_cents(10_000)));
        assert!(facets.categories.is_empty());
        assert_eq!(facets.price_bounds, (Price::ZERO, Price::from_cents(10_000)));
    }
}
