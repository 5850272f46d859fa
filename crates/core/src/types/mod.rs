//! Core types for the storefront state layer.
//!
//! This module provides type-safe wrappers and keyed records for the
//! cart, wishlist, coupon, order and catalog domains.

pub mod cart;
pub mod coupon;
pub mod entity;
pub mod error;
pub mod id;
pub mod identity;
pub mod order;
pub mod price;
pub mod product;
pub mod wishlist;

pub use cart::{CartLine, CartLineKey};
pub use coupon::{AppliedCoupon, Coupon, CouponRule, CouponSlot, normalize_code};
pub use entity::Entity;
pub use error::ValidationError;
pub use id::*;
pub use identity::Identity;
pub use order::{Delivery, Order, OrderAmounts, OrderDraft, OrderLine};
pub use price::Price;
pub use product::{Facets, Gender, Product, ProductFilter};
pub use wishlist::WishlistEntry;
