//! Domain stores built on the sync engine.

pub mod cart;
pub mod coupon;
pub mod orders;
pub mod wishlist;

pub use cart::{CartDomain, CartStore};
pub use coupon::{CouponDomain, CouponStore};
pub use orders::{OrdersDomain, OrdersStore};
pub use wishlist::{WishlistDomain, WishlistStore};
