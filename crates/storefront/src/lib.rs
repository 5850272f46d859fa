//! Shopstate Storefront library.
//!
//! Client-side state for a storefront: cart, wishlist, coupon and order
//! stores that work the same for anonymous visitors and signed-in users,
//! plus a product catalog and an infinite list over it.
//!
//! # Architecture
//!
//! - [`engine`] - The dual-mode sync engine every domain store is built on
//! - [`stores`] - Cart, wishlist, coupon and orders stores
//! - [`catalog`] / [`infinite`] - Read-only product catalog and pagination
//! - [`remote`] - Backend contracts with in-memory and REST implementations
//! - [`storage`] - Device storage for guest state
//! - [`state`] - The [`Storefront`](state::Storefront) context wiring it all

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod infinite;
pub mod reactive;
pub mod remote;
pub mod state;
pub mod storage;
pub mod stores;
pub mod telemetry;

pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use identity::IdentitySignal;
pub use state::Storefront;
