//! Shopstate Core - Shared types library.
//!
//! This crate provides the domain types used by the storefront state layer:
//! - `storefront` - Dual-mode (guest / owned) cart, wishlist, coupon and order stores
//! - `integration-tests` - Cross-store scenarios against the in-memory backend
//!
//! # Architecture
//!
//! The core crate contains only types and traits - no I/O, no storage access,
//! no HTTP clients. This keeps it lightweight and allows it to be used anywhere.
//!
//! # Modules
//!
//! - [`types`] - Newtype IDs, prices, identity, and the keyed domain records

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
