//! Newtype IDs for type-safe entity references.
//!
//! Use the `define_id!` macro to create type-safe ID wrappers that prevent
//! accidentally mixing IDs from different entity types.

use crate::types::error::ValidationError;

/// Macro to define a type-safe ID wrapper.
///
/// Creates a newtype wrapper around `String` with:
/// - `Serialize`/`Deserialize` with `#[serde(transparent)]`
/// - `Debug`, `Clone`, `PartialEq`, `Eq`, `Hash`, `PartialOrd`, `Ord`
/// - Conversion methods: `new()`, `parse()`, `as_str()`
/// - `From<String>`, `From<&str>` and `Display` implementations
///
/// `new()` trims surrounding whitespace; `parse()` additionally rejects
/// identifiers that are empty after trimming.
///
/// # Example
///
/// ```rust
/// # use shopstate_core::define_id;
/// define_id!(UserId);
/// define_id!(OrderId);
///
/// let user_id = UserId::new("u-1");
/// let order_id = OrderId::new("u-1");
///
/// // These are different types, so this won't compile:
/// // let _: UserId = order_id;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            ::serde::Serialize,
            ::serde::Deserialize
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new ID, trimming surrounding whitespace.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                let id: String = id.into();
                Self(id.trim().to_string())
            }

            /// Create a new ID, rejecting blank input.
            ///
            /// # Errors
            ///
            /// Returns `ValidationError::EmptyIdentifier` if the trimmed input is empty.
            pub fn parse(id: impl Into<String>) -> Result<Self, $crate::ValidationError> {
                let id = Self::new(id);
                if id.0.is_empty() {
                    return Err($crate::ValidationError::EmptyIdentifier(stringify!($name)));
                }
                Ok(id)
            }

            /// Get the underlying string value.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the identifier is blank.
            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl ::core::fmt::Display for $name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self::new(id)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

// Define standard entity IDs
define_id!(UserId);
define_id!(ProductId);
define_id!(OrderId);

/// Reject a blank free-form field (colors, sizes, titles).
///
/// # Errors
///
/// Returns `ValidationError::EmptyIdentifier` naming `field` if `value` is blank.
pub fn require_non_blank(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::EmptyIdentifier(field));
    }
    Ok(())
}
