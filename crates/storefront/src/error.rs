//! Store-boundary error taxonomy with Sentry integration.
//!
//! Every store operation returns `Result<T, StoreError>`. Validation and
//! auth errors are synchronous rejections; remote and storage failures are
//! also recorded in the store's `error` cell and reported through [`report`].

use shopstate_core::ValidationError;
use thiserror::Error;

use crate::remote::RemoteError;
use crate::storage::StorageError;

/// Error surfaced by a domain store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Malformed input; nothing was applied.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Operation needs a signed-in user.
    #[error("Authentication required")]
    AuthRequired,

    /// Remote confirmation of an optimistic change failed; the change was rolled back.
    #[error("Remote write failed: {0}")]
    RemoteWrite(RemoteError),

    /// Remote load, merge or subscription failed; last-known-good state kept.
    #[error("Remote read failed: {0}")]
    RemoteRead(RemoteError),

    /// Local persistence failed; in-memory state is still correct.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl StoreError {
    /// Whether the error comes from infrastructure rather than the caller.
    #[must_use]
    pub const fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::RemoteWrite(_) | Self::RemoteRead(_) | Self::Storage(_)
        )
    }
}

/// Result type alias for `StoreError`.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Log a store error and capture infrastructure failures to Sentry.
pub fn report(domain: &'static str, err: &StoreError) {
    if err.is_infrastructure() {
        let event_id = sentry::capture_error(err);
        tracing::warn!(
            domain,
            error = %err,
            sentry_event_id = %event_id,
            "Store error"
        );
    } else {
        tracing::debug!(domain, error = %err, "Rejected store operation");
    }
}

/// Set the Sentry user context from a user ID.
///
/// Called on sign-in to associate errors with users.
pub fn set_sentry_user(user_id: &impl ToString) {
    sentry::configure_scope(|scope| {
        scope.set_user(Some(sentry::User {
            id: Some(user_id.to_string()),
            ..Default::default()
        }));
    });
}

/// Clear the Sentry user context.
///
/// Called on sign-out to stop associating errors with the user.
pub fn clear_sentry_user() {
    sentry::configure_scope(|scope| {
        scope.set_user(None);
    });
}

/// Add a breadcrumb for user actions.
///
/// Breadcrumbs appear in Sentry error reports to show the trail of user actions
/// leading up to an error.
///
/// # Example
///
/// ```rust,ignore
/// add_breadcrumb("cart", "Added line", Some(&[("line", "p1_red_M")]));
/// ```
pub fn add_breadcrumb(category: &str, message: &str, data: Option<&[(&str, &str)]>) {
    let mut breadcrumb = sentry::Breadcrumb {
        category: Some(category.to_string()),
        message: Some(message.to_string()),
        level: sentry::Level::Info,
        ..Default::default()
    };

    if let Some(pairs) = data {
        for (key, value) in pairs {
            breadcrumb.data.insert(
                (*key).to_string(),
                serde_json::Value::String((*value).to_string()),
            );
        }
    }

    sentry::add_breadcrumb(breadcrumb);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::from(ValidationError::EmptyOrder);
        assert_eq!(err.to_string(), "Validation error: order has no line items");

        let err = StoreError::RemoteWrite(RemoteError::Unavailable("offline".to_string()));
        assert_eq!(
            err.to_string(),
            "Remote write failed: Backend unavailable: offline"
        );
    }

    #[test]
    fn test_infrastructure_classification() {
        assert!(!StoreError::AuthRequired.is_infrastructure());
        assert!(!StoreError::Validation(ValidationError::EmptyOrder).is_infrastructure());
        assert!(StoreError::Storage(StorageError::QuotaExceeded { needed: 10, quota: 5 })
            .is_infrastructure());
        assert!(
            StoreError::RemoteRead(RemoteError::Decode("bad".to_string())).is_infrastructure()
        );
    }
}
