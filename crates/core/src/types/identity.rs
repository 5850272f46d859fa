//! Current-user identity as seen by the stores.

use serde::{Deserialize, Serialize};

use super::id::UserId;

/// Snapshot of the identity provider's state.
///
/// `ready` flips to `true` once, after the provider's initial resolution.
/// Until then `id` carries no meaning and stores keep showing guest state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Authenticated user, if any.
    pub id: Option<UserId>,
    /// Whether the provider has resolved its initial state.
    pub ready: bool,
}

impl Identity {
    /// Identity before the provider has resolved.
    #[must_use]
    pub const fn pending() -> Self {
        Self {
            id: None,
            ready: false,
        }
    }

    /// Resolved, unauthenticated identity.
    #[must_use]
    pub const fn guest() -> Self {
        Self {
            id: None,
            ready: true,
        }
    }

    /// Resolved identity for `id`.
    #[must_use]
    pub const fn user(id: UserId) -> Self {
        Self {
            id: Some(id),
            ready: true,
        }
    }

    /// Whether a user is signed in.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.id.is_some()
    }
}
