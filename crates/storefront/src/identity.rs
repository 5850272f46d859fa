//! Identity signal fed by the authentication provider.
//!
//! Domain stores watch this signal; the provider (or a test) drives it with
//! [`IdentitySignal::resolve`], [`IdentitySignal::sign_in`] and
//! [`IdentitySignal::sign_out`].

use std::sync::Arc;

use shopstate_core::{Identity, UserId};
use tokio::sync::watch;
use tracing::info;

use crate::error::{clear_sentry_user, set_sentry_user};
use crate::reactive::Observable;

/// Cloneable handle over the current [`Identity`].
#[derive(Debug, Clone, Default)]
pub struct IdentitySignal {
    inner: Arc<Observable<Identity>>,
}

impl IdentitySignal {
    /// Signal in the unresolved state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current identity.
    #[must_use]
    pub fn current(&self) -> Identity {
        self.inner.get()
    }

    /// Change notifications. Dropping the receiver unsubscribes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Identity> {
        self.inner.subscribe()
    }

    /// Record the provider's initial resolution. Always notifies, even when
    /// nobody is signed in.
    pub fn resolve(&self, user: Option<UserId>) {
        match &user {
            Some(id) => set_sentry_user(id),
            None => clear_sentry_user(),
        }
        info!(user_id = ?user, "Identity resolved");
        self.inner.set(Identity {
            id: user,
            ready: true,
        });
    }

    /// A user signed in (or switched accounts).
    pub fn sign_in(&self, user: UserId) {
        set_sentry_user(&user);
        info!(user_id = %user, "User signed in");
        self.inner.set_if_changed(Identity::user(user));
    }

    /// The current user signed out.
    pub fn sign_out(&self) {
        clear_sentry_user();
        info!("User signed out");
        self.inner.set_if_changed(Identity::guest());
    }

    /// Wait for the provider's initial resolution.
    pub async fn wait_ready(&self) -> Identity {
        self.inner.wait_until(|identity| identity.ready).await
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.inner.with(Identity::is_authenticated)
    }

    #[must_use]
    pub fn user_id(&self) -> Option<UserId> {
        self.inner.with(|identity| identity.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_starts_unresolved() {
        let signal = IdentitySignal::new();
        assert_eq!(signal.current(), Identity::pending());
        assert!(!signal.is_authenticated());
    }

    #[test]
    fn test_resolve_notifies_even_for_guest() {
        let signal = IdentitySignal::new();
        let rx = signal.watch();
        signal.resolve(None);
        assert!(rx.has_changed().unwrap_or(false));
        assert_eq!(signal.current(), Identity::guest());
    }

    #[test]
    fn test_sign_in_and_out() {
        let signal = IdentitySignal::new();
        signal.resolve(None);
        signal.sign_in(UserId::new("u1"));
        assert_eq!(signal.user_id(), Some(UserId::new("u1")));
        assert!(signal.current().ready);
        signal.sign_out();
        assert_eq!(signal.user_id(), None);
    }

    #[tokio::test]
    async fn test_wait_ready() {
        let signal = IdentitySignal::new();
        let provider = signal.clone();
        tokio::spawn(async move { provider.resolve(Some(UserId::new("u9"))) });
        let identity = tokio::time::timeout(Duration::from_secs(1), signal.wait_ready())
            .await
            .unwrap_or_default();
        assert_eq!(identity.id, Some(UserId::new("u9")));
    }
}
