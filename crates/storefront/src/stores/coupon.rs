//! Coupon code applied to the current cart.
//!
//! The synchronized slot holds at most one code, and only a code that was
//! valid when applied. What consumers read is the evaluated [`Coupon`]: the
//! last code entered, whether it is valid, and its percentage. A stored code
//! is re-validated against the rules whenever the slot changes (startup,
//! login, remote updates); one that has gone inactive is dropped from the slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use rust_decimal::Decimal;
use shopstate_core::{AppliedCoupon, Coupon, CouponSlot, normalize_code};
use tracing::{debug, info, instrument, warn};

use crate::engine::{Domain, Mode, SyncEngine, TaskGuard};
use crate::error::{Result, StoreError, add_breadcrumb};
use crate::identity::IdentitySignal;
use crate::reactive::Observable;
use crate::remote::{CouponRules, RemoteStore};
use crate::storage::{GUEST_COUPON_KEY, LocalStorage};

#[derive(Debug)]
pub struct CouponDomain;

impl Domain for CouponDomain {
    type Entry = AppliedCoupon;
    const NAME: &'static str = "coupon";
    const GUEST_KEY: Option<&'static str> = Some(GUEST_COUPON_KEY);

    /// The owner's existing coupon wins over the guest's.
    fn merge(guest: &AppliedCoupon, remote: Option<&AppliedCoupon>) -> Option<AppliedCoupon> {
        remote.is_none().then(|| guest.clone())
    }
}

struct CouponInner {
    engine: SyncEngine<CouponDomain>,
    rules: Arc<dyn CouponRules>,
    coupon: Observable<Coupon>,
    started: AtomicBool,
    validator: Mutex<Option<TaskGuard>>,
}

/// Coupon store handle. Cheap to clone.
#[derive(Clone)]
pub struct CouponStore {
    inner: Arc<CouponInner>,
}

impl std::fmt::Debug for CouponStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CouponStore")
            .field("coupon", &self.coupon())
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}

impl CouponStore {
    #[must_use]
    pub fn new(
        identity: IdentitySignal,
        storage: Arc<dyn LocalStorage>,
        remote: Arc<dyn RemoteStore<AppliedCoupon>>,
        rules: Arc<dyn CouponRules>,
    ) -> Self {
        Self {
            inner: Arc::new(CouponInner {
                engine: SyncEngine::new(identity, storage, remote),
                rules,
                coupon: Observable::new(Coupon::none()),
                started: AtomicBool::new(false),
                validator: Mutex::new(None),
            }),
        }
    }

    /// Load the stored code, validate it, then keep validating as the slot changes.
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.engine.start().await;

        let mut slot = self.inner.engine.items().subscribe();
        self.revalidate().await;

        let weak: Weak<CouponInner> = Arc::downgrade(&self.inner);
        let validator = tokio::spawn(async move {
            while slot.changed().await.is_ok() {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Self { inner }.revalidate().await;
            }
        });
        *self
            .inner
            .validator
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(TaskGuard(validator));
    }

    pub async fn refresh(&self) {
        self.inner.engine.refresh().await;
    }

    /// Apply a code entered by the user.
    ///
    /// The code is normalized first; blank input resets the coupon. Returns
    /// whether the code is valid. An invalid code is shown but not stored.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::RemoteRead` if the rule lookup failed (nothing
    /// changes), otherwise the engine's persistence or remote errors.
    #[instrument(skip(self, input))]
    pub async fn apply(&self, input: &str) -> Result<bool> {
        let code = normalize_code(input);
        if code.is_empty() {
            self.reset().await?;
            return Ok(false);
        }

        let rule = self
            .inner
            .rules
            .lookup(&code)
            .await
            .map_err(|e| self.inner.engine.fail(StoreError::RemoteRead(e)))?;
        let coupon = Coupon::evaluate(&code, rule.as_ref());
        let valid = coupon.valid;

        let stored = if valid {
            let applied = AppliedCoupon { code: code.clone() };
            self.inner
                .engine
                .mutate(CouponSlot, |_| Some(applied))
                .await
        } else {
            self.inner.engine.mutate(CouponSlot, |_| None).await
        };
        // A guest storage failure keeps the in-memory change
        if matches!(stored, Ok(_) | Err(StoreError::Storage(_))) {
            self.inner.coupon.set_if_changed(coupon);
        }
        stored?;

        add_breadcrumb(
            "coupon",
            if valid { "Applied coupon" } else { "Rejected coupon" },
            Some(&[("code", code.as_str())]),
        );
        info!(code = %code, valid, "Coupon applied");
        Ok(valid)
    }

    /// Remove the applied coupon.
    ///
    /// # Errors
    ///
    /// The engine's persistence or remote errors.
    pub async fn reset(&self) -> Result<()> {
        let cleared = self.inner.engine.mutate(CouponSlot, |_| None).await;
        if matches!(cleared, Ok(_) | Err(StoreError::Storage(_))) {
            self.inner.coupon.set_if_changed(Coupon::none());
        }
        cleared.map(|_| ())
    }

    fn slot_code(&self) -> Option<String> {
        self.inner
            .engine
            .items()
            .with(|items| items.get(&CouponSlot).map(|applied| applied.code.clone()))
    }

    /// Bring the evaluated coupon in line with the stored slot.
    async fn revalidate(&self) {
        let Some(code) = self.slot_code() else {
            if self.inner.coupon.with(|coupon| coupon.valid) {
                self.inner.coupon.set(Coupon::none());
            }
            return;
        };
        if self
            .inner
            .coupon
            .with(|coupon| coupon.valid && coupon.code == code)
        {
            return;
        }

        let rule = match self.inner.rules.lookup(&code).await {
            Ok(rule) => rule,
            Err(e) => {
                self.inner.engine.fail(StoreError::RemoteRead(e));
                return;
            }
        };
        if self.slot_code().as_deref() != Some(code.as_str()) {
            // Superseded while the lookup was in flight
            return;
        }

        let coupon = Coupon::evaluate(&code, rule.as_ref());
        if coupon.valid {
            self.inner.coupon.set_if_changed(coupon);
            return;
        }

        debug!(code = %code, "Stored coupon no longer valid");
        self.inner.coupon.set_if_changed(coupon);
        if let Err(e) = self.inner.engine.mutate(CouponSlot, |_| None).await {
            warn!(code = %code, error = %e, "Failed to drop inactive coupon");
        }
    }

    /// Current evaluated coupon.
    #[must_use]
    pub fn coupon(&self) -> Coupon {
        self.inner.coupon.get()
    }

    #[must_use]
    pub fn coupon_cell(&self) -> &Observable<Coupon> {
        &self.inner.coupon
    }

    #[must_use]
    pub fn code(&self) -> String {
        self.inner.coupon.with(|coupon| coupon.code.clone())
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.inner.coupon.with(|coupon| coupon.valid)
    }

    #[must_use]
    pub fn percent(&self) -> u8 {
        self.inner.coupon.with(|coupon| coupon.percent)
    }

    /// Discount as a fraction in `0..=1`; zero unless valid.
    #[must_use]
    pub fn discount_fraction(&self) -> Decimal {
        self.inner.coupon.with(Coupon::discount_fraction)
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.inner.engine.mode()
    }

    #[must_use]
    pub fn mode_cell(&self) -> &Observable<Mode> {
        self.inner.engine.mode_cell()
    }

    #[must_use]
    pub fn is_guest(&self) -> bool {
        self.inner.engine.is_guest()
    }

    #[must_use]
    pub fn loading(&self) -> &Observable<bool> {
        self.inner.engine.loading()
    }

    #[must_use]
    pub fn error(&self) -> &Observable<Option<StoreError>> {
        self.inner.engine.error()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use shopstate_core::CouponRule;

    use super::*;
    use crate::remote::memory::MemoryBackend;
    use crate::storage::{MemoryStorage, read_json};

    fn store(storage: &Arc<MemoryStorage>, backend: &MemoryBackend) -> CouponStore {
        let identity = IdentitySignal::new();
        identity.resolve(None);
        CouponStore::new(
            identity,
            Arc::clone(storage) as Arc<dyn LocalStorage>,
            Arc::new(backend.coupons()),
            Arc::new(backend.clone()),
        )
    }

    fn backend_with_save10() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.put_rule(CouponRule::new("SAVE10", true, 10).unwrap());
        backend
    }

    #[tokio::test]
    async fn test_apply_normalizes_and_stores_valid_code() {
        let storage = Arc::new(MemoryStorage::new());
        let coupons = store(&storage, &backend_with_save10());
        coupons.start().await;

        assert!(coupons.apply("  save10 ").await.unwrap());
        assert_eq!(coupons.code(), "SAVE10");
        assert_eq!(coupons.percent(), 10);
        assert_eq!(coupons.discount_fraction(), Decimal::new(1, 1));

        let stored: Vec<AppliedCoupon> = read_json(storage.as_ref(), GUEST_COUPON_KEY)
            .unwrap()
            .unwrap();
        assert_eq!(stored[0].code, "SAVE10");
    }

    #[tokio::test]
    async fn test_invalid_code_shown_but_not_stored() {
        let storage = Arc::new(MemoryStorage::new());
        let coupons = store(&storage, &backend_with_save10());
        coupons.start().await;
        coupons.apply("SAVE10").await.unwrap();

        assert!(!coupons.apply("bogus").await.unwrap());
        let coupon = coupons.coupon();
        assert_eq!(coupon.code, "BOGUS");
        assert!(!coupon.valid);
        assert_eq!(coupon.percent, 0);
        assert_eq!(storage.read(GUEST_COUPON_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_blank_input_resets() {
        let storage = Arc::new(MemoryStorage::new());
        let coupons = store(&storage, &backend_with_save10());
        coupons.start().await;
        coupons.apply("SAVE10").await.unwrap();

        assert!(!coupons.apply("   ").await.unwrap());
        assert_eq!(coupons.coupon(), Coupon::none());
        assert_eq!(coupons.discount_fraction(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_failed_drop_of_inactive_code_is_reported() {
        let owner = shopstate_core::UserId::new("u1");
        let backend = MemoryBackend::new();
        backend.put_rule(CouponRule::new("OLD5", false, 5).unwrap());
        backend.coupons().seed(
            &owner,
            [AppliedCoupon {
                code: "OLD5".to_string(),
            }],
        );
        let identity = IdentitySignal::new();
        identity.resolve(Some(owner.clone()));
        let coupons = CouponStore::new(
            identity,
            Arc::new(MemoryStorage::new()),
            Arc::new(backend.coupons()),
            Arc::new(backend.clone()),
        );

        backend.fail_next_writes(1);
        coupons.start().await;

        assert!(!coupons.is_valid());
        assert_eq!(coupons.code(), "OLD5");
        assert!(matches!(coupons.error().get(), Some(StoreError::RemoteWrite(_))));

        // The restored slot is validated again and dropped on retry
        tokio::time::timeout(
            std::time::Duration::from_secs(2),
            coupons.inner.engine.items().wait_until(|items| items.is_empty()),
        )
        .await
        .unwrap();
        assert!(backend.coupons().rows(&owner).is_empty());
    }

    #[tokio::test]
    async fn test_lookup_failure_changes_nothing() {
        let storage = Arc::new(MemoryStorage::new());
        let backend = backend_with_save10();
        let coupons = store(&storage, &backend);
        coupons.start().await;

        backend.fail_reads(true);
        let err = coupons.apply("SAVE10").await.unwrap_err();
        assert!(matches!(err, StoreError::RemoteRead(_)));
        assert_eq!(coupons.coupon(), Coupon::none());
    }
}
