//! Dual-mode synchronization engine shared by the domain stores.
//!
//! A [`SyncEngine`] owns one keyed collection and keeps it in exactly one of
//! two realms:
//!
//! - `Guest`: entries live in local storage under the domain's guest key.
//!   Mutations apply in memory and persist synchronously.
//! - `Owned(uid)`: entries live in the remote store, scoped to `uid`, with a
//!   live change feed reconciled into memory. Mutations apply optimistically
//!   and roll back to their exact prior entries if the remote write fails.
//!
//! Identity changes drive the transitions:
//!
//! | From | To | Action |
//! |---|---|---|
//! | `Guest` | `Owned(uid)` | merge guest entries into `uid`, purge guest storage, bind |
//! | `Owned(a)` | `Owned(b)` | unbind `a`, bind `b` |
//! | `Owned(a)` | `Guest` | unbind `a`, load guest storage |
//!
//! Transitions hold the write side of a per-engine gate, mutations the read
//! side, so a transition never interleaves with a mutation or another
//! transition. Identity notifications coalesce in a `watch` channel: a change
//! that arrives mid-transition is evaluated against the identity current when
//! the transition finishes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use shopstate_core::{Entity, Identity, UserId};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, StoreError, report};
use crate::identity::IdentitySignal;
use crate::reactive::Observable;
use crate::remote::{ChangeEvent, ChangeFeed, RemoteStore};
use crate::storage::{LocalStorage, StorageError, read_json, write_json};

/// Entries of a collection, by natural key.
pub type Items<E> = BTreeMap<<E as Entity>::Key, E>;

/// Per-domain policy plugged into the engine.
pub trait Domain: Send + Sync + 'static {
    type Entry: Entity;

    /// Name used in logs and error reports.
    const NAME: &'static str;

    /// Local storage key of the guest realm; `None` if guests own nothing.
    const GUEST_KEY: Option<&'static str>;

    /// Combine a guest entry with the owner's existing remote entry.
    ///
    /// Returns the entry to upload, or `None` to keep the remote as is.
    fn merge(guest: &Self::Entry, remote: Option<&Self::Entry>) -> Option<Self::Entry>;
}

/// Which realm is authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Guest,
    Owned(UserId),
}

impl Mode {
    /// Realm selected by `identity`. An unresolved identity shows the guest realm.
    #[must_use]
    pub fn for_identity(identity: &Identity) -> Self {
        match (&identity.id, identity.ready) {
            (Some(id), true) => Self::Owned(id.clone()),
            _ => Self::Guest,
        }
    }

    #[must_use]
    pub const fn owner(&self) -> Option<&UserId> {
        match self {
            Self::Guest => None,
            Self::Owned(id) => Some(id),
        }
    }

    #[must_use]
    pub const fn is_guest(&self) -> bool {
        matches!(self, Self::Guest)
    }
}

/// Aborts the task when dropped.
pub(crate) struct TaskGuard(pub(crate) JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Guest entries still to be uploaded for `owner`.
struct PendingMerge<E: Entity> {
    owner: UserId,
    entries: Items<E>,
}

// =============================================================================
// Commands
// =============================================================================

struct Change<E: Entity> {
    key: E::Key,
    before: Option<E>,
    after: Option<E>,
}

enum RemoteOp<E: Entity> {
    Upsert(E),
    Delete(E::Key),
    Clear,
}

/// A mutation with the prior values of every key it touches.
struct Command<E: Entity> {
    changes: Vec<Change<E>>,
    remote: RemoteOp<E>,
}

impl<E: Entity> Command<E> {
    fn single(key: E::Key, before: Option<E>, after: Option<E>) -> Self {
        let remote = match &after {
            Some(entry) => RemoteOp::Upsert(entry.clone()),
            None => RemoteOp::Delete(key.clone()),
        };
        Self {
            changes: vec![Change { key, before, after }],
            remote,
        }
    }

    fn clear(items: &Items<E>) -> Self {
        Self {
            changes: items
                .iter()
                .map(|(key, entry)| Change {
                    key: key.clone(),
                    before: Some(entry.clone()),
                    after: None,
                })
                .collect(),
            remote: RemoteOp::Clear,
        }
    }

    fn apply(&self, items: &Observable<Items<E>>) {
        items.update(|map| {
            for change in &self.changes {
                set_entry(map, &change.key, change.after.clone());
            }
        });
    }

    /// Restore the prior value of every key still holding this command's
    /// value. Keys a later write has since changed keep the newer value.
    ///
    /// Returns the number of keys left alone.
    fn revert(&self, items: &Observable<Items<E>>) -> usize {
        let mut superseded = 0;
        items.update_if(|map| {
            let mut changed = false;
            for change in &self.changes {
                if map.get(&change.key) != change.after.as_ref() {
                    superseded += 1;
                    continue;
                }
                set_entry(map, &change.key, change.before.clone());
                changed = true;
            }
            changed
        });
        superseded
    }
}

fn set_entry<E: Entity>(map: &mut Items<E>, key: &E::Key, value: Option<E>) {
    match value {
        Some(entry) => {
            map.insert(key.clone(), entry);
        }
        None => {
            map.remove(key);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn keyed<E: Entity>(entries: Vec<E>) -> Items<E> {
    entries.into_iter().map(|entry| (entry.key(), entry)).collect()
}

// =============================================================================
// Engine
// =============================================================================

struct Shared<D: Domain> {
    items: Observable<Items<D::Entry>>,
    mode: Observable<Mode>,
    loading: Observable<bool>,
    error: Observable<Option<StoreError>>,
    /// Bumped by every transition; stale feed events and rollbacks check it.
    epoch: AtomicU64,
    gate: RwLock<()>,
    started: AtomicBool,
    needs_rebind: AtomicBool,
    pending_merge: Mutex<Option<PendingMerge<D::Entry>>>,
    feed: Mutex<Option<TaskGuard>>,
    watcher: Mutex<Option<TaskGuard>>,
    identity: IdentitySignal,
    storage: Arc<dyn LocalStorage>,
    remote: Arc<dyn RemoteStore<D::Entry>>,
}

/// Reactive collection bound to the guest or owned realm. Cheap to clone.
pub struct SyncEngine<D: Domain> {
    shared: Arc<Shared<D>>,
}

impl<D: Domain> Clone for SyncEngine<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D: Domain> std::fmt::Debug for SyncEngine<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("domain", &D::NAME)
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}

impl<D: Domain> SyncEngine<D> {
    #[must_use]
    pub fn new(
        identity: IdentitySignal,
        storage: Arc<dyn LocalStorage>,
        remote: Arc<dyn RemoteStore<D::Entry>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                items: Observable::new(BTreeMap::new()),
                mode: Observable::new(Mode::Guest),
                loading: Observable::new(false),
                error: Observable::new(None),
                epoch: AtomicU64::new(0),
                gate: RwLock::new(()),
                started: AtomicBool::new(false),
                needs_rebind: AtomicBool::new(false),
                pending_merge: Mutex::new(None),
                feed: Mutex::new(None),
                watcher: Mutex::new(None),
                identity,
                storage,
                remote,
            }),
        }
    }

    fn upgrade(weak: &Weak<Shared<D>>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    // -------------------------------------------------------------------------
    // Reactive state
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn items(&self) -> &Observable<Items<D::Entry>> {
        &self.shared.items
    }

    #[must_use]
    pub fn mode_cell(&self) -> &Observable<Mode> {
        &self.shared.mode
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.shared.mode.get()
    }

    #[must_use]
    pub fn is_guest(&self) -> bool {
        self.shared.mode.with(Mode::is_guest)
    }

    #[must_use]
    pub fn loading(&self) -> &Observable<bool> {
        &self.shared.loading
    }

    #[must_use]
    pub fn error(&self) -> &Observable<Option<StoreError>> {
        &self.shared.error
    }

    #[must_use]
    pub fn identity(&self) -> &IdentitySignal {
        &self.shared.identity
    }

    #[must_use]
    pub fn remote(&self) -> &Arc<dyn RemoteStore<D::Entry>> {
        &self.shared.remote
    }

    /// Whether guest entries are still waiting to be merged after a failure.
    #[must_use]
    pub fn merge_pending(&self) -> bool {
        lock(&self.shared.pending_merge).is_some()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Load the guest realm, settle on the current identity, then follow
    /// identity changes. Calling it again is a no-op.
    pub async fn start(&self) {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.load_guest();

        let mut rx = self.shared.identity.watch();
        let identity = rx.borrow_and_update().clone();
        self.transition(&identity).await;

        let weak = Arc::downgrade(&self.shared);
        let watcher = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let identity = rx.borrow_and_update().clone();
                let Some(engine) = Self::upgrade(&weak) else {
                    break;
                };
                engine.transition(&identity).await;
            }
        });
        *lock(&self.shared.watcher) = Some(TaskGuard(watcher));
    }

    /// Reload the authoritative realm, retrying an unfinished merge first.
    #[instrument(skip(self), fields(domain = D::NAME))]
    pub async fn refresh(&self) {
        let _gate = self.shared.gate.write().await;
        match self.mode() {
            Mode::Guest => self.load_guest(),
            Mode::Owned(uid) => {
                self.begin();
                self.run_pending_merge(&uid).await;
                self.unbind();
                self.bind(uid).await;
            }
        }
    }

    #[instrument(skip(self, identity), fields(domain = D::NAME, user_id = ?identity.id))]
    async fn transition(&self, identity: &Identity) {
        let _gate = self.shared.gate.write().await;
        let target = Mode::for_identity(identity);

        match (self.mode(), target) {
            (Mode::Guest, Mode::Guest) => {}
            (Mode::Guest, Mode::Owned(uid)) => {
                info!(domain = D::NAME, user_id = %uid, "Guest signed in, merging");
                self.begin();
                let guest = self.shared.items.get();
                *lock(&self.shared.pending_merge) = Some(PendingMerge {
                    owner: uid.clone(),
                    entries: guest,
                });
                self.run_pending_merge(&uid).await;
                self.bind(uid).await;
            }
            (Mode::Owned(current), Mode::Owned(uid)) if current == uid => {
                if self.merge_pending() || self.shared.needs_rebind.load(Ordering::SeqCst) {
                    self.begin();
                    self.run_pending_merge(&uid).await;
                    self.unbind();
                    self.bind(uid).await;
                }
            }
            (Mode::Owned(current), Mode::Owned(uid)) => {
                info!(domain = D::NAME, from = %current, to = %uid, "Account switched");
                self.begin();
                self.unbind();
                self.bind(uid).await;
            }
            (Mode::Owned(current), Mode::Guest) => {
                info!(domain = D::NAME, user_id = %current, "Signed out");
                self.begin();
                self.unbind();
                self.load_guest();
            }
        }
    }

    fn begin(&self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        self.shared.loading.set_if_changed(true);
    }

    fn load_guest(&self) {
        let items = match D::GUEST_KEY {
            None => Items::<D::Entry>::new(),
            Some(key) => match read_json::<Vec<D::Entry>>(self.shared.storage.as_ref(), key) {
                Ok(entries) => keyed(entries.unwrap_or_default()),
                Err(e) => {
                    self.fail(StoreError::Storage(e));
                    Items::<D::Entry>::new()
                }
            },
        };
        *lock(&self.shared.pending_merge) = None;
        self.shared.needs_rebind.store(false, Ordering::SeqCst);
        self.shared.items.set_if_changed(items);
        self.shared.mode.set_if_changed(Mode::Guest);
        self.shared.loading.set_if_changed(false);
    }

    /// Subscribe, load, then start reconciling the feed.
    async fn bind(&self, uid: UserId) {
        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        let same_owner = self.shared.mode.with(|mode| mode.owner() == Some(&uid));
        let mut healthy = true;

        let feed = match self.shared.remote.subscribe(&uid).await {
            Ok(feed) => Some(feed),
            Err(e) => {
                healthy = false;
                self.fail(StoreError::RemoteRead(e));
                None
            }
        };

        match self.shared.remote.list(&uid).await {
            Ok(entries) => {
                self.shared.items.set_if_changed(keyed(entries));
            }
            Err(e) => {
                healthy = false;
                if !same_owner {
                    // Never show another owner's entries
                    self.shared.items.set_if_changed(Items::<D::Entry>::new());
                }
                self.fail(StoreError::RemoteRead(e));
            }
        }

        if let Some(feed) = feed {
            self.spawn_feed(feed, epoch);
        }

        self.shared.needs_rebind.store(!healthy, Ordering::SeqCst);
        if healthy && !self.merge_pending() {
            self.shared.error.set_if_changed(None);
        }
        self.shared.mode.set_if_changed(Mode::Owned(uid));
        self.shared.loading.set_if_changed(false);
    }

    fn unbind(&self) {
        *lock(&self.shared.feed) = None;
    }

    fn spawn_feed(&self, mut feed: ChangeFeed<D::Entry>, epoch: u64) {
        let weak = Arc::downgrade(&self.shared);
        let task = tokio::spawn(async move {
            while let Some(event) = feed.next().await {
                let Some(engine) = Self::upgrade(&weak) else {
                    break;
                };
                if engine.shared.epoch.load(Ordering::SeqCst) != epoch {
                    break;
                }
                match event {
                    Ok(change) => engine.reconcile(change),
                    Err(e) => {
                        warn!(domain = D::NAME, error = %e, "Live feed error");
                        engine.fail(StoreError::RemoteRead(e));
                    }
                }
            }
            debug!(domain = D::NAME, "Live feed closed");
        });
        *lock(&self.shared.feed) = Some(TaskGuard(task));
    }

    /// Apply a remote change. Re-applying a change already present is a no-op.
    fn reconcile(&self, event: ChangeEvent<D::Entry>) {
        match event {
            ChangeEvent::Insert(entry) | ChangeEvent::Update(entry) => {
                let key = entry.key();
                let changed = self.shared.items.update_if(move |items| {
                    if items.get(&key) == Some(&entry) {
                        return false;
                    }
                    items.insert(key, entry);
                    true
                });
                if !changed {
                    debug!(domain = D::NAME, "Echo ignored");
                }
            }
            ChangeEvent::Delete(key) => {
                self.shared
                    .items
                    .update_if(move |items| items.remove(&key).is_some());
            }
        }
    }

    /// Record an entry the remote just confirmed for `owner`, if bound to it.
    pub fn remember(&self, owner: &UserId, entry: D::Entry) {
        if self.shared.mode.with(|mode| mode.owner() == Some(owner)) {
            self.reconcile(ChangeEvent::Insert(entry));
        }
    }

    // -------------------------------------------------------------------------
    // Merge
    // -------------------------------------------------------------------------

    async fn run_pending_merge(&self, uid: &UserId) {
        let pending = {
            let mut slot = lock(&self.shared.pending_merge);
            match slot.take() {
                Some(pending) if pending.owner == *uid => pending,
                // Entries pending for another owner stay in guest storage
                _ => return,
            }
        };
        let Some(guest_key) = D::GUEST_KEY else {
            return;
        };

        let count = pending.entries.len();
        match self.merge(uid, guest_key, pending.entries).await {
            Ok(()) => {
                if count > 0 {
                    info!(domain = D::NAME, user_id = %uid, count, "Guest entries merged");
                }
            }
            Err((remaining, err)) => {
                warn!(
                    domain = D::NAME,
                    user_id = %uid,
                    remaining = remaining.len(),
                    "Merge incomplete"
                );
                *lock(&self.shared.pending_merge) = Some(PendingMerge {
                    owner: uid.clone(),
                    entries: remaining,
                });
                self.fail(err);
            }
        }
    }

    /// Upload guest entries, removing each from guest storage as it lands.
    async fn merge(
        &self,
        uid: &UserId,
        guest_key: &str,
        mut remaining: Items<D::Entry>,
    ) -> std::result::Result<(), (Items<D::Entry>, StoreError)> {
        if !remaining.is_empty() {
            let existing = match self.shared.remote.list(uid).await {
                Ok(entries) => keyed(entries),
                Err(e) => return Err((remaining, StoreError::RemoteRead(e))),
            };

            let keys: Vec<_> = remaining.keys().cloned().collect();
            for key in keys {
                let Some(guest) = remaining.get(&key) else {
                    continue;
                };
                if let Some(merged) = D::merge(guest, existing.get(&key))
                    && let Err(e) = self.shared.remote.upsert(uid, &merged).await
                {
                    return Err((remaining, StoreError::RemoteWrite(e)));
                }
                remaining.remove(&key);
                if let Err(e) = self.persist(guest_key, &remaining) {
                    self.fail(StoreError::Storage(e));
                }
            }
        }

        if let Err(e) = self.shared.storage.erase(guest_key) {
            self.fail(StoreError::Storage(e));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    /// Replace the entry at `key` with `f(current)`; `None` removes it.
    ///
    /// Returns the new entry.
    ///
    /// # Errors
    ///
    /// - `StoreError::AuthRequired` in guest mode for domains without a guest realm.
    /// - `StoreError::Storage` if the guest realm could not be persisted (the
    ///   in-memory change is kept).
    /// - `StoreError::RemoteWrite` if the remote write failed (the change was
    ///   rolled back).
    pub async fn mutate<F>(&self, key: <D::Entry as Entity>::Key, f: F) -> Result<Option<D::Entry>>
    where
        F: FnOnce(Option<&D::Entry>) -> Option<D::Entry> + Send,
    {
        let _gate = self.shared.gate.read().await;
        let before = self.shared.items.with(|items| items.get(&key).cloned());
        let after = f(before.as_ref());
        if after == before {
            return Ok(after);
        }

        self.execute(Command::single(key, before, after.clone()))
            .await?;
        Ok(after)
    }

    /// Remove every entry of the current realm.
    ///
    /// # Errors
    ///
    /// Same as [`SyncEngine::mutate`].
    pub async fn clear(&self) -> Result<()> {
        let _gate = self.shared.gate.read().await;
        let command = self.shared.items.with(Command::clear);
        self.execute(command).await
    }

    async fn execute(&self, command: Command<D::Entry>) -> Result<()> {
        match self.mode() {
            Mode::Guest => {
                let Some(guest_key) = D::GUEST_KEY else {
                    return Err(StoreError::AuthRequired);
                };
                command.apply(&self.shared.items);
                let persisted = self
                    .shared
                    .items
                    .with(|items| self.persist(guest_key, items));
                persisted.map_err(|e| self.fail(StoreError::Storage(e)))
            }
            Mode::Owned(uid) => {
                let epoch = self.shared.epoch.load(Ordering::SeqCst);
                command.apply(&self.shared.items);

                let remote = &self.shared.remote;
                let written = match &command.remote {
                    RemoteOp::Upsert(entry) => remote.upsert(&uid, entry).await,
                    RemoteOp::Delete(key) => remote.delete(&uid, key).await,
                    RemoteOp::Clear => remote.clear(&uid).await,
                };

                match written {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        if self.shared.epoch.load(Ordering::SeqCst) == epoch {
                            let superseded = command.revert(&self.shared.items);
                            if superseded > 0 {
                                debug!(
                                    domain = D::NAME,
                                    superseded, "Kept newer values over rolled-back write"
                                );
                            }
                            error!(
                                domain = D::NAME,
                                user_id = %uid,
                                error = %e,
                                "Remote write failed, rolled back"
                            );
                        }
                        Err(self.fail(StoreError::RemoteWrite(e)))
                    }
                }
            }
        }
    }

    fn persist(
        &self,
        guest_key: &str,
        items: &Items<D::Entry>,
    ) -> std::result::Result<(), StorageError> {
        let storage = self.shared.storage.as_ref();
        if items.is_empty() {
            return storage.erase(guest_key);
        }
        let entries: Vec<&D::Entry> = items.values().collect();
        write_json(storage, guest_key, &entries)
    }

    /// Record and report an error, handing it back to the caller.
    pub(crate) fn fail(&self, err: StoreError) -> StoreError {
        report(D::NAME, &err);
        self.shared.error.set(Some(err.clone()));
        err
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use shopstate_core::{CartLine, CartLineKey, Price, Product, ProductId, WishlistEntry};

    use super::*;
    use crate::remote::RemoteError;
    use crate::remote::memory::{MemoryBackend, MemoryTable};
    use crate::storage::MemoryStorage;

    struct Saved;

    impl Domain for Saved {
        type Entry = WishlistEntry;
        const NAME: &'static str = "saved";
        const GUEST_KEY: Option<&'static str> = Some("saved_test_v1");

        fn merge(guest: &WishlistEntry, remote: Option<&WishlistEntry>) -> Option<WishlistEntry> {
            remote.is_none().then(|| guest.clone())
        }
    }

    fn entry(id: &str) -> WishlistEntry {
        WishlistEntry::now(ProductId::new(id))
    }

    fn engine(
        identity: &IdentitySignal,
        storage: &Arc<MemoryStorage>,
        backend: &MemoryBackend,
    ) -> SyncEngine<Saved> {
        SyncEngine::new(
            identity.clone(),
            Arc::clone(storage) as Arc<dyn LocalStorage>,
            Arc::new(backend.wishlists()),
        )
    }

    async fn settle<T, F>(cell: &Observable<T>, pred: F)
    where
        T: Clone + Send + Sync + 'static,
        F: FnMut(&T) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), cell.wait_until(pred))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_guest_mutation_persists() {
        let identity = IdentitySignal::new();
        identity.resolve(None);
        let storage = Arc::new(MemoryStorage::new());
        let backend = MemoryBackend::new();
        let engine = engine(&identity, &storage, &backend);
        engine.start().await;

        let added = entry("p1");
        engine
            .mutate(added.key(), |_| Some(added.clone()))
            .await
            .unwrap();

        assert!(engine.is_guest());
        assert!(storage.read("saved_test_v1").unwrap().is_some());
        assert_eq!(backend.total_calls("wishlists"), 0);
    }

    #[tokio::test]
    async fn test_guest_storage_failure_keeps_memory() {
        let identity = IdentitySignal::new();
        identity.resolve(None);
        let storage = Arc::new(MemoryStorage::with_quota(8));
        let backend = MemoryBackend::new();
        let engine = engine(&identity, &storage, &backend);
        engine.start().await;

        let added = entry("p1");
        let err = engine
            .mutate(added.key(), |_| Some(added.clone()))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Storage(_)));
        assert!(engine.items().with(|items| items.contains_key(&added.key())));
        assert_eq!(engine.error().get(), Some(err));
    }

    #[tokio::test]
    async fn test_owned_rollback_restores_prior_state() {
        let identity = IdentitySignal::new();
        identity.resolve(Some(UserId::new("u1")));
        let storage = Arc::new(MemoryStorage::new());
        let backend = MemoryBackend::new();
        backend
            .wishlists()
            .seed(&UserId::new("u1"), [entry("p1")]);
        let engine = engine(&identity, &storage, &backend);
        engine.start().await;

        let before = engine.items().get();
        backend.fail_next_writes(1);
        let removed = ProductId::new("p1");
        let err = engine.mutate(removed, |_| None).await.unwrap_err();

        assert!(matches!(err, StoreError::RemoteWrite(_)));
        assert_eq!(engine.items().get(), before);
    }

    struct Lines;

    impl Domain for Lines {
        type Entry = CartLine;
        const NAME: &'static str = "lines";
        const GUEST_KEY: Option<&'static str> = Some("lines_test_v1");

        fn merge(guest: &CartLine, _remote: Option<&CartLine>) -> Option<CartLine> {
            Some(guest.clone())
        }
    }

    /// Cart table whose writes of one quantity are slow and then fail.
    struct SlowFailingCarts {
        table: MemoryTable<CartLine>,
        failing_quantity: u32,
    }

    #[async_trait]
    impl RemoteStore<CartLine> for SlowFailingCarts {
        async fn list(&self, owner: &UserId) -> crate::remote::Result<Vec<CartLine>> {
            self.table.list(owner).await
        }

        async fn upsert(&self, owner: &UserId, entry: &CartLine) -> crate::remote::Result<()> {
            if entry.quantity == self.failing_quantity {
                tokio::time::sleep(Duration::from_millis(100)).await;
                return Err(RemoteError::Unavailable("slow failure".to_string()));
            }
            self.table.upsert(owner, entry).await
        }

        async fn delete(&self, owner: &UserId, key: &CartLineKey) -> crate::remote::Result<()> {
            self.table.delete(owner, key).await
        }

        async fn subscribe(&self, owner: &UserId) -> crate::remote::Result<ChangeFeed<CartLine>> {
            self.table.subscribe(owner).await
        }
    }

    fn bump(current: Option<&CartLine>) -> Option<CartLine> {
        current.map(|line| line.with_quantity(line.quantity + 1))
    }

    #[tokio::test]
    async fn test_late_rollback_keeps_newer_confirmed_write() {
        let owner = UserId::new("u1");
        let identity = IdentitySignal::new();
        identity.resolve(Some(owner.clone()));
        let backend = MemoryBackend::new();
        let key = CartLineKey::new("p1", "red", "M").unwrap();
        let product = Product::new("p1", "Tee", Price::from_cents(1000));
        backend
            .carts()
            .seed(&owner, [CartLine::for_product(&product, key.clone(), 1)]);

        let engine: SyncEngine<Lines> = SyncEngine::new(
            identity,
            Arc::new(MemoryStorage::new()),
            Arc::new(SlowFailingCarts {
                table: backend.carts(),
                failing_quantity: 2,
            }),
        );
        engine.start().await;

        // 1 -> 2 is still in flight when 2 -> 3 is confirmed
        let slow = {
            let engine = engine.clone();
            let key = key.clone();
            tokio::spawn(async move { engine.mutate(key, bump).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.mutate(key.clone(), bump).await.unwrap();

        let err = slow.await.unwrap().unwrap_err();
        assert!(matches!(err, StoreError::RemoteWrite(_)));

        let local = engine.items().with(|items| items.get(&key).map(|line| line.quantity));
        assert_eq!(local, Some(3));
        assert_eq!(backend.carts().rows(&owner)[0].quantity, 3);
    }

    #[tokio::test]
    async fn test_remote_changes_reconcile_and_echoes_are_idempotent() {
        let owner = UserId::new("u1");
        let identity = IdentitySignal::new();
        identity.resolve(Some(owner.clone()));
        let storage = Arc::new(MemoryStorage::new());
        let backend = MemoryBackend::new();
        let engine = engine(&identity, &storage, &backend);
        engine.start().await;

        let added = entry("p1");
        engine
            .mutate(added.key(), |_| Some(added.clone()))
            .await
            .unwrap();

        // Another device adds p2; our own echo for p1 must not duplicate
        backend.wishlists().seed(&owner, [entry("p2")]);
        settle(engine.items(), |items| items.len() == 2).await;

        backend.wishlists().remove(&owner, &ProductId::new("p2"));
        settle(engine.items(), |items| items.len() == 1).await;
        assert_eq!(backend.wishlists().subscriber_count(&owner), 1);
    }

    #[tokio::test]
    async fn test_orders_style_domain_requires_identity() {
        struct Ledger;

        impl Domain for Ledger {
            type Entry = WishlistEntry;
            const NAME: &'static str = "ledger";
            const GUEST_KEY: Option<&'static str> = None;

            fn merge(_: &WishlistEntry, _: Option<&WishlistEntry>) -> Option<WishlistEntry> {
                None
            }
        }

        let identity = IdentitySignal::new();
        identity.resolve(None);
        let engine: SyncEngine<Ledger> = SyncEngine::new(
            identity,
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryBackend::new().wishlists()),
        );
        engine.start().await;

        let added = entry("p1");
        let err = engine
            .mutate(added.key(), |_| Some(added.clone()))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::AuthRequired);
    }
}
