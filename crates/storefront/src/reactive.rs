//! Observable cells and memoized derivations.
//!
//! An [`Observable`] is a `tokio::sync::watch` sender: readers borrow the
//! current value or subscribe for change notifications. A [`Derived`] value
//! recomputes lazily, only when its source has changed since the last read.

use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;

/// A reactive cell.
#[derive(Debug)]
pub struct Observable<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone + Send + Sync + 'static> Observable<T> {
    #[must_use]
    pub fn new(value: T) -> Self {
        let (tx, _rx) = watch::channel(value);
        Self { tx }
    }

    /// Clone of the current value.
    #[must_use]
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Read the current value in place.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.tx.borrow())
    }

    /// Replace the value and notify subscribers.
    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Modify the value in place and notify subscribers.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        self.tx.send_modify(f);
    }

    /// Modify the value in place; subscribers are notified only if `f` returns `true`.
    pub fn update_if(&self, f: impl FnOnce(&mut T) -> bool) -> bool {
        self.tx.send_if_modified(f)
    }

    /// Receiver notified on every change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    /// Wait until `pred` holds for the current value and return that value.
    pub async fn wait_until(&self, pred: impl FnMut(&T) -> bool) -> T {
        let mut rx = self.subscribe();
        match rx.wait_for(pred).await {
            Ok(value) => value.clone(),
            // Unreachable while `self` holds the sender
            Err(_) => self.get(),
        }
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Observable<T> {
    /// Replace the value, notifying only if it differs.
    pub fn set_if_changed(&self, value: T) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }
}

impl<T: Clone + Default + Send + Sync + 'static> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

struct DerivedState<S, T> {
    source: watch::Receiver<S>,
    cached: Option<T>,
}

/// Memoized computation over an [`Observable`].
pub struct Derived<S, T> {
    state: Mutex<DerivedState<S, T>>,
    compute: Box<dyn Fn(&S) -> T + Send + Sync>,
}

impl<S, T> Derived<S, T>
where
    S: Clone + Send + Sync + 'static,
    T: Clone,
{
    pub fn new(source: &Observable<S>, compute: impl Fn(&S) -> T + Send + Sync + 'static) -> Self {
        Self {
            state: Mutex::new(DerivedState {
                source: source.subscribe(),
                cached: None,
            }),
            compute: Box::new(compute),
        }
    }

    /// Current derived value, recomputed only if the source changed.
    pub fn get(&self) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let DerivedState { source, cached } = &mut *state;

        let stale = source.has_changed().unwrap_or(false);
        if !stale && let Some(value) = cached.as_ref() {
            return value.clone();
        }

        let value = (self.compute)(&source.borrow_and_update());
        *cached = Some(value.clone());
        value
    }
}

impl<S, T> std::fmt::Debug for Derived<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Derived").finish_non_exhaustive()
    }
}
