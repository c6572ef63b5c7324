//! Observer capability traits and the weak-referenced list that backs them.
//!
//! The distilled design called for "duck-typed" observers exposing either
//! `OnInterfacesAdded` or `OnInterfacesRemoved`; this crate makes that
//! explicit as two single-method traits, matching the design note in
//! DESIGN.md.

use std::sync::{Arc, Mutex, Weak};

use zbus::{names::OwnedUniqueName, zvariant::OwnedObjectPath};

/// Notified when an interface object appears on a watched peer (or locally).
pub trait InterfacesAddedObserver: Send + Sync {
    /// `peer` is the unique bus name that owns `path`.
    fn on_interfaces_added(&self, peer: &OwnedUniqueName, path: &OwnedObjectPath);
}

/// Notified when an interface object disappears from a watched peer (or
/// locally).
pub trait InterfacesRemovedObserver: Send + Sync {
    /// `peer` is the unique bus name the removal signal was attributed to —
    /// not necessarily the name that originally owned `path` (see
    /// `ObjectManagerState::remove_service` and the "rogue remove" boundary
    /// behavior).
    fn on_interfaces_removed(&self, peer: &OwnedUniqueName, path: &OwnedObjectPath);
}

/// A set of weakly-held observers.
///
/// The registry never extends an observer's lifetime: once every `Arc`
/// elsewhere in the process is dropped, the observer silently stops being
/// notified rather than being kept alive by this list.
pub(crate) struct ObserverList<T: ?Sized> {
    observers: Mutex<Vec<Weak<T>>>,
}

impl<T: ?Sized> Default for ObserverList<T> {
    fn default() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> ObserverList<T> {
    /// Registers `observer` if it isn't already present. Idempotent.
    pub(crate) fn add(&self, observer: &Arc<T>) {
        #[allow(clippy::expect_used)]
        let mut observers = self.observers.lock().expect("observer list poisoned");
        let already_present = observers
            .iter()
            .any(|existing| existing.ptr_eq(&Arc::downgrade(observer)));
        if !already_present {
            observers.push(Arc::downgrade(observer));
        }
    }

    /// Removes `observer`. Returns whether it was present.
    pub(crate) fn remove(&self, observer: &Arc<T>) -> bool {
        #[allow(clippy::expect_used)]
        let mut observers = self.observers.lock().expect("observer list poisoned");
        let target = Arc::downgrade(observer);
        let before = observers.len();
        observers.retain(|existing| !existing.ptr_eq(&target));
        observers.len() != before
    }

    /// Returns a snapshot of the currently-live observers, pruning any that
    /// have been dropped since the last call.
    pub(crate) fn snapshot(&self) -> Vec<Arc<T>> {
        #[allow(clippy::expect_used)]
        let mut observers = self.observers.lock().expect("observer list poisoned");
        let live: Vec<Arc<T>> = observers
            .iter()
            .filter_map(std::sync::Weak::upgrade)
            .collect();
        observers.retain(|observer| observer.strong_count() > 0);
        live
    }
}
