#![forbid(unsafe_code)]

//! Value wrappers that publish their mutations on channels.
//!
//! # Design
//!
//! Each wrapper keeps its value in shared storage (`Arc<Mutex<..>>`) next to
//! one or two [`Channel`]s. Cloning a wrapper creates a new handle to the
//! **same** value and channels. The value lock is released before any
//! channel is notified, so callbacks may read or even set the wrapper again.
//!
//! | Wrapper             | Channel(s)                     | Fires                     |
//! |---------------------|--------------------------------|---------------------------|
//! | [`ObservedSetter`]  | `on_set: Channel<T>`           | every `set`               |
//! | [`Observed`]        | `on_will_set`, `on_did_set`    | every `set`, before/after |
//! | [`ObservedUpdate`]  | `on_update: Channel<T>`        | only when the value changes |
//!
//! # Failure Modes
//!
//! - **Concurrent set**: each store is atomic, but notifications from two
//!   racing `set` calls may interleave. `Observed` pairs are therefore only
//!   consistent for a single writer.
//! - **Poisoned lock**: a panic while `update` holds the value recovers the
//!   guard; the value is whatever the closure left behind.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tether_core::{Channel, HandlerHandle};
use tracing::trace;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// ObservedSetter
// ---------------------------------------------------------------------------

/// A shared value whose every assignment is broadcast on [`on_set`].
///
/// [`on_set`]: ObservedSetter::on_set
pub struct ObservedSetter<T: 'static> {
    value: Arc<Mutex<T>>,
    on_set: Channel<T>,
}

impl<T: 'static> Clone for ObservedSetter<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            on_set: self.on_set.clone(),
        }
    }
}

impl<T: fmt::Debug + 'static> fmt::Debug for ObservedSetter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservedSetter")
            .field("value", &*lock(&self.value))
            .field("subscriber_count", &self.on_set.len())
            .finish()
    }
}

impl<T: Default + Clone + 'static> Default for ObservedSetter<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Clone + 'static> ObservedSetter<T> {
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            value: Arc::new(Mutex::new(value)),
            on_set: Channel::new(),
        }
    }

    /// Get a clone of the current value.
    #[must_use]
    pub fn get(&self) -> T {
        lock(&self.value).clone()
    }

    /// Access the current value by reference without cloning.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&lock(&self.value))
    }

    /// Store `value` and notify `on_set` with it, even if it is unchanged.
    pub fn set(&self, value: T) {
        *lock(&self.value) = value.clone();
        self.on_set.notify(value);
    }

    /// Modify the value in place, then notify as [`set`](Self::set) does.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let value = {
            let mut slot = lock(&self.value);
            f(&mut slot);
            slot.clone()
        };
        self.on_set.notify(value);
    }

    /// Channel notified with the new value after every assignment.
    #[must_use]
    pub fn on_set(&self) -> &Channel<T> {
        &self.on_set
    }
}

// ---------------------------------------------------------------------------
// Observed
// ---------------------------------------------------------------------------

/// A shared value announcing each assignment twice: before the store with
/// `(current, incoming)` and after it with `(old, current)`.
pub struct Observed<T: 'static> {
    value: Arc<Mutex<T>>,
    on_will_set: Channel<(T, T)>,
    on_did_set: Channel<(T, T)>,
}

impl<T: 'static> Clone for Observed<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            on_will_set: self.on_will_set.clone(),
            on_did_set: self.on_did_set.clone(),
        }
    }
}

impl<T: fmt::Debug + 'static> fmt::Debug for Observed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observed")
            .field("value", &*lock(&self.value))
            .field("will_set_count", &self.on_will_set.len())
            .field("did_set_count", &self.on_did_set.len())
            .finish()
    }
}

impl<T: Default + Clone + 'static> Default for Observed<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Clone + 'static> Observed<T> {
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            value: Arc::new(Mutex::new(value)),
            on_will_set: Channel::new(),
            on_did_set: Channel::new(),
        }
    }

    /// Get a clone of the current value.
    #[must_use]
    pub fn get(&self) -> T {
        lock(&self.value).clone()
    }

    /// Access the current value by reference without cloning.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&lock(&self.value))
    }

    /// Announce, store, announce.
    pub fn set(&self, value: T) {
        let current = self.get();
        self.on_will_set.notify((current, value.clone()));
        let old = std::mem::replace(&mut *lock(&self.value), value.clone());
        self.on_did_set.notify((old, value));
    }

    /// Compute the next value from a copy of the current one, then
    /// [`set`](Self::set) it.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let mut next = self.get();
        f(&mut next);
        self.set(next);
    }

    /// Channel notified with `(current, incoming)` before each store.
    #[must_use]
    pub fn on_will_set(&self) -> &Channel<(T, T)> {
        &self.on_will_set
    }

    /// Channel notified with `(old, current)` after each store.
    #[must_use]
    pub fn on_did_set(&self) -> &Channel<(T, T)> {
        &self.on_did_set
    }

    /// Run `f(current, incoming)` before every store.
    pub fn will_set<F>(&self, f: F) -> HandlerHandle<(T, T)>
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        self.on_will_set.run(move |(current, incoming)| f(current, incoming))
    }

    /// Run `f(old, current)` after every store.
    pub fn did_set<F>(&self, f: F) -> HandlerHandle<(T, T)>
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        self.on_did_set.run(move |(old, current)| f(old, current))
    }
}

// ---------------------------------------------------------------------------
// ObservedUpdate
// ---------------------------------------------------------------------------

struct Versioned<T> {
    value: T,
    version: u64,
}

/// A shared, version-tracked value that notifies only on real changes.
///
/// # Invariants
///
/// 1. `version` increments by exactly 1 on each value-changing mutation.
/// 2. `set(v)` where `v == current` is a no-op.
/// 3. `on_update` receives the new value once per version bump.
pub struct ObservedUpdate<T: 'static> {
    slot: Arc<Mutex<Versioned<T>>>,
    on_update: Channel<T>,
}

impl<T: 'static> Clone for ObservedUpdate<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            on_update: self.on_update.clone(),
        }
    }
}

impl<T: fmt::Debug + 'static> fmt::Debug for ObservedUpdate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = lock(&self.slot);
        f.debug_struct("ObservedUpdate")
            .field("value", &slot.value)
            .field("version", &slot.version)
            .field("subscriber_count", &self.on_update.len())
            .finish()
    }
}

impl<T: Default + Clone + PartialEq + 'static> Default for ObservedUpdate<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Clone + PartialEq + 'static> ObservedUpdate<T> {
    /// The initial version is 0 and no subscribers are registered.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Versioned { value, version: 0 })),
            on_update: Channel::new(),
        }
    }

    /// Get a clone of the current value.
    #[must_use]
    pub fn get(&self) -> T {
        lock(&self.slot).value.clone()
    }

    /// Access the current value by reference without cloning.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&lock(&self.slot).value)
    }

    /// Store `value` if it differs from the current one and notify
    /// `on_update`.
    pub fn set(&self, value: T) {
        let version = {
            let mut slot = lock(&self.slot);
            if slot.value == value {
                return;
            }
            slot.value = value.clone();
            slot.version += 1;
            slot.version
        };
        trace!(version, "observed value changed");
        self.on_update.notify(value);
    }

    /// Modify the value in place. Notifies only if the result differs from
    /// a snapshot taken before `f` ran.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let changed = {
            let mut slot = lock(&self.slot);
            let old = slot.value.clone();
            f(&mut slot.value);
            if slot.value != old {
                slot.version += 1;
                Some((slot.value.clone(), slot.version))
            } else {
                None
            }
        };
        if let Some((value, version)) = changed {
            trace!(version, "observed value changed");
            self.on_update.notify(value);
        }
    }

    /// Current version number.
    #[must_use]
    pub fn version(&self) -> u64 {
        lock(&self.slot).version
    }

    /// Channel notified with the new value after each change.
    #[must_use]
    pub fn on_update(&self) -> &Channel<T> {
        &self.on_update
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn setter_notifies_every_assignment() {
        let obs = ObservedSetter::new(0);
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = Arc::clone(&count);
        obs.on_set().run(move |_| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        obs.set(1);
        obs.set(1);
        obs.update(|v| *v += 1);
        assert_eq!(count.load(Ordering::Relaxed), 3);
        assert_eq!(obs.get(), 2);
    }

    #[test]
    fn setter_passes_new_value() {
        let obs = ObservedSetter::new(String::new());
        let seen = Arc::new(Mutex::new(String::new()));
        let seen_clone = Arc::clone(&seen);
        obs.on_set()
            .run(move |v| *seen_clone.lock().unwrap() = v.clone());

        obs.set("hello".to_string());
        assert_eq!(*seen.lock().unwrap(), "hello");
    }

    #[test]
    fn observed_reports_both_sides_of_a_store() {
        let obs = Observed::new(1);
        let log = Arc::new(Mutex::new(Vec::new()));

        let will = Arc::clone(&log);
        let reader = obs.clone();
        obs.will_set(move |current, incoming| {
            // The store has not happened yet.
            assert_eq!(reader.get(), *current);
            will.lock().unwrap().push(("will", *current, *incoming));
        });
        let did = Arc::clone(&log);
        let reader = obs.clone();
        obs.did_set(move |old, current| {
            assert_eq!(reader.get(), *current);
            did.lock().unwrap().push(("did", *old, *current));
        });

        obs.set(2);
        assert_eq!(
            *log.lock().unwrap(),
            vec![("will", 1, 2), ("did", 1, 2)]
        );
    }

    #[test]
    fn observed_update_goes_through_set() {
        let obs = Observed::new(vec![1]);
        let lens = Arc::new(Mutex::new(Vec::new()));
        let lens_clone = Arc::clone(&lens);
        obs.did_set(move |old, current| {
            lens_clone.lock().unwrap().push((old.len(), current.len()));
        });
        obs.update(|v| v.push(2));
        assert_eq!(*lens.lock().unwrap(), vec![(1, 2)]);
        assert_eq!(obs.with(Vec::len), 2);
    }

    #[test]
    fn get_set_basic() {
        let obs = ObservedUpdate::new(42);
        assert_eq!(obs.get(), 42);
        assert_eq!(obs.version(), 0);

        obs.set(99);
        assert_eq!(obs.get(), 99);
        assert_eq!(obs.version(), 1);
    }

    #[test]
    fn no_change_no_version_bump() {
        let obs = ObservedUpdate::new(42);
        obs.set(42);
        assert_eq!(obs.version(), 0);
    }

    #[test]
    fn update_mutates_in_place() {
        let obs = ObservedUpdate::new(vec![1, 2, 3]);
        obs.update(|v| v.push(4));
        assert_eq!(obs.get(), vec![1, 2, 3, 4]);
        assert_eq!(obs.version(), 1);

        obs.update(|v| v[0] = 1);
        assert_eq!(obs.version(), 1);
    }

    #[test]
    fn change_notification() {
        let obs = ObservedUpdate::new(0);
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = Arc::clone(&count);
        obs.on_update().run(move |_| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        obs.set(1);
        obs.set(2);
        // Same value, no notification.
        obs.set(2);
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn owner_drop_unsubscribes() {
        let obs = ObservedUpdate::new(0);
        let owner = Arc::new(AtomicU32::new(0));
        obs.on_update().run_with(&owner, |o, v| o.store(*v, Ordering::Relaxed));

        obs.set(7);
        assert_eq!(owner.load(Ordering::Relaxed), 7);

        drop(owner);
        obs.set(8);
        assert!(obs.on_update().is_empty());
    }

    #[test]
    fn clone_shares_state() {
        let obs1 = ObservedUpdate::new(0);
        let obs2 = obs1.clone();

        obs1.set(42);
        assert_eq!(obs2.get(), 42);
        assert_eq!(obs2.version(), 1);

        obs2.set(99);
        assert_eq!(obs1.get(), 99);
        assert_eq!(obs1.version(), 2);
    }

    #[test]
    fn set_from_inside_a_callback() {
        let obs = ObservedUpdate::new(0);
        let inner = obs.clone();
        obs.on_update().run(move |v| {
            if *v < 3 {
                inner.set(v + 1);
            }
        });
        obs.set(1);
        assert_eq!(obs.get(), 3);
        assert_eq!(obs.version(), 3);
    }

    #[test]
    fn debug_format() {
        let obs = ObservedUpdate::new(42);
        let dbg = format!("{obs:?}");
        assert!(dbg.contains("ObservedUpdate"));
        assert!(dbg.contains("42"));
        assert!(dbg.contains("version"));
    }
}
