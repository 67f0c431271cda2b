#![forbid(unsafe_code)]

//! Per-object "something changed" channels.
//!
//! [`Updatable`] gives a type a default `Channel<()>` without adding a field:
//! the channel lives in the process-wide [`UpdateRegistry`], keyed by the
//! object's identity, and is created on first access. Objects that can carry
//! a field should prefer [`LazyChannel`], which costs no global lookup.
//!
//! # Invariants
//!
//! 1. Repeated `on_update()` calls on one live object return handles to the
//!    same channel, even when the first calls race on different threads.
//! 2. The registry never keeps an object alive; entries of dead objects are
//!    dropped the next time the registry inserts or prunes.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use tether_core::{Channel, ObjectId};
use tracing::debug;

struct Entry {
    object: Weak<dyn Any + Send + Sync>,
    channel: Channel<()>,
}

/// Weak side-table from object identity to its update channel.
pub struct UpdateRegistry {
    entries: Mutex<HashMap<ObjectId, Entry>>,
}

impl fmt::Debug for UpdateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateRegistry")
            .field("entries", &self.lock().len())
            .finish()
    }
}

impl UpdateRegistry {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ObjectId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The registry behind [`Updatable::on_update`].
    pub fn global() -> &'static UpdateRegistry {
        static REGISTRY: OnceLock<UpdateRegistry> = OnceLock::new();
        REGISTRY.get_or_init(UpdateRegistry::new)
    }

    /// The update channel of `object`, created if it has none yet.
    pub fn channel_for<T: Any + Send + Sync>(&self, object: &Arc<T>) -> Channel<()> {
        let id = ObjectId::of(object);
        let mut entries = self.lock();
        if let Some(entry) = entries.get(&id) {
            if entry.object.strong_count() > 0 {
                return entry.channel.clone();
            }
        }

        let before = entries.len();
        entries.retain(|_, entry| entry.object.strong_count() > 0);
        let pruned = before - entries.len();
        if pruned > 0 {
            debug!(pruned, "dropped update channels of dead objects");
        }

        let weak: Weak<T> = Arc::downgrade(object);
        let weak: Weak<dyn Any + Send + Sync> = weak;
        let channel = Channel::new();
        entries.insert(
            id,
            Entry {
                object: weak,
                channel: channel.clone(),
            },
        );
        channel
    }

    /// Number of entries, dead ones included until the next prune.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries whose object is gone. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.object.strong_count() > 0);
        before - entries.len()
    }
}

/// A type with a default, lazily created update channel.
///
/// Opt in with an empty impl:
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicU32, Ordering};
/// use tether_reactive::Updatable;
///
/// struct Document;
/// impl Updatable for Document {}
///
/// let doc = Arc::new(Document);
/// let saves = Arc::new(AtomicU32::new(0));
/// let counter = Arc::clone(&saves);
/// doc.on_update().run(move |_| {
///     counter.fetch_add(1, Ordering::Relaxed);
/// });
/// doc.mark_updated();
/// assert_eq!(saves.load(Ordering::Relaxed), 1);
/// ```
pub trait Updatable: Any + Send + Sync {
    /// This object's update channel.
    fn on_update(self: &Arc<Self>) -> Channel<()>
    where
        Self: Sized,
    {
        UpdateRegistry::global().channel_for(self)
    }

    /// Notify this object's update channel.
    fn mark_updated(self: &Arc<Self>)
    where
        Self: Sized,
    {
        self.on_update().signal();
    }
}

/// A channel field created on first use.
///
/// Unlike [`Updatable`], the channel lives inside the owning struct, so no
/// registry lookup is needed and it is dropped together with its owner.
pub struct LazyChannel<P: 'static> {
    cell: OnceLock<Channel<P>>,
}

impl<P: 'static> Default for LazyChannel<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: 'static> fmt::Debug for LazyChannel<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyChannel")
            .field("channel", &self.cell.get())
            .finish()
    }
}

impl<P: 'static> LazyChannel<P> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }

    /// The channel, created on first call.
    pub fn get(&self) -> &Channel<P> {
        self.cell.get_or_init(Channel::new)
    }

    /// Whether the channel has been created.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Notify the channel if it exists. An uninitialized channel has no
    /// handlers, so there is nothing to do.
    pub fn notify(&self, parameter: P) {
        if let Some(channel) = self.cell.get() {
            channel.notify(parameter);
        }
    }
}
