#![forbid(unsafe_code)]

//! Core: weakly-owned publish/subscribe channels.
//!
//! # Role in tether
//! `tether-core` is the notification primitive. A [`Channel<P>`] broadcasts
//! values of type `P` to handlers that hold their owners weakly, so a
//! subscriber disappears from the channel when its owner is dropped, with no
//! explicit unsubscription.
//!
//! # Primary responsibilities
//! - **Channel**: ordered handler registry, snapshot dispatch, revocation.
//! - **Handler**: one (weak owner, callback, continuation guards) record.
//! - **Group**: structural identity for scoped and cross-channel revocation.
//! - **WeakIndex**: process-wide weak registry of grouped channels.
//!
//! # How it fits in the system
//! `tether-reactive` builds value wrappers and per-object update channels on
//! top of the public API here. Nothing in this crate spawns threads or
//! schedules work: every call runs on the caller's thread.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use tether_core::Channel;
//!
//! struct Score(AtomicU32);
//!
//! let scores = Channel::<u32>::new();
//! let score = Arc::new(Score(AtomicU32::new(0)));
//! scores.run_with(&score, |s, points| {
//!     s.0.fetch_add(*points, Ordering::Relaxed);
//! });
//!
//! scores.notify(3);
//! assert_eq!(score.0.load(Ordering::Relaxed), 3);
//!
//! drop(score);
//! scores.notify(4); // owner is gone: nothing fires
//! assert!(scores.is_empty());
//! ```

pub mod channel;
pub mod config;
pub mod group;
pub mod handler;
pub mod index;
pub mod property;
pub mod subscribe;

pub use channel::{Channel, ChannelId};
pub use config::ChannelConfig;
pub use group::{Group, ObjectId, PropertyPath};
pub use handler::{Callback, Guard, HandlerHandle, HandlerId};
pub use index::WeakIndex;
pub use property::Property;
pub use subscribe::{ChannelOwned, OwnedBy, Registration, Subscribe};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock `mutex`, recovering the guard if a previous holder panicked.
///
/// No user code ever runs while a tether lock is held, and every critical
/// section leaves its data consistent, so a poisoned lock carries no torn
/// state.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
