#![forbid(unsafe_code)]

//! Process-wide weak index of grouped channels.
//!
//! Every channel constructed with a [`Group`] registers a weak reference to
//! itself here, and so does every channel holding a handler grouped by a
//! property path. Group revocation asks the index for the live members of a
//! group and revokes on each of them, which is how two channels built with
//! the same group are revoked together and how a property binding replaces
//! the same binding on another channel.
//!
//! # Invariants
//!
//! 1. The index never keeps a channel alive: entries are `Weak`.
//! 2. Dead entries are pruned lazily, whenever their bucket is touched by
//!    [`WeakIndex::insert`] or a member lookup, and across the whole map
//!    every few dozen inserts. Empty buckets are dropped.
//! 3. Member lookups return strong references, so the revocation pass that
//!    follows cannot observe a channel being torn down halfway.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tracing::trace;

use crate::channel::ChannelId;
use crate::group::Group;
use crate::lock_unpoisoned;

/// Type-erased view of a channel, independent of its parameter type.
pub(crate) trait GroupMember: Send + Sync {
    fn channel_id(&self) -> ChannelId;

    /// Revoke handlers tagged with `group` on this channel only.
    fn revoke_local(&self, group: &Group) -> usize;
}

/// Number of inserts between two sweeps of the whole map.
const SWEEP_EVERY: usize = 64;

#[derive(Default)]
struct Buckets {
    groups: HashMap<Group, Vec<Weak<dyn GroupMember>>>,
    inserts_since_sweep: usize,
}

impl Buckets {
    /// Drop dead entries in every bucket, then empty buckets. Returns the
    /// number of entries removed.
    fn sweep(&mut self) -> usize {
        let mut removed = 0;
        self.groups.retain(|_, bucket| {
            let before = bucket.len();
            bucket.retain(|entry| entry.strong_count() > 0);
            removed += before - bucket.len();
            !bucket.is_empty()
        });
        self.inserts_since_sweep = 0;
        removed
    }
}

/// Weakly-held registry of grouped channels.
pub struct WeakIndex {
    buckets: Mutex<Buckets>,
}

impl fmt::Debug for WeakIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let buckets = lock_unpoisoned(&self.buckets);
        f.debug_struct("WeakIndex")
            .field("groups", &buckets.groups.len())
            .field(
                "entries",
                &buckets.groups.values().map(Vec::len).sum::<usize>(),
            )
            .finish()
    }
}

impl WeakIndex {
    fn new() -> Self {
        Self {
            buckets: Mutex::new(Buckets::default()),
        }
    }

    /// The index shared by every channel in the process.
    pub fn global() -> &'static WeakIndex {
        static INDEX: OnceLock<WeakIndex> = OnceLock::new();
        INDEX.get_or_init(WeakIndex::new)
    }

    /// Register `member` under `group`. Registering the same member twice
    /// under one group keeps a single entry.
    pub(crate) fn insert(&self, group: Group, member: Weak<dyn GroupMember>) {
        let mut buckets = lock_unpoisoned(&self.buckets);
        buckets.inserts_since_sweep += 1;
        if buckets.inserts_since_sweep >= SWEEP_EVERY {
            let removed = buckets.sweep();
            if removed > 0 {
                trace!(removed, "swept dead index entries");
            }
        }
        let bucket = buckets.groups.entry(group).or_default();
        bucket.retain(|entry| entry.strong_count() > 0);
        if !bucket.iter().any(|entry| Weak::ptr_eq(entry, &member)) {
            bucket.push(member);
        }
    }

    /// Live members of `group`, in insertion order.
    pub(crate) fn members(&self, group: &Group) -> Vec<Arc<dyn GroupMember>> {
        let mut buckets = lock_unpoisoned(&self.buckets);
        let Some(bucket) = buckets.groups.get_mut(group) else {
            return Vec::new();
        };
        let mut live = Vec::with_capacity(bucket.len());
        bucket.retain(|entry| match entry.upgrade() {
            Some(member) => {
                live.push(member);
                true
            }
            None => false,
        });
        if bucket.is_empty() {
            buckets.groups.remove(group);
        }
        live
    }

    /// Number of live channels registered under `group`.
    #[must_use]
    pub fn member_count(&self, group: &Group) -> usize {
        self.members(group).len()
    }

    /// Drop every dead entry and empty bucket. Returns the number of entries
    /// removed.
    pub fn prune(&self) -> usize {
        lock_unpoisoned(&self.buckets).sweep()
    }

    /// Number of groups with at least one entry (live or not yet pruned).
    #[must_use]
    pub fn group_count(&self) -> usize {
        lock_unpoisoned(&self.buckets).groups.len()
    }
}
