#![forbid(unsafe_code)]

//! Handler records and the public [`HandlerHandle`].
//!
//! A handler pairs one weakly-held owner with one normalized callback. Every
//! registration shape (bare closure, owner + closure, method call, property
//! binding) is reduced to the same callback signature before it gets here:
//!
//! ```text
//! Fn(&(dyn Any + Send + Sync), &P) -> bool      // true = keep me registered
//! ```
//!
//! # Continuation guards
//!
//! Guards are predicates over `(parameter, invocation_count)` evaluated before
//! the callback. They form an ordered chain: the guard added last is the
//! outermost one and is evaluated first. The first guard returning `false`
//! retires the handler without firing it.
//!
//! # Invariants
//!
//! 1. `invocation_count` only moves when the callback is about to run. Each
//!    firing claims its count with a compare-and-swap after the guards
//!    approved it, so concurrent dispatches never fire past a guard's limit.
//! 2. A handler is active exactly while it is attached to at least one
//!    channel. Retired handlers never fire again, through dispatch or `now`.
//! 3. No handler lock is ever held while user code runs.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use smallvec::SmallVec;

use crate::channel::{ChannelId, ChannelInner};
use crate::group::{Group, ObjectId};
use crate::lock_unpoisoned;

/// Strong owner reference held for the duration of one dispatch pass.
pub(crate) type Owner = Arc<dyn Any + Send + Sync>;
/// Weak owner reference stored by a handler.
pub(crate) type WeakOwner = Weak<dyn Any + Send + Sync>;

/// Canonical callback shape. The return value is the continue flag.
pub type Callback<P> = Box<dyn Fn(&(dyn Any + Send + Sync), &P) -> bool + Send + Sync>;

/// Continuation predicate over `(parameter, invocation_count)`.
pub type Guard<P> = Arc<dyn Fn(&P, u64) -> bool + Send + Sync>;

/// Process-unique handler identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Result of offering one parameter to one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Fired and asked to stay registered.
    Continue,
    /// Fired and asked to be removed.
    Stop,
    /// A guard declined; the callback did not run.
    Declined,
    /// Already retired by an earlier callback in the same pass.
    Skipped,
}

type Attachments<P> = SmallVec<[(ChannelId, Weak<ChannelInner<P>>); 1]>;

pub(crate) struct HandlerCore<P: 'static> {
    id: HandlerId,
    owner: WeakOwner,
    owner_id: ObjectId,
    group: Option<Group>,
    callback: Callback<P>,
    guards: Mutex<Vec<Guard<P>>>,
    invocations: AtomicU64,
    active: AtomicBool,
    attached: Mutex<Attachments<P>>,
}

impl<P: 'static> HandlerCore<P> {
    pub(crate) fn new(
        owner: WeakOwner,
        owner_id: ObjectId,
        group: Option<Group>,
        guards: Vec<Guard<P>>,
        callback: Callback<P>,
    ) -> Self {
        Self {
            id: HandlerId::next(),
            owner,
            owner_id,
            group,
            callback,
            guards: Mutex::new(guards),
            invocations: AtomicU64::new(0),
            active: AtomicBool::new(true),
            attached: Mutex::new(SmallVec::new()),
        }
    }

    pub(crate) fn id(&self) -> HandlerId {
        self.id
    }

    pub(crate) fn owner_id(&self) -> ObjectId {
        self.owner_id
    }

    pub(crate) fn group(&self) -> Option<&Group> {
        self.group.as_ref()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn upgrade_owner(&self) -> Option<Owner> {
        self.owner.upgrade()
    }

    pub(crate) fn invocation_count(&self) -> u64 {
        self.invocations.load(Ordering::Acquire)
    }

    pub(crate) fn push_guard(&self, guard: Guard<P>) {
        lock_unpoisoned(&self.guards).push(guard);
    }

    /// Record that `channel` now lists this handler. Returns `false` when the
    /// handler is retired or already attached there.
    pub(crate) fn attach(&self, channel: ChannelId, weak: Weak<ChannelInner<P>>) -> bool {
        let mut attached = lock_unpoisoned(&self.attached);
        if !self.is_active() || attached.iter().any(|(id, _)| *id == channel) {
            return false;
        }
        attached.push((channel, weak));
        true
    }

    /// Record that `channel` dropped this handler. The handler retires once
    /// no channel lists it anymore.
    pub(crate) fn forget(&self, channel: ChannelId) {
        let mut attached = lock_unpoisoned(&self.attached);
        attached.retain(|(id, _)| *id != channel);
        if attached.is_empty() {
            self.active.store(false, Ordering::Release);
        }
    }

    /// Mark the handler retired and hand back every channel that still lists
    /// it, so the caller can detach it outside this lock.
    pub(crate) fn retire(&self) -> Attachments<P> {
        let mut attached = lock_unpoisoned(&self.attached);
        self.active.store(false, Ordering::Release);
        std::mem::take(&mut *attached)
    }

    /// Run the guard chain and, if it passes, the callback.
    pub(crate) fn invoke(&self, owner: &(dyn Any + Send + Sync), parameter: &P) -> Outcome {
        let guards: SmallVec<[Guard<P>; 2]> =
            lock_unpoisoned(&self.guards).iter().cloned().collect();
        loop {
            if !self.is_active() {
                return Outcome::Skipped;
            }
            let count = self.invocation_count();
            if guards.iter().rev().any(|guard| !guard(parameter, count)) {
                return Outcome::Declined;
            }
            // Claim the slot the guards approved; a concurrent dispatch that
            // got there first forces a re-check against the new count.
            let claimed = self.invocations.compare_exchange(
                count,
                count + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            if claimed.is_ok() {
                break;
            }
        }
        if (self.callback)(owner, parameter) {
            Outcome::Continue
        } else {
            Outcome::Stop
        }
    }

    /// Retire the handler and detach it from every channel listing it.
    pub(crate) fn retire_everywhere(&self) {
        for (_, channel) in self.retire() {
            if let Some(channel) = channel.upgrade() {
                channel.detach_retired(self.id);
            }
        }
    }
}

/// Handle to one registered handler.
///
/// Handles are cheap to clone; every clone refers to the same handler.
/// Dropping a handle does **not** unregister anything.
pub struct HandlerHandle<P: 'static> {
    core: Arc<HandlerCore<P>>,
}

impl<P: 'static> Clone for HandlerHandle<P> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<P: 'static> fmt::Debug for HandlerHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerHandle")
            .field("id", &self.core.id)
            .field("group", &self.core.group)
            .field("invocation_count", &self.core.invocation_count())
            .field("active", &self.core.is_active())
            .field("owner_alive", &(self.core.owner.strong_count() > 0))
            .finish()
    }
}

impl<P: 'static> PartialEq for HandlerHandle<P> {
    fn eq(&self, other: &Self) -> bool {
        self.core.id == other.core.id
    }
}

impl<P: 'static> Eq for HandlerHandle<P> {}

impl<P: 'static> HandlerHandle<P> {
    pub(crate) fn from_core(core: Arc<HandlerCore<P>>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &Arc<HandlerCore<P>> {
        &self.core
    }

    /// Handler identity.
    #[must_use]
    pub fn id(&self) -> HandlerId {
        self.core.id
    }

    /// Group the handler was registered with, if any.
    #[must_use]
    pub fn group(&self) -> Option<&Group> {
        self.core.group()
    }

    /// Number of times the callback has run.
    #[must_use]
    pub fn invocation_count(&self) -> u64 {
        self.core.invocation_count()
    }

    /// Whether the handler is still attached to at least one channel.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.core.is_active()
    }

    /// Fire immediately with `parameter`, outside of any dispatch pass.
    ///
    /// Does nothing if the owner is gone or the handler was retired. Guards
    /// apply exactly as they do during dispatch, and a stop decision retires
    /// the handler everywhere.
    pub fn now(&self, parameter: P) -> &Self {
        let Some(owner) = self.core.upgrade_owner() else {
            return self;
        };
        match self.core.invoke(&*owner, &parameter) {
            Outcome::Continue | Outcome::Skipped => {}
            Outcome::Stop | Outcome::Declined => self.core.retire_everywhere(),
        }
        self
    }

    /// Keep the handler only while `predicate(parameter, invocation_count)`
    /// holds. The newest guard is evaluated first.
    pub fn until<F>(self, predicate: F) -> Self
    where
        F: Fn(&P, u64) -> bool + Send + Sync + 'static,
    {
        self.core.push_guard(Arc::new(predicate));
        self
    }

    /// Fire only if the handler has never fired, then retire on the next offer.
    pub fn once(self) -> Self {
        self.until(|_, count| count == 0)
    }

    /// Fire at most `limit` times in total.
    pub fn limit(self, limit: u64) -> Self {
        self.until(move |_, count| count < limit)
    }

    /// Detach from every channel this handler is attached to.
    pub fn remove(&self) {
        self.core.retire_everywhere();
    }
}
