#![forbid(unsafe_code)]

//! Typed broadcast channel with weakly-owned handlers.
//!
//! # Design
//!
//! [`Channel<P>`] is a cheap, clonable handle onto one shared registry: an
//! ordered `Vec` of handlers behind a `Mutex`. Handlers hold their owners
//! weakly, so a subscriber that goes away simply stops receiving values; the
//! registry notices lazily and drops the entry.
//!
//! ```text
//! notify(p)
//!   lock ─► upgrade every owner ─► purge dead ─► snapshot [(h, owner)] ─► unlock
//!   for (h, owner) in snapshot:  guards? ─► callback(owner, &p) ─► keep?
//!   lock ─► drop retired handlers ─► unlock
//! ```
//!
//! # Performance
//!
//! | Operation        | Complexity                       |
//! |------------------|----------------------------------|
//! | `register()`     | O(1) amortized (+ group revoke when solo) |
//! | `notify()`       | O(H) where H = handlers at call start |
//! | `revoke_*()`     | O(H) per channel reached          |
//! | `remove()`       | O(H)                              |
//!
//! # Failure Modes
//!
//! - **Re-entrant use**: callbacks may call `notify`, `register` or any
//!   `revoke_*` on the same channel. The lock is never held across user code,
//!   so this cannot deadlock. Handlers registered during a pass are not part
//!   of that pass.
//! - **Concurrent notify**: registry mutations are serialized, callbacks of
//!   concurrent `notify` calls are not. Callers needing exclusivity must
//!   serialize `notify` themselves.
//! - **Panicking callback**: the panic propagates to the `notify` caller.
//!   Handlers already retired in that pass are still removed.

use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use smallvec::SmallVec;
use tracing::{debug, debug_span, trace};

use crate::config::ChannelConfig;
use crate::group::{Group, ObjectId};
use crate::handler::{HandlerCore, HandlerHandle, HandlerId, Outcome, Owner, WeakOwner};
use crate::index::{GroupMember, WeakIndex};
use crate::lock_unpoisoned;
use crate::property::Property;
use crate::subscribe::{ChannelOwned, OwnedBy, Registration, Subscribe};

/// Process-unique channel identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

type Handlers<P> = Vec<Arc<HandlerCore<P>>>;
type Snapshot<P> = SmallVec<[(Arc<HandlerCore<P>>, Owner); 8]>;

pub(crate) struct ChannelInner<P: 'static> {
    id: ChannelId,
    group: Option<Group>,
    label: Option<Cow<'static, str>>,
    handlers: Mutex<Handlers<P>>,
}

impl<P: 'static> ChannelInner<P> {
    fn lock(&self) -> MutexGuard<'_, Handlers<P>> {
        lock_unpoisoned(&self.handlers)
    }

    fn label(&self) -> &str {
        self.label.as_deref().unwrap_or("")
    }

    /// Remove every handler matching `pred`, telling each one it left.
    fn detach_where(
        &self,
        handlers: &mut Handlers<P>,
        mut pred: impl FnMut(&HandlerCore<P>) -> bool,
    ) -> usize {
        let before = handlers.len();
        handlers.retain(|handler| {
            if pred(handler.as_ref()) {
                handler.forget(self.id);
                false
            } else {
                true
            }
        });
        before - handlers.len()
    }

    /// Drop a handler that already retired itself.
    pub(crate) fn detach_retired(&self, id: HandlerId) {
        self.lock().retain(|handler| handler.id() != id);
    }

    /// Purge dead and retired handlers, returning the live ones with their
    /// owners upgraded, plus the number purged.
    fn snapshot(&self) -> (Snapshot<P>, usize) {
        let mut handlers = self.lock();
        let mut live = Snapshot::with_capacity(handlers.len());
        let before = handlers.len();
        handlers.retain(|handler| {
            if !handler.is_active() {
                return false;
            }
            match handler.upgrade_owner() {
                Some(owner) => {
                    live.push((Arc::clone(handler), owner));
                    true
                }
                None => {
                    handler.forget(self.id);
                    false
                }
            }
        });
        let purged = before - handlers.len();
        (live, purged)
    }

    /// Purge dead and retired handlers and return how many remain.
    fn live_len(&self) -> usize {
        let mut handlers = self.lock();
        self.detach_where(&mut handlers, |handler| {
            !handler.is_active() || handler.upgrade_owner().is_none()
        });
        handlers.len()
    }
}

impl<P: 'static> GroupMember for ChannelInner<P> {
    fn channel_id(&self) -> ChannelId {
        self.id
    }

    fn revoke_local(&self, group: &Group) -> usize {
        let mut handlers = self.lock();
        self.detach_where(&mut handlers, |handler| handler.group() == Some(group))
    }
}

/// Applies the removals collected during one dispatch pass, even when a
/// callback unwinds.
struct Sweep<'a, P: 'static> {
    channel: &'a ChannelInner<P>,
    retired: SmallVec<[Arc<HandlerCore<P>>; 4]>,
}

impl<P: 'static> Drop for Sweep<'_, P> {
    fn drop(&mut self) {
        if self.retired.is_empty() {
            return;
        }
        for handler in &self.retired {
            for (id, channel) in handler.retire() {
                if id == self.channel.id {
                    continue;
                }
                if let Some(channel) = channel.upgrade() {
                    channel.detach_retired(handler.id());
                }
            }
        }
        self.channel.lock().retain(|handler| handler.is_active());
        trace!(
            channel = %self.channel.id,
            label = self.channel.label(),
            retired = self.retired.len(),
            "retired handlers after dispatch"
        );
    }
}

/// A typed broadcast point.
///
/// Cloning a `Channel` creates another handle to the **same** registry.
///
/// # Invariants
///
/// 1. Within one `notify`, handlers fire in registration order.
/// 2. A handler whose owner is gone never fires and is purged by the next
///    `notify` or `len`.
/// 3. At most one handler per group after a solo registration.
/// 4. Channels built with the same group are revoked together.
pub struct Channel<P: 'static> {
    inner: Arc<ChannelInner<P>>,
}

impl<P: 'static> Clone for Channel<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: 'static> Default for Channel<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: 'static> fmt::Debug for Channel<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("group", &self.inner.group)
            .field("handler_count", &self.inner.lock().len())
            .finish()
    }
}

impl<P: 'static> Channel<P> {
    /// Create an ungrouped channel.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ChannelConfig::default())
    }

    /// Create a channel tagged with `group` and register it in the
    /// [`WeakIndex`].
    #[must_use]
    pub fn with_group(group: impl Into<Group>) -> Self {
        Self::with_config(ChannelConfig::new().with_group(group))
    }

    /// Create a channel from a full configuration.
    #[must_use]
    pub fn with_config(config: ChannelConfig) -> Self {
        let ChannelConfig {
            group,
            label,
            initial_capacity,
        } = config;
        let inner = Arc::new(ChannelInner {
            id: ChannelId::next(),
            group,
            label,
            handlers: Mutex::new(Vec::with_capacity(initial_capacity)),
        });
        let channel = Self { inner };
        if let Some(group) = &channel.inner.group {
            channel.join_index(group.clone());
        }
        channel
    }

    fn join_index(&self, group: Group) {
        let weak: Weak<ChannelInner<P>> = Arc::downgrade(&self.inner);
        let member: Weak<dyn GroupMember> = weak;
        WeakIndex::global().insert(group, member);
    }

    /// Property-path groups are indexed per holding channel, so a binding
    /// reaches its counterparts on channels built without that group.
    fn index_handler_group(&self, group: Option<&Group>) {
        if let Some(group @ Group::Property { .. }) = group {
            self.join_index(group.clone());
        }
    }

    /// Channel identity.
    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    /// Group this channel was built with.
    #[must_use]
    pub fn group(&self) -> Option<&Group> {
        self.inner.group.as_ref()
    }

    /// Diagnostic label.
    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.inner.label.as_deref()
    }

    /// Whether two handles refer to the same channel.
    #[must_use]
    pub fn same_channel(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of live handlers. Purges handlers whose owner is gone.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.live_len()
    }

    /// Whether no live handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn self_owner(&self) -> (WeakOwner, ObjectId) {
        let weak: Weak<ChannelInner<P>> = Arc::downgrade(&self.inner);
        let owner: WeakOwner = weak;
        (owner, ObjectId::of(&self.inner))
    }

    /// Channels that share a group with this channel, are tagged with
    /// `group`, or hold a handler grouped by the property path `group`,
    /// excluding this one.
    fn peers(&self, group: &Group) -> Vec<Arc<dyn GroupMember>> {
        let index = WeakIndex::global();
        let mut peers = index.members(group);
        if let Some(own) = &self.inner.group {
            if own != group {
                peers.extend(index.members(own));
            }
        }
        let mut seen = SmallVec::<[ChannelId; 8]>::new();
        peers.retain(|peer| {
            let id = peer.channel_id();
            if id == self.inner.id || seen.contains(&id) {
                return false;
            }
            seen.push(id);
            true
        });
        peers
    }

    fn revoke_peers(&self, group: &Group) -> usize {
        self.peers(group)
            .iter()
            .map(|peer| peer.revoke_local(group))
            .sum()
    }

    /// Add a handler. All registration shapes end up here.
    ///
    /// A solo registration with a group first revokes that group everywhere
    /// it reaches, then appends the new handler under the same lock as the
    /// local revoke.
    pub fn register(&self, registration: Registration<P>) -> HandlerHandle<P> {
        let Registration {
            owner,
            group,
            solo,
            guards,
            callback,
        } = registration;
        let (owner, owner_id) = owner.unwrap_or_else(|| self.self_owner());
        let core = Arc::new(HandlerCore::new(
            owner,
            owner_id,
            group.clone(),
            guards,
            callback,
        ));
        core.attach(self.inner.id, Arc::downgrade(&self.inner));

        self.index_handler_group(group.as_ref());

        match group.filter(|_| solo) {
            Some(group) => {
                let remote = self.revoke_peers(&group);
                let mut handlers = self.inner.lock();
                let local = self
                    .inner
                    .detach_where(&mut handlers, |handler| handler.group() == Some(&group));
                handlers.push(Arc::clone(&core));
                drop(handlers);
                if local + remote > 0 {
                    debug!(
                        channel = %self.inner.id,
                        label = self.inner.label(),
                        %group,
                        replaced = local + remote,
                        "solo registration replaced handlers"
                    );
                }
            }
            None => self.inner.lock().push(Arc::clone(&core)),
        }
        HandlerHandle::from_core(core)
    }

    /// Start a registration owned by the channel itself.
    pub fn subscribe(&self) -> Subscribe<'_, P, ChannelOwned> {
        Subscribe::new(self, None)
    }

    /// Start a registration owned by `owner`. The handler lives no longer than
    /// `owner` does.
    pub fn on<T: Any + Send + Sync>(&self, owner: &Arc<T>) -> Subscribe<'_, P, OwnedBy<T>> {
        let weak: Weak<T> = Arc::downgrade(owner);
        let weak: WeakOwner = weak;
        Subscribe::new(self, Some((weak, ObjectId::of(owner))))
    }

    /// Register a closure owned by the channel.
    pub fn run<F>(&self, callback: F) -> HandlerHandle<P>
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        self.subscribe().run(callback)
    }

    /// Register a closure receiving `owner` and the parameter.
    pub fn run_with<T, F>(&self, owner: &Arc<T>, callback: F) -> HandlerHandle<P>
    where
        T: Any + Send + Sync,
        F: Fn(&T, &P) + Send + Sync + 'static,
    {
        self.on(owner).run_with(callback)
    }

    /// Register a parameter-ignoring method call on `owner`.
    pub fn call<T, F>(&self, owner: &Arc<T>, method: F) -> HandlerHandle<P>
    where
        T: Any + Send + Sync,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.on(owner).call(method)
    }

    /// Write every notified value into `property` of `owner`.
    ///
    /// Replaces any earlier binding of the same property on the same object,
    /// here and on every channel the property group reaches.
    pub fn bind<T>(&self, owner: &Arc<T>, property: Property<T, P>) -> HandlerHandle<P>
    where
        T: Any + Send + Sync,
        P: Clone,
    {
        self.on(owner)
            .group(Group::property_of(owner, property.path()))
            .solo(true)
            .run_with(move |target, value| property.set(target, value.clone()))
    }

    /// Remove the binding of `property` on `owner`.
    pub fn unbind<T, V>(&self, owner: &Arc<T>, property: &Property<T, V>) -> usize
    where
        T: Any + Send + Sync,
    {
        self.revoke_group(&Group::property_of(owner, property.path()))
    }

    /// Append an existing handler, typically one registered on another
    /// channel. Removing the handle later detaches it from both.
    pub fn attach(&self, handle: &HandlerHandle<P>) {
        let core = handle.core();
        if core.attach(self.inner.id, Arc::downgrade(&self.inner)) {
            self.index_handler_group(core.group());
            self.inner.lock().push(Arc::clone(core));
        }
    }

    /// Broadcast `parameter` to every live handler, in registration order.
    pub fn notify(&self, parameter: P) {
        let _span = self
            .inner
            .label
            .as_deref()
            .map(|label| debug_span!("notify", channel = %self.inner.id, label).entered());
        let (snapshot, purged) = self.inner.snapshot();
        trace!(
            channel = %self.inner.id,
            label = self.inner.label(),
            live = snapshot.len(),
            purged,
            "notify"
        );
        if snapshot.is_empty() {
            return;
        }
        let mut sweep = Sweep {
            channel: &self.inner,
            retired: SmallVec::new(),
        };
        for (handler, owner) in &snapshot {
            match handler.invoke(&**owner, &parameter) {
                Outcome::Continue | Outcome::Skipped => {}
                Outcome::Stop | Outcome::Declined => sweep.retired.push(Arc::clone(handler)),
            }
        }
    }

    /// Detach one handler from this channel.
    pub fn remove(&self, handle: &HandlerHandle<P>) -> bool {
        let id = handle.id();
        let mut handlers = self.inner.lock();
        self.inner.detach_where(&mut handlers, |handler| handler.id() == id) > 0
    }

    /// Detach every handler tagged with `group`, here and on every channel
    /// sharing a group with this one or tagged with `group` itself.
    pub fn revoke_group(&self, group: &Group) -> usize {
        let local = self.inner.revoke_local(group);
        let remote = self.revoke_peers(group);
        debug!(
            channel = %self.inner.id,
            label = self.inner.label(),
            %group,
            local,
            remote,
            "revoked group"
        );
        local + remote
    }

    /// Detach every *ungrouped* handler owned by `owner`. Grouped handlers are
    /// only reachable through [`Channel::revoke_group`].
    pub fn revoke_owner<T: ?Sized>(&self, owner: &Arc<T>) -> usize {
        self.revoke_ungrouped(ObjectId::of(owner))
    }

    /// Detach every ungrouped handler registered without an explicit owner.
    pub fn revoke(&self) -> usize {
        self.revoke_ungrouped(ObjectId::of(&self.inner))
    }

    fn revoke_ungrouped(&self, owner: ObjectId) -> usize {
        let mut handlers = self.inner.lock();
        let removed = self.inner.detach_where(&mut handlers, |handler| {
            handler.group().is_none() && handler.owner_id() == owner
        });
        drop(handlers);
        debug!(
            channel = %self.inner.id,
            label = self.inner.label(),
            %owner,
            removed,
            "revoked owner"
        );
        removed
    }
}

impl Channel<()> {
    /// Sugar for `notify(())`.
    pub fn signal(&self) {
        self.notify(());
    }
}
