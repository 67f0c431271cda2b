#![forbid(unsafe_code)]

//! Registration records and the fluent [`Subscribe`] builder.
//!
//! Every way of adding a handler produces a [`Registration`] and hands it to
//! [`Channel::register`]. The builder only decides the callback shape:
//!
//! | Terminal              | Callback shape            | Needs owner |
//! |-----------------------|---------------------------|-------------|
//! | `run`                 | `Fn(&P)`                  | no          |
//! | `run_while`           | `Fn(&P) -> bool`          | no          |
//! | `trigger`             | `Fn()`                    | no          |
//! | `run_with`            | `Fn(&T, &P)`              | yes         |
//! | `run_with_while`      | `Fn(&T, &P) -> bool`      | yes         |
//! | `call`                | `Fn(&T)`                  | yes         |
//!
//! Setting a group makes the registration solo unless `.solo(false)` follows.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use crate::channel::Channel;
use crate::group::{Group, ObjectId};
use crate::handler::{Callback, Guard, HandlerHandle, WeakOwner};

/// Everything needed to add one handler to a channel.
pub struct Registration<P: 'static> {
    pub(crate) owner: Option<(WeakOwner, ObjectId)>,
    pub(crate) group: Option<Group>,
    pub(crate) solo: bool,
    pub(crate) guards: Vec<Guard<P>>,
    pub(crate) callback: Callback<P>,
}

impl<P: 'static> fmt::Debug for Registration<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("owner", &self.owner.as_ref().map(|(_, id)| *id))
            .field("group", &self.group)
            .field("solo", &self.solo)
            .field("guards", &self.guards.len())
            .finish_non_exhaustive()
    }
}

impl<P: 'static> Registration<P> {
    /// Registration with the canonical callback shape. Without an explicit
    /// owner the handler is owned by the channel it is registered on.
    #[must_use]
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&(dyn Any + Send + Sync), &P) -> bool + Send + Sync + 'static,
    {
        Self {
            owner: None,
            group: None,
            solo: false,
            guards: Vec::new(),
            callback: Box::new(callback),
        }
    }

    /// Tie the handler's lifetime to `owner`.
    #[must_use]
    pub fn owned_by<T: Any + Send + Sync>(mut self, owner: &Arc<T>) -> Self {
        let weak: Weak<T> = Arc::downgrade(owner);
        let weak: WeakOwner = weak;
        self.owner = Some((weak, ObjectId::of(owner)));
        self
    }

    /// Tag the handler with `group`. Implies solo.
    #[must_use]
    pub fn group(mut self, group: impl Into<Group>) -> Self {
        self.group = Some(group.into());
        self.solo = true;
        self
    }

    /// Whether registering revokes handlers already carrying the group.
    #[must_use]
    pub fn solo(mut self, solo: bool) -> Self {
        self.solo = solo;
        self
    }

    /// Add a continuation guard.
    #[must_use]
    pub fn until<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&P, u64) -> bool + Send + Sync + 'static,
    {
        self.guards.push(Arc::new(predicate));
        self
    }
}

/// Marker: the handler is owned by the channel.
#[derive(Debug, Clone, Copy)]
pub struct ChannelOwned;

/// Marker: the handler is owned by an `Arc<T>`.
pub struct OwnedBy<T>(PhantomData<fn() -> T>);

/// Fluent registration builder returned by [`Channel::subscribe`] and
/// [`Channel::on`].
pub struct Subscribe<'a, P: 'static, O> {
    channel: &'a Channel<P>,
    owner: Option<(WeakOwner, ObjectId)>,
    group: Option<Group>,
    solo: bool,
    guards: Vec<Guard<P>>,
    _owner: PhantomData<O>,
}

impl<'a, P: 'static, O> Subscribe<'a, P, O> {
    pub(crate) fn new(channel: &'a Channel<P>, owner: Option<(WeakOwner, ObjectId)>) -> Self {
        Self {
            channel,
            owner,
            group: None,
            solo: false,
            guards: Vec::new(),
            _owner: PhantomData,
        }
    }

    /// Tag the handler with `group`. Implies solo.
    #[must_use]
    pub fn group(mut self, group: impl Into<Group>) -> Self {
        self.group = Some(group.into());
        self.solo = true;
        self
    }

    /// Whether registering revokes handlers already carrying the group.
    #[must_use]
    pub fn solo(mut self, solo: bool) -> Self {
        self.solo = solo;
        self
    }

    /// Keep the handler only while `predicate(parameter, invocation_count)`
    /// holds.
    #[must_use]
    pub fn until<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&P, u64) -> bool + Send + Sync + 'static,
    {
        self.guards.push(Arc::new(predicate));
        self
    }

    /// Fire once, then retire.
    #[must_use]
    pub fn once(self) -> Self {
        self.until(|_, count| count == 0)
    }

    fn finish(self, callback: Callback<P>) -> HandlerHandle<P> {
        let Self {
            channel,
            owner,
            group,
            solo,
            guards,
            _owner,
        } = self;
        channel.register(Registration {
            owner,
            group,
            solo,
            guards,
            callback,
        })
    }

    /// Run `callback` with each parameter.
    pub fn run<F>(self, callback: F) -> HandlerHandle<P>
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        self.finish(Box::new(move |_: &(dyn Any + Send + Sync), parameter: &P| {
            callback(parameter);
            true
        }))
    }

    /// Run `callback` with each parameter; returning `false` retires it.
    pub fn run_while<F>(self, callback: F) -> HandlerHandle<P>
    where
        F: Fn(&P) -> bool + Send + Sync + 'static,
    {
        self.finish(Box::new(move |_: &(dyn Any + Send + Sync), parameter: &P| {
            callback(parameter)
        }))
    }

    /// Run `callback` on every notification, ignoring the parameter.
    pub fn trigger<F>(self, callback: F) -> HandlerHandle<P>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.finish(Box::new(move |_: &(dyn Any + Send + Sync), _: &P| {
            callback();
            true
        }))
    }
}

impl<'a, P: 'static, T: Any + Send + Sync> Subscribe<'a, P, OwnedBy<T>> {
    /// Run `callback` with the owner and each parameter.
    pub fn run_with<F>(self, callback: F) -> HandlerHandle<P>
    where
        F: Fn(&T, &P) + Send + Sync + 'static,
    {
        self.run_with_while(move |owner, parameter| {
            callback(owner, parameter);
            true
        })
    }

    /// Run `callback` with the owner and each parameter; returning `false`
    /// retires it.
    pub fn run_with_while<F>(self, callback: F) -> HandlerHandle<P>
    where
        F: Fn(&T, &P) -> bool + Send + Sync + 'static,
    {
        self.finish(Box::new(move |owner: &(dyn Any + Send + Sync), parameter: &P| {
            match owner.downcast_ref::<T>() {
                Some(owner) => callback(owner, parameter),
                None => true,
            }
        }))
    }

    /// Call `method` on the owner, ignoring the parameter.
    pub fn call<F>(self, method: F) -> HandlerHandle<P>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.run_with(move |owner, _| method(owner))
    }
}
