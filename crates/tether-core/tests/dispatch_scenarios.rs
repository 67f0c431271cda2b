#![forbid(unsafe_code)]

//! End-to-end dispatch scenarios.
//!
//! These walk one model object through every registration shape and check
//! the observable state after each step:
//! - method calls, closures, parameter-ignoring calls
//! - owner revocation vs. group revocation
//! - property binding and unbinding
//! - `now`, `once`, `until`
//! - owners going away between notifications

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tether_core::{Channel, Group, Property};
use tracing::Level;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::TRACE)
        .try_init();
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Int(i32),
    Str(String),
}

struct Object {
    state: Mutex<Option<Value>>,
    count: AtomicUsize,
    on_change_state: Channel<Option<Value>>,
}

impl Object {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            count: AtomicUsize::new(0),
            on_change_state: Channel::new(),
        })
    }

    fn set_state(&self, value: Option<Value>) {
        *self.state.lock().unwrap() = value.clone();
        self.count.fetch_add(1, Ordering::Relaxed);
        self.on_change_state.notify(value);
    }

    fn state(&self) -> Option<Value> {
        self.state.lock().unwrap().clone()
    }

    fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    fn reset_count(&self) {
        self.count.store(0, Ordering::Relaxed);
    }

    fn void(&self) {
        self.set_state(None);
    }

    fn int(&self, i: &i32) {
        self.set_state(Some(Value::Int(*i)));
    }

    fn str(&self, s: &String) {
        self.set_state(Some(Value::Str(s.clone())));
    }
}

fn int(i: i32) -> Option<Value> {
    Some(Value::Int(i))
}

fn text(s: &str) -> Option<Value> {
    Some(Value::Str(s.to_string()))
}

fn state_property() -> Property<Object, Option<Value>> {
    Property::new("state", |object, value| object.set_state(value))
}

#[test]
fn int_channel_owner_and_group_revocation() {
    init_tracing();
    let object = Object::new();
    let ints = Channel::<i32>::new();

    ints.run_with(&object, Object::int);
    ints.notify(1);
    assert_eq!(object.state(), int(1));
    assert_eq!(object.count(), 1);
    ints.notify(2);
    assert_eq!(object.state(), int(2));
    assert_eq!(object.count(), 2);

    ints.run_with(&object, Object::int);
    ints.notify(3);
    assert_eq!(object.state(), int(3));
    assert_eq!(object.count(), 4);

    ints.revoke_owner(&object);
    ints.notify(4);
    assert_eq!(object.state(), int(3));
    assert_eq!(object.count(), 4);

    ints.on(&object).group("Int").run_with(Object::int);
    ints.on(&object).group("Int").run_with(Object::int);
    ints.notify(5);
    assert_eq!(object.state(), int(5));
    assert_eq!(object.count(), 5);

    // Grouped handlers are out of reach of owner revocation.
    ints.revoke_owner(&object);
    ints.notify(6);
    assert_eq!(object.state(), int(6));
    assert_eq!(object.count(), 6);

    ints.revoke_group(&Group::tag("Int"));
    ints.notify(7);
    assert_eq!(object.state(), int(6));
    assert_eq!(object.count(), 6);
}

#[test]
fn unit_channel_revocation_scopes() {
    init_tracing();
    let object = Object::new();
    let void = Channel::<()>::new();

    void.call(&object, Object::void);
    void.signal();
    assert_eq!(object.state(), None);
    assert_eq!(object.count(), 1);

    // Neither the channel scope nor an unknown group reaches the handler.
    void.revoke();
    void.revoke_group(&Group::tag("Void"));
    void.signal();
    assert_eq!(object.count(), 2);

    void.revoke_owner(&object);
    void.signal();
    assert_eq!(object.count(), 2);

    let _ = void.call(&object, Object::void).once();
    void.signal();
    void.signal();
    assert_eq!(object.count(), 3);

    void.on(&object).group("Void").call(Object::void);
    void.on(&object).group("Void").call(Object::void);
    void.signal();
    assert_eq!(object.count(), 4);

    void.revoke();
    void.revoke_owner(&object);
    void.revoke_owner(&Object::new());
    void.revoke_group(&Group::tag("void"));
    void.signal();
    assert_eq!(object.count(), 5);

    void.revoke_group(&Group::tag("Void"));
    void.signal();
    assert_eq!(object.count(), 5);

    void.on(&object).group("Void").call(Object::void);
    void.revoke_group(&Group::tag("Void"));
    void.signal();
    assert_eq!(object.count(), 5);

    void.run_with(&object, |o, _| o.reset_count());
    void.signal();
    assert_eq!(object.count(), 0);
    void.revoke_owner(&object);
    assert!(void.is_empty());
}

#[test]
fn property_binding_survives_owner_revocation() {
    init_tracing();
    let object = Object::new();
    let values = Channel::<Option<Value>>::new();

    values.bind(&object, state_property());
    values.notify(text("Test"));
    assert_eq!(object.state(), text("Test"));
    assert_eq!(object.count(), 1);
    values.notify(None);
    assert_eq!(object.state(), None);
    assert_eq!(object.count(), 2);

    values.bind(&object, state_property());
    values.notify(text(""));
    assert_eq!(object.state(), text(""));
    assert_eq!(object.count(), 3);

    values.revoke_owner(&object);
    values.notify(int(42));
    assert_eq!(object.state(), int(42));
    assert_eq!(object.count(), 4);

    values.unbind(&object, &state_property());
    values.notify(None);
    assert_eq!(object.state(), int(42));
    assert_eq!(object.count(), 4);
}

#[test]
fn rebinding_leaves_one_write_through() {
    let object = Object::new();
    let values = Channel::<Option<Value>>::new();

    let first = values.bind(&object, state_property());
    let second = values.bind(&object, state_property());
    assert!(!first.is_active());
    assert!(second.is_active());
    assert_eq!(values.len(), 1);

    values.notify(int(1));
    assert_eq!(object.count(), 1);
    assert_eq!(first.invocation_count(), 0);
    assert_eq!(second.invocation_count(), 1);
}

#[test]
fn now_fires_immediately() {
    let object = Object::new();
    let values = Channel::<Option<Value>>::new();

    let handle = values.run_with(&object, |o, v| o.set_state(v.clone()));
    handle.now(text("T"));
    assert_eq!(object.state(), text("T"));
    assert_eq!(object.count(), 1);
    assert_eq!(handle.invocation_count(), 1);

    values.notify(text("U"));
    assert_eq!(handle.invocation_count(), 2);
}

#[test]
fn now_is_silent_when_owner_is_gone() {
    let values = Channel::<u8>::new();
    let owner = Arc::new(());
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_clone = Arc::clone(&fired);
    let handle = values.run_with(&owner, move |_, _| {
        fired_clone.fetch_add(1, Ordering::Relaxed);
    });
    drop(owner);
    handle.now(1);
    assert_eq!(fired.load(Ordering::Relaxed), 0);
    assert_eq!(handle.invocation_count(), 0);
}

#[test]
fn string_channel_closures_and_until() {
    init_tracing();
    let object = Object::new();
    let strings = Channel::<String>::new();

    strings.run_with(&object, Object::str);
    strings.notify("OK".into());
    assert_eq!(object.state(), text("OK"));
    assert_eq!(object.count(), 1);
    strings.notify(String::new());
    assert_eq!(object.state(), text(""));
    assert_eq!(object.count(), 2);

    strings.call(&object, Object::void);
    strings.notify("Void".into());
    assert_eq!(object.state(), None);
    assert_eq!(object.count(), 4);

    strings.revoke_owner(&object);
    strings.notify(String::new());
    assert_eq!(object.state(), None);
    assert_eq!(object.count(), 4);

    // Channel-owned closure holding the object weakly.
    let weak: Weak<Object> = Arc::downgrade(&object);
    strings.run(move |s| {
        if let Some(object) = weak.upgrade() {
            object.str(s);
        }
    });
    strings.notify(String::new());
    assert_eq!(object.state(), text(""));
    assert_eq!(object.count(), 5);

    strings.revoke();
    strings.notify("Revoke".into());
    assert_eq!(object.state(), text(""));
    assert_eq!(object.count(), 5);

    let _ = strings
        .run_with(&object, Object::str)
        .until(|s, _| s.len() < 3);
    strings.notify("A".into());
    assert_eq!(object.state(), text("A"));
    assert_eq!(object.count(), 6);
    strings.notify("AB".into());
    assert_eq!(object.state(), text("AB"));
    assert_eq!(object.count(), 7);
    strings.notify("ABC".into());
    assert_eq!(object.state(), text("AB"));
    assert_eq!(object.count(), 7);
    assert!(strings.is_empty());
}

#[test]
fn tuple_channel_stops_when_owner_drops() {
    let object = Object::new();
    let pairs = Channel::<(String, String)>::new();

    let owner = Object::new();
    let target = Arc::downgrade(&object);
    pairs
        .run_with(&owner, move |_, (a, b)| {
            if let Some(object) = target.upgrade() {
                object.set_state(Some(Value::Str(format!("{a}{b}"))));
            }
        })
        .now(("A".into(), "B".into()));
    assert_eq!(object.state(), text("AB"));
    assert_eq!(object.count(), 1);

    pairs.notify(("C".into(), "D".into()));
    assert_eq!(object.state(), text("CD"));
    assert_eq!(object.count(), 2);

    drop(owner);
    pairs.notify(("E".into(), "F".into()));
    assert_eq!(object.state(), text("CD"));
    assert_eq!(object.count(), 2);
    assert!(pairs.is_empty());
}

#[test]
fn handlers_never_retain_their_owner() {
    let object = Object::new();
    let weak = Arc::downgrade(&object);
    object
        .on_change_state
        .run_with(&object, |o, _| o.reset_count());
    drop(object);
    assert!(weak.upgrade().is_none());
}

#[test]
fn handler_on_owned_channel_follows_owner_changes() {
    let object = Object::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);
    let watcher = Arc::new(());
    object.on_change_state.run_with(&watcher, move |_, v| {
        seen_clone.lock().unwrap().push(v.clone());
    });

    object.set_state(int(1));
    object.set_state(int(2));
    drop(watcher);
    object.set_state(int(3));

    assert_eq!(*seen.lock().unwrap(), vec![int(1), int(2)]);
}

#[test]
fn state_and_count_scenario() {
    let object = Object::new();
    let ints = Channel::<i32>::new();
    ints.run_with(&object, Object::int);

    ints.notify(1);
    assert_eq!((object.state(), object.count()), (int(1), 1));
    ints.notify(2);
    assert_eq!((object.state(), object.count()), (int(2), 2));

    ints.revoke_owner(&object);
    ints.notify(3);
    assert_eq!((object.state(), object.count()), (int(2), 2));
}
