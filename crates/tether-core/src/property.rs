#![forbid(unsafe_code)]

//! Write-through property accessors for [`Channel::bind`](crate::Channel::bind).
//!
//! A [`Property<T, V>`] names one settable slot of `T` and carries the setter
//! used to write a `V` into it. The name and owning type together form the
//! [`PropertyPath`] that identifies bindings, so binding the same property of
//! the same object twice replaces the first binding.
//!
//! Owners are shared (`Arc<T>`), so setters receive `&T` and rely on interior
//! mutability:
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use tether_core::{Channel, Property};
//!
//! struct Label {
//!     text: Mutex<String>,
//! }
//!
//! let text = Property::new("text", |label: &Label, value: String| {
//!     *label.text.lock().unwrap() = value;
//! });
//! let label = Arc::new(Label { text: Mutex::new(String::new()) });
//! let channel = Channel::<String>::new();
//! channel.bind(&label, text);
//! channel.notify("hello".to_string());
//! assert_eq!(*label.text.lock().unwrap(), "hello");
//! ```

use std::fmt;

use crate::group::PropertyPath;

/// Named setter for one property of `T`.
pub struct Property<T, V> {
    path: PropertyPath,
    setter: fn(&T, V),
}

impl<T, V> Clone for Property<T, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, V> Copy for Property<T, V> {}

impl<T, V> fmt::Debug for Property<T, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Property").field(&self.path).finish()
    }
}

impl<T: 'static, V> Property<T, V> {
    /// Property `name` of `T`, written through `setter`.
    #[must_use]
    pub fn new(name: &'static str, setter: fn(&T, V)) -> Self {
        Self {
            path: PropertyPath::of::<T>(name),
            setter,
        }
    }
}

impl<T, V> Property<T, V> {
    /// Identity of this property.
    #[must_use]
    pub fn path(&self) -> PropertyPath {
        self.path
    }

    /// Write `value` into `target`.
    pub fn set(&self, target: &T, value: V) {
        (self.setter)(target, value);
    }
}
