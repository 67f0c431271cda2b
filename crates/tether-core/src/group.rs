#![forbid(unsafe_code)]

//! Structural identity tags used to scope coordinated revocation.
//!
//! A [`Group`] is a plain value. Two groups are equal when every component is
//! equal, and an absent component only equals another absent component. The
//! same type tags individual handlers (so `revoke_group` can find them) and
//! whole channels (so revocation fans out through the
//! [`WeakIndex`](crate::index::WeakIndex)).
//!
//! # Object identity
//!
//! Object-scoped groups capture the address of the `Arc` allocation, not the
//! object itself. A group built from an object that has since been dropped
//! stays a valid value; it simply stops matching anything once no handler
//! carries it. Allocation addresses can be reused after a drop, so a group
//! should not outlive the object it names.

use std::any::{TypeId, type_name};
use std::borrow::Cow;
use std::fmt;
use std::sync::{Arc, Weak};

/// Stable identity of a shared allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(usize);

impl ObjectId {
    /// Identity of the allocation behind `object`.
    #[must_use]
    pub fn of<T: ?Sized>(object: &Arc<T>) -> Self {
        Self(Arc::as_ptr(object).cast::<()>() as usize)
    }

    /// Identity of the allocation a weak reference points at.
    #[must_use]
    pub fn of_weak<T: ?Sized>(object: &Weak<T>) -> Self {
        Self(object.as_ptr().cast::<()>() as usize)
    }

    /// Raw address, for diagnostics only.
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identity of a property accessor: the owning type plus the property name.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyPath {
    owner: TypeId,
    owner_name: &'static str,
    name: &'static str,
}

impl PropertyPath {
    /// Path for property `name` on type `T`.
    #[must_use]
    pub fn of<T: ?Sized + 'static>(name: &'static str) -> Self {
        Self {
            owner: TypeId::of::<T>(),
            owner_name: type_name::<T>(),
            name,
        }
    }

    /// Property name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.owner_name, self.name)
    }
}

/// Revocation scope shared by handlers and channels.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Group {
    /// Scoped to one object, optionally narrowed by a sub-key and an id.
    Object {
        object: ObjectId,
        key: Option<Cow<'static, str>>,
        id: Option<Cow<'static, str>>,
    },
    /// Scoped to a property path, optionally on one object and with an id.
    Property {
        path: PropertyPath,
        object: Option<ObjectId>,
        id: Option<Cow<'static, str>>,
    },
    /// Free-form tag.
    Tag(Cow<'static, str>),
}

impl Group {
    /// Tag group.
    #[must_use]
    pub fn tag(tag: impl Into<Cow<'static, str>>) -> Self {
        Self::Tag(tag.into())
    }

    /// Group scoped to `object`.
    #[must_use]
    pub fn object<T: ?Sized>(object: &Arc<T>) -> Self {
        Self::Object {
            object: ObjectId::of(object),
            key: None,
            id: None,
        }
    }

    /// Group scoped to `object` and narrowed by `key`.
    #[must_use]
    pub fn object_key<T: ?Sized>(object: &Arc<T>, key: impl Into<Cow<'static, str>>) -> Self {
        Self::Object {
            object: ObjectId::of(object),
            key: Some(key.into()),
            id: None,
        }
    }

    /// Group scoped to a property path on any object.
    #[must_use]
    pub fn property(path: PropertyPath) -> Self {
        Self::Property {
            path,
            object: None,
            id: None,
        }
    }

    /// Group scoped to a property path on one object.
    #[must_use]
    pub fn property_of<T: ?Sized>(object: &Arc<T>, path: PropertyPath) -> Self {
        Self::Property {
            path,
            object: Some(ObjectId::of(object)),
            id: None,
        }
    }

    /// Attach an id component. Tags have no id slot and are returned as is.
    #[must_use]
    pub fn with_id(self, new_id: impl Into<Cow<'static, str>>) -> Self {
        match self {
            Self::Object { object, key, .. } => Self::Object {
                object,
                key,
                id: Some(new_id.into()),
            },
            Self::Property { path, object, .. } => Self::Property {
                path,
                object,
                id: Some(new_id.into()),
            },
            tag @ Self::Tag(_) => tag,
        }
    }

    /// Object identity this group is scoped to, if any.
    #[must_use]
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            Self::Object { object, .. } => Some(*object),
            Self::Property { object, .. } => *object,
            Self::Tag(_) => None,
        }
    }
}

impl From<&'static str> for Group {
    fn from(tag: &'static str) -> Self {
        Self::Tag(Cow::Borrowed(tag))
    }
}

impl From<String> for Group {
    fn from(tag: String) -> Self {
        Self::Tag(Cow::Owned(tag))
    }
}

impl From<PropertyPath> for Group {
    fn from(path: PropertyPath) -> Self {
        Self::property(path)
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object { object, key, id } => {
                write!(f, "object:{object}")?;
                if let Some(key) = key {
                    write!(f, "/{key}")?;
                }
                if let Some(id) = id {
                    write!(f, "#{id}")?;
                }
                Ok(())
            }
            Self::Property { path, object, id } => {
                write!(f, "property:{path:?}")?;
                if let Some(object) = object {
                    write!(f, "@{object}")?;
                }
                if let Some(id) = id {
                    write!(f, "#{id}")?;
                }
                Ok(())
            }
            Self::Tag(tag) => write!(f, "tag:{tag}"),
        }
    }
}
