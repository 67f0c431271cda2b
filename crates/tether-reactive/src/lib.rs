#![forbid(unsafe_code)]

//! Reactive values built on `tether-core` channels.
//!
//! - [`Observed`], [`ObservedSetter`], [`ObservedUpdate`]: shared value
//!   wrappers that publish their mutations.
//! - [`Updatable`]: a default update channel for any `Arc`-shared type.
//! - [`LazyChannel`]: a channel field that is only created when first used.
//!
//! # Invariants
//!
//! 1. No value lock is held while a channel is notified.
//! 2. `ObservedUpdate` notifies exactly once per value-changing mutation.
//! 3. Nothing here keeps a subscriber's owner alive.

pub mod observed;
pub mod updatable;

pub use observed::{Observed, ObservedSetter, ObservedUpdate};
pub use updatable::{LazyChannel, Updatable, UpdateRegistry};
