#![forbid(unsafe_code)]

//! Channel construction options.

use std::borrow::Cow;

use crate::group::Group;

/// Configuration for a [`Channel`](crate::Channel).
#[derive(Debug, Clone, Default)]
pub struct ChannelConfig {
    /// Group shared with other channels for coordinated revocation. Grouped
    /// channels are registered in the [`WeakIndex`](crate::WeakIndex).
    pub group: Option<Group>,
    /// Name attached to the channel's tracing events.
    pub label: Option<Cow<'static, str>>,
    /// Handler slots reserved up front.
    pub initial_capacity: usize,
}

impl ChannelConfig {
    /// Ungrouped, unlabeled, no reserved capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the channel group.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<Group>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Set the diagnostic label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<Cow<'static, str>>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Reserve room for `capacity` handlers.
    #[must_use]
    pub fn with_initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }
}
