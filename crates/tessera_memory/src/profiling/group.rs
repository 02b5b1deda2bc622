//! # Memory Groups
//!
//! Named nodes in the attribution tree, their counters, and the handle
//! allocators carry to report into a group.

use std::fmt;
use std::sync::Arc;

use super::event::EventKind;
use super::profiler::Profiler;

/// Identifier of a memory group, unique within one [`Profiler`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub(crate) u32);

impl GroupId {
    /// The root group every profiler starts with.
    pub const ROOT: Self = Self(0);

    /// Wire value standing for "no parent".
    pub const NONE: u32 = u32::MAX;

    /// Raw id.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<GroupId> for u32 {
    fn from(id: GroupId) -> Self {
        id.0
    }
}

/// Reserved and used byte counters of one group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupCounters {
    /// Bytes obtained from backing memory on behalf of the group.
    pub reserved: u64,
    /// Bytes handed out to callers on behalf of the group.
    pub used: u64,
}

impl GroupCounters {
    /// Applies one event. Live recording and replay both go through here,
    /// which is what makes replay reproduce live counters exactly.
    ///
    /// Counters saturate at zero and `u64::MAX`.
    pub fn apply(&mut self, kind: EventKind, size: i64) {
        match kind {
            EventKind::Allocate => self.used = self.used.saturating_add_signed(size),
            EventKind::Deallocate => self.used = self.used.saturating_add_signed(size.saturating_neg()),
            EventKind::Reserve => self.reserved = self.reserved.saturating_add_signed(size),
            EventKind::Release => self.reserved = self.reserved.saturating_add_signed(size.saturating_neg()),
            EventKind::GroupCreated => {}
        }
    }

    /// True when both counters are zero.
    #[inline]
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.reserved == 0 && self.used == 0
    }
}

/// A group as captured in a snapshot or track.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupRecord {
    /// Group id.
    pub id: GroupId,
    /// Parent group, `None` for the root.
    pub parent: Option<GroupId>,
    /// Name, unique among siblings.
    pub name: String,
    /// Counters at capture time.
    pub counters: GroupCounters,
}

/// Attribution handle: a group plus the profiler that owns it.
///
/// Allocators hold one of these to report their usage. Only allocators in
/// this crate can record through it.
#[derive(Clone)]
pub struct GroupHandle {
    profiler: Arc<Profiler>,
    id: GroupId,
}

impl GroupHandle {
    pub(crate) fn new(profiler: Arc<Profiler>, id: GroupId) -> Self {
        Self { profiler, id }
    }

    /// The group id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> GroupId {
        self.id
    }

    /// The owning profiler.
    #[inline]
    #[must_use]
    pub fn profiler(&self) -> &Arc<Profiler> {
        &self.profiler
    }

    /// Current counters of the group.
    #[must_use]
    pub fn counters(&self) -> GroupCounters {
        self.profiler.counters(self.id).unwrap_or_default()
    }

    #[inline]
    pub(crate) fn record(&self, kind: EventKind, size: usize) {
        self.record_signed(kind, i64::try_from(size).unwrap_or(i64::MAX));
    }

    #[inline]
    pub(crate) fn record_signed(&self, kind: EventKind, size: i64) {
        self.profiler.record(self.id, kind, size);
    }
}

impl fmt::Debug for GroupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GroupHandle").field(&self.id).finish()
    }
}

/// Records `kind` of `size` bytes when a group is attached.
#[inline]
pub(crate) fn record(group: Option<&GroupHandle>, kind: EventKind, size: usize) {
    if let Some(group) = group {
        if size > 0 {
            group.record(kind, size);
        }
    }
}
