//! # Profiler
//!
//! Registry of memory groups plus the append-only event log.
//!
//! ## Ordering
//!
//! ```text
//! Thread A: record(G1, Allocate, 64) ─┐
//! Thread B: record(G2, Reserve, 4096) ─┼─► [lock] seq += 1, apply, append [unlock]
//! Thread C: record(G1, Deallocate, 64)─┘
//! ```
//!
//! The sequence counter is bumped inside the same short critical section that
//! updates the counters and appends the event, so the log order, the sequence
//! order and the order in which counters changed are one and the same. A
//! snapshot taken under that lock is therefore exactly the state after its
//! tagged sequence number.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::event::{Clock, Event, EventKind, MonotonicClock};
use super::group::{GroupCounters, GroupHandle, GroupId, GroupRecord};
use super::track::Track;
use crate::config::ProfilingConfig;
use crate::error::{MemoryError, MemoryResult};

/// Groups and their counters at one point of the event stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    /// Sequence number of the last event reflected in `groups` (0 if none).
    pub sequence: u64,
    /// Every group that existed at capture time, ordered by id.
    pub groups: Vec<GroupRecord>,
}

impl Snapshot {
    /// Looks up a captured group.
    #[must_use]
    pub fn group(&self, id: GroupId) -> Option<&GroupRecord> {
        self.groups.get(id.index()).filter(|g| g.id == id)
    }
}

struct Registry {
    groups: Vec<GroupRecord>,
    children: Vec<HashMap<String, GroupId>>,
    events: Vec<Event>,
}

impl Registry {
    fn contains(&self, id: GroupId) -> bool {
        id.index() < self.groups.len()
    }
}

/// Memory profiling context: group tree, counters and event stream.
///
/// Explicitly constructed and shared through `Arc`; nothing here is global,
/// so independent profilers can coexist (one per test, one per tool).
/// Groups are never destroyed.
pub struct Profiler {
    registry: Mutex<Registry>,
    sequence: AtomicU64,
    clock: Box<dyn Clock>,
}

impl Profiler {
    /// Name of the group every profiler starts with.
    pub const ROOT_NAME: &'static str = "root";

    /// Creates a profiler with the default configuration and clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&ProfilingConfig::default())
    }

    /// Creates a profiler sized from configuration.
    #[must_use]
    pub fn with_config(config: &ProfilingConfig) -> Self {
        Self::with_clock(config, Box::new(MonotonicClock::new()))
    }

    /// Creates a profiler annotating events with `clock`.
    #[must_use]
    pub fn with_clock(config: &ProfilingConfig, clock: Box<dyn Clock>) -> Self {
        let root = GroupRecord {
            id: GroupId::ROOT,
            parent: None,
            name: Self::ROOT_NAME.to_owned(),
            counters: GroupCounters::default(),
        };
        Self {
            registry: Mutex::new(Registry {
                groups: vec![root],
                children: vec![HashMap::new()],
                events: Vec::with_capacity(config.event_capacity),
            }),
            sequence: AtomicU64::new(0),
            clock,
        }
    }

    /// The root group.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> GroupId {
        GroupId::ROOT
    }

    /// Creates a group under `parent`, or under the root when `None`.
    ///
    /// # Errors
    ///
    /// `UnknownGroup` if `parent` does not exist, `DuplicateGroupName` if a
    /// sibling already uses `name`.
    pub fn create_group(&self, parent: Option<GroupId>, name: &str) -> MemoryResult<GroupId> {
        let parent = parent.unwrap_or(GroupId::ROOT);
        let mut registry = self.registry.lock();
        if !registry.contains(parent) {
            return Err(MemoryError::UnknownGroup(parent.get()));
        }
        if registry.children[parent.index()].contains_key(name) {
            return Err(MemoryError::DuplicateGroupName {
                parent: parent.get(),
                name: name.to_owned(),
            });
        }

        let raw = u32::try_from(registry.groups.len())
            .ok()
            .filter(|&raw| raw != GroupId::NONE)
            .ok_or(MemoryError::UnknownGroup(GroupId::NONE))?;
        let id = GroupId(raw);
        registry.groups.push(GroupRecord {
            id,
            parent: Some(parent),
            name: name.to_owned(),
            counters: GroupCounters::default(),
        });
        registry.children.push(HashMap::new());
        registry.children[parent.index()].insert(name.to_owned(), id);
        self.append(&mut registry, id, EventKind::GroupCreated, 0);

        tracing::debug!(group = %id, parent = %parent, name, "memory group created");
        Ok(id)
    }

    /// Finds a child of `parent` (root when `None`) by name.
    #[must_use]
    pub fn find_group(&self, parent: Option<GroupId>, name: &str) -> Option<GroupId> {
        let parent = parent.unwrap_or(GroupId::ROOT);
        let registry = self.registry.lock();
        registry.children.get(parent.index())?.get(name).copied()
    }

    /// Copy of one group's current record.
    #[must_use]
    pub fn group(&self, id: GroupId) -> Option<GroupRecord> {
        self.registry.lock().groups.get(id.index()).cloned()
    }

    /// Current counters of one group.
    #[must_use]
    pub fn counters(&self, id: GroupId) -> Option<GroupCounters> {
        self.registry.lock().groups.get(id.index()).map(|g| g.counters)
    }

    /// Number of groups, root included.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.registry.lock().groups.len()
    }

    /// Attribution handle for `id`.
    ///
    /// # Errors
    ///
    /// `UnknownGroup` if `id` does not exist in this profiler.
    pub fn handle(self: &Arc<Self>, id: GroupId) -> MemoryResult<GroupHandle> {
        if !self.registry.lock().contains(id) {
            return Err(MemoryError::UnknownGroup(id.get()));
        }
        Ok(GroupHandle::new(Arc::clone(self), id))
    }

    /// Sequence number of the most recent event (0 before any event).
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Captures every group and its counters, tagged with the last sequence
    /// number they reflect.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let registry = self.registry.lock();
        Snapshot {
            sequence: self.sequence.load(Ordering::Acquire),
            groups: registry.groups.clone(),
        }
    }

    /// Events recorded after `sequence`, in sequence order.
    ///
    /// Safe to call while other threads record; the result is a consistent
    /// prefix of the stream.
    #[must_use]
    pub fn events_since(&self, sequence: u64) -> Vec<Event> {
        let registry = self.registry.lock();
        let start = registry.events.partition_point(|e| e.sequence <= sequence);
        registry.events[start..].to_vec()
    }

    /// Builds a track from `snapshot` and everything recorded since.
    ///
    /// Groups created after the snapshot join the group table with zero
    /// counters, which is their state at snapshot time.
    #[must_use]
    pub fn track_since(&self, snapshot: &Snapshot) -> Track {
        let registry = self.registry.lock();
        let mut groups = snapshot.groups.clone();
        groups.extend(registry.groups.iter().skip(snapshot.groups.len()).map(|g| GroupRecord {
            counters: GroupCounters::default(),
            ..g.clone()
        }));
        let start = registry.events.partition_point(|e| e.sequence <= snapshot.sequence);
        Track::from_parts(snapshot.sequence, GroupId::ROOT, groups, registry.events[start..].to_vec())
    }

    pub(crate) fn record(&self, group: GroupId, kind: EventKind, size: i64) {
        let mut registry = self.registry.lock();
        debug_assert!(registry.contains(group), "handles only exist for known groups");
        let Some(record) = registry.groups.get_mut(group.index()) else {
            return;
        };
        record.counters.apply(kind, size);
        self.append(&mut registry, group, kind, size);
    }

    fn append(&self, registry: &mut Registry, group: GroupId, kind: EventKind, size: i64) {
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        registry.events.push(Event {
            sequence,
            group,
            kind,
            size,
            timestamp_ns: self.clock.now_nanos(),
        });
        tracing::trace!(sequence, group = %group, %kind, size, "memory event");
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Profiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profiler")
            .field("groups", &self.group_count())
            .field("last_sequence", &self.last_sequence())
            .finish_non_exhaustive()
    }
}
