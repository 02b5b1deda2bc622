//! # Profiling Events
//!
//! Immutable records of every attributed size change, totally ordered by a
//! global sequence number.

use std::fmt;
use std::time::Instant;

use super::group::GroupId;

/// What happened to a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    /// Bytes handed out to a caller.
    Allocate = 0,
    /// Bytes given back by a caller.
    Deallocate = 1,
    /// Backing memory obtained.
    Reserve = 2,
    /// Backing memory returned.
    Release = 3,
    /// The group itself was created.
    GroupCreated = 4,
}

impl EventKind {
    /// Converts from the wire byte.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Allocate),
            1 => Some(Self::Deallocate),
            2 => Some(Self::Reserve),
            3 => Some(Self::Release),
            4 => Some(Self::GroupCreated),
            _ => None,
        }
    }

    /// Short label for tools.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Allocate => "alloc",
            Self::Deallocate => "dealloc",
            Self::Reserve => "reserve",
            Self::Release => "release",
            Self::GroupCreated => "group",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One recorded event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    /// Strictly increasing across the whole profiler, starting at 1.
    pub sequence: u64,
    /// Group the event is attributed to.
    pub group: GroupId,
    /// Event kind.
    pub kind: EventKind,
    /// Size in bytes; signed so reallocation deltas fit.
    pub size: i64,
    /// Clock reading for human inspection only; never used for ordering.
    pub timestamp_ns: u64,
}

/// Time source used to annotate events.
pub trait Clock: Send + Sync {
    /// Nanoseconds since an arbitrary fixed origin.
    fn now_nanos(&self) -> u64;
}

/// Monotonic wall clock measured from profiler construction.
#[derive(Clone, Copy, Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Starts a clock at "now".
    #[must_use]
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_nanos(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}
