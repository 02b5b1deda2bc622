//! # Memory Profiling
//!
//! Attributes allocator usage to a tree of named groups and records every
//! size change as an ordered event.
//!
//! ## Model
//!
//! ```text
//! root
//! ├── render            reserved / used
//! │   └── meshes        reserved / used
//! └── strings           reserved / used
//!
//! events: 1 GroupCreated(render)  2 GroupCreated(meshes)  3 Reserve(meshes, 4096) ...
//! ```
//!
//! - Groups are created at runtime and never destroyed.
//! - Counters change only through events recorded by allocators.
//! - Replaying the events after a [`Snapshot`] onto it reproduces the live
//!   counters exactly; a [`Track`] is that pair, serialized.

mod event;
mod group;
mod profiler;
mod track;

pub use event::{Clock, Event, EventKind, MonotonicClock};
pub use group::{GroupCounters, GroupHandle, GroupId, GroupRecord};
pub use profiler::{Profiler, Snapshot};
pub use track::{Track, TRACK_MAGIC, TRACK_VERSION};

pub(crate) use group::record;
