//! # Memory Error Types
//!
//! All errors that can occur in the allocators, the interning pool, the
//! profiler and the track format.

use thiserror::Error;

/// Errors raised by allocators, the interning pool and the profiler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// The backing allocator could not provide a page or stack buffer.
    #[error("backing allocation failed: {size} bytes aligned to {align}")]
    AllocationFailure {
        /// Requested size in bytes.
        size: usize,
        /// Requested alignment.
        align: usize,
    },

    /// The general-purpose heap could not satisfy a request.
    #[error("out of memory: {size} bytes aligned to {align}")]
    OutOfMemory {
        /// Requested size in bytes.
        size: usize,
        /// Requested alignment.
        align: usize,
    },

    /// A stack allocator does not have enough room left.
    #[error("stack capacity exceeded: requested {requested} bytes, {available} available")]
    CapacityExceeded {
        /// Bytes needed, including alignment padding.
        requested: usize,
        /// Bytes remaining in the stack.
        available: usize,
    },

    /// A checkpoint from another stack, or one above the current top.
    #[error("invalid stack checkpoint")]
    InvalidCheckpoint,

    /// Size/alignment combination that no allocator can honour.
    #[error("invalid layout: size {size}, align {align}")]
    InvalidLayout {
        /// Requested size in bytes.
        size: usize,
        /// Requested alignment.
        align: usize,
    },

    /// Pointer was not issued by this heap allocator (or was already freed).
    #[error("unknown allocation at {0:#x}")]
    UnknownAllocation(usize),

    /// A sibling group with this name already exists.
    #[error("duplicate memory group name '{name}' under group {parent}")]
    DuplicateGroupName {
        /// Parent group id.
        parent: u32,
        /// Conflicting name.
        name: String,
    },

    /// Group id not known to the profiler.
    #[error("unknown memory group: {0}")]
    UnknownGroup(u32),

    /// Configuration file could not be read or parsed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for allocator and profiler operations.
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Errors raised while reading, writing or replaying a track.
#[derive(Error, Debug)]
pub enum TrackError {
    /// Underlying reader/writer failed.
    #[error("track i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// File does not start with the track magic.
    #[error("not a track file (bad magic)")]
    BadMagic,

    /// Format version newer than this build understands.
    #[error("unsupported track version {0}")]
    UnsupportedVersion(u32),

    /// Event kind byte out of range.
    #[error("invalid event kind {0}")]
    InvalidEventKind(u8),

    /// Group name is not valid UTF-8.
    #[error("group name is not valid utf-8")]
    InvalidName,

    /// Two groups share an id.
    #[error("duplicate group id {0}")]
    DuplicateGroup(u32),

    /// A group names a parent that is not in the track.
    #[error("group {group} references unknown parent {parent}")]
    UnknownParent {
        /// Offending group.
        group: u32,
        /// Missing parent id.
        parent: u32,
    },

    /// Header root id does not name a parentless group.
    #[error("root group {0} missing from track")]
    MissingRoot(u32),

    /// A group cannot be reached from the root by following parents.
    #[error("group {0} is not reachable from the root")]
    Unreachable(u32),

    /// Two children of one parent share a name.
    #[error("group {parent} has more than one child named {name:?}")]
    DuplicateName {
        /// Parent group id.
        parent: u32,
        /// Repeated name.
        name: String,
    },

    /// An event references a group that is not in the track.
    #[error("event {sequence} references unknown group {group}")]
    UnknownGroup {
        /// Event sequence number.
        sequence: u64,
        /// Missing group id.
        group: u32,
    },

    /// A `GroupCreated` event whose group is not present with a matching id.
    #[error("group-created event {sequence} does not match group {group}")]
    GroupCreatedMismatch {
        /// Event sequence number.
        sequence: u64,
        /// Referenced group id.
        group: u32,
    },

    /// Events are not strictly increasing by sequence number.
    #[error("event sequence {sequence} does not follow {previous}")]
    OutOfOrder {
        /// Previous sequence number (or the snapshot sequence).
        previous: u64,
        /// Offending sequence number.
        sequence: u64,
    },

    /// A count in the file exceeds what the format can represent.
    #[error("track section too large: {0} entries")]
    TooLarge(usize),
}

/// Result type for track operations.
pub type TrackResult<T> = Result<T, TrackError>;
