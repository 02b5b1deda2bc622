//! # Tessera Memory
//!
//! Specialized allocators, string interning and memory-usage profiling for
//! engine subsystems that know their allocation patterns better than a
//! general-purpose heap does.
//!
//! ## Components
//!
//! 1. **Pools** - fixed-size chunks, O(1) acquire/release ([`UnorderedPool`],
//!    [`OrderedPool`])
//! 2. **Stack** - bump allocation with bulk rewind ([`StackAllocator`])
//! 3. **Heap** - variable-size blocks with per-block attribution ([`HeapAllocator`])
//! 4. **Strings** - deduplicated strings with pointer identity ([`StringInterningPool`])
//! 5. **Profiling** - group tree, ordered event log, snapshots, tracks ([`Profiler`])
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tessera_memory::{AllocatorContext, ChunkLayout, OrderedPool, Profiler};
//!
//! let profiler = Arc::new(Profiler::new());
//! let meshes = profiler.create_group(None, "meshes")?;
//! let context = AllocatorContext::default().with_group(profiler.handle(meshes)?);
//!
//! let mut pool = OrderedPool::with_context(ChunkLayout::new(64, 16, 128)?, context);
//! let chunk = pool.acquire()?;
//! assert_eq!(profiler.counters(meshes).unwrap().used, 64);
//! ```

#![deny(unsafe_code)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod error;
pub mod memory;
pub mod profiling;
pub mod strings;

pub use config::{MemoryConfig, PoolConfig, ProfilingConfig, StringPoolConfig};
pub use error::{MemoryError, MemoryResult, TrackError, TrackResult};
pub use memory::{
    AcquiredChunks, AllocatorContext, BackingAllocator, BudgetedBacking, Checkpoint, ChunkLayout,
    HeapAllocator, OrderedPool, StackAllocator, SystemBacking, UnorderedPool,
};
pub use profiling::{
    Clock, Event, EventKind, GroupCounters, GroupHandle, GroupId, GroupRecord, MonotonicClock,
    Profiler, Snapshot, Track,
};
pub use strings::{InternedStr, StringInterningPool};
