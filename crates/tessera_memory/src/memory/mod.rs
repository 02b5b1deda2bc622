//! # Allocators
//!
//! Specialized allocators that all sit on one [`BackingAllocator`].
//!
//! ## Which one
//!
//! - [`UnorderedPool`]: many objects of one size, O(1) everything, no iteration.
//! - [`OrderedPool`]: same, plus ascending iteration over live chunks and
//!   shrinking of empty pages, paid for with an O(free) release.
//! - [`StackAllocator`]: scratch memory freed in bulk at a [`Checkpoint`].
//! - [`HeapAllocator`]: anything else.
//!
//! None of them synchronize internally. Each can be given an
//! [`AllocatorContext`] carrying the backing allocator and the memory group
//! its usage is attributed to.

mod backing;
mod chunk;
mod heap;
mod ordered;
mod stack;
mod unordered;

pub use backing::{AllocatorContext, BackingAllocator, BudgetedBacking, SystemBacking};
pub use chunk::ChunkLayout;
pub use heap::HeapAllocator;
pub use ordered::{AcquiredChunks, OrderedPool};
pub use stack::{Checkpoint, StackAllocator};
pub use unordered::UnorderedPool;
