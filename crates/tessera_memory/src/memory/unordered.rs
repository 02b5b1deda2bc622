//! # Unordered Pool
//!
//! Fixed-size chunk allocator with O(1) acquire and release.

#![allow(unsafe_code)]

use std::ptr::NonNull;

use super::backing::AllocatorContext;
use super::chunk::{ChunkLayout, FreeList, Page};
use crate::error::MemoryResult;
use crate::profiling::{self, EventKind};

/// A pool allocator for fixed-size chunks with an unordered free list.
///
/// Chunks are handed out and taken back individually, all with the same
/// size and alignment. Pages of chunks are reserved from the backing
/// allocator on demand and only returned by [`clear`](Self::clear) or drop.
///
/// The free list is LIFO: a released chunk is the next one acquired. There is
/// no iteration and no shrink, because an unordered list cannot tell a fully
/// free page from a partially used one cheaply.
///
/// # Thread Safety
///
/// This pool is NOT thread-safe. Use one pool per thread or wrap in a mutex.
///
/// # Example
///
/// ```rust,ignore
/// let layout = ChunkLayout::new(16, 8, 4)?;
/// let mut pool = UnorderedPool::new(layout);
///
/// // Acquire - O(1)
/// let chunk = pool.acquire()?;
///
/// // Release - O(1)
/// unsafe { pool.release(chunk) };
/// ```
pub struct UnorderedPool {
    layout: ChunkLayout,
    pages: Vec<Page>,
    free: FreeList,
    used: usize,
    context: AllocatorContext,
}

// SAFETY: the pool exclusively owns its pages; chunk pointers handed out
// carry no shared state with the pool.
unsafe impl Send for UnorderedPool {}

impl UnorderedPool {
    /// Creates an empty pool over the system allocator.
    ///
    /// No memory is reserved until the first acquire.
    #[must_use]
    pub fn new(layout: ChunkLayout) -> Self {
        Self::with_context(layout, AllocatorContext::default())
    }

    /// Creates an empty pool with an explicit backing allocator and group.
    #[must_use]
    pub fn with_context(layout: ChunkLayout, context: AllocatorContext) -> Self {
        Self {
            layout,
            pages: Vec::new(),
            free: FreeList::new(),
            used: 0,
            context,
        }
    }

    /// Chunk and page shape.
    #[inline]
    #[must_use]
    pub const fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    /// Number of chunks currently acquired.
    #[inline]
    #[must_use]
    pub const fn used_count(&self) -> usize {
        self.used
    }

    /// Number of chunks on the free list.
    #[inline]
    #[must_use]
    pub const fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Number of pages owned by the pool.
    #[inline]
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// True when no chunk is acquired. O(1).
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Acquires one chunk.
    ///
    /// This is a **O(1)** operation unless a new page has to be reserved, in
    /// which case the page's chunks are threaded onto the free list first.
    ///
    /// # Errors
    ///
    /// `AllocationFailure` if a page is needed and the backing allocator
    /// fails. The pool is unchanged.
    pub fn acquire(&mut self) -> MemoryResult<NonNull<u8>> {
        if self.free.is_empty() {
            self.grow()?;
        }
        let chunk = self
            .free
            .pop_front()
            .unwrap_or_else(|| unreachable!("grow leaves free chunks"));
        self.used += 1;
        profiling::record(self.context.group(), EventKind::Allocate, self.layout.chunk_size());
        Ok(chunk)
    }

    /// Releases a chunk back to the pool. O(1).
    ///
    /// # Safety
    ///
    /// `chunk` must have been returned by [`acquire`](Self::acquire) on this
    /// pool, must not have been released since, and must not be used
    /// afterwards. Double release is not detected.
    pub unsafe fn release(&mut self, chunk: NonNull<u8>) {
        debug_assert!(self.used > 0, "release without matching acquire");
        debug_assert!(
            self.pages.iter().any(|p| p.contains(chunk.as_ptr() as usize, &self.layout)),
            "chunk does not belong to this pool"
        );
        // SAFETY: caller contract.
        unsafe { self.free.push_front(chunk) };
        self.used -= 1;
        profiling::record(self.context.group(), EventKind::Deallocate, self.layout.chunk_size());
    }

    /// Returns every page to the backing allocator.
    ///
    /// Invalidates every chunk previously acquired.
    pub fn clear(&mut self) {
        let group = self.context.group();
        profiling::record(group, EventKind::Deallocate, self.used * self.layout.chunk_size());
        profiling::record(group, EventKind::Release, self.pages.len() * self.layout.page_bytes());

        self.free.reset();
        self.used = 0;
        let backing = self.context.backing();
        for page in self.pages.drain(..) {
            // SAFETY: the page came from this backing and every chunk of it
            // is invalidated by `clear`.
            unsafe { page.release(backing.as_ref(), &self.layout) };
        }
    }

    fn grow(&mut self) -> MemoryResult<()> {
        let page = Page::allocate(self.context.backing().as_ref(), &self.layout).map_err(|e| {
            tracing::warn!(error = %e, "unordered pool could not reserve a page");
            e
        })?;
        // SAFETY: the page is fresh and owned by this pool.
        unsafe { self.free.push_page_front(&page, &self.layout) };
        self.pages.push(page);
        profiling::record(self.context.group(), EventKind::Reserve, self.layout.page_bytes());
        tracing::debug!(
            pages = self.pages.len(),
            page_bytes = self.layout.page_bytes(),
            "unordered pool grew"
        );
        Ok(())
    }
}

impl Drop for UnorderedPool {
    fn drop(&mut self) {
        self.clear();
    }
}
