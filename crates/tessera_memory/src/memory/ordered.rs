//! # Ordered Pool
//!
//! Fixed-size chunk allocator that keeps both its page list and its free list
//! sorted by address.
//!
//! ## Cost Model
//!
//! | Operation        | Cost                          |
//! |------------------|-------------------------------|
//! | `acquire`        | O(1) (new page: O(chunks))    |
//! | `release`        | O(free chunks)                |
//! | `iter_acquired`  | O(total chunks), lazy         |
//! | `shrink`         | O(pages + free chunks)        |
//!
//! Sorted order is what lets iteration and shrink be a single merge-walk of
//! two ascending sequences instead of a set lookup per chunk.

#![allow(unsafe_code)]

use std::iter::Peekable;
use std::ptr::NonNull;

use super::backing::AllocatorContext;
use super::chunk::{ChunkLayout, FreeIter, FreeList, Page};
use crate::error::MemoryResult;
use crate::profiling::{self, EventKind};

/// A pool allocator for fixed-size chunks with an address-ordered free list.
///
/// Always hands out the lowest free address, can enumerate the chunks in use
/// in ascending order, and can give fully free pages back with
/// [`shrink`](Self::shrink).
///
/// Pages are expected to come from the backing allocator at ascending
/// addresses; when one does not, it is inserted at its sorted position
/// instead of appended.
///
/// # Thread Safety
///
/// This pool is NOT thread-safe. Use one pool per thread or wrap in a mutex.
pub struct OrderedPool {
    layout: ChunkLayout,
    /// Ascending by base address.
    pages: Vec<Page>,
    /// Ascending by address.
    free: FreeList,
    used: usize,
    context: AllocatorContext,
}

// SAFETY: the pool exclusively owns its pages; see `UnorderedPool`.
unsafe impl Send for OrderedPool {}

impl OrderedPool {
    /// Creates an empty pool over the system allocator.
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

    /// Acquires the lowest free chunk. O(1).
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

    /// Releases a chunk, inserting it at its sorted position. O(free chunks).
    ///
    /// # Safety
    ///
    /// `chunk` must have been returned by [`acquire`](Self::acquire) on this
    /// pool, must not have been released since, and must not be used
    /// afterwards.
    pub unsafe fn release(&mut self, chunk: NonNull<u8>) {
        debug_assert!(self.used > 0, "release without matching acquire");
        debug_assert!(self.owns(chunk), "chunk does not belong to this pool");
        // SAFETY: caller contract; the list is sorted by invariant.
        unsafe { self.free.insert_sorted(chunk) };
        self.used -= 1;
        profiling::record(self.context.group(), EventKind::Deallocate, self.layout.chunk_size());
    }

    /// Iterates the acquired chunks in ascending address order.
    ///
    /// Lazy and finite; call again to restart. The walk merges the sorted
    /// page list with the sorted free list, so the whole iteration costs
    /// O(total chunks).
    #[must_use]
    pub fn iter_acquired(&self) -> AcquiredChunks<'_> {
        AcquiredChunks {
            pages: &self.pages,
            layout: &self.layout,
            page: 0,
            chunk: 0,
            remaining: self.used,
            free: self.free.iter().peekable(),
        }
    }

    /// Returns every page without a used chunk to the backing allocator.
    ///
    /// The page's chunks leave the free list in the same merge-walk.
    /// O(pages + free chunks). Returns the number of pages released.
    pub fn shrink(&mut self) -> usize {
        let empty = self.free.take_empty_pages(&mut self.pages, &self.layout);
        let released = empty.len();
        let backing = self.context.backing();
        for page in empty {
            // SAFETY: the page came from this backing and none of its chunks
            // is in use or listed any more.
            unsafe { page.release(backing.as_ref(), &self.layout) };
        }
        if released > 0 {
            profiling::record(self.context.group(), EventKind::Release, released * self.layout.page_bytes());
            tracing::debug!(released, pages = self.pages.len(), "ordered pool shrunk");
        }
        released
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
            // SAFETY: see `UnorderedPool::clear`.
            unsafe { page.release(backing.as_ref(), &self.layout) };
        }
    }

    /// True when the free list is strictly ascending.
    #[must_use]
    pub fn is_free_list_sorted(&self) -> bool {
        self.free.is_sorted()
    }

    fn owns(&self, chunk: NonNull<u8>) -> bool {
        let addr = chunk.as_ptr() as usize;
        let index = self.pages.partition_point(|p| p.base_addr() <= addr);
        index > 0 && self.pages[index - 1].contains(addr, &self.layout)
    }

    fn grow(&mut self) -> MemoryResult<()> {
        let page = Page::allocate(self.context.backing().as_ref(), &self.layout).map_err(|e| {
            tracing::warn!(error = %e, "ordered pool could not reserve a page");
            e
        })?;

        // SAFETY: the page is fresh, owned by this pool, and no listed chunk
        // lies inside it.
        unsafe { self.free.splice_page_sorted(&page, &self.layout) };
        let base = page.base_addr();
        if self.pages.last().map_or(true, |last| last.base_addr() < base) {
            self.pages.push(page);
        } else {
            let index = self.pages.partition_point(|p| p.base_addr() < base);
            tracing::debug!(index, "ordered pool page below existing pages");
            self.pages.insert(index, page);
        }

        profiling::record(self.context.group(), EventKind::Reserve, self.layout.page_bytes());
        tracing::debug!(
            pages = self.pages.len(),
            page_bytes = self.layout.page_bytes(),
            "ordered pool grew"
        );
        Ok(())
    }
}

impl Drop for OrderedPool {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Ascending iterator over the acquired chunks of an [`OrderedPool`].
pub struct AcquiredChunks<'a> {
    pages: &'a [Page],
    layout: &'a ChunkLayout,
    page: usize,
    chunk: usize,
    remaining: usize,
    free: Peekable<FreeIter<'a>>,
}

impl Iterator for AcquiredChunks<'_> {
    type Item = NonNull<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.remaining > 0 {
            let page = self.pages.get(self.page)?;
            let candidate = page.chunk(self.chunk, self.layout);
            self.chunk += 1;
            if self.chunk == self.layout.chunks_per_page() {
                self.chunk = 0;
                self.page += 1;
            }

            if self.free.peek() == Some(&candidate) {
                self.free.next();
            } else {
                self.remaining -= 1;
                return Some(candidate);
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for AcquiredChunks<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::backing::{BackingAllocator, BudgetedBacking};
    use std::sync::Arc;

    fn pool() -> OrderedPool {
        OrderedPool::new(ChunkLayout::new(16, 8, 4).unwrap())
    }

    fn addr(chunk: NonNull<u8>) -> usize {
        chunk.as_ptr() as usize
    }

    #[test]
    fn test_acquire_lowest_first() {
        let mut pool = pool();
        let chunks: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();
        assert!(chunks.windows(2).all(|w| addr(w[0]) < addr(w[1])));

        unsafe {
            pool.release(chunks[2]);
            pool.release(chunks[0]);
        }
        assert!(pool.is_free_list_sorted());
        assert_eq!(pool.acquire().unwrap(), chunks[0]);
        assert_eq!(pool.acquire().unwrap(), chunks[2]);
    }

    #[test]
    fn test_iter_acquired_ascending() {
        let mut pool = pool();
        let chunks: Vec<_> = (0..10).map(|_| pool.acquire().unwrap()).collect();
        for &index in &[1, 4, 5, 9] {
            unsafe { pool.release(chunks[index]) };
        }

        let mut expected: Vec<_> = chunks
            .iter()
            .enumerate()
            .filter(|(i, _)| ![1, 4, 5, 9].contains(i))
            .map(|(_, c)| *c)
            .collect();
        expected.sort_by_key(|c| addr(*c));

        let walked: Vec<_> = pool.iter_acquired().collect();
        assert_eq!(walked, expected);
        assert_eq!(pool.iter_acquired().len(), 6);
        // Restartable.
        assert_eq!(pool.iter_acquired().collect::<Vec<_>>(), walked);
    }

    #[test]
    fn test_iter_empty_pool() {
        let mut pool = pool();
        assert_eq!(pool.iter_acquired().count(), 0);
        let chunk = pool.acquire().unwrap();
        unsafe { pool.release(chunk) };
        assert_eq!(pool.iter_acquired().count(), 0);
    }

    #[test]
    fn test_shrink_keeps_used_pages() {
        let mut pool = pool();
        let chunks: Vec<_> = (0..12).map(|_| pool.acquire().unwrap()).collect();
        let mut sorted = chunks.clone();
        sorted.sort_by_key(|c| addr(*c));
        assert_eq!(pool.page_count(), 3);

        // Free everything except one chunk on the middle page.
        let keep = sorted[6];
        for &chunk in sorted.iter().filter(|c| **c != keep) {
            unsafe { pool.release(chunk) };
        }

        assert_eq!(pool.shrink(), 2);
        assert_eq!(pool.page_count(), 1);
        assert_eq!(pool.free_count(), 3);
        assert_eq!(pool.iter_acquired().collect::<Vec<_>>(), vec![keep]);
        assert!(pool.is_free_list_sorted());

        // Still usable after shrinking.
        let again = pool.acquire().unwrap();
        assert_ne!(again, keep);
        assert_eq!(pool.shrink(), 0);
    }

    #[test]
    fn test_shrink_returns_memory() {
        let layout = ChunkLayout::new(32, 16, 8).unwrap();
        let backing = Arc::new(BudgetedBacking::new(1 << 20));
        let mut pool = OrderedPool::with_context(layout, AllocatorContext::default().with_backing(backing.clone()));

        let chunks: Vec<_> = (0..24).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(backing.outstanding(), 3 * layout.page_bytes());
        for chunk in chunks {
            unsafe { pool.release(chunk) };
        }
        assert_eq!(pool.shrink(), 3);
        assert_eq!(backing.outstanding(), 0);
        assert!(pool.is_empty());
        assert_eq!(pool.free_count(), 0);
    }

    /// Hands out pages top-down from one buffer, so every new page lies
    /// below the previous one.
    struct DescendingBacking {
        buffer: NonNull<u8>,
        layout: std::alloc::Layout,
        next: parking_lot::Mutex<usize>,
        released: std::sync::atomic::AtomicUsize,
    }

    unsafe impl Send for DescendingBacking {}
    unsafe impl Sync for DescendingBacking {}

    impl DescendingBacking {
        fn new(bytes: usize) -> Self {
            let layout = std::alloc::Layout::from_size_align(bytes, 64).unwrap();
            let buffer = NonNull::new(unsafe { std::alloc::alloc(layout) }).unwrap();
            Self {
                buffer,
                layout,
                next: parking_lot::Mutex::new(bytes),
                released: std::sync::atomic::AtomicUsize::new(0),
            }
        }
    }

    impl Drop for DescendingBacking {
        fn drop(&mut self) {
            unsafe { std::alloc::dealloc(self.buffer.as_ptr(), self.layout) };
        }
    }

    impl BackingAllocator for DescendingBacking {
        fn reserve(&self, layout: std::alloc::Layout) -> Option<NonNull<u8>> {
            let mut next = self.next.lock();
            let offset = next.checked_sub(layout.size())? & !(layout.align() - 1);
            *next = offset;
            NonNull::new(unsafe { self.buffer.as_ptr().add(offset) })
        }

        unsafe fn resize(&self, _: NonNull<u8>, _: std::alloc::Layout, _: usize) -> Option<NonNull<u8>> {
            None
        }

        unsafe fn release(&self, _: NonNull<u8>, _: std::alloc::Layout) {
            self.released.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    #[test]
    fn test_pages_below_existing_pages_stay_sorted() {
        let layout = ChunkLayout::new(16, 8, 4).unwrap();
        let backing = Arc::new(DescendingBacking::new(4 * layout.page_bytes() + 64));
        let mut pool =
            OrderedPool::with_context(layout, AllocatorContext::default().with_backing(backing.clone()));

        let chunks: Vec<_> = (0..12).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(pool.page_count(), 3);
        assert!(pool.pages.windows(2).all(|w| w[0].base_addr() < w[1].base_addr()));
        // The newest page is the lowest one.
        assert!(addr(chunks[8]) < addr(chunks[4]));
        assert!(addr(chunks[4]) < addr(chunks[0]));

        let mut live: Vec<_> = chunks.clone();
        for &index in &[11, 0, 5, 6, 2] {
            unsafe { pool.release(chunks[index]) };
            live.retain(|c| *c != chunks[index]);
            assert!(pool.is_free_list_sorted());
        }
        live.sort_by_key(|c| addr(*c));
        assert_eq!(pool.iter_acquired().collect::<Vec<_>>(), live);

        // Lowest free address comes back first.
        let lowest = [11, 0, 5, 6, 2].iter().map(|&i| chunks[i]).min_by_key(|c| addr(*c)).unwrap();
        assert_eq!(pool.acquire().unwrap(), lowest);
        unsafe { pool.release(lowest) };

        for chunk in live {
            unsafe { pool.release(chunk) };
        }
        assert_eq!(pool.shrink(), 3);
        assert_eq!(pool.page_count(), 0);
        assert_eq!(backing.released.load(std::sync::atomic::Ordering::Relaxed), 3);
    }

    #[test]
    fn test_clear() {
        let mut pool = pool();
        for _ in 0..7 {
            pool.acquire().unwrap();
        }
        pool.clear();
        assert!(pool.is_empty());
        assert_eq!(pool.page_count(), 0);
        assert_eq!(pool.iter_acquired().count(), 0);
    }
}
