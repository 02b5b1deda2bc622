//! # Chunks, Pages and the Intrusive Free List
//!
//! Shared building block of both pool allocators.
//!
//! ## Layout
//!
//! ```text
//! Page (one backing block, chunks_per_page * stride bytes)
//! ┌──────────┬──────────┬──────────┬──────────┐
//! │ chunk 0  │ chunk 1  │ chunk 2  │ chunk 3  │
//! └────┬─────┴──────────┴────┬─────┴──────────┘
//!      │  free: first word    │
//!      └── links to next ─────┘
//! ```
//!
//! A free chunk stores the address of the next free chunk in its first
//! pointer-sized bytes. A used chunk is opaque. The pool's bookkeeping (the
//! free list below) is the only thing that ever reinterprets chunk bytes, and
//! only while the chunk is on the list.

#![allow(unsafe_code)]

use std::alloc::Layout;
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};

use crate::config::PoolConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::memory::backing::BackingAllocator;

/// Shape of the chunks and pages of a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkLayout {
    chunk_size: usize,
    chunk_align: usize,
    chunks_per_page: usize,
    stride: usize,
}

impl ChunkLayout {
    /// Creates a layout for chunks of `chunk_size` bytes aligned to
    /// `chunk_align`, `chunks_per_page` chunks per page.
    ///
    /// The alignment is raised to at least pointer alignment and the stride
    /// to at least one pointer, so every chunk can hold a free-list link.
    ///
    /// # Errors
    ///
    /// `InvalidLayout` if the size or page capacity is zero, the alignment is
    /// not a power of two, or the page size overflows.
    pub fn new(chunk_size: usize, chunk_align: usize, chunks_per_page: usize) -> MemoryResult<Self> {
        let invalid = MemoryError::InvalidLayout {
            size: chunk_size,
            align: chunk_align,
        };
        if chunk_size == 0 || chunks_per_page == 0 || !chunk_align.is_power_of_two() {
            return Err(invalid);
        }

        let align = chunk_align.max(mem::align_of::<*mut u8>());
        let stride = chunk_size
            .max(mem::size_of::<*mut u8>())
            .checked_next_multiple_of(align)
            .ok_or_else(|| invalid.clone())?;
        let page_bytes = stride.checked_mul(chunks_per_page).ok_or_else(|| invalid.clone())?;
        Layout::from_size_align(page_bytes, align).map_err(|_| invalid)?;

        Ok(Self {
            chunk_size,
            chunk_align: align,
            chunks_per_page,
            stride,
        })
    }

    /// Layout sized and aligned for values of `T`.
    ///
    /// # Errors
    ///
    /// See [`ChunkLayout::new`].
    pub fn for_type<T>(chunks_per_page: usize) -> MemoryResult<Self> {
        Self::new(mem::size_of::<T>().max(1), mem::align_of::<T>(), chunks_per_page)
    }

    /// Layout whose page capacity comes from configuration.
    ///
    /// # Errors
    ///
    /// See [`ChunkLayout::new`].
    pub fn with_config(chunk_size: usize, chunk_align: usize, config: &PoolConfig) -> MemoryResult<Self> {
        Self::new(chunk_size, chunk_align, config.chunks_per_page)
    }

    /// Requested chunk size in bytes.
    #[inline]
    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Effective chunk alignment.
    #[inline]
    #[must_use]
    pub const fn chunk_align(&self) -> usize {
        self.chunk_align
    }

    /// Chunks per page.
    #[inline]
    #[must_use]
    pub const fn chunks_per_page(&self) -> usize {
        self.chunks_per_page
    }

    /// Distance between consecutive chunk addresses.
    #[inline]
    #[must_use]
    pub const fn stride(&self) -> usize {
        self.stride
    }

    /// Bytes in one page.
    #[inline]
    #[must_use]
    pub const fn page_bytes(&self) -> usize {
        self.stride * self.chunks_per_page
    }

    pub(crate) fn page_layout(&self) -> Layout {
        // Validated in `new`.
        Layout::from_size_align(self.page_bytes(), self.chunk_align)
            .unwrap_or_else(|_| unreachable!("page layout validated at construction"))
    }
}

/// One contiguous block of chunks, owned by exactly one pool.
///
/// Pages are not released on drop; the owning pool hands them back to its
/// backing allocator explicitly.
#[derive(Debug)]
pub(crate) struct Page {
    base: NonNull<u8>,
}

impl Page {
    /// Reserves a fresh page from `backing`.
    pub(crate) fn allocate(backing: &dyn BackingAllocator, layout: &ChunkLayout) -> MemoryResult<Self> {
        let page_layout = layout.page_layout();
        let base = backing.reserve(page_layout).ok_or(MemoryError::AllocationFailure {
            size: page_layout.size(),
            align: page_layout.align(),
        })?;
        Ok(Self { base })
    }

    #[inline]
    pub(crate) fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn end_addr(&self, layout: &ChunkLayout) -> usize {
        self.base_addr() + layout.page_bytes()
    }

    #[inline]
    pub(crate) fn contains(&self, addr: usize, layout: &ChunkLayout) -> bool {
        addr >= self.base_addr() && addr < self.end_addr(layout)
    }

    /// Address of chunk `index` (must be `< chunks_per_page`).
    #[inline]
    pub(crate) fn chunk(&self, index: usize, layout: &ChunkLayout) -> NonNull<u8> {
        debug_assert!(index < layout.chunks_per_page());
        // SAFETY: index < chunks_per_page, so the offset stays inside the page.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(index * layout.stride())) }
    }

    /// Returns the page to `backing`.
    ///
    /// # Safety
    ///
    /// The page must have come from `backing` with `layout`, and no chunk of
    /// it may be used afterwards.
    pub(crate) unsafe fn release(self, backing: &dyn BackingAllocator, layout: &ChunkLayout) {
        // SAFETY: forwarded caller contract.
        unsafe { backing.release(self.base, layout.page_layout()) }
    }
}

/// Reads the link stored in a free chunk.
///
/// # Safety
///
/// `chunk` must be a free chunk on some free list.
#[inline]
unsafe fn read_link(chunk: NonNull<u8>) -> Option<NonNull<u8>> {
    // SAFETY: free chunks are pointer-aligned and at least pointer-sized, and
    // hold a link written by `write_link`.
    NonNull::new(unsafe { chunk.as_ptr().cast::<*mut u8>().read() })
}

/// Writes the link of a free chunk.
///
/// # Safety
///
/// `chunk` must be a chunk owned by the pool that is (or is becoming) free.
#[inline]
unsafe fn write_link(chunk: NonNull<u8>, next: Option<NonNull<u8>>) {
    let raw = next.map_or(ptr::null_mut(), NonNull::as_ptr);
    // SAFETY: see `read_link`.
    unsafe { chunk.as_ptr().cast::<*mut u8>().write(raw) }
}

#[inline]
fn addr(chunk: NonNull<u8>) -> usize {
    chunk.as_ptr() as usize
}

/// Intrusive singly-linked list of free chunks.
///
/// Safe methods rely on the invariant that every node on the list is a free
/// chunk of a live page; the unsafe insertion methods are where callers
/// vouch for that.
#[derive(Debug)]
pub(crate) struct FreeList {
    head: Option<NonNull<u8>>,
    tail: Option<NonNull<u8>>,
    len: usize,
}

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) const fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Forgets every node. The caller releases the pages.
    pub(crate) fn reset(&mut self) {
        *self = Self::new();
    }

    /// Pops the head. O(1).
    pub(crate) fn pop_front(&mut self) -> Option<NonNull<u8>> {
        let head = self.head?;
        // SAFETY: head is on the list.
        self.head = unsafe { read_link(head) };
        if self.head.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        Some(head)
    }

    /// Pushes onto the head. O(1).
    ///
    /// # Safety
    ///
    /// `chunk` must be a chunk of a live page of the owning pool and must not
    /// already be on the list.
    pub(crate) unsafe fn push_front(&mut self, chunk: NonNull<u8>) {
        // SAFETY: caller contract.
        unsafe { write_link(chunk, self.head) };
        if self.head.is_none() {
            self.tail = Some(chunk);
        }
        self.head = Some(chunk);
        self.len += 1;
    }

    /// Inserts keeping ascending address order. O(len).
    ///
    /// # Safety
    ///
    /// As [`push_front`](Self::push_front); the list must already be sorted.
    pub(crate) unsafe fn insert_sorted(&mut self, chunk: NonNull<u8>) {
        let target = addr(chunk);
        match (self.head, self.tail) {
            (Some(head), _) if target < addr(head) => {
                // SAFETY: caller contract.
                unsafe { self.push_front(chunk) };
                return;
            }
            (None, _) => {
                // SAFETY: caller contract.
                unsafe { self.push_front(chunk) };
                return;
            }
            (_, Some(tail)) if target > addr(tail) => {
                // SAFETY: caller contract; tail is on the list.
                unsafe {
                    write_link(chunk, None);
                    write_link(tail, Some(chunk));
                }
                self.tail = Some(chunk);
                self.len += 1;
                return;
            }
            _ => {}
        }

        let mut prev = self.head.unwrap_or_else(|| unreachable!("empty list handled above"));
        loop {
            // SAFETY: prev is on the list.
            let next = unsafe { read_link(prev) };
            match next {
                Some(node) if addr(node) < target => prev = node,
                _ => {
                    debug_assert!(next.map_or(true, |node| addr(node) != target), "double release");
                    // SAFETY: caller contract; prev is on the list.
                    unsafe {
                        write_link(chunk, next);
                        write_link(prev, Some(chunk));
                    }
                    if next.is_none() {
                        self.tail = Some(chunk);
                    }
                    self.len += 1;
                    return;
                }
            }
        }
    }

    /// Threads every chunk of a fresh page onto the head, chunk 0 first.
    ///
    /// # Safety
    ///
    /// `page` must be a live page of the owning pool with no chunk in use or
    /// on the list.
    pub(crate) unsafe fn push_page_front(&mut self, page: &Page, layout: &ChunkLayout) {
        for index in (0..layout.chunks_per_page()).rev() {
            // SAFETY: caller contract.
            unsafe { self.push_front(page.chunk(index, layout)) };
        }
    }

    /// Splices every chunk of a fresh page into a sorted list.
    ///
    /// A page above everything already listed is appended at the tail in
    /// O(chunks_per_page). A lower page is spliced after the last node below
    /// it, which costs one scan of the list.
    ///
    /// # Safety
    ///
    /// As [`push_page_front`](Self::push_page_front); the list must be sorted
    /// and no listed node may lie inside `page`.
    pub(crate) unsafe fn splice_page_sorted(&mut self, page: &Page, layout: &ChunkLayout) {
        let count = layout.chunks_per_page();
        let first = page.chunk(0, layout);
        let last = page.chunk(count - 1, layout);
        for index in 0..count - 1 {
            // SAFETY: caller contract.
            unsafe { write_link(page.chunk(index, layout), Some(page.chunk(index + 1, layout))) };
        }

        let base = page.base_addr();
        let mut prev = None;
        if self.tail.is_some_and(|tail| addr(tail) < base) {
            prev = self.tail;
        } else {
            let mut cursor = self.head;
            while let Some(node) = cursor.filter(|node| addr(*node) < base) {
                prev = Some(node);
                // SAFETY: node is on the list.
                cursor = unsafe { read_link(node) };
            }
        }

        match prev {
            None => {
                // SAFETY: caller contract.
                unsafe { write_link(last, self.head) };
                self.head = Some(first);
            }
            Some(prev) => {
                // SAFETY: prev is on the list; last is a chunk of the page.
                unsafe {
                    write_link(last, read_link(prev));
                    write_link(prev, Some(first));
                }
            }
        }
        if self.tail.map_or(true, |tail| addr(tail) < base) {
            self.tail = Some(last);
        }
        self.len += count;
    }

    /// Removes every page whose chunks are all on the list, unlinking those
    /// chunks in the same walk. Returns the removed pages.
    ///
    /// Both `pages` and the list must be sorted ascending. O(pages + len).
    pub(crate) fn take_empty_pages(&mut self, pages: &mut Vec<Page>, layout: &ChunkLayout) -> Vec<Page> {
        let mut kept = Vec::with_capacity(pages.len());
        let mut empty = Vec::new();
        let mut prev: Option<NonNull<u8>> = None;
        let mut cursor = self.head;

        for page in pages.drain(..) {
            let end = page.end_addr(layout);
            let mut last_in_page = None;
            let mut count = 0;
            while let Some(node) = cursor.filter(|node| addr(*node) < end) {
                debug_assert!(page.contains(addr(node), layout));
                count += 1;
                last_in_page = Some(node);
                // SAFETY: node is on the list.
                cursor = unsafe { read_link(node) };
            }

            if count == layout.chunks_per_page() {
                match prev {
                    None => self.head = cursor,
                    // SAFETY: prev is on the list and stays on it.
                    Some(prev) => unsafe { write_link(prev, cursor) },
                }
                if cursor.is_none() {
                    self.tail = prev;
                }
                self.len -= count;
                empty.push(page);
            } else {
                if last_in_page.is_some() {
                    prev = last_in_page;
                }
                kept.push(page);
            }
        }

        *pages = kept;
        empty
    }

    /// Iterates the list from head to tail.
    pub(crate) fn iter(&self) -> FreeIter<'_> {
        FreeIter {
            next: self.head,
            _list: PhantomData,
        }
    }

    /// True when every node is strictly above its predecessor.
    pub(crate) fn is_sorted(&self) -> bool {
        let mut previous = None;
        self.iter().all(|node| {
            let ordered = previous.map_or(true, |p| p < addr(node));
            previous = Some(addr(node));
            ordered
        })
    }
}

/// Borrowing iterator over a [`FreeList`].
pub(crate) struct FreeIter<'a> {
    next: Option<NonNull<u8>>,
    _list: PhantomData<&'a FreeList>,
}

impl Iterator for FreeIter<'_> {
    type Item = NonNull<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;
        // SAFETY: node is on the borrowed list, which cannot change meanwhile.
        self.next = unsafe { read_link(node) };
        Some(node)
    }
}
