//! # Heap Allocator
//!
//! General-purpose variable-size allocation with per-allocation group
//! attribution.

#![allow(unsafe_code)]

use std::alloc::Layout;
use std::collections::HashMap;
use std::ptr::NonNull;

use super::backing::AllocatorContext;
use crate::error::{MemoryError, MemoryResult};
use crate::profiling::{self, EventKind, GroupHandle};

/// Bookkeeping for one live heap block.
struct LiveBlock {
    layout: Layout,
    size: usize,
    group: Option<GroupHandle>,
}

/// A general-purpose allocator over the context's backing allocator.
///
/// Every live block remembers the group it was attributed to, so resizing
/// and freeing report against that same group even if the caller no longer
/// knows it. Pointers the heap did not hand out are rejected with
/// [`MemoryError::UnknownAllocation`] instead of reaching the backing store.
///
/// # Thread Safety
///
/// Not internally synchronized. Wrap in a mutex to share.
pub struct HeapAllocator {
    live: HashMap<usize, LiveBlock>,
    live_bytes: usize,
    context: AllocatorContext,
}

impl HeapAllocator {
    /// Creates a heap over the system allocator with no default group.
    #[must_use]
    pub fn new() -> Self {
        Self::with_context(AllocatorContext::default())
    }

    /// Creates a heap with an explicit backing allocator. The context's group,
    /// if any, is the default attribution for allocations made without one.
    #[must_use]
    pub fn with_context(context: AllocatorContext) -> Self {
        Self {
            live: HashMap::new(),
            live_bytes: 0,
            context,
        }
    }

    /// Number of live allocations.
    #[inline]
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Sum of the requested sizes of all live allocations.
    #[inline]
    #[must_use]
    pub const fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    /// Requested size of a live allocation.
    #[must_use]
    pub fn size_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.live.get(&(ptr.as_ptr() as usize)).map(|block| block.size)
    }

    /// Allocates `size` bytes aligned to `align`, attributed to `group` or,
    /// when `None`, to the context's group.
    ///
    /// A zero `size` still returns a unique, freeable pointer.
    ///
    /// # Errors
    ///
    /// `InvalidLayout` for a bad alignment, `OutOfMemory` if the backing
    /// allocator fails.
    pub fn allocate(
        &mut self,
        size: usize,
        align: usize,
        group: Option<&GroupHandle>,
    ) -> MemoryResult<NonNull<u8>> {
        let layout = Layout::from_size_align(size.max(1), align)
            .map_err(|_| MemoryError::InvalidLayout { size, align })?;
        let ptr = self.context.backing().reserve(layout).ok_or_else(|| {
            tracing::warn!(size, align, "heap allocation failed");
            MemoryError::OutOfMemory { size, align }
        })?;

        let group = group.or_else(|| self.context.group()).cloned();
        profiling::record(group.as_ref(), EventKind::Allocate, size);
        self.live.insert(ptr.as_ptr() as usize, LiveBlock { layout, size, group });
        self.live_bytes += size;
        Ok(ptr)
    }

    /// Resizes a live allocation, possibly moving it.
    ///
    /// The size delta is recorded against the group of the original
    /// allocation: `Allocate` when growing, `Deallocate` when shrinking.
    ///
    /// # Errors
    ///
    /// `UnknownAllocation` if `ptr` is not live, `OutOfMemory` if the backing
    /// allocator fails. On error the original allocation stays valid.
    pub fn reallocate(&mut self, ptr: NonNull<u8>, new_size: usize) -> MemoryResult<NonNull<u8>> {
        let addr = ptr.as_ptr() as usize;
        let block = self.live.get(&addr).ok_or(MemoryError::UnknownAllocation(addr))?;
        let align = block.layout.align();
        let new_layout = Layout::from_size_align(new_size.max(1), align)
            .map_err(|_| MemoryError::InvalidLayout { size: new_size, align })?;

        // SAFETY: the block is live and was reserved from this backing with
        // `block.layout`.
        let moved = unsafe { self.context.backing().resize(ptr, block.layout, new_layout.size()) }
            .ok_or_else(|| {
                tracing::warn!(size = new_size, align, "heap reallocation failed");
                MemoryError::OutOfMemory { size: new_size, align }
            })?;

        let mut block = self
            .live
            .remove(&addr)
            .unwrap_or_else(|| unreachable!("block looked up above"));
        let old_size = block.size;
        if new_size > old_size {
            profiling::record(block.group.as_ref(), EventKind::Allocate, new_size - old_size);
        } else {
            profiling::record(block.group.as_ref(), EventKind::Deallocate, old_size - new_size);
        }
        self.live_bytes = self.live_bytes - old_size + new_size;
        block.layout = new_layout;
        block.size = new_size;
        self.live.insert(moved.as_ptr() as usize, block);
        Ok(moved)
    }

    /// Frees a live allocation.
    ///
    /// # Errors
    ///
    /// `UnknownAllocation` if `ptr` is not live. Nothing is released then.
    pub fn free(&mut self, ptr: NonNull<u8>) -> MemoryResult<()> {
        let addr = ptr.as_ptr() as usize;
        let block = self.live.remove(&addr).ok_or(MemoryError::UnknownAllocation(addr))?;
        profiling::record(block.group.as_ref(), EventKind::Deallocate, block.size);
        self.live_bytes -= block.size;
        // SAFETY: the block was live and reserved from this backing with
        // `block.layout`.
        unsafe { self.context.backing().release(ptr, block.layout) };
        Ok(())
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HeapAllocator {
    fn drop(&mut self) {
        if self.live.is_empty() {
            return;
        }
        tracing::warn!(
            count = self.live.len(),
            bytes = self.live_bytes,
            "heap dropped with live allocations"
        );
        let backing = self.context.backing();
        for (addr, block) in self.live.drain() {
            profiling::record(block.group.as_ref(), EventKind::Deallocate, block.size);
            if let Some(ptr) = NonNull::new(addr as *mut u8) {
                // SAFETY: every key is a live block reserved from this backing.
                unsafe { backing.release(ptr, block.layout) };
            }
        }
        self.live_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::backing::BudgetedBacking;
    use crate::profiling::Profiler;
    use std::sync::Arc;

    #[test]
    fn test_heap_allocate_free() {
        let mut heap = HeapAllocator::new();
        let ptr = heap.allocate(100, 16, None).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 16, 0);
        assert_eq!(heap.live_count(), 1);
        assert_eq!(heap.live_bytes(), 100);
        assert_eq!(heap.size_of(ptr), Some(100));

        heap.free(ptr).unwrap();
        assert_eq!(heap.live_count(), 0);
        assert_eq!(heap.live_bytes(), 0);
    }

    #[test]
    fn test_heap_zero_size() {
        let mut heap = HeapAllocator::new();
        let a = heap.allocate(0, 1, None).unwrap();
        let b = heap.allocate(0, 1, None).unwrap();
        assert_ne!(a, b);
        heap.free(a).unwrap();
        heap.free(b).unwrap();
    }

    #[test]
    fn test_heap_reallocate_preserves_contents() {
        let mut heap = HeapAllocator::new();
        let ptr = heap.allocate(8, 8, None).unwrap();
        unsafe { ptr.as_ptr().copy_from_nonoverlapping([7u8; 8].as_ptr(), 8) };

        let grown = heap.reallocate(ptr, 4096).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(grown.as_ptr(), 8) };
        assert_eq!(bytes, &[7u8; 8]);
        assert_eq!(heap.live_bytes(), 4096);
        assert_eq!(heap.live_count(), 1);

        heap.free(grown).unwrap();
    }

    #[test]
    fn test_heap_unknown_pointer() {
        let mut heap = HeapAllocator::new();
        let mut local = 0u8;
        let stray = NonNull::from(&mut local);
        assert_eq!(
            heap.free(stray),
            Err(MemoryError::UnknownAllocation(stray.as_ptr() as usize))
        );
        assert!(matches!(heap.reallocate(stray, 4), Err(MemoryError::UnknownAllocation(_))));
    }

    #[test]
    fn test_heap_out_of_memory_keeps_block() {
        let backing = Arc::new(BudgetedBacking::new(64));
        let mut heap = HeapAllocator::with_context(AllocatorContext::default().with_backing(backing.clone()));

        let ptr = heap.allocate(32, 8, None).unwrap();
        assert!(matches!(heap.allocate(64, 8, None), Err(MemoryError::OutOfMemory { .. })));
        assert!(matches!(heap.reallocate(ptr, 128), Err(MemoryError::OutOfMemory { .. })));
        assert_eq!(heap.size_of(ptr), Some(32));

        heap.free(ptr).unwrap();
        assert_eq!(backing.outstanding(), 0);
    }

    #[test]
    fn test_heap_attribution() {
        let profiler = Arc::new(Profiler::new());
        let id = profiler.create_group(None, "scripts").unwrap();
        let group = profiler.handle(id).unwrap();
        let mut heap = HeapAllocator::new();

        let a = heap.allocate(100, 8, Some(&group)).unwrap();
        let b = heap.allocate(50, 8, Some(&group)).unwrap();
        assert_eq!(group.counters().used, 150);

        let a = heap.reallocate(a, 40).unwrap();
        assert_eq!(group.counters().used, 90);

        heap.free(b).unwrap();
        assert_eq!(group.counters().used, 40);

        drop(heap);
        assert_eq!(group.counters().used, 0);
        let _ = a;
    }

    #[test]
    fn test_heap_default_group_from_context() {
        let profiler = Arc::new(Profiler::new());
        let id = profiler.create_group(None, "default").unwrap();
        let group = profiler.handle(id).unwrap();
        let mut heap = HeapAllocator::with_context(AllocatorContext::default().with_group(group.clone()));

        let ptr = heap.allocate(24, 8, None).unwrap();
        assert_eq!(group.counters().used, 24);
        heap.free(ptr).unwrap();
        assert_eq!(group.counters().used, 0);
    }
}
