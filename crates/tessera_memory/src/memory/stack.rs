//! # Stack Allocator
//!
//! A bump allocator over one fixed buffer, freed in bulk by rewinding to a
//! checkpoint.

#![allow(unsafe_code)]

use std::alloc::Layout;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use super::backing::AllocatorContext;
use crate::error::{MemoryError, MemoryResult};
use crate::profiling::{self, EventKind};

/// Alignment of the backing buffer itself.
const BUFFER_ALIGN: usize = 16;

static NEXT_STACK_ID: AtomicU64 = AtomicU64::new(1);

/// Saved top of a [`StackAllocator`], usable to rewind it.
///
/// Only meaningful for the allocator that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Checkpoint {
    owner: u64,
    offset: usize,
}

impl Checkpoint {
    /// Byte offset of the top when the checkpoint was taken.
    #[inline]
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }
}

/// A bump-pointer stack allocator.
///
/// Allocations are fast (align and bump). Memory is freed in bulk by
/// rewinding to a [`Checkpoint`] or clearing; nothing is ever destroyed
/// individually, so only trivially destructible data belongs here. The typed
/// helpers enforce that with a `Copy` bound.
///
/// # Thread Safety
///
/// This allocator is NOT thread-safe. Use one per thread or wrap in a mutex.
///
/// # Example
///
/// ```rust,ignore
/// let mut stack = StackAllocator::new(1024 * 1024)?; // 1MB
///
/// let frame = stack.head();
/// let scratch = stack.push_slice(&[0.0f32; 1000])?;
///
/// // Free everything acquired since `frame`
/// stack.release(frame)?;
/// ```
pub struct StackAllocator {
    base: NonNull<u8>,
    capacity: usize,
    top: usize,
    id: u64,
    context: AllocatorContext,
}

// SAFETY: the stack exclusively owns its buffer.
unsafe impl Send for StackAllocator {}

impl StackAllocator {
    /// Creates a stack of `capacity` bytes over the system allocator.
    ///
    /// # Errors
    ///
    /// `InvalidLayout` for a zero capacity, `AllocationFailure` if the
    /// buffer cannot be reserved.
    pub fn new(capacity: usize) -> MemoryResult<Self> {
        Self::with_context(capacity, AllocatorContext::default())
    }

    /// Creates a stack with an explicit backing allocator and group.
    ///
    /// # Errors
    ///
    /// See [`StackAllocator::new`].
    pub fn with_context(capacity: usize, context: AllocatorContext) -> MemoryResult<Self> {
        let layout = Layout::from_size_align(capacity, BUFFER_ALIGN)
            .ok()
            .filter(|l| l.size() > 0)
            .ok_or(MemoryError::InvalidLayout {
                size: capacity,
                align: BUFFER_ALIGN,
            })?;
        let base = context.backing().reserve(layout).ok_or_else(|| {
            tracing::warn!(capacity, "stack allocator could not reserve its buffer");
            MemoryError::AllocationFailure {
                size: capacity,
                align: BUFFER_ALIGN,
            }
        })?;
        profiling::record(context.group(), EventKind::Reserve, capacity);

        Ok(Self {
            base,
            capacity,
            top: 0,
            id: NEXT_STACK_ID.fetch_add(1, Ordering::Relaxed),
            context,
        })
    }

    /// Total capacity in bytes.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes between the base and the current top.
    #[inline]
    #[must_use]
    pub const fn used(&self) -> usize {
        self.top
    }

    /// Remaining bytes. O(1).
    #[inline]
    #[must_use]
    pub const fn free_space(&self) -> usize {
        self.capacity - self.top
    }

    /// Acquires `size` bytes aligned to `align`.
    ///
    /// # Errors
    ///
    /// `InvalidLayout` if `align` is not a power of two, `CapacityExceeded`
    /// if the aligned block does not fit. The stack is unchanged on error.
    pub fn acquire(&mut self, size: usize, align: usize) -> MemoryResult<NonNull<u8>> {
        if !align.is_power_of_two() {
            return Err(MemoryError::InvalidLayout { size, align });
        }

        let base = self.base.as_ptr() as usize;
        let exceeded = || MemoryError::CapacityExceeded {
            requested: size,
            available: self.free_space(),
        };
        let start = (base + self.top)
            .checked_next_multiple_of(align)
            .map(|aligned| aligned - base)
            .ok_or_else(exceeded)?;
        let end = start.checked_add(size).filter(|&end| end <= self.capacity).ok_or_else(|| {
            MemoryError::CapacityExceeded {
                requested: size.saturating_add(start - self.top),
                available: self.free_space(),
            }
        })?;

        profiling::record(self.context.group(), EventKind::Allocate, end - self.top);
        self.top = end;
        // SAFETY: start <= capacity, so the pointer stays within the buffer
        // (or one past its end for a zero-sized request at the very top).
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(start)) })
    }

    /// Copies `value` onto the stack.
    ///
    /// # Errors
    ///
    /// `CapacityExceeded` if it does not fit.
    pub fn push<T: Copy>(&mut self, value: T) -> MemoryResult<NonNull<T>> {
        let slot = self.acquire(mem::size_of::<T>(), mem::align_of::<T>())?.cast::<T>();
        // SAFETY: slot is aligned for T and has room for one T.
        unsafe { slot.as_ptr().write(value) };
        Ok(slot)
    }

    /// Copies `values` onto the stack contiguously.
    ///
    /// # Errors
    ///
    /// `CapacityExceeded` if they do not fit.
    pub fn push_slice<T: Copy>(&mut self, values: &[T]) -> MemoryResult<NonNull<T>> {
        let bytes = mem::size_of_val(values);
        let slot = self.acquire(bytes, mem::align_of::<T>())?.cast::<T>();
        // SAFETY: slot is aligned for T with room for `values.len()` items,
        // and cannot overlap a borrowed slice.
        unsafe { ptr::copy_nonoverlapping(values.as_ptr(), slot.as_ptr(), values.len()) };
        Ok(slot)
    }

    /// Current top as a checkpoint.
    #[inline]
    #[must_use]
    pub const fn head(&self) -> Checkpoint {
        Checkpoint {
            owner: self.id,
            offset: self.top,
        }
    }

    /// Rewinds the top to `checkpoint`, freeing everything acquired since.
    ///
    /// Nothing is destroyed; the top pointer just moves.
    ///
    /// # Errors
    ///
    /// `InvalidCheckpoint` if the checkpoint belongs to another stack or lies
    /// above the current top. This is a programming error; the stack is left
    /// unchanged.
    pub fn release(&mut self, checkpoint: Checkpoint) -> MemoryResult<()> {
        if checkpoint.owner != self.id || checkpoint.offset > self.top {
            tracing::warn!(
                offset = checkpoint.offset,
                top = self.top,
                "invalid stack checkpoint"
            );
            return Err(MemoryError::InvalidCheckpoint);
        }
        profiling::record(self.context.group(), EventKind::Deallocate, self.top - checkpoint.offset);
        self.top = checkpoint.offset;
        Ok(())
    }

    /// Rewinds to the base, freeing everything.
    pub fn clear(&mut self) {
        profiling::record(self.context.group(), EventKind::Deallocate, self.top);
        self.top = 0;
    }

    /// True when `ptr` points into this stack's buffer.
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let base = self.base.as_ptr() as usize;
        (base..base + self.capacity).contains(&(ptr as usize))
    }
}

impl Drop for StackAllocator {
    fn drop(&mut self) {
        self.clear();
        profiling::record(self.context.group(), EventKind::Release, self.capacity);
        let layout = Layout::from_size_align(self.capacity, BUFFER_ALIGN)
            .unwrap_or_else(|_| unreachable!("layout validated at construction"));
        // SAFETY: the buffer came from this backing with this layout.
        unsafe { self.context.backing().release(self.base, layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_allocation() {
        let mut stack = StackAllocator::new(1024).unwrap();
        let block = stack.acquire(10, 1).unwrap();
        assert!(stack.contains(block.as_ptr()));
        assert_eq!(stack.used(), 10);
        assert_eq!(stack.free_space(), 1014);
    }

    #[test]
    fn test_stack_alignment() {
        let mut stack = StackAllocator::new(1024).unwrap();
        stack.acquire(3, 1).unwrap();
        let aligned = stack.acquire(8, 8).unwrap();
        assert_eq!(aligned.as_ptr() as usize % 8, 0);
        assert_eq!(stack.used(), 16);
    }

    #[test]
    fn test_stack_checkpoint_rewind() {
        let mut stack = StackAllocator::new(64).unwrap();
        stack.acquire(10, 1).unwrap();
        stack.acquire(10, 1).unwrap();
        let checkpoint = stack.head();
        assert_eq!(checkpoint.offset(), 20);

        stack.acquire(30, 1).unwrap();
        assert_eq!(stack.used(), 50);

        stack.release(checkpoint).unwrap();
        assert_eq!(stack.free_space(), 44);
    }

    #[test]
    fn test_stack_release_head_is_noop() {
        let mut stack = StackAllocator::new(64).unwrap();
        stack.acquire(7, 1).unwrap();
        let before = stack.free_space();
        stack.release(stack.head()).unwrap();
        assert_eq!(stack.free_space(), before);
    }

    #[test]
    fn test_stack_capacity_exceeded_leaves_state() {
        let mut stack = StackAllocator::new(32).unwrap();
        stack.acquire(30, 1).unwrap();
        let err = stack.acquire(8, 1).unwrap_err();
        assert_eq!(
            err,
            MemoryError::CapacityExceeded {
                requested: 8,
                available: 2
            }
        );
        assert_eq!(stack.used(), 30);
        assert!(stack.acquire(2, 1).is_ok());
    }

    #[test]
    fn test_stack_huge_padded_request_is_rejected() {
        let mut stack = StackAllocator::new(64).unwrap();
        stack.acquire(1, 1).unwrap();

        let err = stack.acquire(usize::MAX, 8).unwrap_err();
        assert_eq!(
            err,
            MemoryError::CapacityExceeded {
                requested: usize::MAX,
                available: 63
            }
        );
        assert_eq!(stack.used(), 1);
        assert!(stack.acquire(8, 8).is_ok());
    }

    #[test]
    fn test_stack_invalid_checkpoints() {
        let mut a = StackAllocator::new(64).unwrap();
        let mut b = StackAllocator::new(64).unwrap();

        a.acquire(16, 1).unwrap();
        let ahead = a.head();
        a.release(StackAllocator::head(&a)).unwrap();

        // From another stack.
        assert_eq!(b.release(ahead), Err(MemoryError::InvalidCheckpoint));

        // Already passed.
        a.clear();
        assert_eq!(a.release(ahead), Err(MemoryError::InvalidCheckpoint));
        assert_eq!(a.used(), 0);
    }

    #[test]
    fn test_stack_typed_push() {
        let mut stack = StackAllocator::new(256).unwrap();
        let value = stack.push(0xDEAD_BEEF_u64).unwrap();
        assert_eq!(value.as_ptr() as usize % mem::align_of::<u64>(), 0);
        assert_eq!(unsafe { *value.as_ptr() }, 0xDEAD_BEEF);

        let slice = stack.push_slice(&[1u16, 2, 3]).unwrap();
        let read = unsafe { std::slice::from_raw_parts(slice.as_ptr(), 3) };
        assert_eq!(read, &[1, 2, 3]);
    }

    #[test]
    fn test_stack_rejects_bad_input() {
        assert!(StackAllocator::new(0).is_err());
        let mut stack = StackAllocator::new(64).unwrap();
        assert!(matches!(stack.acquire(4, 3), Err(MemoryError::InvalidLayout { .. })));
    }
}
