//! # Backing Allocation
//!
//! The raw "reserve N bytes aligned to A" primitive every allocator in this
//! crate sits on, and the context object allocators are constructed with.

#![allow(unsafe_code)]

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::profiling::GroupHandle;

/// Source of raw memory for pages, stack buffers and heap blocks.
///
/// Implementations may fail; failure is reported as `None` and mapped by
/// each allocator onto its own error kind.
pub trait BackingAllocator: Send + Sync {
    /// Reserves a block of `layout.size()` bytes aligned to `layout.align()`.
    ///
    /// `layout.size()` is never zero.
    fn reserve(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Resizes a block previously returned by [`reserve`](Self::reserve).
    ///
    /// On `None` the original block is untouched and still owned by the caller.
    ///
    /// # Safety
    ///
    /// `ptr` must have been reserved from `self` with `old` and not released.
    /// `new_size` must be non-zero.
    unsafe fn resize(&self, ptr: NonNull<u8>, old: Layout, new_size: usize) -> Option<NonNull<u8>>;

    /// Returns a block to the backing store.
    ///
    /// # Safety
    ///
    /// `ptr` must have been reserved from `self` with `layout` and not released.
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Backing allocator over the Rust global allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemBacking;

impl BackingAllocator for SystemBacking {
    fn reserve(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.size() > 0);
        // SAFETY: layout has a non-zero size.
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    unsafe fn resize(&self, ptr: NonNull<u8>, old: Layout, new_size: usize) -> Option<NonNull<u8>> {
        Layout::from_size_align(new_size, old.align()).ok()?;
        // SAFETY: caller guarantees ptr/old came from `reserve`; the new
        // size rounded to `old.align()` was checked above.
        NonNull::new(unsafe { alloc::realloc(ptr.as_ptr(), old, new_size) })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: caller guarantees ptr/layout came from `reserve`.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

/// Backing allocator with a hard byte budget.
///
/// Requests that would push the outstanding total past the budget fail.
/// Useful to cap a subsystem, and to exercise out-of-memory paths.
pub struct BudgetedBacking {
    inner: Arc<dyn BackingAllocator>,
    budget: usize,
    outstanding: AtomicUsize,
}

impl BudgetedBacking {
    /// Creates a budget of `budget` bytes over the system allocator.
    #[must_use]
    pub fn new(budget: usize) -> Self {
        Self::wrap(Arc::new(SystemBacking), budget)
    }

    /// Creates a budget of `budget` bytes over `inner`.
    #[must_use]
    pub fn wrap(inner: Arc<dyn BackingAllocator>, budget: usize) -> Self {
        Self {
            inner,
            budget,
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Bytes currently reserved through this budget.
    #[inline]
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Total budget in bytes.
    #[inline]
    #[must_use]
    pub const fn budget(&self) -> usize {
        self.budget
    }

    fn charge(&self, bytes: usize) -> bool {
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(bytes).filter(|&total| total <= self.budget)
            })
            .is_ok()
    }

    fn refund(&self, bytes: usize) {
        self.outstanding.fetch_sub(bytes, Ordering::AcqRel);
    }
}

impl fmt::Debug for BudgetedBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BudgetedBacking")
            .field("budget", &self.budget)
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

impl BackingAllocator for BudgetedBacking {
    fn reserve(&self, layout: Layout) -> Option<NonNull<u8>> {
        if !self.charge(layout.size()) {
            tracing::warn!(size = layout.size(), budget = self.budget, "backing budget exhausted");
            return None;
        }
        let block = self.inner.reserve(layout);
        if block.is_none() {
            self.refund(layout.size());
        }
        block
    }

    unsafe fn resize(&self, ptr: NonNull<u8>, old: Layout, new_size: usize) -> Option<NonNull<u8>> {
        if new_size > old.size() && !self.charge(new_size - old.size()) {
            tracing::warn!(size = new_size, budget = self.budget, "backing budget exhausted");
            return None;
        }
        // SAFETY: forwarded caller contract.
        let block = unsafe { self.inner.resize(ptr, old, new_size) };
        match (block.is_some(), new_size > old.size()) {
            (true, false) => self.refund(old.size() - new_size),
            (false, true) => self.refund(new_size - old.size()),
            _ => {}
        }
        block
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.release(ptr, layout) };
        self.refund(layout.size());
    }
}

/// Everything an allocator needs from its surroundings: where raw memory
/// comes from, and which memory group (if any) its usage is attributed to.
#[derive(Clone)]
pub struct AllocatorContext {
    backing: Arc<dyn BackingAllocator>,
    group: Option<GroupHandle>,
}

impl AllocatorContext {
    /// System backing, no attribution.
    #[must_use]
    pub fn system() -> Self {
        Self {
            backing: Arc::new(SystemBacking),
            group: None,
        }
    }

    /// Replaces the backing allocator.
    #[must_use]
    pub fn with_backing(mut self, backing: Arc<dyn BackingAllocator>) -> Self {
        self.backing = backing;
        self
    }

    /// Attributes all usage to `group`.
    #[must_use]
    pub fn with_group(mut self, group: GroupHandle) -> Self {
        self.group = Some(group);
        self
    }

    /// The backing allocator.
    #[inline]
    #[must_use]
    pub fn backing(&self) -> &Arc<dyn BackingAllocator> {
        &self.backing
    }

    /// The attributed group, if any.
    #[inline]
    #[must_use]
    pub fn group(&self) -> Option<&GroupHandle> {
        self.group.as_ref()
    }
}

impl Default for AllocatorContext {
    fn default() -> Self {
        Self::system()
    }
}

impl fmt::Debug for AllocatorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatorContext")
            .field("group", &self.group.as_ref().map(GroupHandle::id))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_reserve_release() {
        let backing = SystemBacking;
        let layout = Layout::from_size_align(256, 64).unwrap();
        let block = backing.reserve(layout).unwrap();
        assert_eq!(block.as_ptr() as usize % 64, 0);
        unsafe { backing.release(block, layout) };
    }

    #[test]
    fn test_budget_refuses_over_limit() {
        let backing = BudgetedBacking::new(128);
        let layout = Layout::from_size_align(100, 8).unwrap();

        let first = backing.reserve(layout).unwrap();
        assert_eq!(backing.outstanding(), 100);
        assert!(backing.reserve(layout).is_none());
        assert_eq!(backing.outstanding(), 100);

        unsafe { backing.release(first, layout) };
        assert_eq!(backing.outstanding(), 0);
    }

    #[test]
    fn test_budget_resize_accounting() {
        let backing = BudgetedBacking::new(64);
        let layout = Layout::from_size_align(32, 8).unwrap();
        let block = backing.reserve(layout).unwrap();

        assert!(unsafe { backing.resize(block, layout, 128) }.is_none());
        assert_eq!(backing.outstanding(), 32);

        let grown = unsafe { backing.resize(block, layout, 64) }.unwrap();
        assert_eq!(backing.outstanding(), 64);

        let grown_layout = Layout::from_size_align(64, 8).unwrap();
        let shrunk = unsafe { backing.resize(grown, grown_layout, 16) }.unwrap();
        assert_eq!(backing.outstanding(), 16);

        unsafe { backing.release(shrunk, Layout::from_size_align(16, 8).unwrap()) };
        assert_eq!(backing.outstanding(), 0);
    }
}
