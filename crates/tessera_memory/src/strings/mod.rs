//! # String Interning
//!
//! Deduplicated, immutable strings with pointer identity.
//!
//! ## Layout
//!
//! ```text
//! headers: UnorderedPool ──► [StackAllocator] [StackAllocator] ...
//!                                  │                 │
//!                                  ▼                 ▼
//!                            "Hello\0World\0"  "a long string\0"
//!
//! lookup: HashSet<Entry> keyed by content, pointing into the stacks
//! ```
//!
//! Interned bytes live until the pool is dropped. Two handles are equal
//! exactly when they point at the same bytes, so comparing or hashing a
//! handle never reads the string.

#![allow(unsafe_code)]

use std::borrow::Borrow;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::{self, NonNull};

use parking_lot::Mutex;

use crate::config::StringPoolConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::memory::{AllocatorContext, ChunkLayout, StackAllocator, UnorderedPool};

/// Stack headers per page of the header pool.
const HEADERS_PER_PAGE: usize = 16;

/// A location inside one of the string stacks, hashed by content.
struct Entry {
    ptr: NonNull<u8>,
    len: usize,
}

impl Entry {
    fn bytes(&self) -> &[u8] {
        // SAFETY: entries point at interned bytes, which live as long as the
        // pool that owns the entry.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Borrow<[u8]> for Entry {
    fn borrow(&self) -> &[u8] {
        self.bytes()
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.bytes() == other.bytes()
    }
}

impl Eq for Entry {}

impl Hash for Entry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes().hash(state);
    }
}

struct InternState {
    entries: HashSet<Entry>,
    /// Chunks holding the `StackAllocator` values themselves.
    headers: UnorderedPool,
    /// Every string stack; the last one takes new strings.
    stacks: Vec<NonNull<StackAllocator>>,
    stack_capacity: usize,
    interned_bytes: usize,
    context: AllocatorContext,
}

// SAFETY: the raw pointers all point into memory owned by this state.
unsafe impl Send for InternState {}

impl InternState {
    fn lookup(&self, bytes: &[u8]) -> Option<(NonNull<u8>, usize)> {
        self.entries.get(bytes).map(|entry| (entry.ptr, entry.len))
    }

    fn insert(&mut self, text: &str) -> MemoryResult<(NonNull<u8>, usize)> {
        let needed = text.len() + 1;
        let stack = self.stack_for(needed)?;

        // SAFETY: stack headers stay valid until the pool is dropped, and the
        // state lock gives exclusive access.
        let stack = unsafe { &mut *stack.as_ptr() };
        let dst = stack.acquire(needed, 1)?;
        // SAFETY: `dst` has room for `needed` bytes and cannot overlap `text`.
        unsafe {
            ptr::copy_nonoverlapping(text.as_ptr(), dst.as_ptr(), text.len());
            dst.as_ptr().add(text.len()).write(0);
        }

        self.entries.insert(Entry { ptr: dst, len: text.len() });
        self.interned_bytes += text.len();
        Ok((dst, text.len()))
    }

    /// Stack with room for `needed` bytes, creating one when necessary.
    fn stack_for(&mut self, needed: usize) -> MemoryResult<NonNull<StackAllocator>> {
        if needed > self.stack_capacity {
            // Dedicated stack, kept out of the way of the current one.
            let stack = self.new_stack(needed)?;
            let at = self.stacks.len().saturating_sub(1);
            self.stacks.insert(at, stack);
            tracing::debug!(bytes = needed, "dedicated string stack");
            return Ok(stack);
        }

        if let Some(&current) = self.stacks.last() {
            // SAFETY: see `insert`.
            if unsafe { current.as_ref() }.free_space() >= needed {
                return Ok(current);
            }
        }

        let stack = self.new_stack(self.stack_capacity)?;
        self.stacks.push(stack);
        tracing::debug!(stacks = self.stacks.len(), capacity = self.stack_capacity, "new string stack");
        Ok(stack)
    }

    fn new_stack(&mut self, capacity: usize) -> MemoryResult<NonNull<StackAllocator>> {
        let header = self.headers.acquire()?.cast::<StackAllocator>();
        match StackAllocator::with_context(capacity, self.context.clone()) {
            Ok(stack) => {
                // SAFETY: the chunk is sized and aligned for a StackAllocator.
                unsafe { header.as_ptr().write(stack) };
                Ok(header)
            }
            Err(e) => {
                // SAFETY: acquired just above and never handed out.
                unsafe { self.headers.release(header.cast()) };
                if self.headers.is_empty() {
                    self.headers.clear();
                }
                Err(e)
            }
        }
    }
}

impl Drop for InternState {
    fn drop(&mut self) {
        self.entries.clear();
        for stack in self.stacks.drain(..) {
            // SAFETY: every header holds a live StackAllocator written by
            // `new_stack`, dropped exactly once here.
            unsafe {
                ptr::drop_in_place(stack.as_ptr());
                self.headers.release(stack.cast());
            }
        }
    }
}

/// Thread-safe pool of interned strings.
///
/// Interning the same content always yields the same [`InternedStr`]. Strings
/// are never released while the pool lives, and handles cannot outlive it.
///
/// # Example
///
/// ```rust,ignore
/// let pool = StringInterningPool::new();
/// let a = pool.intern("Hello")?;
/// let b = pool.intern("Hello")?;
/// assert_eq!(a, b); // pointer comparison
/// ```
pub struct StringInterningPool {
    state: Mutex<InternState>,
}

impl StringInterningPool {
    /// Creates a pool with default settings over the system allocator.
    #[must_use]
    pub fn new() -> Self {
        let config = StringPoolConfig::default();
        Self::build(&config, AllocatorContext::default())
    }

    /// Creates a pool from configuration. All string memory, headers
    /// included, is attributed to the context's group.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for a zero stack capacity.
    pub fn with_config(config: &StringPoolConfig, context: AllocatorContext) -> MemoryResult<Self> {
        if config.stack_capacity == 0 {
            return Err(MemoryError::InvalidConfig(
                "strings.stack_capacity must be non-zero".into(),
            ));
        }
        Ok(Self::build(config, context))
    }

    fn build(config: &StringPoolConfig, context: AllocatorContext) -> Self {
        let header_layout = ChunkLayout::for_type::<StackAllocator>(HEADERS_PER_PAGE)
            .unwrap_or_else(|_| unreachable!("StackAllocator has a valid layout"));
        Self {
            state: Mutex::new(InternState {
                entries: HashSet::with_capacity(config.initial_capacity),
                headers: UnorderedPool::with_context(header_layout, context.clone()),
                stacks: Vec::new(),
                stack_capacity: config.stack_capacity,
                interned_bytes: 0,
                context,
            }),
        }
    }

    /// Interns `text`, returning the canonical handle for its content.
    ///
    /// # Errors
    ///
    /// `AllocationFailure` if a new string stack cannot be reserved. The pool
    /// is unchanged then.
    pub fn intern(&self, text: &str) -> MemoryResult<InternedStr<'_>> {
        let mut state = self.state.lock();
        let found = state.lookup(text.as_bytes());
        let (ptr, len) = match found {
            Some(found) => found,
            None => state.insert(text)?,
        };
        Ok(InternedStr::new(ptr, len))
    }

    /// Handle for `text` if it was interned before. Never inserts.
    #[must_use]
    pub fn get(&self, text: &str) -> Option<InternedStr<'_>> {
        let state = self.state.lock();
        state
            .lookup(text.as_bytes())
            .map(|(ptr, len)| InternedStr::new(ptr, len))
    }

    /// Number of distinct strings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// True when nothing has been interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of string stacks allocated so far.
    #[must_use]
    pub fn stack_count(&self) -> usize {
        self.state.lock().stacks.len()
    }

    /// Total content bytes interned, terminators excluded.
    #[must_use]
    pub fn interned_bytes(&self) -> usize {
        self.state.lock().interned_bytes
    }
}

impl Default for StringInterningPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StringInterningPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StringInterningPool")
            .field("strings", &state.entries.len())
            .field("stacks", &state.stacks.len())
            .field("bytes", &state.interned_bytes)
            .finish()
    }
}

/// Handle to an interned string.
///
/// Copyable and pointer-sized in spirit: equality and hashing look only at
/// the address, never at the bytes.
#[derive(Clone, Copy)]
pub struct InternedStr<'pool> {
    ptr: NonNull<u8>,
    len: usize,
    _pool: PhantomData<&'pool StringInterningPool>,
}

// SAFETY: the bytes behind a handle are immutable for the pool's lifetime.
unsafe impl Send for InternedStr<'_> {}
// SAFETY: as above.
unsafe impl Sync for InternedStr<'_> {}

impl<'pool> InternedStr<'pool> {
    fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self {
            ptr,
            len,
            _pool: PhantomData,
        }
    }

    /// The string.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'pool str {
        // SAFETY: the bytes were copied from a `&str` and are immutable and
        // alive for 'pool.
        unsafe { std::str::from_utf8_unchecked(std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)) }
    }

    /// The string's bytes, without the terminator.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &'pool [u8] {
        self.as_str().as_bytes()
    }

    /// Address of the first byte. Identity of the handle.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Length in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True for the empty string.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl PartialEq for InternedStr<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl Eq for InternedStr<'_> {}

impl Hash for InternedStr<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ptr.hash(state);
    }
}

impl Deref for InternedStr<'_> {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl AsRef<str> for InternedStr<'_> {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for InternedStr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for InternedStr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InternedStr").field(&self.as_str()).finish()
    }
}
