//! Buffer ownership across allocator domains.
//!
//! Every heap buffer that crosses the bridge belongs to exactly one allocator
//! domain:
//!
//! - **Local**: ordinary process heap values (`Vec<u8>`, `String`).
//! - **Transport**: the allocate/free pair the call transport uses for any
//!   buffer that crosses the call boundary.
//! - **Foreign**: an allocator owned by a second runtime hosted in the process
//!   (for example a managed string allocator).
//!
//! [`OwnedBuffer`] carries the allocator that produced it and frees itself
//! through that allocator on drop, so a buffer can never be released by the
//! wrong domain. Moving content between domains is always copy-then-free via
//! [`OwnedBuffer::rehome`].

#![allow(unsafe_code)]

use crate::error::{BridgeError, Result};
use std::alloc::Layout;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Allocator domain a buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocDomain {
    Local,
    Transport,
    Foreign,
}

impl AllocDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocDomain::Local => "local",
            AllocDomain::Transport => "transport",
            AllocDomain::Foreign => "foreign",
        }
    }
}

impl fmt::Display for AllocDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An allocate/free pair belonging to one domain.
pub trait Allocator: Send + Sync {
    /// The domain this allocator serves.
    fn domain(&self) -> AllocDomain;

    /// Allocate `len` bytes. Returns `None` when the allocator is exhausted.
    ///
    /// The returned memory is uninitialized.
    fn allocate(&self, len: usize) -> Option<NonNull<u8>>;

    /// Release memory previously produced by this allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this allocator (or be
    /// memory this allocator's domain is contractually able to release), `len`
    /// must be the length it was allocated or adopted with, and it must not
    /// have been freed already.
    unsafe fn free(&self, ptr: NonNull<u8>, len: usize);
}

impl<A: Allocator + ?Sized> Allocator for Arc<A> {
    fn domain(&self) -> AllocDomain {
        (**self).domain()
    }

    fn allocate(&self, len: usize) -> Option<NonNull<u8>> {
        (**self).allocate(len)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, len: usize) {
        // SAFETY: forwarded unchanged; the caller upholds the contract.
        unsafe { (**self).free(ptr, len) }
    }
}

/// Shared, type-erased allocator handle.
pub type SharedAllocator = Arc<dyn Allocator>;

/// A buffer owned by the transport allocator.
pub type TransportBuffer = OwnedBuffer<SharedAllocator>;

/// Allocator backed by the process heap through `std::alloc`.
///
/// This is the default transport allocator. Zero-length requests are served
/// as one-byte allocations so the pointer is always real.
#[derive(Debug, Clone, Copy)]
pub struct HeapAllocator {
    domain: AllocDomain,
}

impl HeapAllocator {
    pub const fn new(domain: AllocDomain) -> Self {
        Self { domain }
    }

    /// The heap allocator acting as the transport's allocate/free pair.
    pub const fn transport() -> Self {
        Self::new(AllocDomain::Transport)
    }

    /// Shared handle to a transport heap allocator.
    pub fn shared_transport() -> SharedAllocator {
        Arc::new(Self::transport())
    }

    fn layout(len: usize) -> Option<Layout> {
        Layout::from_size_align(len.max(1), 1).ok()
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::transport()
    }
}

impl Allocator for HeapAllocator {
    fn domain(&self) -> AllocDomain {
        self.domain
    }

    fn allocate(&self, len: usize) -> Option<NonNull<u8>> {
        let layout = Self::layout(len)?;
        // SAFETY: the layout has a non-zero size.
        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, len: usize) {
        if let Some(layout) = Self::layout(len) {
            // SAFETY: the caller guarantees `ptr` came from `allocate(len)`,
            // which used this exact layout.
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) }
        }
    }
}

/// Allocator wrapper that counts every allocate and free.
///
/// Used for leak accounting: after any sequence of calls the counts must be
/// balanced. It can also be told to fail allocations, to exercise the
/// exhaustion path.
#[derive(Debug, Default)]
pub struct CountingAllocator<A: Allocator> {
    inner: A,
    allocations: AtomicUsize,
    frees: AtomicUsize,
    failing: AtomicBool,
}

impl<A: Allocator> CountingAllocator<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            allocations: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// Number of successful allocations so far.
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    /// Number of frees so far.
    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }

    /// Allocations not yet freed.
    pub fn outstanding(&self) -> usize {
        self.allocations().saturating_sub(self.frees())
    }

    pub fn is_balanced(&self) -> bool {
        self.allocations() == self.frees()
    }

    /// Make subsequent allocations fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl CountingAllocator<HeapAllocator> {
    /// Counting wrapper around the heap transport allocator.
    pub fn transport() -> Self {
        Self::new(HeapAllocator::transport())
    }
}

impl<A: Allocator> Allocator for CountingAllocator<A> {
    fn domain(&self) -> AllocDomain {
        self.inner.domain()
    }

    fn allocate(&self, len: usize) -> Option<NonNull<u8>> {
        if self.failing.load(Ordering::SeqCst) {
            return None;
        }
        let ptr = self.inner.allocate(len)?;
        self.allocations.fetch_add(1, Ordering::SeqCst);
        Some(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, len: usize) {
        self.frees.fetch_add(1, Ordering::SeqCst);
        // SAFETY: forwarded unchanged; the caller upholds the contract.
        unsafe { self.inner.free(ptr, len) }
    }
}

/// A byte buffer owned by one allocator domain.
///
/// Dropping the buffer frees it through the allocator it was created with.
pub struct OwnedBuffer<A: Allocator> {
    ptr: NonNull<u8>,
    len: usize,
    alloc: A,
}

// SAFETY: the buffer uniquely owns its memory; sending it moves that ownership
// along with an allocator that is itself Send.
unsafe impl<A: Allocator + Send> Send for OwnedBuffer<A> {}
// SAFETY: shared access only hands out `&[u8]`.
unsafe impl<A: Allocator + Sync> Sync for OwnedBuffer<A> {}

impl<A: Allocator> OwnedBuffer<A> {
    /// Allocate in `alloc`'s domain and copy `bytes` in.
    pub fn copy_from(bytes: &[u8], alloc: A) -> Result<Self> {
        let len = bytes.len();
        let ptr = alloc.allocate(len).ok_or(BridgeError::Allocation {
            domain: alloc.domain(),
            len,
        })?;
        // SAFETY: `ptr` is a fresh allocation of at least `len` bytes and
        // cannot overlap the borrowed source slice.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), len) };
        Ok(Self { ptr, len, alloc })
    }

    /// Allocate `len` zero bytes in `alloc`'s domain.
    pub fn zeroed(len: usize, alloc: A) -> Result<Self> {
        let ptr = alloc.allocate(len).ok_or(BridgeError::Allocation {
            domain: alloc.domain(),
            len,
        })?;
        // SAFETY: `ptr` is a fresh allocation of at least `len` bytes.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, len) };
        Ok(Self { ptr, len, alloc })
    }

    /// Adopt memory produced by `alloc`'s domain.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len` initialized bytes that `alloc.free(ptr, len)`
    /// is allowed to release, and nothing else may free it afterwards.
    pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize, alloc: A) -> Self {
        Self { ptr, len, alloc }
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` is valid for `len` initialized bytes for as long as
        // `self` lives.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as for `as_slice`; `&mut self` makes the access unique.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn domain(&self) -> AllocDomain {
        self.alloc.domain()
    }

    /// Copy into a local-domain value and release this buffer.
    pub fn into_vec(self) -> Vec<u8> {
        self.as_slice().to_vec()
    }

    /// Move the content into another allocator domain.
    ///
    /// Allocates in `target`, copies, then frees `self` through its own
    /// allocator. The original is released even when the target allocation
    /// fails.
    pub fn rehome<B: Allocator>(self, target: B) -> Result<OwnedBuffer<B>> {
        let moved = OwnedBuffer::copy_from(self.as_slice(), target);
        drop(self);
        moved
    }

    /// Give up ownership without freeing.
    ///
    /// Used when the memory is handed to a party that will release it through
    /// the same domain (for example a foreign caller freeing a returned
    /// string).
    pub fn into_raw(self) -> (NonNull<u8>, usize) {
        let this = std::mem::ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the allocator is read out exactly
        // once and then dropped here without touching the buffer.
        drop(unsafe { std::ptr::read(&this.alloc) });
        (this.ptr, this.len)
    }
}

impl<A: Allocator> Drop for OwnedBuffer<A> {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` were produced by or adopted into `alloc`, and
        // ownership is unique, so this is the only release.
        unsafe { self.alloc.free(self.ptr, self.len) }
    }
}

impl<A: Allocator> AsRef<[u8]> for OwnedBuffer<A> {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl<A: Allocator> fmt::Debug for OwnedBuffer<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedBuffer")
            .field("domain", &self.domain())
            .field("len", &self.len)
            .finish()
    }
}
