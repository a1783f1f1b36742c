//! The foreign allocator domain.
//!
//! Strings exchanged with the hosting runtime are allocated with the task
//! allocator that managed string marshalling expects: `CoTaskMemAlloc` /
//! `CoTaskMemFree` on Windows, `malloc` / `free` elsewhere.

#![allow(unsafe_code)]

use callbridge_core::{AllocDomain, Allocator, OwnedBuffer, Result, SharedAllocator};
use std::ffi::{c_char, CStr};
use std::ptr::NonNull;
use std::sync::Arc;

/// Allocator of the hosting runtime's string marshaller.
///
/// `free` ignores the length, so buffers adopted from a C string may record
/// the string length rather than the allocation size.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoTaskMemAllocator;

impl CoTaskMemAllocator {
    pub fn shared() -> SharedAllocator {
        Arc::new(CoTaskMemAllocator)
    }
}

impl Allocator for CoTaskMemAllocator {
    fn domain(&self) -> AllocDomain {
        AllocDomain::Foreign
    }

    fn allocate(&self, len: usize) -> Option<NonNull<u8>> {
        // SAFETY: plain allocation call; a null return is handled by NonNull.
        NonNull::new(unsafe { raw_alloc(len.max(1)) }.cast::<u8>())
    }

    unsafe fn free(&self, ptr: NonNull<u8>, _len: usize) {
        // SAFETY: the caller guarantees `ptr` came from this domain and is
        // released only once.
        unsafe { raw_free(ptr.as_ptr().cast()) }
    }
}

#[cfg(windows)]
unsafe fn raw_alloc(len: usize) -> *mut std::ffi::c_void {
    // SAFETY: CoTaskMemAlloc accepts any size and returns null on failure.
    unsafe { windows_sys::Win32::System::Com::CoTaskMemAlloc(len) }
}

#[cfg(windows)]
unsafe fn raw_free(ptr: *mut std::ffi::c_void) {
    // SAFETY: forwarded from `Allocator::free`.
    unsafe { windows_sys::Win32::System::Com::CoTaskMemFree(ptr) }
}

#[cfg(not(windows))]
unsafe fn raw_alloc(len: usize) -> *mut std::ffi::c_void {
    // SAFETY: malloc accepts any size and returns null on failure.
    unsafe { libc::malloc(len) }
}

#[cfg(not(windows))]
unsafe fn raw_free(ptr: *mut std::ffi::c_void) {
    // SAFETY: forwarded from `Allocator::free`.
    unsafe { libc::free(ptr) }
}

/// Copy `s` into a NUL-terminated string owned by `allocator`.
///
/// The caller receives ownership and must release it through the same
/// domain (for example with `callbridge_free_string`).
pub fn alloc_string(s: &str, allocator: &SharedAllocator) -> Result<*mut c_char> {
    let bytes = s.as_bytes();
    let mut buffer = OwnedBuffer::zeroed(bytes.len() + 1, allocator.clone())?;
    buffer.as_mut_slice()[..bytes.len()].copy_from_slice(bytes);
    let (ptr, _) = buffer.into_raw();
    Ok(ptr.as_ptr().cast())
}

/// Take ownership of a NUL-terminated string produced by the foreign domain.
///
/// Returns `None` for a null pointer.
///
/// # Safety
///
/// A non-null `ptr` must be a NUL-terminated string allocated by `allocator`'s
/// domain, and the caller must not use or free it afterwards.
pub unsafe fn adopt_string(
    ptr: *mut c_char,
    allocator: SharedAllocator,
) -> Option<OwnedBuffer<SharedAllocator>> {
    let ptr = NonNull::new(ptr)?;
    // SAFETY: the caller guarantees a valid NUL-terminated string.
    let len = unsafe { CStr::from_ptr(ptr.as_ptr()) }.to_bytes().len();
    // SAFETY: ownership moves to the buffer, which frees through the same
    // domain; the recorded length is ignored by this domain's free.
    Some(unsafe { OwnedBuffer::from_raw(ptr.cast::<u8>(), len, allocator) })
}

/// Release a string produced by [`alloc_string`]. Null is ignored.
///
/// # Safety
///
/// `ptr` must be null or a string allocated in the foreign domain that has not
/// been freed yet.
pub unsafe fn free_string(ptr: *mut c_char) {
    if let Some(ptr) = NonNull::new(ptr.cast::<u8>()) {
        // SAFETY: upheld by the caller.
        unsafe { CoTaskMemAllocator.free(ptr, 0) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_adopt_string() {
        let allocator = CoTaskMemAllocator::shared();
        let ptr = alloc_string("héllo", &allocator).unwrap();

        // SAFETY: `ptr` was just produced by `alloc_string` in this domain.
        let adopted = unsafe { adopt_string(ptr, allocator) }.unwrap();
        assert_eq!(adopted.as_slice(), "héllo".as_bytes());
        assert_eq!(adopted.domain(), AllocDomain::Foreign);
    }

    #[test]
    fn test_adopt_null_is_none() {
        // SAFETY: null is always accepted.
        let adopted = unsafe { adopt_string(std::ptr::null_mut(), CoTaskMemAllocator::shared()) };
        assert!(adopted.is_none());
    }

    #[test]
    fn test_empty_string_is_terminated() {
        let allocator = CoTaskMemAllocator::shared();
        let ptr = alloc_string("", &allocator).unwrap();
        // SAFETY: `ptr` is a valid NUL-terminated string from `alloc_string`.
        unsafe {
            assert_eq!(CStr::from_ptr(ptr).to_bytes(), b"");
            free_string(ptr);
        }
    }
}
