//! Page-aligned frame memory handed to the driver as a user pointer.
#![allow(unsafe_code)]

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use crate::traits::{CameraError, Result};

const FALLBACK_PAGE_SIZE: usize = 4096;

/// System page size.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions; a negative return means "unknown".
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size)
        .ok()
        .filter(|size| size.is_power_of_two())
        .unwrap_or(FALLBACK_PAGE_SIZE)
}

/// Owned, zero-initialised, page-aligned byte region of fixed length.
pub struct PageAlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl PageAlignedBuffer {
    /// Allocate `len` bytes aligned to the system page size.
    pub fn new(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(CameraError::Alloc { len });
        }
        let layout =
            Layout::from_size_align(len, page_size()).map_err(|_| CameraError::Alloc { len })?;
        // SAFETY: layout has non-zero size and a power-of-two alignment.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(CameraError::Alloc { len })?;
        Ok(Self { ptr, layout })
    }

    /// Buffer length in bytes.
    pub const fn len(&self) -> usize {
        self.layout.size()
    }

    /// Start address, for handing to the driver.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// The whole region.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialised bytes for the
        // lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for PageAlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this exact layout and
        // is freed only here.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for PageAlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageAlignedBuffer")
            .field("len", &self.len())
            .field("align", &self.layout.align())
            .finish()
    }
}
