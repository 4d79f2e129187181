//! Host memory regions.

use crate::error::{Error, Result};
use crate::platform::Addr;
use rustix::mm::{MapFlags, ProtFlags};
use std::alloc::Layout;
use std::ptr::NonNull;

/// How a [`HostRegion`] obtained its memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    /// Global allocator, remembered layout for deallocation.
    Heap(Layout),
    /// Anonymous page mapping of `mapped_len` bytes.
    Mapped { mapped_len: usize },
}

/// A zero-initialized, exclusively owned block of host memory.
///
/// Two flavors exist: heap regions come from the global allocator with a
/// caller-chosen alignment and back system-memory surfaces; mapped regions
/// are whole pages obtained with `mmap` and stand in for driver-managed
/// memory (pinned, device, unified, video buffers) in the simulated runtime.
///
/// # Example
///
/// ```rust
/// use bufsurface::memory::HostRegion;
///
/// let region = HostRegion::heap(1024, 64).unwrap();
/// assert_eq!(region.len(), 1024);
/// assert_eq!(region.addr().get() % 64, 0);
/// ```
pub struct HostRegion {
    ptr: NonNull<u8>,
    len: usize,
    source: Source,
}

impl HostRegion {
    /// Allocate `len` zeroed bytes from the heap, aligned to `align`.
    ///
    /// # Errors
    ///
    /// Returns an error if `len` is 0, `align` is not a power of two, or the
    /// allocator fails.
    pub fn heap(len: usize, align: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::AllocationFailed("size must be greater than 0".into()));
        }
        let layout = Layout::from_size_align(len, align)
            .map_err(|e| Error::AllocationFailed(format!("bad layout: {e}")))?;

        // SAFETY: layout has non-zero size.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| Error::AllocationFailed(format!("heap allocation of {len} bytes")))?;

        Ok(Self {
            ptr,
            len,
            source: Source::Heap(layout),
        })
    }

    /// Map `len` zeroed bytes of anonymous memory (rounded up to whole pages).
    ///
    /// # Errors
    ///
    /// Returns an error if `len` is 0 or `mmap` fails.
    pub fn mapped(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::AllocationFailed("size must be greater than 0".into()));
        }
        let page = rustix::param::page_size();
        let mapped_len = len
            .checked_next_multiple_of(page)
            .ok_or_else(|| Error::AllocationFailed("mapping size overflow".into()))?;

        // SAFETY: a fresh private anonymous mapping does not alias anything.
        let base = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                mapped_len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )?
        };
        let ptr = NonNull::new(base.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;

        Ok(Self {
            ptr,
            len,
            source: Source::Mapped { mapped_len },
        })
    }

    /// Start address.
    #[inline]
    pub fn addr(&self) -> Addr {
        Addr::from_ptr(self.ptr.as_ptr())
    }

    /// Raw pointer to the start of the region.
    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Usable length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; regions are never empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the region is a page mapping.
    #[inline]
    pub fn is_mapped(&self) -> bool {
        matches!(self.source, Source::Mapped { .. })
    }

    /// View the region as a byte slice.
    ///
    /// # Safety
    ///
    /// No one may write to the region while the slice is alive.
    #[inline]
    pub unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len bytes; caller excludes writers.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for HostRegion {
    fn drop(&mut self) {
        match self.source {
            // SAFETY: ptr came from alloc_zeroed with this layout.
            Source::Heap(layout) => unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) },
            Source::Mapped { mapped_len } => {
                // SAFETY: ptr/mapped_len describe a mapping we own.
                if let Err(e) = unsafe { rustix::mm::munmap(self.ptr.as_ptr().cast(), mapped_len) } {
                    tracing::warn!(error = %e, "munmap failed");
                }
            }
        }
    }
}

impl std::fmt::Debug for HostRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRegion")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

// SAFETY: HostRegion owns its memory exclusively; access goes through raw
// pointers whose synchronization is the caller's responsibility.
unsafe impl Send for HostRegion {}
unsafe impl Sync for HostRegion {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_region_zeroed_and_aligned() {
        let region = HostRegion::heap(4096, 256).unwrap();
        assert_eq!(region.len(), 4096);
        assert_eq!(region.addr().get() % 256, 0);
        assert!(!region.is_mapped());
        assert!(unsafe { region.as_slice() }.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_zero_size_fails() {
        assert!(HostRegion::heap(0, 8).is_err());
        assert!(HostRegion::mapped(0).is_err());
    }

    #[test]
    fn test_bad_alignment_fails() {
        assert!(HostRegion::heap(64, 3).is_err());
    }

    #[test]
    fn test_mapped_region_read_write() {
        let region = HostRegion::mapped(100).unwrap();
        assert!(region.is_mapped());
        assert_eq!(region.addr().get() % rustix::param::page_size(), 0);

        unsafe {
            std::ptr::write(region.as_mut_ptr(), 42);
            std::ptr::write(region.as_mut_ptr().add(99), 43);
            let slice = region.as_slice();
            assert_eq!(slice[0], 42);
            assert_eq!(slice[99], 43);
            assert_eq!(slice[50], 0);
        }
    }
}
