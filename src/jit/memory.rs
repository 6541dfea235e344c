//! Executable memory management using mmap.
//!
//! The code cache maps one region readable, writable and executable so that
//! installed code can still be patched in place (call-site linking, entry
//! forwarding). All such writes after installation go through aligned atomic
//! stores, see `patch.rs`.

use std::ptr::NonNull;

use thiserror::Error;

/// Error type for memory operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("memory allocation failed")]
    AllocationFailed,
    #[error("memory protection change failed")]
    ProtectionFailed,
    #[error("invalid memory size")]
    InvalidSize,
}

/// A page-aligned block of memory allocated via mmap, mapped RWX.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
}

impl ExecutableMemory {
    /// Map `size` bytes (rounded up to the page size) as patchable code space.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }

        let page_size = Self::page_size();
        let aligned_size = size
            .checked_add(page_size - 1)
            .ok_or(MemoryError::InvalidSize)?
            & !(page_size - 1);

        let ptr = Self::mmap_alloc(aligned_size)?;

        Ok(Self {
            ptr,
            size: aligned_size,
        })
    }

    /// Get the page size for the current system.
    pub fn page_size() -> usize {
        #[cfg(unix)]
        {
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
        }
        #[cfg(not(unix))]
        {
            4096
        }
    }

    #[cfg(unix)]
    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        use std::ptr;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }

        let result = unsafe {
            libc::mprotect(
                ptr,
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            )
        };
        if result != 0 {
            unsafe {
                libc::munmap(ptr, size);
            }
            return Err(MemoryError::ProtectionFailed);
        }

        NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)
    }

    #[cfg(not(unix))]
    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        // Not executable on most systems; metadata-only use.
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|_| MemoryError::InvalidSize)?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(MemoryError::AllocationFailed)
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Copy bytes into the mapping.
    ///
    /// # Safety
    /// No other thread may be executing or patching the written range.
    pub unsafe fn write(&self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        let end = offset.checked_add(data.len()).ok_or(MemoryError::InvalidSize)?;
        if end > self.size {
            return Err(MemoryError::InvalidSize);
        }

        unsafe {
            let dest = self.ptr.as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dest, data.len());
        }

        Ok(())
    }

    /// Read back a range of the mapping.
    pub fn read(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        if end > self.size {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) })
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
            }
        }
        #[cfg(not(unix))]
        {
            if let Ok(layout) = std::alloc::Layout::from_size_align(self.size, Self::page_size()) {
                unsafe {
                    std::alloc::dealloc(self.ptr.as_ptr(), layout);
                }
            }
        }
    }
}

// The mapping is owned exclusively; concurrent mutation is limited to the
// atomic patch protocol.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}
