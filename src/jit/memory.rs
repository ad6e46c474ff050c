//! Executable memory management using mmap.
//!
//! This module provides a safe abstraction over OS-level memory mapping.
//! The region is mapped read-write-execute for its whole lifetime: block
//! linking and invalidation patch already-live code, so flipping protection
//! per patch would dominate the cost of the patch itself.

use std::ptr::NonNull;

/// Error type for memory operations.
#[derive(Debug)]
pub enum MemoryError {
    AllocationFailed,
    InvalidSize,
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "memory allocation failed"),
            MemoryError::InvalidSize => write!(f, "invalid memory size"),
        }
    }
}

impl std::error::Error for MemoryError {}

/// A block of executable memory allocated via mmap.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
}

impl ExecutableMemory {
    /// Allocate a new block of memory with the given size, rounded up to
    /// the page size.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }

        let page_size = Self::page_size();
        let aligned_size = (size + page_size - 1) & !(page_size - 1);

        let ptr = Self::mmap_alloc(aligned_size)?;

        Ok(Self {
            ptr,
            size: aligned_size,
        })
    }

    fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        use std::ptr;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }

        NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Get the size of the allocated memory.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

// ExecutableMemory is Send because it owns its mapping outright.
unsafe impl Send for ExecutableMemory {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_memory() {
        let mem = ExecutableMemory::new(4096).unwrap();
        assert!(mem.size() >= 4096);
    }

    #[test]
    fn test_rejects_zero_size() {
        assert!(ExecutableMemory::new(0).is_err());
    }

    #[test]
    fn test_rounds_to_page_size() {
        let mem = ExecutableMemory::new(1).unwrap();
        assert_eq!(mem.size() % 4096, 0);
    }
}
