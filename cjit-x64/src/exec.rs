//! Executable memory.
//!
//! One page-aligned allocation per loaded module: mapped read-write for
//! relocation patching, flipped to read-execute exactly once, released when
//! the module is dropped. `mmap`/`mprotect` on unix, `VirtualAlloc`/
//! `VirtualProtect` on windows.

use crate::Result;

/// Page size used for section alignment within the buffer.
pub const PAGE_SIZE: usize = 4096;

static_assertions::const_assert!(PAGE_SIZE.is_power_of_two());

/// An OS-allocated buffer that starts RW and ends RX.
#[derive(Debug)]
pub struct ExecBuffer {
    ptr: *mut u8,
    len: usize,
    executable: bool,
}

impl ExecBuffer {
    /// Allocate at least `len` bytes of page-aligned read-write memory.
    pub fn alloc(len: usize) -> Result<Self> {
        let len = len.div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE;
        let ptr = sys::alloc_rw(len)?;
        Ok(Self {
            ptr,
            len,
            executable: false,
        })
    }

    /// Base address of the buffer.
    pub fn base(&self) -> *const u8 {
        self.ptr
    }

    /// Allocated length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mutable view; only valid before [`ExecBuffer::protect_rx`].
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        assert!(!self.executable, "buffer is already executable");
        // Safety: the region is owned by this allocation, mapped RW and
        // uniquely borrowed through &mut self.
        unsafe { core::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// Flip the pages from RW to RX. Called exactly once.
    pub fn protect_rx(&mut self) -> Result<()> {
        sys::protect_rx(self.ptr, self.len)?;
        self.executable = true;
        Ok(())
    }
}

impl Drop for ExecBuffer {
    fn drop(&mut self) {
        sys::release(self.ptr, self.len);
    }
}

// The generated code is position-resolved data; the buffer can move between
// threads with its owner.
unsafe impl Send for ExecBuffer {}

#[cfg(unix)]
mod sys {
    use crate::{Result, X64Error};

    pub fn alloc_rw(len: usize) -> Result<*mut u8> {
        // Safety: anonymous private mapping with no file descriptor.
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(X64Error::Memory("mmap failed".into()));
        }
        Ok(ptr.cast())
    }

    pub fn protect_rx(ptr: *mut u8, len: usize) -> Result<()> {
        // Safety: `ptr`/`len` describe a mapping produced by alloc_rw.
        let rc = unsafe { libc::mprotect(ptr.cast(), len, libc::PROT_READ | libc::PROT_EXEC) };
        if rc != 0 {
            return Err(X64Error::Memory("mprotect failed".into()));
        }
        Ok(())
    }

    pub fn release(ptr: *mut u8, len: usize) {
        // Safety: same mapping; errors on unmap are unrecoverable and ignored.
        unsafe {
            libc::munmap(ptr.cast(), len);
        }
    }
}

#[cfg(windows)]
mod sys {
    use crate::{Result, X64Error};
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_EXECUTE_READ, PAGE_READWRITE,
    };

    pub fn alloc_rw(len: usize) -> Result<*mut u8> {
        // Safety: plain reservation+commit, no existing region touched.
        let ptr = unsafe {
            VirtualAlloc(
                core::ptr::null(),
                len,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        if ptr.is_null() {
            return Err(X64Error::Memory("VirtualAlloc failed".into()));
        }
        Ok(ptr.cast())
    }

    pub fn protect_rx(ptr: *mut u8, len: usize) -> Result<()> {
        let mut old = 0u32;
        // Safety: region produced by alloc_rw.
        let ok = unsafe { VirtualProtect(ptr.cast(), len, PAGE_EXECUTE_READ, &mut old) };
        if ok == 0 {
            return Err(X64Error::Memory("VirtualProtect failed".into()));
        }
        Ok(())
    }

    pub fn release(ptr: *mut u8, len: usize) {
        let _ = len;
        // Safety: region produced by alloc_rw.
        unsafe {
            VirtualFree(ptr.cast(), 0, MEM_RELEASE);
        }
    }
}
