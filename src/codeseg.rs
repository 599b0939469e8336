//! W^X code-segment lifecycle.
//!
//! The order is fixed: map a writable, non-executable region, copy the
//! relocated machine code in, then seal it. Sealing consumes the writable
//! handle and yields an executable one, so no code path can write to a
//! region that is already executable.

use crate::debug_println;
use crate::error::*;

/// Writable, non-executable mapping holding code that is still being placed.
pub struct CodeWriter {
    ptr: *mut u8,
    len: usize,
}

/// Sealed, executable, non-writable mapping. Unmapped on drop.
pub struct CodeSegment {
    ptr: *mut u8,
    len: usize,
}

fn page_align(size: usize) -> usize {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    (size + page - 1) & !(page - 1)
}

impl CodeWriter {
    /// Maps a zero-initialized read-write region of at least `size` bytes.
    pub fn map(size: usize) -> Result<CodeWriter, Error> {
        if size == 0 {
            return resource(CODE_ALLOC_FAILED);
        }
        let len = page_align(size);
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return resource(CODE_ALLOC_FAILED);
        }
        debug_println!("mapped code segment of {} bytes", len);
        Ok(CodeWriter { ptr: ptr as *mut u8, len })
    }

    /// Maps a region and copies `code` into it in one step.
    pub fn with_code(code: &[u8]) -> Result<CodeWriter, Error> {
        let mut writer = CodeWriter::map(code.len())?;
        writer.write(0, code);
        Ok(writer)
    }

    pub fn base(&self) -> *mut u8 {
        self.ptr
    }

    pub fn write(&mut self, at: usize, bytes: &[u8]) {
        assert!(at + bytes.len() <= self.len, "write past mapped code segment");
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(at), bytes.len());
        }
    }

    /// Flips the region executable and drops write permission. On failure
    /// the mapping is released; the caller's compilation must abort.
    pub fn seal(self) -> Result<CodeSegment, Error> {
        let rc = unsafe { libc::mprotect(self.ptr as *mut _, self.len, libc::PROT_READ | libc::PROT_EXEC) };
        let (ptr, len) = (self.ptr, self.len);
        // either way this handle must not unmap; ownership moves on
        std::mem::forget(self);
        if rc != 0 {
            unsafe { libc::munmap(ptr as *mut _, len) };
            return resource(CODE_PROTECT_FAILED);
        }
        Ok(CodeSegment { ptr, len })
    }
}

impl Drop for CodeWriter {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.ptr as *mut _, self.len) };
    }
}

impl CodeSegment {
    pub fn base(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for CodeSegment {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.ptr as *mut _, self.len) };
    }
}
