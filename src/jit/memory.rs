use super::JitError;

const FALLBACK_PAGE_SIZE: usize = 4096;

fn page_size() -> usize {
    let probed = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if probed > 0 {
        probed as usize
    } else {
        FALLBACK_PAGE_SIZE
    }
}

fn round_up_to_page_size(size: usize) -> usize {
    let page = page_size();
    size.div_ceil(page) * page
}

/// A page-aligned region carrying JIT-compatible permissions. On macOS the
/// mapping is RWX with `MAP_JIT` and actual stores are gated by the
/// per-thread write-protect toggle; elsewhere the region is remapped between
/// RW and RX with `mprotect`. Callers must pair `begin_write`/`end_write`
/// around every store, including back-patches, and must never execute while
/// writes are enabled.
#[derive(Debug)]
pub struct ExecutableMemory {
    ptr: *mut u8,
    len: usize,
    finalized: bool,
}

impl ExecutableMemory {
    pub fn new(size: usize) -> Result<Self, JitError> {
        let len = round_up_to_page_size(size.max(1));

        #[cfg(target_os = "macos")]
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT,
                -1,
                0,
            )
        };

        #[cfg(not(target_os = "macos"))]
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
            return Err(JitError::AllocationFailed(
                std::io::Error::last_os_error().to_string(),
            ));
        }

        let mut memory = Self {
            ptr: ptr as *mut u8,
            len,
            finalized: false,
        };
        memory.begin_write()?;
        Ok(memory)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Enables stores into the region for the current thread. Required
    /// before any write, including re-emission after `finalize`.
    pub fn begin_write(&mut self) -> Result<(), JitError> {
        self.set_writable(true)
    }

    /// Revokes write access; the region becomes fetchable as code again.
    pub fn end_write(&mut self) -> Result<(), JitError> {
        self.set_writable(false)
    }

    /// Terminal sealing call. Idempotent; a second finalize is a no-op.
    pub fn finalize(&mut self) -> Result<(), JitError> {
        if self.finalized {
            return Ok(());
        }
        self.end_write()?;
        self.finalized = true;
        Ok(())
    }

    #[cfg(target_os = "macos")]
    fn set_writable(&mut self, writable: bool) -> Result<(), JitError> {
        thread_write_protect(!writable);
        Ok(())
    }

    #[cfg(not(target_os = "macos"))]
    fn set_writable(&mut self, writable: bool) -> Result<(), JitError> {
        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ | libc::PROT_EXEC
        };
        let rc = unsafe { libc::mprotect(self.ptr as *mut libc::c_void, self.len, prot) };
        if rc != 0 {
            return Err(JitError::ProtectionFailed(
                std::io::Error::last_os_error().to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn write_u32_le(&mut self, offset: usize, value: u32) {
        debug_assert!(offset + 4 <= self.len);
        let bytes = value.to_le_bytes();
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), 4);
        }
    }

    pub(crate) fn read_u32_le(&self, offset: usize) -> u32 {
        debug_assert!(offset + 4 <= self.len);
        let mut bytes = [0u8; 4];
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.add(offset), bytes.as_mut_ptr(), 4);
        }
        u32::from_le_bytes(bytes)
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.len);
            }
        }
    }
}

/// Synchronizes the instruction cache with the data cache over `[begin,
/// begin + size)`. Must run after all stores and after `end_write`, before
/// the code is executed.
pub fn flush_instruction_cache(begin: *const u8, size: usize) {
    #[cfg(all(target_arch = "aarch64", target_os = "macos"))]
    unsafe {
        sys_icache_invalidate(begin as *mut libc::c_void, size);
    }

    #[cfg(all(target_arch = "aarch64", not(target_os = "macos")))]
    unsafe {
        __clear_cache(
            begin as *mut libc::c_char,
            begin.add(size) as *mut libc::c_char,
        );
    }

    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = (begin, size);
    }
}

#[cfg(target_os = "macos")]
fn thread_write_protect(enabled: bool) {
    unsafe {
        if pthread_jit_write_protect_supported_np() != 0 {
            pthread_jit_write_protect_np(libc::c_int::from(enabled));
        }
    }
}

#[cfg(target_os = "macos")]
unsafe extern "C" {
    fn pthread_jit_write_protect_supported_np() -> libc::c_int;
    fn pthread_jit_write_protect_np(enabled: libc::c_int);
}

#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
unsafe extern "C" {
    fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
}

#[cfg(all(target_arch = "aarch64", not(target_os = "macos")))]
unsafe extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}
