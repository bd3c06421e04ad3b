use std::ptr;

/// Default reservation: 16MB virtual address space.
const DEFAULT_RESERVE: usize = 16 * 1024 * 1024;

/// Initial committed region: 64KB.
const INITIAL_COMMIT: usize = 64 * 1024;

/// Executable memory buffer for generated code.
///
/// Uses a reservation model: reserves a virtual address range via mmap
/// with PROT_NONE (free — no physical pages), then commits pages on
/// demand as code is emitted.
///
/// Lifecycle:
/// 1. `new(size)` — reserves virtual address space, commits initial pages
/// 2. `emit_u8`/`emit_u32`/`emit_u64` — append x86-64 instruction bytes
/// 3. `finalize()` — flips committed pages to read+execute
/// 4. `entry()` — returns a pointer to the start of emitted code
/// 5. `reopen()` — flips back to read+write for appending more code
///
/// A guard page at the end of the reserved region catches overflows.
/// The buffer is unmapped on drop.
pub struct CodeBuffer {
    base: *mut u8,
    /// Total mmap'd size (reserved + guard page).
    reserved: usize,
    /// Bytes currently committed (RW). Always page-aligned.
    committed: usize,
    /// Bytes emitted so far.
    len: usize,
    finalized: bool,
}

// CodeBuffer holds a raw mmap'd pointer — safe to send across threads
// since we never alias it.
unsafe impl Send for CodeBuffer {}
unsafe impl Sync for CodeBuffer {}

impl CodeBuffer {
    /// Allocate a code buffer with at least `min_size` bytes initially committed.
    ///
    /// Reserves a large virtual address range (costs no physical memory),
    /// then commits enough pages to hold `min_size` bytes. A guard page
    /// (PROT_NONE) sits at the end of the reserved region.
    pub fn new(min_size: usize) -> Result<Self, anyhow::Error> {
        let page_size = page_size();
        let initial_commit = align_up(min_size.max(INITIAL_COMMIT), page_size);
        let reserve = align_up(DEFAULT_RESERVE.max(initial_commit), page_size);
        let total = reserve + page_size; // + guard page

        // Reserve entire range as PROT_NONE (no physical pages).
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        anyhow::ensure!(base != libc::MAP_FAILED, "code buffer mmap failed");

        // Commit the initial region as writable.
        let ret = unsafe { libc::mprotect(base, initial_commit, libc::PROT_READ | libc::PROT_WRITE) };
        if ret != 0 {
            unsafe { libc::munmap(base, total) };
            anyhow::bail!("code buffer mprotect (RW) failed");
        }

        Ok(CodeBuffer {
            base: base as *mut u8,
            reserved: total,
            committed: initial_commit,
            len: 0,
            finalized: false,
        })
    }

    /// Append a single instruction byte.
    ///
    /// Automatically commits more pages if needed.
    #[inline]
    pub fn emit_u8(&mut self, byte: u8) {
        debug_assert!(!self.finalized, "cannot emit after finalize");
        self.ensure_capacity(1);
        unsafe {
            ptr::write(self.base.add(self.len), byte);
        }
        self.len += 1;
    }

    /// Append a 32-bit little-endian immediate.
    pub fn emit_u32(&mut self, val: u32) {
        for b in val.to_le_bytes() {
            self.emit_u8(b);
        }
    }

    /// Append a 64-bit little-endian immediate.
    pub fn emit_u64(&mut self, val: u64) {
        for b in val.to_le_bytes() {
            self.emit_u8(b);
        }
    }

    /// Patch a previously emitted 32-bit immediate at byte offset `offset`.
    pub fn patch_u32(&mut self, offset: usize, val: u32) {
        debug_assert!(!self.finalized, "cannot patch after finalize");
        debug_assert!(offset + 4 <= self.len, "patch offset out of bounds");
        unsafe {
            let dst = self.base.add(offset);
            ptr::copy_nonoverlapping(val.to_le_bytes().as_ptr(), dst, 4);
        }
    }

    /// Current emission offset in bytes.
    #[inline]
    pub fn pos(&self) -> usize {
        self.len
    }

    /// Pointer to the start of emitted code.
    pub fn entry(&self) -> *const u8 {
        self.base
    }

    /// Address range covered by emitted code, for region registration.
    pub fn range(&self) -> (usize, usize) {
        (self.base as usize, self.base as usize + self.len)
    }

    /// Flip committed pages to read+execute.
    pub fn finalize(&mut self) -> Result<(), anyhow::Error> {
        let ret = unsafe {
            libc::mprotect(
                self.base as *mut libc::c_void,
                self.committed,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        anyhow::ensure!(ret == 0, "code buffer mprotect (RX) failed");
        self.finalized = true;
        Ok(())
    }

    /// Flip back to read+write for appending more code.
    pub fn reopen(&mut self) -> Result<(), anyhow::Error> {
        let ret = unsafe {
            libc::mprotect(
                self.base as *mut libc::c_void,
                self.committed,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        anyhow::ensure!(ret == 0, "code buffer mprotect (RW) failed");
        self.finalized = false;
        Ok(())
    }

    fn ensure_capacity(&mut self, extra: usize) {
        if self.len + extra <= self.committed {
            return;
        }
        let page_size = page_size();
        let new_commit = align_up(self.len + extra, page_size).max(self.committed * 2);
        let new_commit = new_commit.min(self.reserved - page_size);
        assert!(
            self.len + extra <= new_commit,
            "code buffer exhausted its reservation"
        );
        let ret = unsafe {
            libc::mprotect(
                self.base.add(self.committed) as *mut libc::c_void,
                new_commit - self.committed,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        assert!(ret == 0, "code buffer mprotect (grow) failed");
        self.committed = new_commit;
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        // SAFETY: `base` and `reserved` were set by a successful mmap call.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.reserved);
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) always succeeds on POSIX systems.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_and_read_back() {
        let mut buf = CodeBuffer::new(64).unwrap();
        buf.emit_u8(0x90);
        buf.emit_u32(0xDEAD_BEEF);
        buf.emit_u64(0x0123_4567_89AB_CDEF);
        assert_eq!(buf.pos(), 13);
        let bytes = unsafe { std::slice::from_raw_parts(buf.entry(), 13) };
        assert_eq!(bytes[0], 0x90);
        assert_eq!(&bytes[1..5], &0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(&bytes[5..13], &0x0123_4567_89AB_CDEFu64.to_le_bytes());
    }

    #[test]
    fn patch_rewrites_immediate() {
        let mut buf = CodeBuffer::new(64).unwrap();
        buf.emit_u8(0xE9);
        let at = buf.pos();
        buf.emit_u32(0);
        buf.patch_u32(at, 0x11223344);
        let bytes = unsafe { std::slice::from_raw_parts(buf.entry(), 5) };
        assert_eq!(&bytes[1..5], &0x11223344u32.to_le_bytes());
    }

    #[test]
    fn finalized_code_executes() {
        // mov eax, 7; ret
        let mut buf = CodeBuffer::new(64).unwrap();
        buf.emit_u8(0xB8);
        buf.emit_u32(7);
        buf.emit_u8(0xC3);
        buf.finalize().unwrap();
        let f: extern "C" fn() -> u32 = unsafe { std::mem::transmute(buf.entry()) };
        assert_eq!(f(), 7);
    }

    #[test]
    fn grows_past_initial_commit() {
        let mut buf = CodeBuffer::new(64).unwrap();
        for i in 0..(INITIAL_COMMIT + 4096) {
            buf.emit_u8((i & 0xFF) as u8);
        }
        assert!(buf.pos() > INITIAL_COMMIT);
    }
}
