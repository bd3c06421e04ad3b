//! Guarded virtual-memory mapping backing one stack object.
//!
//! Layout (addresses increase to the right):
//!
//! ```text
//! [guard]  [value stack ...→]   [red zone]  [←... native region]
//!  NONE     READ|WRITE           NONE        READ|WRITE
//!  ^base    ^value_base          ^           ^native_base    ^end
//! ```
//!
//! The value stack grows upward from `value_base`; the native region
//! (return-address slots and frame records) grows downward from `end`.
//! The guard page below `value_base` catches value-stack underflow;
//! the red zone between the regions catches overflow of either stack.
//! Faults in either no-access zone are classified `STACK_OVERFLOW` by
//! an external signal handler via [`StackMapping::red_zone_range`].
//!
//! The red zone sits at `size − (native_pages + 1) · PAGE_SIZE`; with
//! one native page that is the classic `size − 2 · PAGE_SIZE` spot.

use std::ptr;

/// A guarded anonymous mapping. Construction failures are fatal: an
/// engine that cannot protect its red zones must not run.
pub(crate) struct StackMapping {
    base: *mut u8,
    size: usize,
    native_size: usize,
}

impl StackMapping {
    /// Map `size` bytes with guard page, value region, red zone and
    /// `native_pages` pages of native region.
    pub(crate) fn new(size: usize, native_pages: usize) -> StackMapping {
        let page_size = page_size();
        assert!(size % page_size == 0, "stack size must be page-aligned");
        let native_size = native_pages * page_size;
        assert!(
            size >= native_size + 4 * page_size,
            "stack mapping too small for its native region"
        );

        // SAFETY: anonymous private mapping; the two protected zones are
        // entirely inside it.
        unsafe {
            let base = libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            assert!(
                base != libc::MAP_FAILED,
                "mmap failed to allocate {size} bytes for stack"
            );
            let base = base as *mut u8;

            let ret = libc::mprotect(base as *mut libc::c_void, page_size, libc::PROT_NONE);
            assert!(ret == 0, "mprotect failed to set underflow guard page");

            let red = base.add(size - native_size - page_size);
            let ret = libc::mprotect(red as *mut libc::c_void, page_size, libc::PROT_NONE);
            assert!(ret == 0, "mprotect failed to set red zone");

            StackMapping {
                base,
                size,
                native_size,
            }
        }
    }

    /// Lowest pushable value-stack address (`range.start`).
    #[inline(always)]
    pub(crate) fn value_base(&self) -> *mut u8 {
        unsafe { self.base.add(page_size()) }
    }

    /// One past the highest pushable value-stack address.
    #[inline(always)]
    pub(crate) fn value_limit(&self) -> *mut u8 {
        unsafe { self.base.add(self.size - self.native_size - page_size()) }
    }

    /// Lowest native-region address (just above the red zone).
    #[inline(always)]
    pub(crate) fn native_base(&self) -> *mut u8 {
        unsafe { self.base.add(self.size - self.native_size) }
    }

    /// One past the mapping (`range.end`); initial native sp.
    #[inline(always)]
    pub(crate) fn end(&self) -> *mut u8 {
        unsafe { self.base.add(self.size) }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Address ranges of the two no-access zones, for the external
    /// signal handler to classify faults as `STACK_OVERFLOW`.
    pub(crate) fn red_zone_range(&self) -> [(usize, usize); 2] {
        let page = page_size();
        let under = self.base as usize;
        let red = self.base as usize + self.size - self.native_size - page;
        [(under, under + page), (red, red + page)]
    }
}

impl Drop for StackMapping {
    fn drop(&mut self) {
        // SAFETY: base/size were produced by a successful mmap.
        unsafe {
            let ret = libc::munmap(self.base as *mut libc::c_void, self.size);
            debug_assert!(ret == 0, "munmap failed");
        }
    }
}

/// System page size.
pub(crate) fn page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) always succeeds on POSIX systems.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
