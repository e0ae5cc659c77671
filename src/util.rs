//! Utility functions.

use std::sync::OnceLock;

/// Returns the smallest multiple of `alignment` that is greater or equal to `n`.
///
/// # Panics
/// Panics in debug builds if `alignment` is not a power of two.
/// Callers must make sure that the result fits in a `usize`.
#[inline]
pub(crate) fn roundup(n: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two(), "alignment must be a power of two.");
    let mask = alignment - 1;
    (n + mask) & !mask
}

/// Returns the virtual memory page size of the system.
///
/// The value is queried once with `sysconf` and cached afterwards.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        debug_assert!(size > 0, "sysconf(_SC_PAGESIZE) should never fail.");
        if size > 0 {
            size as usize
        } else {
            4096
        }
    })
}

/// Returns the id of the calling process.
#[inline(always)]
pub(crate) fn current_pid() -> u32 {
    std::process::id()
}
