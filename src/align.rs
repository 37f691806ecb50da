//! Page and cache-line arithmetic shared by every mapping layer.
//!
//! All segment bases and sizes in this crate are kept page-aligned; auxiliary
//! sub-allocations are additionally cache-line aligned. The helpers here are
//! the single source of truth for both granularities.

use std::sync::OnceLock;

use nix::errno::Errno;

use crate::error::{Error, Result};

/// Cache line size assumed for auxiliary sub-region padding.
#[cfg(target_arch = "aarch64")]
pub const CACHE_LINE_BYTES: usize = 128;
/// Cache line size assumed for auxiliary sub-region padding.
#[cfg(not(target_arch = "aarch64"))]
pub const CACHE_LINE_BYTES: usize = 64;

/// Hard platform ceiling on any single segment mapping.
///
/// On 32-bit targets a full 4 GiB cannot be expressed without overflowing
/// signed offsets on some systems, so the ceiling is 2 GiB minus one page.
#[cfg(target_pointer_width = "64")]
pub const PLATFORM_MAP_CEILING: usize = 1 << 42;
/// Hard platform ceiling on any single segment mapping.
#[cfg(not(target_pointer_width = "64"))]
pub const PLATFORM_MAP_CEILING: usize = (1 << 31) - 4096;

/// Align `value` up to a multiple of `align` (power of two).
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Align `value` down to a multiple of `align` (power of two).
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// The system page size, queried once and cached.
pub fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        // SAFETY: sysconf is always safe to call.
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz <= 0 {
            4096
        } else {
            sz as usize
        }
    })
}

/// Align `value` up to the next page boundary.
#[inline]
pub fn page_align_up(value: usize) -> usize {
    align_up(value, page_size())
}

/// Align `value` down to a page boundary.
#[inline]
pub fn page_align_down(value: usize) -> usize {
    align_down(value, page_size())
}

/// Total physical memory of this host in bytes, if the OS reports it.
pub fn phys_mem_size() -> Option<u64> {
    // SAFETY: sysconf is always safe to call.
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    if pages <= 0 {
        return None;
    }
    Some(pages as u64 * page_size() as u64)
}

/// Current top of the process heap, aligned up to a page boundary.
///
/// Segment placement keeps a caller-chosen offset above this address to
/// avoid colliding with later heap growth.
#[cfg(not(target_os = "macos"))]
pub fn heap_end() -> Result<usize> {
    // SAFETY: sbrk(0) only queries the current program break.
    let brk = unsafe { libc::sbrk(0) };
    if brk as isize == -1 {
        return Err(Error::HeapEnd {
            errno: Errno::last(),
        });
    }
    Ok(page_align_up(brk as usize))
}

/// Current top of the process heap, aligned up to a page boundary.
///
/// Darwin emulates `sbrk`, making the heap-separation test meaningless, so
/// the largest page-aligned address is reported instead.
#[cfg(target_os = "macos")]
pub fn heap_end() -> Result<usize> {
    Ok(page_align_down(usize::MAX))
}
