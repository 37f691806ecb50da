//! Low-level anonymous memory mapping, errno classification, and the
//! bounded-retry wrapper for fixed-address maps.
//!
//! Everything above this module reasons about mapping failures in exactly
//! two categories: *exhausted* (no memory or address space at the requested
//! size, recoverable by trying a smaller size) and *fatal* (anything else).
//! The [`ErrnoPolicy`] table performs that translation, including the
//! platform quirks where the kernel reports exhaustion under a different
//! errno than `ENOMEM`.

use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use tracing::trace;

use crate::align::page_size;
use crate::error::{Error, Result};

/// Classification of a failed map attempt.
#[derive(Debug)]
pub enum MapFailure {
    /// No memory or address space at the requested size; a smaller request
    /// may succeed.
    Exhausted,
    /// Any other condition; shrinking will not help.
    Fatal(Error),
}

/// Translation table from raw OS errno values to the canonical
/// "exhausted" condition.
///
/// `ENOMEM` always means exhausted. Some platforms report exhaustion under
/// a different code (Solaris returns `EAGAIN` for insufficient memory), so
/// the set is extendable and injectable for tests.
#[derive(Debug, Clone, Copy)]
pub struct ErrnoPolicy {
    exhausted: &'static [Errno],
}

impl ErrnoPolicy {
    /// Build a policy from an explicit errno set.
    pub const fn new(exhausted: &'static [Errno]) -> Self {
        ErrnoPolicy { exhausted }
    }

    /// The policy matching the compilation target.
    pub fn native() -> Self {
        #[cfg(any(target_os = "solaris", target_os = "illumos"))]
        {
            ErrnoPolicy::new(&[Errno::ENOMEM, Errno::EAGAIN])
        }
        #[cfg(not(any(target_os = "solaris", target_os = "illumos")))]
        {
            ErrnoPolicy::new(&[Errno::ENOMEM])
        }
    }

    /// Whether `errno` canonically means "exhausted".
    pub fn is_exhausted(&self, errno: Errno) -> bool {
        self.exhausted.contains(&errno)
    }

    /// Classify a failed map attempt of `size` bytes.
    pub(crate) fn classify(&self, size: usize, errno: Errno) -> MapFailure {
        if self.is_exhausted(errno) {
            MapFailure::Exhausted
        } else {
            MapFailure::Fatal(Error::MapFailed { size, errno })
        }
    }
}

impl Default for ErrnoPolicy {
    fn default() -> Self {
        ErrnoPolicy::native()
    }
}

fn anon_flags() -> MapFlags {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        // Avoid reserving swap for probe mappings.
        MapFlags::MAP_PRIVATE | MapFlags::MAP_NORESERVE
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        MapFlags::MAP_PRIVATE
    }
}

/// Map `size` bytes of anonymous memory at an OS-chosen address.
///
/// The result is verified to be page-aligned; an unaligned result is a
/// fatal condition because every downstream layout computation assumes
/// page granularity.
pub(crate) fn map_anon(size: usize, policy: &ErrnoPolicy) -> std::result::Result<usize, MapFailure> {
    let len = NonZeroUsize::new(size)
        .ok_or_else(|| MapFailure::Fatal(Error::Internal("0-byte anonymous map".into())))?;
    // SAFETY: anonymous mapping at an OS-chosen address; no aliasing concerns.
    let res = unsafe {
        mman::mmap_anonymous(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            anon_flags(),
        )
    };
    match res {
        Ok(ptr) => {
            let addr = ptr.as_ptr() as usize;
            trace!(size, addr, "mmap");
            if addr % page_size() != 0 {
                return Err(MapFailure::Fatal(Error::UnalignedMapResult { addr }));
            }
            Ok(addr)
        }
        Err(errno) => {
            trace!(size, %errno, "mmap failed");
            Err(policy.classify(size, errno))
        }
    }
}

/// Map `size` bytes of anonymous memory exactly at `addr`.
pub(crate) fn map_anon_fixed(
    addr: usize,
    size: usize,
    policy: &ErrnoPolicy,
) -> std::result::Result<(), MapFailure> {
    let len = NonZeroUsize::new(size)
        .ok_or_else(|| MapFailure::Fatal(Error::Internal("0-byte fixed map".into())))?;
    let base = NonZeroUsize::new(addr)
        .ok_or_else(|| MapFailure::Fatal(Error::Internal("fixed map at null".into())))?;
    // SAFETY: the caller owns the target range; MAP_FIXED replaces any
    // mapping there, which is exactly the trimming semantic we need.
    let res = unsafe {
        mman::mmap_anonymous(
            Some(base),
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            anon_flags() | MapFlags::MAP_FIXED,
        )
    };
    match res {
        Ok(ptr) => {
            let actual = ptr.as_ptr() as usize;
            trace!(size, addr, "mmap fixed");
            if actual != addr {
                return Err(MapFailure::Fatal(Error::FixedMapMoved {
                    requested: addr,
                    actual,
                }));
            }
            Ok(())
        }
        Err(errno) => {
            trace!(size, addr, %errno, "mmap fixed failed");
            Err(policy.classify(size, errno))
        }
    }
}

/// Remove a mapping established by this crate.
pub(crate) fn unmap(addr: usize, size: usize) -> Result<()> {
    let ptr = NonNull::new(addr as *mut std::ffi::c_void)
        .ok_or_else(|| Error::Internal("munmap of null".into()))?;
    // SAFETY: the caller guarantees [addr, addr+size) is a live mapping
    // owned by this process and not referenced afterwards.
    unsafe { mman::munmap(ptr, size) }.map_err(|errno| Error::UnmapFailed { addr, size, errno })?;
    trace!(size, addr, "munmap");
    Ok(())
}

/// Bounded exponential-backoff retry for fixed-address mapping.
///
/// Some kernels transiently refuse a fixed map with an exhaustion errno
/// immediately after an unmap of the same range. When `enabled`, a failed
/// fixed map is retried with doubling delays before being treated as
/// fatal. This wrapper is the only retry site in the crate.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Whether the workaround is active on this platform.
    pub enabled: bool,
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the doubling delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            enabled: cfg!(target_os = "linux"),
            max_attempts: 100,
            initial_delay: Duration::from_micros(1),
            max_delay: Duration::from_millis(20),
        }
    }
}

/// Run `attempt(addr, size)` under the retry policy.
///
/// `attempt` is the fixed-map primitive of whichever backing store is in
/// use (anonymous memory or a shared object).
pub(crate) fn map_fixed_with_retry<F>(
    policy: &RetryPolicy,
    addr: usize,
    size: usize,
    mut attempt: F,
) -> Result<()>
where
    F: FnMut(usize, usize) -> std::result::Result<(), MapFailure>,
{
    let mut delay = policy.initial_delay;
    let mut attempts = 1u32;
    loop {
        match attempt(addr, size) {
            Ok(()) => return Ok(()),
            Err(MapFailure::Fatal(e)) => return Err(e),
            Err(MapFailure::Exhausted) => {
                if !policy.enabled || attempts >= policy.max_attempts {
                    return Err(Error::FixedMapFailed {
                        addr,
                        size,
                        attempts,
                        errno: Errno::ENOMEM,
                    });
                }
                trace!(attempt = attempts, delay_ns = delay.as_nanos() as u64, "fixed map retry");
                std::thread::sleep(delay);
                delay = std::cmp::min(policy.max_delay, delay * 2);
                attempts += 1;
            }
        }
    }
}

/// The mapping operations a probe or attach sequence runs against.
///
/// Implemented by anonymous process-private memory ([`SystemMapOps`]), by
/// the shared-object backends, and by test oracles. Addresses are plain
/// `usize` so layout arithmetic stays pointer-free.
pub trait MapOps {
    /// Map `size` bytes at an OS-chosen page-aligned address.
    fn map(&mut self, size: usize) -> std::result::Result<usize, MapFailure>;

    /// Map `size` bytes exactly at `addr`, replacing whatever is there.
    fn map_fixed(&mut self, addr: usize, size: usize) -> std::result::Result<(), MapFailure>;

    /// Remove the mapping at `[addr, addr+size)`, including any named
    /// object backing it.
    fn unmap(&mut self, addr: usize, size: usize) -> Result<()>;

    /// Remove the OS-visible name of the local object, if any, leaving
    /// current mappings intact. Idempotent.
    fn unlink_local(&mut self) {}

    /// Whether concurrent mappings by co-located processes compete for the
    /// same address-space budget, requiring the multi-fit refinement.
    fn multi_fit_required(&self) -> bool {
        false
    }

    /// Whether the final segment must be re-mapped even when the probe
    /// window already has the right base and size. Shared-object backends
    /// must recreate so the object is sized to the final segment.
    fn recreate_on_trim(&self) -> bool {
        false
    }
}

/// [`MapOps`] over anonymous process-private memory.
#[derive(Debug, Default)]
pub struct SystemMapOps {
    policy: ErrnoPolicy,
}

impl SystemMapOps {
    /// Build with an explicit errno policy.
    pub fn new(policy: ErrnoPolicy) -> Self {
        SystemMapOps { policy }
    }
}

impl MapOps for SystemMapOps {
    fn map(&mut self, size: usize) -> std::result::Result<usize, MapFailure> {
        map_anon(size, &self.policy)
    }

    fn map_fixed(&mut self, addr: usize, size: usize) -> std::result::Result<(), MapFailure> {
        map_anon_fixed(addr, size, &self.policy)
    }

    fn unmap(&mut self, addr: usize, size: usize) -> Result<()> {
        unmap(addr, size)
    }
}
