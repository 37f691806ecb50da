//! Error types for segment establishment.

use nix::errno::Errno;
use thiserror::Error;

/// Result type for segment establishment operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for segment establishment operations.
///
/// Every variant here is terminal for the job: the establishment protocol
/// has no safe partial state, so callers are expected to tear down and
/// abort on any error. Recoverable conditions (a map attempt hitting
/// resource exhaustion during probing) are absorbed internally and never
/// surface through this type.
#[derive(Error, Debug)]
pub enum Error {
    /// A non-fixed mapping failed with an error that does not mean "exhausted".
    #[error("unexpected error in mmap for size {size}: {errno}")]
    MapFailed {
        /// Requested mapping size in bytes.
        size: usize,
        /// The raw OS error.
        errno: Errno,
    },

    /// A fixed-address mapping failed, after retries where applicable.
    #[error("mmap fixed failed at {addr:#x} for size {size} after {attempts} attempt(s): {errno}")]
    FixedMapFailed {
        /// The requested fixed base address.
        addr: usize,
        /// Requested mapping size in bytes.
        size: usize,
        /// Number of attempts made, including retries.
        attempts: u32,
        /// The raw OS error from the final attempt.
        errno: Errno,
    },

    /// Unmapping an established region failed.
    #[error("munmap({addr:#x}, {size}) failed: {errno}")]
    UnmapFailed {
        /// Base address of the region.
        addr: usize,
        /// Size of the region in bytes.
        size: usize,
        /// The raw OS error.
        errno: Errno,
    },

    /// The OS returned a mapping whose base is not page-aligned.
    #[error("mmap result {addr:#x} is not aligned to the page size")]
    UnalignedMapResult {
        /// The address the OS returned.
        addr: usize,
    },

    /// A fixed-address mapping was placed somewhere other than requested.
    #[error("mmap fixed moved from {requested:#x} to {actual:#x}")]
    FixedMapMoved {
        /// The address that was requested.
        requested: usize,
        /// The address the OS actually used.
        actual: usize,
    },

    /// No mappable region of any size could be found.
    #[error("unable to find an adequate mmap segment")]
    NoAdequateSegment,

    /// Creating, sizing, or mapping a shared memory object failed.
    #[error("failed to set up {size}-byte shared memory object for slot {slot}: {errno}")]
    ShmSetup {
        /// Host-local slot index of the object.
        slot: usize,
        /// Requested object size in bytes.
        size: usize,
        /// The raw OS error.
        errno: Errno,
    },

    /// The atomic unique-name search exhausted every candidate directory.
    #[error("failed to find a unique shared-memory name prefix: {errno}")]
    NoUniqueName {
        /// The raw OS error from the last candidate.
        errno: Errno,
    },

    /// The uniqueness marker published by the host leader is not visible.
    #[error("shared-memory uniqueness marker {path} is not accessible: {errno}")]
    MarkerMissing {
        /// Marker file path.
        path: String,
        /// The raw OS error.
        errno: Errno,
    },

    /// Two host-local slots derived the same System V key.
    #[error("duplicate System V key for slots {first} and {second}")]
    DuplicateKey {
        /// Earlier slot holding the key.
        first: usize,
        /// Slot that collided with it.
        second: usize,
    },

    /// The heap-separation offset leaves no room for a local segment.
    #[error("minimum heap offset too large to accommodate a segment")]
    HeapOffsetTooLarge,

    /// A co-located peer's segment was mapped into the reserved heap gap.
    #[error("minimum heap offset too large to accommodate a remote segment")]
    RemoteHeapOffsetTooLarge,

    /// An aligned-placement base escaped the window probed on this process.
    #[error("segment base {base:#x} escapes the probed window [{lo:#x}, {hi:#x})")]
    BaseOutsideWindow {
        /// The computed common base.
        base: usize,
        /// Low end of the local window.
        lo: usize,
        /// High end of the local window.
        hi: usize,
    },

    /// A peer attached its segment somewhere other than the agreed base.
    #[error("rank {rank} attached its segment at {actual:#x}, expected common base {expected:#x}")]
    AlignmentViolated {
        /// The offending rank.
        rank: usize,
        /// The base it published.
        actual: usize,
        /// The base every rank agreed on.
        expected: usize,
    },

    /// Auxiliary-region requirements exceed what the segment can hold.
    #[error("auxiliary region requirement ({auxseg} bytes) exceeds available segment size ({avail} bytes)")]
    AuxsegTooLarge {
        /// Total auxiliary bytes requested.
        auxseg: usize,
        /// Usable segment bytes available.
        avail: usize,
    },

    /// A collective delivered a payload of unexpected size.
    #[error("collective payload size mismatch: got {got} bytes, expected {expected}")]
    CollectiveSize {
        /// Bytes actually delivered.
        got: usize,
        /// Bytes the protocol required.
        expected: usize,
    },

    /// Querying the process heap end failed.
    #[error("failed to query heap end: {errno}")]
    HeapEnd {
        /// The raw OS error.
        errno: Errno,
    },

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}
