//! Process-shared memory backends.
//!
//! Co-located processes map each other's segments directly instead of
//! going through the network. Five mutually-exclusive mechanisms can back
//! the shared objects; exactly one is selected per job from
//! [`crate::SegmentConfig`]:
//!
//! - **PosixShm** — named POSIX shared-memory objects (`shm_open`)
//! - **FileBacked** — regular files mapped `MAP_SHARED`
//! - **SysV** — key-based System V shared segments (`shmget`/`shmat`)
//! - **CrossAttach** — XPMEM kernel facility mapping another process's
//!   existing mapping by reference (cargo feature `xpmem`)
//! - **SameAddressSpace** — all ranks are one process; plain heap memory
//!
//! Every rank owns one object slot, plus one extra slot holding the
//! collective "vnet" bootstrap channel created by the host leader. The
//! rank owning a slot is the only rank that ever creates or unlinks it;
//! everyone else only attaches and detaches. Unlink removes the OS-visible
//! name without touching live mappings, is idempotent, and is safe on
//! partially-initialized state because cleanup runs from error paths.

use std::alloc::Layout;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use tracing::debug;

use crate::align::{page_size, CACHE_LINE_BYTES};
use crate::collective::{broadcast_u64, Collectives};
use crate::error::{Error, Result};
use crate::mmap::{ErrnoPolicy, MapFailure, MapOps};

/// Shared-object name prefix; the leading component of every POSIX name
/// and marker/file basename this crate creates.
const NAME_PREFIX: &str = "SEGNT";

/// Length of the per-host unique tag derived from the marker filename.
const UNIQUE_LEN: usize = 6;

/// Base-36 slot digits bound the named mechanisms to 36^3 ranks per host.
pub const MAX_NAMED_SLOTS: usize = 36 * 36 * 36;

/// The concrete OS facility backing shared objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PshmMechanism {
    /// Named POSIX shared-memory objects.
    #[default]
    PosixShm,
    /// Regular files mapped `MAP_SHARED`.
    FileBacked,
    /// System V shared segments addressed by `ftok` keys.
    SysV,
    /// XPMEM cross-process attach.
    #[cfg(feature = "xpmem")]
    CrossAttach,
    /// Degenerate single-process backend: plain heap allocation.
    SameAddressSpace,
}

#[cfg(feature = "xpmem")]
mod ffi {
    //! Raw FFI bindings to libxpmem.
    //!
    //! These are low-level unsafe functions. Use the safe wrappers in the
    //! parent module.
    #![allow(non_camel_case_types)]

    use std::os::raw::{c_int, c_void};

    pub type xpmem_segid_t = i64;
    pub type xpmem_apid_t = i64;

    #[repr(C)]
    pub struct xpmem_addr {
        pub apid: xpmem_apid_t,
        pub offset: libc::off_t,
    }

    pub const XPMEM_RDWR: c_int = 0x2;
    pub const XPMEM_PERMIT_MODE: c_int = 0x1;

    #[link(name = "xpmem")]
    unsafe extern "C" {
        pub fn xpmem_make(
            vaddr: *mut c_void,
            size: usize,
            permit_type: c_int,
            permit_value: *mut c_void,
        ) -> xpmem_segid_t;
        pub fn xpmem_remove(segid: xpmem_segid_t) -> c_int;
        pub fn xpmem_get(
            segid: xpmem_segid_t,
            flags: c_int,
            permit_type: c_int,
            permit_value: *mut c_void,
        ) -> xpmem_apid_t;
        pub fn xpmem_release(apid: xpmem_apid_t) -> c_int;
        pub fn xpmem_attach(addr: xpmem_addr, size: usize, vaddr: *mut c_void) -> *mut c_void;
        pub fn xpmem_detach(vaddr: *mut c_void) -> c_int;
    }
}

/// Per-slot identifiers, one flavor per mechanism.
#[derive(Debug)]
enum Slots {
    /// Names not derived yet.
    Unset,
    /// POSIX object names ("/SEGNT<tag><k36>").
    Posix(Vec<String>),
    /// Backing file paths under the temp directory.
    File(Vec<PathBuf>),
    /// `ftok`-derived keys.
    SysV(Vec<libc::key_t>),
    /// Published base addresses (same address space).
    Heap(Vec<usize>),
    /// XPMEM segment ids (published) and access ids (local attaches).
    #[cfg(feature = "xpmem")]
    Xpmem { segids: Vec<i64>, apids: Vec<i64> },
}

/// One process's handle on the host group's shared-memory objects.
///
/// `nodes` is the host-local rank count; slots `0..nodes` are the per-rank
/// segments and slot `nodes` is the vnet bootstrap channel.
#[derive(Debug)]
pub struct PshmBackend {
    mechanism: PshmMechanism,
    my_node: usize,
    nodes: usize,
    policy: ErrnoPolicy,
    marker: Option<PathBuf>,
    slots: Slots,
    /// Live heap allocations per slot (SameAddressSpace only).
    heap_allocs: Vec<Option<(usize, Layout)>>,
}

impl PshmBackend {
    /// Create a backend for `nodes` co-located ranks, of which this
    /// process is host-local rank `my_node`. No OS resources are touched
    /// until names are established.
    pub fn new(mechanism: PshmMechanism, my_node: usize, nodes: usize) -> Result<Self> {
        if my_node >= nodes {
            return Err(Error::Internal(format!(
                "host-local rank {my_node} out of range for {nodes} ranks"
            )));
        }
        if nodes + 1 > MAX_NAMED_SLOTS {
            return Err(Error::Internal(format!(
                "{nodes} co-located ranks exceed the {MAX_NAMED_SLOTS}-name limit"
            )));
        }
        Ok(PshmBackend {
            mechanism,
            my_node,
            nodes,
            policy: ErrnoPolicy::native(),
            marker: None,
            slots: Slots::Unset,
            heap_allocs: vec![None; nodes + 1],
        })
    }

    /// The mechanism this backend was built with.
    pub fn mechanism(&self) -> PshmMechanism {
        self.mechanism
    }

    /// Whether this process is the designated creator of `slot`.
    ///
    /// Each rank creates its own per-rank object; the host leader
    /// additionally creates the vnet slot.
    pub fn is_creator(&self, slot: usize) -> bool {
        slot == self.my_node || (slot == self.nodes && self.my_node == 0)
    }

    /// Establish unique object names collectively within the host group.
    ///
    /// The host leader creates a temporary marker file via an atomic
    /// create-unique primitive, derives a short tag from its name, and
    /// broadcasts the tag host-locally; every rank then derives the same
    /// slot names deterministically. Idempotent.
    pub fn setup_names(&mut self, coll: &dyn Collectives) -> Result<()> {
        if !matches!(self.slots, Slots::Unset) {
            return Ok(());
        }
        match self.mechanism {
            PshmMechanism::PosixShm | PshmMechanism::FileBacked | PshmMechanism::SysV => {
                let mut tag = [0u8; UNIQUE_LEN];
                if self.my_node == 0 {
                    tag = self.make_unique(None)?;
                }
                let mut word = u64::from_ne_bytes([
                    tag[0], tag[1], tag[2], tag[3], tag[4], tag[5], 0, 0,
                ]);
                broadcast_u64(coll, &mut word, 0)?;
                let bytes = word.to_ne_bytes();
                tag.copy_from_slice(&bytes[..UNIQUE_LEN]);
                if self.my_node != 0 {
                    self.make_unique(Some(&tag))?;
                }
            }
            PshmMechanism::SameAddressSpace => {
                self.slots = Slots::Heap(vec![0; self.nodes + 1]);
            }
            #[cfg(feature = "xpmem")]
            PshmMechanism::CrossAttach => {
                self.slots = Slots::Xpmem {
                    segids: vec![-1; self.nodes + 1],
                    apids: vec![-1; self.nodes + 1],
                };
            }
        }
        Ok(())
    }

    /// Candidate directories for the uniqueness marker.
    fn marker_dirs(&self) -> Vec<PathBuf> {
        match self.mechanism {
            // The marker doubles as the ftok/file-name anchor, so it lives
            // in the job's temp directory.
            PshmMechanism::FileBacked | PshmMechanism::SysV => vec![std::env::temp_dir()],
            // POSIX names must be unique per *host*, so $TMPDIR (often
            // job-scoped) is deliberately not honored here.
            _ => {
                let mut dirs = vec![
                    PathBuf::from("/tmp"),
                    PathBuf::from("/var/tmp"),
                    PathBuf::from("/usr/tmp"),
                ];
                if cfg!(target_os = "linux") {
                    dirs.push(PathBuf::from("/dev/shm"));
                }
                dirs
            }
        }
    }

    /// Create (leader) or adopt (others) the uniqueness tag, then derive
    /// all slot names from it.
    fn make_unique(&mut self, unique: Option<&[u8; UNIQUE_LEN]>) -> Result<[u8; UNIQUE_LEN]> {
        let tag = match unique {
            None => {
                let mut last_errno = Errno::ENOTDIR;
                let mut found = None;
                for dir in self.marker_dirs() {
                    // O_CREAT|O_EXCL under the hood: the create is atomic,
                    // so two jobs can never derive the same tag.
                    let attempt = tempfile::Builder::new()
                        .prefix(NAME_PREFIX)
                        .rand_bytes(UNIQUE_LEN)
                        .tempfile_in(&dir)
                        .and_then(|f| f.keep().map_err(|e| e.error));
                    match attempt {
                        Ok((_file, path)) => {
                            found = Some(path);
                            break;
                        }
                        Err(e) => {
                            last_errno = Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO));
                        }
                    }
                }
                let path = match found {
                    Some(p) => p,
                    None if self.mechanism == PshmMechanism::PosixShm => {
                        // Last resort: hope the pid's low 24 bits are
                        // unique enough on this host. No marker file.
                        let pid = std::process::id();
                        let tag = format!("{:06x}", pid & 0xFF_FFFF);
                        let mut out = [0u8; UNIQUE_LEN];
                        out.copy_from_slice(tag.as_bytes());
                        self.derive_names(&out)?;
                        return Ok(out);
                    }
                    None => return Err(Error::NoUniqueName { errno: last_errno }),
                };
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default();
                let mut out = [0u8; UNIQUE_LEN];
                out.copy_from_slice(&name.as_bytes()[name.len() - UNIQUE_LEN..]);
                // Keep the marker until uniqueness is no longer required.
                self.marker = Some(path);
                out
            }
            Some(tag) => {
                if self.mechanism == PshmMechanism::SysV && self.marker.is_none() {
                    // Non-leaders must see the leader's marker: ftok hashes
                    // the inode, so the file itself anchors key agreement.
                    let path = std::env::temp_dir().join(format!(
                        "{NAME_PREFIX}{}",
                        std::str::from_utf8(tag)
                            .map_err(|_| Error::Internal("non-UTF8 unique tag".into()))?
                    ));
                    if let Err(e) = std::fs::OpenOptions::new().read(true).write(true).open(&path)
                    {
                        return Err(Error::MarkerMissing {
                            path: path.display().to_string(),
                            errno: Errno::from_raw(e.raw_os_error().unwrap_or(0)),
                        });
                    }
                    self.marker = Some(path);
                }
                *tag
            }
        };
        self.derive_names(&tag)?;
        Ok(tag)
    }

    /// Derive every slot's name/key from the host-unique tag.
    fn derive_names(&mut self, tag: &[u8; UNIQUE_LEN]) -> Result<()> {
        let tag_str = std::str::from_utf8(tag)
            .map_err(|_| Error::Internal("non-UTF8 unique tag".into()))?;
        match self.mechanism {
            PshmMechanism::PosixShm => {
                let names = (0..=self.nodes)
                    .map(|k| {
                        let d = base36_suffix(k);
                        format!(
                            "/{NAME_PREFIX}{tag_str}{}",
                            std::str::from_utf8(&d).expect("base36 digits are ASCII")
                        )
                    })
                    .collect();
                self.slots = Slots::Posix(names);
            }
            PshmMechanism::FileBacked => {
                let dir = std::env::temp_dir();
                let paths = (0..=self.nodes)
                    .map(|k| {
                        let d = base36_suffix(k);
                        dir.join(format!(
                            "{NAME_PREFIX}{tag_str}{}",
                            std::str::from_utf8(&d).expect("base36 digits are ASCII")
                        ))
                    })
                    .collect();
                self.slots = Slots::File(paths);
            }
            PshmMechanism::SysV => {
                let marker = self
                    .marker
                    .as_ref()
                    .ok_or_else(|| Error::Internal("SysV keys require the marker file".into()))?;
                let cpath = std::ffi::CString::new(marker.display().to_string())
                    .map_err(|_| Error::Internal("marker path contains NUL".into()))?;
                let mut keys: Vec<libc::key_t> = Vec::with_capacity(self.nodes + 1);
                for k in 0..=self.nodes {
                    // SAFETY: cpath is a valid NUL-terminated path.
                    let key = unsafe { libc::ftok(cpath.as_ptr(), (k + 1) as libc::c_int) };
                    if key == -1 {
                        return Err(Error::NoUniqueName {
                            errno: Errno::last(),
                        });
                    }
                    // ftok uses only the low 8 bits of the project id on
                    // many systems; verify we actually got distinct keys.
                    if let Some(first) = keys.iter().position(|&other| other == key) {
                        return Err(Error::DuplicateKey { first, second: k });
                    }
                    keys.push(key);
                }
                self.slots = Slots::SysV(keys);
            }
            _ => {
                return Err(Error::Internal(
                    "name derivation applies only to named mechanisms".into(),
                ))
            }
        }
        Ok(())
    }

    /// Create (as the slot's designated creator) or attach to the shared
    /// object behind `slot`, mapping it at `base` when given.
    ///
    /// A zero `size` is accepted only when `may_fail`; failures in
    /// may-fail contexts classify through the errno policy so probing can
    /// treat them as exhaustion, and any partially-created resource is
    /// unlinked before returning.
    pub(crate) fn map_slot(
        &mut self,
        slot: usize,
        base: Option<usize>,
        size: usize,
        may_fail: bool,
    ) -> std::result::Result<usize, MapFailure> {
        if size == 0 {
            if may_fail {
                return Err(MapFailure::Exhausted);
            }
            self.cleanup();
            return Err(MapFailure::Fatal(Error::ShmSetup {
                slot,
                size,
                errno: Errno::EINVAL,
            }));
        }
        let create = self.is_creator(slot);
        let res = match &self.slots {
            Slots::Posix(names) => {
                let name = names[slot].clone();
                self.map_posix(&name, create, base, size)
            }
            Slots::File(paths) => {
                let path = paths[slot].clone();
                self.map_file(&path, create, base, size)
            }
            Slots::SysV(keys) => {
                let key = keys[slot];
                self.map_sysv(key, create, base, size)
            }
            Slots::Heap(addrs) => {
                let published = addrs[slot];
                self.map_heap(slot, create, published, size)
            }
            #[cfg(feature = "xpmem")]
            Slots::Xpmem { segids, .. } => {
                let segid = segids[slot];
                self.map_xpmem(slot, create, segid, base, size)
            }
            Slots::Unset => Err(Errno::ENOENT),
        };
        match res {
            Ok(addr) => {
                if addr % page_size() != 0 {
                    self.cleanup();
                    return Err(MapFailure::Fatal(Error::UnalignedMapResult { addr }));
                }
                if let Some(want) = base {
                    if addr != want {
                        self.cleanup();
                        return Err(MapFailure::Fatal(Error::FixedMapMoved {
                            requested: want,
                            actual: addr,
                        }));
                    }
                }
                debug!(slot, size, addr, create, "shared object mapped");
                Ok(addr)
            }
            Err(errno) => {
                if create {
                    // Never leak a half-created named object.
                    self.unlink(slot);
                }
                if may_fail && self.policy.is_exhausted(errno) {
                    Err(MapFailure::Exhausted)
                } else {
                    if !may_fail {
                        self.cleanup();
                    }
                    Err(MapFailure::Fatal(Error::ShmSetup { slot, size, errno }))
                }
            }
        }
    }

    /// Attach to a co-located peer's already-published object. Never
    /// creates; failures are fatal.
    pub fn attach_remote(&mut self, slot: usize, size: usize) -> Result<usize> {
        debug_assert!(!self.is_creator(slot));
        match self.map_slot(slot, None, size, false) {
            Ok(addr) => Ok(addr),
            Err(MapFailure::Fatal(e)) => Err(e),
            Err(MapFailure::Exhausted) => Err(Error::ShmSetup {
                slot,
                size,
                errno: Errno::ENOMEM,
            }),
        }
    }

    fn map_posix(
        &self,
        name: &str,
        create: bool,
        base: Option<usize>,
        size: usize,
    ) -> std::result::Result<usize, Errno> {
        let mut oflag = OFlag::O_RDWR;
        if create {
            oflag |= OFlag::O_CREAT | OFlag::O_EXCL;
        }
        let mode = Mode::S_IRUSR | Mode::S_IWUSR;
        let fd = match mman::shm_open(name, oflag, mode) {
            Ok(fd) => fd,
            #[cfg(target_os = "macos")]
            Err(Errno::EEXIST) => {
                // Darwin transiently reports EEXIST for a name that is
                // mid-unlink; yield and retry a bounded number of times.
                let mut retries = 32;
                loop {
                    std::thread::yield_now();
                    match mman::shm_open(name, oflag, mode) {
                        Ok(fd) => break fd,
                        Err(Errno::EEXIST) if retries > 0 => retries -= 1,
                        Err(e) => return Err(e),
                    }
                }
            }
            Err(e) => return Err(e),
        };
        if create {
            nix::unistd::ftruncate(&fd, size as libc::off_t)?;
        }
        map_shared_fd(&fd, base, size)
    }

    fn map_file(
        &self,
        path: &Path,
        create: bool,
        base: Option<usize>,
        size: usize,
    ) -> std::result::Result<usize, Errno> {
        let mut opts = std::fs::OpenOptions::new();
        opts.read(true).write(true);
        if create {
            opts.create_new(true);
        }
        let file = opts
            .open(path)
            .map_err(|e| Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)))?;
        if create {
            nix::unistd::ftruncate(&file, size as libc::off_t)?;
        }
        map_shared_fd(&file, base, size)
    }

    fn map_sysv(
        &self,
        key: libc::key_t,
        create: bool,
        base: Option<usize>,
        size: usize,
    ) -> std::result::Result<usize, Errno> {
        let mut flags = 0o600;
        if create {
            flags |= libc::IPC_CREAT | libc::IPC_EXCL;
        }
        // SAFETY: plain syscall; create sizes the segment in one step.
        let id = unsafe { libc::shmget(key, size, flags) };
        if id == -1 {
            let errno = Errno::last();
            // shmget reports per-segment (SHMMAX) and total (SHMALL) size
            // limits as EINVAL/ENOSPC; both canonically mean exhausted.
            return Err(match errno {
                Errno::EINVAL | Errno::ENOSPC => Errno::ENOMEM,
                other => other,
            });
        }
        let want = base.unwrap_or(0) as *const libc::c_void;
        // SAFETY: id is a valid segment; shmat validates the address.
        let ptr = unsafe { libc::shmat(id, want, 0) };
        if ptr as isize == -1 {
            return Err(Errno::last());
        }
        Ok(ptr as usize)
    }

    fn map_heap(
        &mut self,
        slot: usize,
        create: bool,
        published: usize,
        size: usize,
    ) -> std::result::Result<usize, Errno> {
        if !create {
            // Same address space: the creator's allocation is ours too.
            return if published == 0 {
                Err(Errno::ENOENT)
            } else {
                Ok(published)
            };
        }
        let layout = Layout::from_size_align(size, page_size().max(CACHE_LINE_BYTES))
            .map_err(|_| Errno::EINVAL)?;
        // SAFETY: layout has nonzero size (checked by map_slot).
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(Errno::ENOMEM);
        }
        let addr = ptr as usize;
        self.heap_allocs[slot] = Some((addr, layout));
        if let Slots::Heap(addrs) = &mut self.slots {
            addrs[slot] = addr;
        }
        Ok(addr)
    }

    #[cfg(feature = "xpmem")]
    fn map_xpmem(
        &mut self,
        slot: usize,
        create: bool,
        segid: i64,
        base: Option<usize>,
        size: usize,
    ) -> std::result::Result<usize, Errno> {
        if create {
            let addr = base.and_then(NonZeroUsize::new);
            let len = NonZeroUsize::new(size).ok_or(Errno::EINVAL)?;
            let mut flags = MapFlags::MAP_SHARED;
            if base.is_some() {
                flags |= MapFlags::MAP_FIXED;
            }
            // SAFETY: anonymous shared mapping owned by this process.
            let ptr = unsafe {
                mman::mmap_anonymous(addr, len, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE, flags)
            }?;
            return Ok(ptr.as_ptr() as usize);
        }
        // SAFETY: segid was published by the creating process.
        let apid = unsafe {
            ffi::xpmem_get(
                segid,
                ffi::XPMEM_RDWR,
                ffi::XPMEM_PERMIT_MODE,
                std::ptr::null_mut(),
            )
        };
        if apid == -1 {
            return Err(Errno::last());
        }
        let at = ffi::xpmem_addr { apid, offset: 0 };
        // SAFETY: apid is a live access handle for at least `size` bytes.
        let ptr = unsafe {
            ffi::xpmem_attach(
                at,
                size,
                base.map_or(std::ptr::null_mut(), |b| b as *mut _),
            )
        };
        if ptr as isize == -1 {
            // SAFETY: apid came from xpmem_get above.
            unsafe { ffi::xpmem_release(apid) };
            return Err(Errno::last());
        }
        if let Slots::Xpmem { apids, .. } = &mut self.slots {
            apids[slot] = apid;
        }
        Ok(ptr as usize)
    }

    /// Remove this process's mapping of a region obtained from
    /// [`map_slot`](Self::map_slot). The OS-visible name is untouched.
    pub fn detach(&mut self, addr: usize, size: usize) -> Result<()> {
        match self.mechanism {
            PshmMechanism::SysV => {
                // SAFETY: addr was returned by shmat.
                if unsafe { libc::shmdt(addr as *const libc::c_void) } != 0 {
                    return Err(Error::UnmapFailed {
                        addr,
                        size,
                        errno: Errno::last(),
                    });
                }
                Ok(())
            }
            PshmMechanism::SameAddressSpace => {
                for entry in self.heap_allocs.iter_mut() {
                    if let Some((a, layout)) = *entry {
                        if a == addr {
                            // SAFETY: allocated by map_heap with this layout.
                            unsafe { std::alloc::dealloc(a as *mut u8, layout) };
                            *entry = None;
                            return Ok(());
                        }
                    }
                }
                // Attachers share the creator's allocation; nothing to free.
                Ok(())
            }
            _ => crate::mmap::unmap(addr, size),
        }
    }

    /// Detach a remote peer's region, releasing any per-attach handle the
    /// mechanism holds.
    pub fn detach_remote(&mut self, slot: usize, addr: usize, size: usize) -> Result<()> {
        #[cfg(feature = "xpmem")]
        if let Slots::Xpmem { apids, .. } = &mut self.slots {
            // SAFETY: addr was returned by xpmem_attach for this slot.
            unsafe {
                ffi::xpmem_detach(addr as *mut _);
            }
            if apids[slot] != -1 {
                // SAFETY: apid came from xpmem_get.
                unsafe { ffi::xpmem_release(apids[slot]) };
                apids[slot] = -1;
            }
            return Ok(());
        }
        let _ = slot;
        match self.mechanism {
            PshmMechanism::SameAddressSpace => Ok(()),
            _ => self.detach(addr, size),
        }
    }

    /// Remove the OS-visible name of `slot`, ignoring errors. Idempotent;
    /// live mappings are unaffected.
    pub fn unlink(&mut self, slot: usize) {
        match &self.slots {
            Slots::Posix(names) => {
                if let Some(name) = names.get(slot) {
                    let _ = mman::shm_unlink(name.as_str());
                }
            }
            Slots::File(paths) => {
                if let Some(path) = paths.get(slot) {
                    let _ = std::fs::remove_file(path);
                }
            }
            Slots::SysV(keys) => {
                if let Some(&key) = keys.get(slot) {
                    // SAFETY: querying an id for removal; errors ignored.
                    let id = unsafe { libc::shmget(key, 0, 0) };
                    if id != -1 {
                        // SAFETY: IPC_RMID with a null buf is the removal form.
                        unsafe { libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut()) };
                    }
                }
            }
            // No OS-visible name to remove.
            #[cfg(feature = "xpmem")]
            Slots::Xpmem { .. } => {}
            Slots::Heap(_) | Slots::Unset => {}
        }
    }

    /// Best-effort removal of every name this backend may have created,
    /// plus the uniqueness marker. Safe to call at any point after
    /// construction, any number of times, including from error paths.
    pub fn cleanup(&mut self) {
        if !matches!(self.slots, Slots::Unset) {
            for slot in 0..=self.nodes {
                self.unlink(slot);
            }
        }
        if let Some(marker) = self.marker.take() {
            let _ = std::fs::remove_file(marker);
        }
    }

    /// Create or attach the collective "vnet" bootstrap channel (the extra
    /// slot). Collective over the host group: the leader creates and
    /// publishes, everyone else attaches after the publish.
    pub fn map_vnet(&mut self, size: usize, coll: &dyn Collectives) -> Result<usize> {
        let vslot = self.nodes;
        let named = matches!(
            self.mechanism,
            PshmMechanism::PosixShm | PshmMechanism::FileBacked | PshmMechanism::SysV
        );

        let mut addr = 0usize;
        let mut tag = [0u8; UNIQUE_LEN];
        if self.my_node == 0 {
            if named && matches!(self.slots, Slots::Unset) {
                tag = self.make_unique(None)?;
            }
            addr = match self.map_slot(vslot, None, size, true) {
                Ok(a) => a,
                Err(MapFailure::Fatal(e)) => return Err(e),
                Err(MapFailure::Exhausted) => {
                    self.cleanup();
                    return Err(Error::ShmSetup {
                        slot: vslot,
                        size,
                        errno: Errno::ENOMEM,
                    });
                }
            };
        }

        // The leader's publish doubles as the create/attach ordering
        // barrier: nobody attaches before this broadcast completes.
        if named {
            let mut word =
                u64::from_ne_bytes([tag[0], tag[1], tag[2], tag[3], tag[4], tag[5], 0, 0]);
            broadcast_u64(coll, &mut word, 0)?;
            let bytes = word.to_ne_bytes();
            tag.copy_from_slice(&bytes[..UNIQUE_LEN]);
            if self.my_node != 0 && matches!(self.slots, Slots::Unset) {
                self.make_unique(Some(&tag))?;
            }
        } else {
            // Unnamed mechanisms publish the handle itself.
            let mut word = self.published_word(vslot, addr);
            broadcast_u64(coll, &mut word, 0)?;
            self.adopt_published_word(vslot, word);
        }

        if self.my_node != 0 {
            addr = match self.map_slot(vslot, None, size, true) {
                Ok(a) => a,
                Err(MapFailure::Fatal(e)) => return Err(e),
                Err(MapFailure::Exhausted) => {
                    self.cleanup();
                    return Err(Error::ShmSetup {
                        slot: vslot,
                        size,
                        errno: Errno::ENOMEM,
                    });
                }
            };
        }
        Ok(addr)
    }

    /// Publish this process's final segment so co-located peers can attach.
    ///
    /// Named mechanisms need nothing: the object name is the publication.
    /// XPMEM creates and host-exchanges segment ids; SameAddressSpace
    /// exchanges raw base addresses.
    pub fn export_segment(&mut self, base: usize, size: usize, coll: &dyn Collectives) -> Result<()> {
        match self.mechanism {
            #[cfg(feature = "xpmem")]
            PshmMechanism::CrossAttach => {
                // SAFETY: base/size delimit this process's live segment.
                let segid = unsafe {
                    ffi::xpmem_make(
                        base as *mut _,
                        size,
                        ffi::XPMEM_PERMIT_MODE,
                        0o600 as *mut _,
                    )
                };
                if segid == -1 {
                    tracing::warn!(errno = %Errno::last(), "xpmem_make failed");
                }
                if let Slots::Xpmem { segids, .. } = &mut self.slots {
                    segids[self.my_node] = segid;
                }
                self.exchange_published(coll)
            }
            PshmMechanism::SameAddressSpace => {
                let _ = size;
                if let Slots::Heap(addrs) = &mut self.slots {
                    addrs[self.my_node] = base;
                }
                self.exchange_published(coll)
            }
            _ => {
                let _ = (base, size);
                Ok(())
            }
        }
    }

    /// Host-local all-gather of the published per-slot words, built from
    /// the supernode broadcast primitive.
    fn exchange_published(&mut self, coll: &dyn Collectives) -> Result<()> {
        for m in 0..self.nodes {
            let mine = self.published_word(m, 0);
            let mut word = mine;
            broadcast_u64(coll, &mut word, m)?;
            self.adopt_published_word(m, word);
        }
        Ok(())
    }

    fn published_word(&self, slot: usize, fallback_addr: usize) -> u64 {
        match &self.slots {
            Slots::Heap(addrs) => {
                let a = addrs[slot];
                (if a != 0 { a } else { fallback_addr }) as u64
            }
            #[cfg(feature = "xpmem")]
            Slots::Xpmem { segids, .. } => segids[slot] as u64,
            _ => fallback_addr as u64,
        }
    }

    fn adopt_published_word(&mut self, slot: usize, word: u64) {
        match &mut self.slots {
            Slots::Heap(addrs) => addrs[slot] = word as usize,
            #[cfg(feature = "xpmem")]
            Slots::Xpmem { segids, .. } => segids[slot] = word as i64,
            _ => {}
        }
    }

    /// Test-only constructor with pre-derived backing file paths.
    #[cfg(test)]
    pub(crate) fn with_file_paths(my_node: usize, nodes: usize, paths: Vec<PathBuf>) -> Self {
        PshmBackend {
            mechanism: PshmMechanism::FileBacked,
            my_node,
            nodes,
            policy: ErrnoPolicy::native(),
            marker: None,
            slots: Slots::File(paths),
            heap_allocs: vec![None; nodes + 1],
        }
    }
}

impl Drop for PshmBackend {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Map `size` bytes of `fd` `MAP_SHARED`, optionally at a fixed base.
fn map_shared_fd<F: std::os::fd::AsFd>(
    fd: &F,
    base: Option<usize>,
    size: usize,
) -> std::result::Result<usize, Errno> {
    let len = NonZeroUsize::new(size).ok_or(Errno::EINVAL)?;
    let addr = base.and_then(NonZeroUsize::new);
    let mut flags = MapFlags::MAP_SHARED;
    if base.is_some() {
        flags |= MapFlags::MAP_FIXED;
    }
    // SAFETY: fd is a live descriptor sized to at least `size`; fixed
    // placement only targets ranges this process owns.
    let ptr = unsafe {
        mman::mmap(
            addr,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            flags,
            fd,
            0,
        )
    }?;
    Ok(ptr.as_ptr() as usize)
}

/// Three base-36 digits encoding a slot index; 46,656 distinct suffixes
/// even on case-insensitive filesystems.
pub(crate) fn base36_suffix(slot: usize) -> [u8; 3] {
    const TBL: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut digit = slot;
    let mut out = [0u8; 3];
    out[2] = TBL[digit % 36];
    digit /= 36;
    out[1] = TBL[digit % 36];
    digit /= 36;
    out[0] = TBL[digit % 36];
    out
}

/// [`MapOps`] over this process's own shared-object slot.
///
/// Probing through this adapter measures exactly what final attachment
/// will do: each map creates (and each unmap destroys) a real shared
/// object of the candidate size.
pub(crate) struct PshmMapOps<'a> {
    backend: &'a mut PshmBackend,
}

impl<'a> PshmMapOps<'a> {
    pub(crate) fn new(backend: &'a mut PshmBackend) -> Self {
        PshmMapOps { backend }
    }
}

impl MapOps for PshmMapOps<'_> {
    fn map(&mut self, size: usize) -> std::result::Result<usize, MapFailure> {
        let my = self.backend.my_node;
        self.backend.map_slot(my, None, size, true)
    }

    fn map_fixed(&mut self, addr: usize, size: usize) -> std::result::Result<(), MapFailure> {
        let my = self.backend.my_node;
        self.backend.map_slot(my, Some(addr), size, true).map(|_| ())
    }

    fn unmap(&mut self, addr: usize, size: usize) -> Result<()> {
        self.backend.detach(addr, size)?;
        let my = self.backend.my_node;
        self.backend.unlink(my);
        Ok(())
    }

    fn unlink_local(&mut self) {
        let my = self.backend.my_node;
        self.backend.unlink(my);
    }

    fn multi_fit_required(&self) -> bool {
        // Heap-backed "segments" consume no additional address space per
        // mapping, so concurrent-fit refinement is meaningless there.
        !matches!(self.backend.mechanism, PshmMechanism::SameAddressSpace)
    }

    fn recreate_on_trim(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn base36_suffixes_are_distinct() {
        let mut seen = HashSet::with_capacity(MAX_NAMED_SLOTS);
        for slot in 0..MAX_NAMED_SLOTS {
            let s = base36_suffix(slot);
            assert!(s.iter().all(|b| b.is_ascii_alphanumeric()));
            assert!(seen.insert(s), "suffix collision at slot {slot}");
        }
    }

    #[test]
    fn posix_names_share_one_prefix() {
        let mut b = PshmBackend::new(PshmMechanism::PosixShm, 0, 4).unwrap();
        b.derive_names(b"abc123").unwrap();
        let Slots::Posix(names) = &b.slots else {
            panic!("expected POSIX names");
        };
        assert_eq!(names.len(), 5);
        let prefix = "/SEGNTabc123";
        let mut seen = HashSet::new();
        for name in names {
            assert!(name.starts_with(prefix));
            assert_eq!(name.len(), prefix.len() + 3);
            assert!(seen.insert(name.clone()));
        }
    }

    #[test]
    fn creator_designation() {
        let leader = PshmBackend::new(PshmMechanism::SameAddressSpace, 0, 3).unwrap();
        assert!(leader.is_creator(0));
        assert!(!leader.is_creator(1));
        assert!(leader.is_creator(3), "leader owns the vnet slot");

        let other = PshmBackend::new(PshmMechanism::SameAddressSpace, 2, 3).unwrap();
        assert!(other.is_creator(2));
        assert!(!other.is_creator(0));
        assert!(!other.is_creator(3));
    }

    #[test]
    fn file_backend_round_trip_between_two_ranks() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<_> = (0..3).map(|k| dir.path().join(format!("seg{k}"))).collect();
        let size = 2 * page_size();

        let mut creator = PshmBackend::with_file_paths(0, 2, paths.clone());
        let addr = match creator.map_slot(0, None, size, false) {
            Ok(a) => a,
            Err(MapFailure::Fatal(e)) => panic!("create failed: {e}"),
            Err(MapFailure::Exhausted) => panic!("create exhausted"),
        };
        let payload = b"segment establishment round trip";
        // SAFETY: addr points at a fresh `size`-byte shared mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), addr as *mut u8, payload.len());
        }

        // A second simulated rank attaches to the published object.
        let mut attacher = PshmBackend::with_file_paths(1, 2, paths);
        let remote = attacher.attach_remote(0, size).unwrap();
        let seen = unsafe { std::slice::from_raw_parts(remote as *const u8, payload.len()) };
        assert_eq!(seen, payload);
        // Independent mappings of one object, not necessarily one address.
        attacher.detach(remote, size).unwrap();
        creator.detach(addr, size).unwrap();
    }

    #[test]
    fn unlink_and_detach_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<_> = (0..2).map(|k| dir.path().join(format!("seg{k}"))).collect();
        let size = page_size();

        let mut b = PshmBackend::with_file_paths(0, 1, paths);
        let addr = b.map_slot(0, None, size, false).map_err(|_| ()).unwrap();
        b.unlink(0);
        b.unlink(0); // second unlink: no name left, no effect
        b.detach(addr, size).unwrap();
        b.detach(addr, size).unwrap(); // page already unmapped; munmap is a no-op
        b.cleanup();
        b.cleanup();
    }

    #[test]
    fn zero_byte_request_fails_softly_only_when_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<_> = (0..2).map(|k| dir.path().join(format!("seg{k}"))).collect();
        let mut b = PshmBackend::with_file_paths(0, 1, paths);
        assert!(matches!(
            b.map_slot(0, None, 0, true),
            Err(MapFailure::Exhausted)
        ));
        assert!(matches!(
            b.map_slot(0, None, 0, false),
            Err(MapFailure::Fatal(Error::ShmSetup { size: 0, .. }))
        ));
    }

    #[test]
    fn create_failure_unlinks_partial_resource() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nodir");
        // Paths under a nonexistent directory: create fails after zero
        // progress, and nothing may be left behind.
        let paths = vec![missing.join("a"), missing.join("b")];
        let mut b = PshmBackend::with_file_paths(0, 1, paths);
        assert!(b.map_slot(0, None, page_size(), false).is_err());
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn marker_creation_and_cleanup() {
        let mut b = PshmBackend::new(PshmMechanism::FileBacked, 0, 2).unwrap();
        let tag = b.make_unique(None).unwrap();
        assert!(tag.iter().all(|c| c.is_ascii()));
        let marker = b.marker.clone().expect("leader keeps the marker");
        assert!(marker.exists());
        let Slots::File(paths) = &b.slots else {
            panic!("expected file paths");
        };
        assert_eq!(paths.len(), 3);
        b.cleanup();
        assert!(!marker.exists(), "cleanup removes the marker");
    }

    #[test]
    fn heap_backend_publishes_and_frees() {
        let mut b = PshmBackend::new(PshmMechanism::SameAddressSpace, 0, 1).unwrap();
        b.slots = Slots::Heap(vec![0; 2]);
        let size = page_size();
        let addr = b.map_slot(0, None, size, false).map_err(|_| ()).unwrap();
        assert_eq!(addr % CACHE_LINE_BYTES, 0);
        // The creator's address is published for same-address-space peers.
        let Slots::Heap(addrs) = &b.slots else {
            panic!()
        };
        assert_eq!(addrs[0], addr);
        b.detach(addr, size).unwrap();
        b.detach(addr, size).unwrap(); // idempotent
    }
}
