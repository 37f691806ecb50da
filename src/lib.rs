//! # segnet
//!
//! Distributed shared-segment establishment for a parallel communication
//! runtime.
//!
//! Every process in a parallel job needs one large, page-aligned
//! virtual-memory region (the *segment*) for zero-copy remote-memory
//! operations. This crate provides the machinery that discovers, sizes,
//! aligns, and maps that region, plus the process-shared-memory (PSHM)
//! layer that lets co-located processes map each other's segments
//! directly:
//!
//! - **Probing** ([`probe_segment`]): find the largest mappable region
//!   under unknown OS limits
//! - **Coordination** ([`SegmentContext::mmap_limit`]): negotiate one
//!   size that every process can map, honoring per-process and per-host
//!   ceilings
//! - **Attachment** ([`SegmentContext::segment_attach`]): final
//!   placement, optional cross-node address alignment, heap-collision
//!   avoidance, and cross-mapping of co-located peers' segments
//! - **Auxiliary carve-out** ([`SegmentContext::register_auxseg`]):
//!   runtime-private sub-regions handed to internal subsystems
//!
//! The crate consumes the job's bootstrap collectives through the
//! [`Collectives`] trait and never performs network communication itself.
//!
//! ## Quick Start
//!
//! ```no_run
//! use segnet::{Collectives, SegmentConfig, SegmentContext, Topology};
//!
//! // A single-process job needs only trivial collectives.
//! struct Solo;
//! impl Collectives for Solo {
//!     fn exchange(&self, local: &[u8], all: &mut [u8]) -> segnet::Result<()> {
//!         all.copy_from_slice(local);
//!         Ok(())
//!     }
//!     fn barrier(&self) -> segnet::Result<()> {
//!         Ok(())
//!     }
//!     fn supernode_broadcast(&self, _buf: &mut [u8], _root: usize) -> segnet::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> segnet::Result<()> {
//!     let topo = Topology::new(0, vec![0])?;
//!     let mut ctx = SegmentContext::new(SegmentConfig::default(), topo)?;
//!     let limit = ctx.mmap_limit(&Solo, None, None)?;
//!     ctx.segment_init(&Solo, limit)?;
//!     let request = ctx.max_global_segment_size() / 2;
//!     ctx.segment_attach(&Solo, request, 0)?;
//!     let seg = ctx.segment_table()[0];
//!     println!("segment at {:#x}, {} bytes", seg.addr, seg.size);
//!     Ok(())
//! }
//! ```
//!
//! ## Failure Model
//!
//! Establishment is fail-fast: recoverable map failures drive the
//! internal search loops and never surface, while any returned
//! [`Error`] means the job has no safe partial state and should abort.
//! Named OS objects (shared-memory names, keys, marker files) are
//! unlinked on every path, including error paths and [`Drop`].

#![warn(missing_docs)]
#![warn(clippy::all)]
// Allow certain pedantic lints for existing code
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]

mod align;
mod attach;
mod auxseg;
mod collective;
mod coordinate;
mod error;
mod mmap;
mod probe;
mod pshm;
pub mod slurm;
mod topology;

pub use align::{page_size, CACHE_LINE_BYTES, PLATFORM_MAP_CEILING};
pub use auxseg::{AuxsegClient, AuxsegRequest};
pub use collective::{bruck_concat, Collectives, RankMessaging};
pub use error::{Error, Result};
pub use mmap::{ErrnoPolicy, MapFailure, MapOps, RetryPolicy, SystemMapOps};
pub use probe::{probe_segment, ProbeStrategy, DEFAULT_PROBE_GRANULARITY};
pub use pshm::{PshmBackend, PshmMechanism, MAX_NAMED_SLOTS};
pub use topology::Topology;

use tracing::debug;

use crate::attach::InitState;
use crate::auxseg::AuxsegRegistry;
use crate::pshm::PshmMapOps;

/// A contiguous page-aligned virtual-memory region.
///
/// Invariant: `addr` and `size` are both multiples of the page size. A
/// region is replaced, never mutated, when trimmed or re-mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Base address.
    pub addr: usize,
    /// Length in bytes.
    pub size: usize,
}

impl SegmentInfo {
    /// The empty region.
    pub const EMPTY: SegmentInfo = SegmentInfo { addr: 0, size: 0 };

    /// Whether this region is empty.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// One past the last byte.
    pub fn end(&self) -> usize {
        self.addr + self.size
    }
}

/// Policy knobs for segment establishment.
///
/// These mirror decisions the surrounding runtime fixes once per build or
/// per job; nothing here adapts at runtime.
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    /// Shared-object mechanism for co-located segment access, or `None`
    /// for process-private anonymous memory only.
    pub mechanism: Option<PshmMechanism>,
    /// Require the segment to occupy the identical virtual base on every
    /// node.
    pub aligned_segments: bool,
    /// Place the segment at the high end of the discovered window
    /// (otherwise the low end).
    pub use_high_segment: bool,
    /// Put the client-visible segment at the segment base and the
    /// auxiliary region on top (otherwise auxiliary space sits at the
    /// base, where a client overflow cannot reach it).
    pub client_at_base: bool,
    /// Probe search strategy.
    pub probe_strategy: ProbeStrategy,
    /// Bracket width at which the probe stops refining.
    pub probe_granularity: usize,
    /// Retry policy for fixed-address maps.
    pub retry: RetryPolicy,
    /// Safety cap on concurrent-fit refinement rounds.
    pub max_fit_rounds: usize,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        SegmentConfig {
            mechanism: None,
            aligned_segments: false,
            use_high_segment: true,
            client_at_base: false,
            probe_strategy: ProbeStrategy::Binary,
            probe_granularity: DEFAULT_PROBE_GRANULARITY,
            retry: RetryPolicy::default(),
            max_fit_rounds: 8,
        }
    }
}

/// Run `f` against the mapping backend this context is configured with.
fn with_ops<R>(
    pshm: &mut Option<PshmBackend>,
    f: impl FnOnce(&mut dyn MapOps) -> R,
) -> R {
    match pshm.as_mut() {
        Some(backend) => f(&mut PshmMapOps::new(backend)),
        None => f(&mut SystemMapOps::new(ErrnoPolicy::native())),
    }
}

/// Process-wide segment establishment state.
///
/// One context is created by the runtime's initialization sequence and
/// driven through its phases in order:
///
/// 1. [`mmap_limit`](Self::mmap_limit) — coordinated size discovery
/// 2. [`segment_init`](Self::segment_init) — window probing and geometry
///    exchange
/// 3. [`segment_attach`](Self::segment_attach) — final placement and
///    peer cross-mapping
///
/// All three are collective: every process of the job must call them in
/// the same order with the same arguments. After attachment the final
/// geometry is available from the query methods.
///
/// Teardown ([`cleanup`](Self::cleanup), also run on [`Drop`]) is
/// idempotent and callable from any partially-initialized state, so
/// fatal-error paths can always invoke it.
#[derive(Debug)]
pub struct SegmentContext {
    cfg: SegmentConfig,
    topo: Topology,
    pshm: Option<PshmBackend>,
    auxseg: AuxsegRegistry,
    init: Option<InitState>,
    my_heap_end: usize,
    max_local: usize,
    max_global: usize,
    seginfo: Vec<SegmentInfo>,
    client_seg: Vec<SegmentInfo>,
    aux_seg: Vec<SegmentInfo>,
    offsets: Vec<isize>,
    vnet: Option<SegmentInfo>,
    attached: bool,
}

impl SegmentContext {
    /// Build a context for this process's position in the job.
    pub fn new(cfg: SegmentConfig, topo: Topology) -> Result<Self> {
        let pshm = match cfg.mechanism {
            Some(mechanism) => Some(PshmBackend::new(
                mechanism,
                topo.host_rank(),
                topo.host_size(),
            )?),
            None => None,
        };
        let nranks = topo.nranks();
        Ok(SegmentContext {
            cfg,
            topo,
            pshm,
            auxseg: AuxsegRegistry::new(),
            init: None,
            my_heap_end: 0,
            max_local: 0,
            max_global: 0,
            seginfo: Vec::new(),
            client_seg: Vec::new(),
            aux_seg: Vec::new(),
            offsets: vec![0; nranks],
            vnet: None,
            attached: false,
        })
    }

    /// The job topology this context was built for.
    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    fn ensure_names(&mut self, coll: &dyn Collectives) -> Result<()> {
        if let Some(backend) = &mut self.pshm {
            backend.setup_names(coll)?;
        }
        Ok(())
    }

    /// Create or attach the collective "vnet" bootstrap channel shared by
    /// this host's ranks, returning its local base address.
    ///
    /// Collective over the host group; shared-object configurations only.
    pub fn bootstrap_vnet(&mut self, size: usize, coll: &dyn Collectives) -> Result<usize> {
        let backend = self.pshm.as_mut().ok_or_else(|| {
            Error::Internal("vnet bootstrap requires a shared-object mechanism".into())
        })?;
        let addr = backend.map_vnet(size, coll)?;
        self.vnet = Some(SegmentInfo { addr, size });
        Ok(addr)
    }

    /// Compute the per-process size every process can map, honoring
    /// `local_limit` (per process) and `shared_limit` (per host group).
    ///
    /// Collective. Co-located ranks probe sequentially, results are
    /// averaged per host, and shared-object builds additionally verify
    /// that all co-located segments fit simultaneously.
    pub fn mmap_limit(
        &mut self,
        coll: &dyn Collectives,
        local_limit: Option<usize>,
        shared_limit: Option<u64>,
    ) -> Result<usize> {
        self.ensure_names(coll)?;
        let limit = with_ops(&mut self.pshm, |ops| {
            coordinate::mmap_limit(
                ops,
                &self.topo,
                coll,
                local_limit,
                shared_limit,
                &self.cfg,
            )
        })?;
        Ok(limit)
    }

    /// Probe the local window at `limit` and exchange segment geometry
    /// job-wide, establishing the advertised maximum segment sizes.
    ///
    /// Collective. `limit` normally comes from
    /// [`mmap_limit`](Self::mmap_limit); an uncoordinated limit can fail
    /// in surprising ways once every process maps simultaneously.
    pub fn segment_init(&mut self, coll: &dyn Collectives, limit: usize) -> Result<()> {
        if self.init.is_some() {
            return Err(Error::Internal("segment_init called twice".into()));
        }
        self.ensure_names(coll)?;
        let aux_total = self.auxseg.preinit();
        let init = with_ops(&mut self.pshm, |ops| {
            attach::segment_init(ops, &self.topo, coll, limit, &self.cfg)
        })?;
        if aux_total > 0 {
            self.auxseg.check_fits(init.max_global)?;
        }
        // The auxiliary reservation comes out of what clients may request.
        self.max_local = init.max_local.saturating_sub(aux_total);
        self.max_global = init.max_global.saturating_sub(aux_total);
        self.my_heap_end = init.my_heap_end;
        self.init = Some(init);
        debug!(
            max_local = self.max_local,
            max_global = self.max_global,
            "segment sizes advertised"
        );
        Ok(())
    }

    /// Largest client segment this process can provide. Valid after
    /// [`segment_init`](Self::segment_init).
    pub fn max_local_segment_size(&self) -> usize {
        self.max_local
    }

    /// Largest client segment every process can provide. Valid after
    /// [`segment_init`](Self::segment_init).
    pub fn max_global_segment_size(&self) -> usize {
        self.max_global
    }

    /// Register an auxiliary-space client. Must run before
    /// [`segment_init`](Self::segment_init) collects size requirements.
    pub fn register_auxseg(&mut self, client: Box<dyn AuxsegClient>) -> Result<()> {
        self.auxseg.register(client)
    }

    /// Map the final segment of `client_segsize` bytes (plus the
    /// auxiliary reservation), cross-map co-located peers, and publish
    /// the job-wide geometry.
    ///
    /// Collective. `min_heap_offset` keeps the segment at least that many
    /// bytes above the heap end.
    pub fn segment_attach(
        &mut self,
        coll: &dyn Collectives,
        client_segsize: usize,
        min_heap_offset: usize,
    ) -> Result<()> {
        let init = self
            .init
            .take()
            .ok_or_else(|| Error::Internal("segment_attach before segment_init".into()))?;
        let full_request = self
            .auxseg
            .preattach(align::page_align_up(client_segsize));

        let out = with_ops(&mut self.pshm, |ops| {
            attach::attach_local(
                ops,
                &self.topo,
                coll,
                &init,
                full_request,
                min_heap_offset,
                &self.cfg,
            )
        })?;

        self.offsets = match self.pshm.as_mut() {
            Some(backend) => attach::cross_map_peers(
                backend,
                &self.topo,
                coll,
                &out.seginfo,
                init.my_heap_end,
                min_heap_offset,
            )?,
            None => vec![0; self.topo.nranks()],
        };

        let (client_table, aux_table) = self.auxseg.attach(&out.seginfo, self.cfg.client_at_base);
        self.seginfo = out.seginfo;
        self.client_seg = client_table;
        self.aux_seg = aux_table;
        self.attached = true;
        debug!(
            addr = out.my_segment.addr,
            size = out.my_segment.size,
            "segment attached"
        );
        Ok(())
    }

    /// Degenerate whole-address-space attachment: every byte of process
    /// memory is "the segment", so only the auxiliary region is
    /// established — heap-allocated and exchanged via the self-performed
    /// ring collective over `msg`.
    pub fn segment_attach_everything(&mut self, msg: &dyn RankMessaging) -> Result<()> {
        self.auxseg.preinit();
        let nranks = self.topo.nranks();
        let everything = SegmentInfo {
            addr: 0,
            size: usize::MAX,
        };
        self.seginfo = vec![everything; nranks];
        self.client_seg = vec![everything; nranks];
        self.aux_seg = self
            .auxseg
            .attach_everything(msg, self.topo.rank(), nranks)?;
        self.offsets = vec![0; nranks];
        self.attached = true;
        Ok(())
    }

    /// Per-rank `{base, size}` of the client-visible segment. Valid after
    /// attachment.
    pub fn segment_table(&self) -> &[SegmentInfo] {
        &self.client_seg
    }

    /// Per-rank `{base, size}` of the runtime-private auxiliary region.
    pub fn aux_table(&self) -> &[SegmentInfo] {
        &self.aux_seg
    }

    /// Per-rank `{base, size}` of the full segment (client plus
    /// auxiliary).
    pub fn full_table(&self) -> &[SegmentInfo] {
        &self.seginfo
    }

    /// Offset to add to `rank`'s published addresses to obtain a pointer
    /// valid in this process. Zero for self, for non-co-located peers,
    /// and for configurations without a shared-object mechanism.
    pub fn peer_offset(&self, rank: usize) -> isize {
        self.offsets.get(rank).copied().unwrap_or(0)
    }

    /// Whether attachment has completed.
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// The vnet bootstrap channel mapped by
    /// [`bootstrap_vnet`](Self::bootstrap_vnet), if any.
    pub fn vnet_region(&self) -> Option<SegmentInfo> {
        self.vnet
    }

    /// Best-effort removal of every named OS resource this context may
    /// have created. Idempotent; safe from any partially-initialized
    /// state, including fatal-error paths.
    pub fn cleanup(&mut self) {
        if let Some(backend) = &mut self.pshm {
            backend.cleanup();
        }
    }
}

impl Drop for SegmentContext {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::sim::sim_job;

    #[test]
    fn context_lifecycle_without_colocation() {
        // Two single-rank hosts over real anonymous memory, kept small.
        let host_of = vec![0usize, 1];
        let handles: Vec<_> = sim_job(host_of.clone())
            .into_iter()
            .enumerate()
            .map(|(rank, coll)| {
                let host_of = host_of.clone();
                std::thread::spawn(move || {
                    let topo = Topology::new(rank, host_of).unwrap();
                    let cfg = SegmentConfig {
                        probe_granularity: page_size(),
                        ..SegmentConfig::default()
                    };
                    let mut ctx = SegmentContext::new(cfg, topo).unwrap();
                    let limit = ctx.mmap_limit(&coll, Some(64 * page_size()), None).unwrap();
                    assert_eq!(limit, 64 * page_size());
                    ctx.segment_init(&coll, limit).unwrap();
                    assert!(ctx.max_global_segment_size() > 0);
                    let request = 16 * page_size();
                    ctx.segment_attach(&coll, request, 0).unwrap();
                    assert!(ctx.is_attached());
                    let my = ctx.segment_table()[ctx.topology().rank()];
                    assert_eq!(my.size, request);
                    assert_eq!(my.addr % page_size(), 0);
                    assert_eq!(ctx.peer_offset(1 - ctx.topology().rank()), 0);
                    // The mapped segment must be usable memory.
                    unsafe { std::ptr::write_volatile(my.addr as *mut u8, 0x5A) };
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn everything_mode_skips_mapping() {
        let fabrics = crate::collective::sim::sim_fabric(2);
        let handles: Vec<_> = fabrics
            .into_iter()
            .enumerate()
            .map(|(rank, fabric)| {
                std::thread::spawn(move || {
                    let topo = Topology::new(rank, vec![0, 1]).unwrap();
                    let mut ctx =
                        SegmentContext::new(SegmentConfig::default(), topo).unwrap();
                    ctx.segment_attach_everything(&fabric).unwrap();
                    assert!(ctx.is_attached());
                    assert_eq!(ctx.segment_table()[rank].size, usize::MAX);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn cleanup_is_safe_before_any_collective_ran() {
        let topo = Topology::new(0, vec![0]).unwrap();
        let cfg = SegmentConfig {
            mechanism: Some(PshmMechanism::FileBacked),
            ..SegmentConfig::default()
        };
        let mut ctx = SegmentContext::new(cfg, topo).unwrap();
        ctx.cleanup();
        ctx.cleanup();
        // Drop runs cleanup a third time.
    }
}
