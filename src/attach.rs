//! Final segment placement and cross-process mapping.
//!
//! Attachment happens in two collective steps. `segment_init` probes the
//! local window at the coordinated limit and exchanges every process's
//! window and heap end, deriving the job-wide bounding box and the
//! advertised maximum segment sizes. `attach_local` then converts a
//! requested size into the final mapped segment: placement (optionally at
//! one job-wide common base), heap-collision avoidance, and trimming by
//! unmap plus fixed re-map. For shared-object builds, `cross_map_peers`
//! finally attaches every co-located peer's segment and records the
//! per-peer address offsets that make them directly addressable.

use tracing::{debug, warn};

use crate::align::{heap_end, page_align_down, page_size, PLATFORM_MAP_CEILING};
use crate::collective::{exchange_words, Collectives};
use crate::error::{Error, Result};
use crate::mmap::{map_fixed_with_retry, MapOps};
use crate::probe::probe_segment;
use crate::pshm::PshmBackend;
use crate::topology::Topology;
use crate::{SegmentConfig, SegmentInfo};

/// One process's contribution to a segment exchange: its window plus one
/// context-dependent word (heap end during init, requested size during
/// attach).
#[derive(Debug, Clone, Copy)]
pub(crate) struct SegmentExchangeRecord {
    pub info: SegmentInfo,
    pub word: u64,
}

impl SegmentExchangeRecord {
    fn encode(&self) -> [u64; 3] {
        [self.info.addr as u64, self.info.size as u64, self.word]
    }

    fn decode_all(words: &[u64]) -> Vec<SegmentExchangeRecord> {
        words
            .chunks_exact(3)
            .map(|c| SegmentExchangeRecord {
                info: SegmentInfo {
                    addr: c[0] as usize,
                    size: c[1] as usize,
                },
                word: c[2],
            })
            .collect()
    }
}

/// Exchange one record per rank, in rank order.
fn exchange_records(
    coll: &dyn Collectives,
    nranks: usize,
    rec: SegmentExchangeRecord,
) -> Result<Vec<SegmentExchangeRecord>> {
    let words = exchange_words(coll, nranks, &rec.encode())?;
    Ok(SegmentExchangeRecord::decode_all(&words))
}

/// Aggregates of every rank's window, used for aligned placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ClusterSegmentBounds {
    /// Highest window base across ranks: the only base inside everyone's
    /// window, if any.
    pub max_base: usize,
    /// Lowest window end across ranks.
    pub min_end: usize,
    /// Highest heap end across ranks.
    pub max_heap_end: usize,
    /// Smallest window size across ranks.
    pub min_size: usize,
}

impl ClusterSegmentBounds {
    pub(crate) fn compute(records: &[SegmentExchangeRecord]) -> Self {
        let mut bounds = ClusterSegmentBounds {
            max_base: 0,
            min_end: usize::MAX,
            max_heap_end: 0,
            min_size: usize::MAX,
        };
        for r in records {
            bounds.max_base = bounds.max_base.max(r.info.addr);
            bounds.min_end = bounds.min_end.min(r.info.addr + r.info.size);
            bounds.max_heap_end = bounds.max_heap_end.max(r.word as usize);
            bounds.min_size = bounds.min_size.min(r.info.size);
        }
        bounds
    }

    /// Whether a common base exists inside every window.
    pub(crate) fn overlaps(&self) -> bool {
        self.max_base < self.min_end
    }
}

/// Everything `segment_init` learns, consumed later by `attach_local`.
#[derive(Debug, Clone)]
pub(crate) struct InitState {
    /// This process's probed window (still mapped).
    pub segment: SegmentInfo,
    /// This process's heap end at init time.
    pub my_heap_end: usize,
    /// Job-wide window aggregates.
    pub bounds: ClusterSegmentBounds,
    /// Largest segment this process can offer.
    pub max_local: usize,
    /// Largest segment every process can offer.
    pub max_global: usize,
}

/// Probe the local window at `limit` and exchange geometry job-wide.
///
/// Collective. The probe window stays mapped; `attach_local` consumes it.
pub(crate) fn segment_init(
    ops: &mut dyn MapOps,
    topo: &Topology,
    coll: &dyn Collectives,
    limit: usize,
    cfg: &SegmentConfig,
) -> Result<InitState> {
    let limit = page_align_down(limit.min(PLATFORM_MAP_CEILING));
    let segment = probe_segment(ops, limit, cfg.probe_strategy, cfg.probe_granularity, &cfg.retry)?;
    debug!(addr = segment.addr, size = segment.size, "local probe window");

    let my_heap_end = heap_end()?;
    let records = exchange_records(
        coll,
        topo.nranks(),
        SegmentExchangeRecord {
            info: segment,
            word: my_heap_end as u64,
        },
    )?;
    let bounds = ClusterSegmentBounds::compute(&records);

    let (max_local, max_global) = if cfg.aligned_segments {
        warn_if_va_randomized(topo);
        if !bounds.overlaps() {
            // Address-space layout differences left no window common to
            // all ranks. Detectable but not correctable here.
            warn!(
                max_base = bounds.max_base,
                min_end = bounds.min_end,
                "unable to locate overlapping windows for aligned segments"
            );
            (0, 0)
        } else {
            (
                segment.addr + segment.size - bounds.max_base,
                bounds.min_end - bounds.max_base,
            )
        }
    } else {
        (segment.size, bounds.min_size)
    };

    debug!(max_local, max_global, "segment geometry exchanged");
    debug_assert_eq!(max_local % page_size(), 0);
    debug_assert_eq!(max_global % page_size(), 0);
    debug_assert!(max_global <= max_local);

    Ok(InitState {
        segment,
        my_heap_end,
        bounds,
        max_local,
        max_global,
    })
}

/// Warn when the kernel randomizes address-space layout under a
/// configuration that needs congruent layouts across nodes.
fn warn_if_va_randomized(topo: &Topology) {
    if topo.nranks() < 2 || !cfg!(target_os = "linux") {
        return;
    }
    if let Ok(contents) = std::fs::read_to_string("/proc/sys/kernel/randomize_va_space") {
        if contents.trim() != "0" {
            warn!(
                "kernel address-space randomization is enabled; \
                 aligned segments are likely to fail at scale"
            );
        }
    }
}

/// Shift and shrink a candidate placement away from the heap.
///
/// If the candidate would start within `min_heap_offset` of `top_of_heap`
/// while extending above it, it is moved up to exactly
/// `top_of_heap + min_heap_offset` and shrunk to fit the remainder of the
/// window. A window too small for any positive size is fatal.
pub(crate) fn place_segment(
    window: SegmentInfo,
    candidate_base: usize,
    segsize: usize,
    top_of_heap: usize,
    min_heap_offset: usize,
) -> Result<SegmentInfo> {
    let mut segbase = candidate_base;
    let mut segsize = segsize;
    let end_of_window = window.addr + window.size;

    // In the heap's growth path and too close to it?
    if segbase + segsize > top_of_heap && top_of_heap + min_heap_offset > segbase {
        segbase = top_of_heap + min_heap_offset;
        if segbase >= end_of_window {
            return Err(Error::HeapOffsetTooLarge);
        }
        let max_fit = end_of_window - segbase;
        if segsize > max_fit {
            warn!(
                requested = segsize,
                granted = max_fit,
                "reducing segment size to honor the heap offset"
            );
            segsize = max_fit;
        }
    }
    Ok(SegmentInfo {
        addr: segbase,
        size: segsize,
    })
}

/// The result of local attachment: the final per-rank segment table.
#[derive(Debug)]
pub(crate) struct AttachOutcome {
    /// Final `{base, size}` of every rank's segment, in rank order.
    pub seginfo: Vec<SegmentInfo>,
    /// This process's entry of `seginfo`.
    pub my_segment: SegmentInfo,
}

/// Convert the agreed `segsize` into the final mapped segment and
/// exchange the result job-wide.
///
/// Collective. Consumes the probe window held by `init`.
pub(crate) fn attach_local(
    ops: &mut dyn MapOps,
    topo: &Topology,
    coll: &dyn Collectives,
    init: &InitState,
    segsize: usize,
    min_heap_offset: usize,
    cfg: &SegmentConfig,
) -> Result<AttachOutcome> {
    debug_assert_eq!(segsize % page_size(), 0);
    let window = init.segment;
    if segsize > window.size {
        return Err(Error::Internal(format!(
            "requested segment size {segsize} exceeds the probed window ({})",
            window.size
        )));
    }

    // Placement policy: one common base job-wide when alignment is
    // required, otherwise a per-process end of the local window.
    let (candidate_base, top_of_heap) = if cfg.aligned_segments {
        let base = if cfg.use_high_segment {
            // Requested sizes may differ across ranks; placing as high as
            // possible while staying aligned needs a second exchange.
            let records = exchange_records(
                coll,
                topo.nranks(),
                SegmentExchangeRecord {
                    info: window,
                    word: segsize as u64,
                },
            )?;
            let mut min_start = usize::MAX;
            for r in &records {
                let start = (r.info.addr + r.info.size).saturating_sub(r.word as usize);
                if start < init.bounds.max_base {
                    return Err(Error::BaseOutsideWindow {
                        base: start,
                        lo: init.bounds.max_base,
                        hi: init.bounds.min_end,
                    });
                }
                min_start = min_start.min(start);
            }
            min_start
        } else {
            init.bounds.max_base
        };
        (base, init.bounds.max_heap_end)
    } else {
        let base = if cfg.use_high_segment {
            window.addr + window.size - segsize
        } else {
            window.addr
        };
        (base, init.my_heap_end)
    };

    let my_segment = if segsize == 0 {
        // No segment requested; release the window and publish empty.
        if !window.is_empty() {
            ops.unmap(window.addr, window.size)?;
        }
        SegmentInfo::EMPTY
    } else {
        let placed = place_segment(window, candidate_base, segsize, top_of_heap, min_heap_offset)?;
        let trim = ops.recreate_on_trim() || placed != window;
        if trim {
            if placed.addr < window.addr || placed.addr + placed.size > window.addr + window.size {
                return Err(Error::BaseOutsideWindow {
                    base: placed.addr,
                    lo: window.addr,
                    hi: window.addr + window.size,
                });
            }
            ops.unmap(window.addr, window.size)?;
            map_fixed_with_retry(&cfg.retry, placed.addr, placed.size, |a, s| {
                ops.map_fixed(a, s)
            })?;
        }
        placed
    };
    debug!(
        addr = my_segment.addr,
        size = my_segment.size,
        "final local segment"
    );

    // Publish final geometry.
    let records = exchange_records(
        coll,
        topo.nranks(),
        SegmentExchangeRecord {
            info: my_segment,
            word: 0,
        },
    )?;
    let seginfo: Vec<SegmentInfo> = records.iter().map(|r| r.info).collect();

    if cfg.aligned_segments && segsize > 0 {
        for (rank, si) in seginfo.iter().enumerate() {
            if si.size != 0 && si.addr != my_segment.addr {
                return Err(Error::AlignmentViolated {
                    rank,
                    actual: si.addr,
                    expected: my_segment.addr,
                });
            }
        }
    }

    Ok(AttachOutcome {
        seginfo,
        my_segment,
    })
}

/// Attach every co-located peer's segment through the shared-object
/// backend, returning this process's address offset per rank (0 for
/// non-co-located peers and for self).
///
/// Collective over the host group. On return all named objects have been
/// unlinked, bracketed by barriers so a crash at any point cannot leak
/// them.
pub(crate) fn cross_map_peers(
    backend: &mut PshmBackend,
    topo: &Topology,
    coll: &dyn Collectives,
    seginfo: &[SegmentInfo],
    my_heap_end: usize,
    min_heap_offset: usize,
) -> Result<Vec<isize>> {
    let mut offsets = vec![0isize; topo.nranks()];
    let me = topo.rank();
    backend.export_segment(seginfo[me].addr, seginfo[me].size, coll)?;

    for (slot, &node) in topo.host_members().iter().enumerate() {
        if node == me || seginfo[node].size == 0 {
            continue;
        }
        let size = seginfo[node].size;
        let base = backend.attach_remote(slot, size)?;
        debug_assert_eq!(base % page_size(), 0);
        debug_assert_eq!(size % page_size(), 0);
        if base >= my_heap_end && base < my_heap_end + min_heap_offset {
            return Err(Error::RemoteHeapOffsetTooLarge);
        }
        offsets[node] = base as isize - seginfo[node].addr as isize;
        debug!(node, base, offset = offsets[node], "mapped remote segment");
    }

    // Barrier #1: all attaches complete before unlinking. Barrier #2:
    // unlinking completes before return, so crashes cannot leak objects.
    coll.barrier()?;
    backend.cleanup();
    coll.barrier()?;
    Ok(offsets)
}
