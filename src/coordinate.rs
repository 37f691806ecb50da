//! Coordinated discovery of one segment size every process can map.
//!
//! A size that probes successfully on one process is not automatically
//! usable job-wide: co-located processes compete for the same physical
//! memory and, under shared-object backends, for the same address-space
//! budget. The coordinator clamps the platform ceiling to caller limits,
//! lets each host's ranks probe **sequentially** (concurrent probing would
//! corrupt the availability measurements), averages the discoveries within
//! each host group, and finally verifies that all co-located segments fit
//! simultaneously, shrinking until they do.
//!
//! Every intermediate mapping is torn down before return, and a final
//! barrier guarantees teardown has completed everywhere; a later probe by
//! a different process must never observe stale holes.

use tracing::{debug, warn};

use crate::align::{page_align_down, phys_mem_size, PLATFORM_MAP_CEILING};
use crate::collective::{broadcast_u64, exchange_u64, Collectives};
use crate::error::Result;
use crate::mmap::MapOps;
use crate::probe::probe_inner;
use crate::topology::Topology;
use crate::{SegmentConfig, SegmentInfo};

/// Compute the largest per-process segment size that every process can
/// map, honoring `local_limit` (per process) and `shared_limit` (per host
/// group, split evenly among co-located ranks).
///
/// An absent `shared_limit` defaults to the host's physical memory. The
/// result is suitable as the probing limit for segment initialization.
///
/// Collective: every process must call this with the same limits.
pub fn mmap_limit(
    ops: &mut dyn MapOps,
    topo: &Topology,
    coll: &dyn Collectives,
    local_limit: Option<usize>,
    shared_limit: Option<u64>,
    cfg: &SegmentConfig,
) -> Result<usize> {
    // Start at something reasonable if we expect to avoid swapping.
    let shared = shared_limit.or_else(phys_mem_size);

    let mut local = local_limit.unwrap_or(usize::MAX);
    if let Some(sh) = shared {
        if local as u64 > sh {
            local = sh.min(usize::MAX as u64) as usize;
        }
    }
    let mut maxsz = PLATFORM_MAP_CEILING.min(local);

    // Without co-located ranks there is nothing to coordinate: a single
    // local probe answers the question.
    if !topo.any_colocation() {
        maxsz = page_align_down(maxsz);
        if maxsz == 0 {
            return Ok(0);
        }
        let se = probe_inner(ops, maxsz, cfg.probe_strategy, cfg.probe_granularity, &cfg.retry)?;
        if !se.is_empty() {
            ops.unmap(se.addr, se.size)?;
        }
        return Ok(se.size);
    }

    let local_count = topo.host_size();

    // Ensure the concurrent probes cannot collectively exceed the
    // per-host ceiling.
    if let Some(sh) = shared {
        if local_count > 1 {
            let per = (sh / local_count as u64).min(usize::MAX as u64) as usize;
            maxsz = maxsz.min(per);
        }
    }
    maxsz = page_align_down(maxsz);

    // One rank per host probes at a time, paced job-wide in as many
    // rounds as the widest host needs. Each finished prober broadcasts
    // its result host-locally: declining expectations shorten later
    // probes, which can only discover less.
    let mut my = SegmentInfo::EMPTY;
    let rounds = topo.widest_host();
    for i in 0..rounds {
        if i == topo.host_rank() && maxsz > 0 {
            my = probe_inner(ops, maxsz, cfg.probe_strategy, cfg.probe_granularity, &cfg.retry)?;
            maxsz = my.size;
        }
        if i < local_count {
            let mut word = maxsz as u64;
            broadcast_u64(coll, &mut word, i)?;
            maxsz = word as usize;
        }
        coll.barrier()?;
    }

    // Combine discoveries and average within the host group.
    let sizes = exchange_u64(coll, topo.nranks(), my.size as u64)?;
    let sum: u64 = topo.host_members().iter().map(|&r| sizes[r]).sum();
    maxsz = page_align_down((sum / local_count as u64) as usize);
    debug!(mean = maxsz, "host-group probe mean");

    // The probe determined how much one process can map; now be sure
    // that `local_count` segments fit *simultaneously*. Address-space
    // quotas and hole fragmentation can make them not, in which case the
    // host leader iteratively shrinks the candidate.
    if ops.multi_fit_required() {
        if !my.is_empty() {
            ops.unmap(my.addr, my.size)?;
            my = SegmentInfo::EMPTY;
        }
        unlink_segments(ops, coll)?;

        if topo.host_rank() == 0 && maxsz > 0 {
            maxsz = multi_fit(ops, local_count, maxsz, cfg)?;
        }
        let mut word = maxsz as u64;
        broadcast_u64(coll, &mut word, 0)?;
        maxsz = word as usize;

        unlink_segments(ops, coll)?;
    }

    if !my.is_empty() {
        ops.unmap(my.addr, my.size)?;
    }
    // Ensures teardown completes on-node before anyone proceeds.
    coll.barrier()?;
    debug!(limit = maxsz, "coordinated mmap limit");
    Ok(maxsz)
}

/// Barrier-bracketed removal of the local object name, so no rank races a
/// peer's create or attach against the unlink.
fn unlink_segments(ops: &mut dyn MapOps, coll: &dyn Collectives) -> Result<()> {
    coll.barrier()?;
    ops.unlink_local();
    coll.barrier()?;
    Ok(())
}

/// Shrink `maxsz` until `nodes` simultaneous mappings of it succeed.
///
/// Ideally the first pass confirms the probed size. A resource-limit
/// ceiling is found in one shrink and verified in a second; hole
/// fragmentation may need several passes, so the loop is capped rather
/// than trusted to converge.
fn multi_fit(
    ops: &mut dyn MapOps,
    nodes: usize,
    mut maxsz: usize,
    cfg: &SegmentConfig,
) -> Result<usize> {
    let mut rounds = 0usize;
    loop {
        rounds += 1;
        let mut held: Vec<SegmentInfo> = Vec::with_capacity(nodes);
        let mut sum: u64 = 0;
        let mut done = true;
        for _ in 0..nodes {
            let se = probe_inner(ops, maxsz, cfg.probe_strategy, cfg.probe_granularity, &cfg.retry)?;
            // The name must go away immediately: every iteration reuses
            // this process's single object slot.
            ops.unlink_local();
            sum += se.size as u64;
            let sz = se.size;
            held.push(se);
            if sz != maxsz {
                done = false;
                if sz < cfg.probe_granularity {
                    break;
                }
            }
        }
        for se in held {
            if !se.is_empty() {
                ops.unmap(se.addr, se.size)?;
            }
        }
        maxsz = page_align_down((sum / nodes as u64) as usize);
        if done || maxsz == 0 {
            break;
        }
        if rounds >= cfg.max_fit_rounds {
            warn!(rounds, maxsz, "concurrent-fit refinement hit its round cap");
            break;
        }
    }
    Ok(maxsz)
}
