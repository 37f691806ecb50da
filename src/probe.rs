//! Discovery of the largest mappable virtual-memory region.
//!
//! The probe answers one question: given an upper bound, what is the
//! largest page-aligned region this process can still map at an OS-chosen
//! address? Kernel overcommit settings, address-space quotas, and hole
//! fragmentation make the answer unknowable except by trying, so the probe
//! performs a search over candidate sizes, treating "exhausted" map
//! failures as *too large* and everything else as fatal.
//!
//! Binary bisection is the default. Two linear strategies exist for
//! systems with strongly asymmetric map/unmap/failure costs; the choice is
//! a fixed policy in [`crate::SegmentConfig`], not runtime-adaptive.

use tracing::debug;

use crate::align::{page_align_down, page_align_up, page_size};
use crate::error::Result;
use crate::mmap::{map_fixed_with_retry, MapFailure, MapOps, RetryPolicy};
use crate::SegmentInfo;

/// Bracket width at which bisection stops refining.
///
/// Finer granularity buys almost no usable space and costs a map attempt
/// per halving.
pub const DEFAULT_PROBE_GRANULARITY: usize = 4 << 20;

/// Search strategy for the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbeStrategy {
    /// Bisect the candidate interval. Best when map success, map failure,
    /// and unmap all cost roughly the same.
    #[default]
    Binary,
    /// Walk down one page at a time from the bound. Best when failed maps
    /// are cheap but unmap and successful map are very slow.
    LinearDescending,
    /// Walk up one page at a time. Best when successful map and unmap are
    /// cheap but failed maps are very slow.
    LinearAscending,
}

/// A candidate region found by a search, which may or may not still be
/// mapped.
struct Candidate {
    info: SegmentInfo,
    mapped: bool,
}

impl Candidate {
    const NONE: Candidate = Candidate {
        info: SegmentInfo::EMPTY,
        mapped: false,
    };
}

/// Find the largest mappable region with `size <= max_size`.
///
/// `max_size` is aligned down to a page multiple first; if that leaves
/// zero, the empty region is returned without attempting any map. An empty
/// result for a nonzero bound is reported as
/// [`Error::NoAdequateSegment`](crate::Error::NoAdequateSegment).
///
/// On success exactly one mapping is live: the returned region.
pub fn probe_segment(
    ops: &mut dyn MapOps,
    max_size: usize,
    strategy: ProbeStrategy,
    granularity: usize,
    retry: &RetryPolicy,
) -> Result<SegmentInfo> {
    let max_size = page_align_down(max_size);
    if max_size == 0 {
        return Ok(SegmentInfo::EMPTY);
    }
    let info = probe_inner(ops, max_size, strategy, granularity, retry)?;
    if info.is_empty() {
        return Err(crate::Error::NoAdequateSegment);
    }
    Ok(info)
}

/// As [`probe_segment`], but `max_size` must already be page-aligned and
/// nonzero, and an empty result is not an error.
///
/// This is the form the coordinated size negotiation uses, where "nothing
/// fits" is a legitimate data point rather than a failure.
pub(crate) fn probe_inner(
    ops: &mut dyn MapOps,
    max_size: usize,
    strategy: ProbeStrategy,
    granularity: usize,
    retry: &RetryPolicy,
) -> Result<SegmentInfo> {
    debug_assert_eq!(max_size, page_align_down(max_size));
    debug_assert!(max_size > 0);

    // Try the full bound first; only search when it fails.
    let candidate = match ops.map(max_size) {
        Ok(addr) => Candidate {
            info: SegmentInfo {
                addr,
                size: max_size,
            },
            mapped: true,
        },
        Err(MapFailure::Fatal(e)) => return Err(e),
        Err(MapFailure::Exhausted) => match strategy {
            ProbeStrategy::Binary => binary_search(ops, 0, max_size, granularity)?,
            ProbeStrategy::LinearDescending => linear_descending(ops, max_size)?,
            ProbeStrategy::LinearAscending => linear_ascending(ops, max_size)?,
        },
    };

    if candidate.info.is_empty() {
        return Ok(SegmentInfo::EMPTY);
    }

    let info = if candidate.mapped && candidate.info.addr % page_size() == 0 {
        // Aligned and already mapped; keep as-is.
        candidate.info
    } else {
        // Re-map at the page-trimmed sub-range.
        if candidate.mapped {
            ops.unmap(candidate.info.addr, candidate.info.size)?;
        }
        let begin = page_align_up(candidate.info.addr);
        let end = page_align_down(candidate.info.addr + candidate.info.size);
        if begin >= end {
            return Ok(SegmentInfo::EMPTY);
        }
        let trimmed = SegmentInfo {
            addr: begin,
            size: end - begin,
        };
        map_fixed_with_retry(retry, trimmed.addr, trimmed.size, |a, s| {
            ops.map_fixed(a, s)
        })?;
        trimmed
    };

    debug_assert_eq!(info.addr % page_size(), 0);
    debug_assert_eq!(info.size % page_size(), 0);
    debug!(addr = info.addr, size = info.size, "probe found segment");
    Ok(info)
}

/// Bisect `(low, high)` for the largest mappable size.
///
/// Returns the best candidate with its region unmapped; preference goes to
/// the upper half so the search converges on the maximum, not merely a
/// workable size.
fn binary_search(
    ops: &mut dyn MapOps,
    low: usize,
    high: usize,
    granularity: usize,
) -> Result<Candidate> {
    if high - low <= granularity {
        return Ok(Candidate::NONE);
    }
    let mid = page_align_down(low + (high - low) / 2);
    if mid == 0 {
        return Ok(Candidate::NONE);
    }

    match ops.map(mid) {
        Err(MapFailure::Fatal(e)) => Err(e),
        Err(MapFailure::Exhausted) => binary_search(ops, low, mid, granularity),
        Ok(addr) => {
            ops.unmap(addr, mid)?;
            let upper = binary_search(ops, mid, high, granularity)?;
            if upper.info.is_empty() {
                Ok(Candidate {
                    info: SegmentInfo { addr, size: mid },
                    mapped: false,
                })
            } else {
                Ok(upper)
            }
        }
    }
}

/// Walk down from `high` a page at a time; the result stays mapped.
fn linear_descending(ops: &mut dyn MapOps, high: usize) -> Result<Candidate> {
    let mut size = high;
    while size > page_size() {
        size -= page_size();
        match ops.map(size) {
            Ok(addr) => {
                return Ok(Candidate {
                    info: SegmentInfo { addr, size },
                    mapped: true,
                })
            }
            Err(MapFailure::Exhausted) => {}
            Err(MapFailure::Fatal(e)) => return Err(e),
        }
    }
    Ok(Candidate::NONE)
}

/// Walk up from one page; the result is unmapped.
fn linear_ascending(ops: &mut dyn MapOps, high: usize) -> Result<Candidate> {
    let mut last = Candidate::NONE;
    let mut size = page_size();
    loop {
        match ops.map(size) {
            Err(MapFailure::Exhausted) => return Ok(last),
            Err(MapFailure::Fatal(e)) => return Err(e),
            Ok(addr) => {
                ops.unmap(addr, size)?;
                last = Candidate {
                    info: SegmentInfo { addr, size },
                    mapped: false,
                };
                if size + page_size() > high {
                    return Ok(last);
                }
                size += page_size();
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::align::page_size;
    use crate::error::Error;
    use std::collections::HashMap;

    /// Test oracle: mapping succeeds iff `size <= capacity` counting all
    /// live mappings, handing out addresses from a synthetic address space.
    pub(crate) struct OracleMapOps {
        pub capacity: usize,
        next_addr: usize,
        live: HashMap<usize, usize>,
        pub map_calls: usize,
    }

    impl OracleMapOps {
        pub fn new(capacity: usize) -> Self {
            OracleMapOps {
                capacity,
                next_addr: 0x1000_0000,
                live: HashMap::new(),
                map_calls: 0,
            }
        }

        pub fn live_bytes(&self) -> usize {
            self.live.values().sum()
        }

        pub fn live_count(&self) -> usize {
            self.live.len()
        }
    }

    impl MapOps for OracleMapOps {
        fn map(&mut self, size: usize) -> std::result::Result<usize, MapFailure> {
            self.map_calls += 1;
            if self.live_bytes() + size > self.capacity {
                return Err(MapFailure::Exhausted);
            }
            let addr = self.next_addr;
            self.next_addr += size + page_size();
            self.live.insert(addr, size);
            Ok(addr)
        }

        fn map_fixed(&mut self, addr: usize, size: usize) -> std::result::Result<(), MapFailure> {
            if self.live_bytes() + size > self.capacity {
                return Err(MapFailure::Exhausted);
            }
            self.live.insert(addr, size);
            Ok(())
        }

        fn unmap(&mut self, addr: usize, size: usize) -> Result<()> {
            match self.live.remove(&addr) {
                Some(sz) if sz == size => Ok(()),
                other => Err(Error::Internal(format!(
                    "oracle unmap({addr:#x}, {size}) of unknown region (had {other:?})"
                ))),
            }
        }

        fn multi_fit_required(&self) -> bool {
            true
        }
    }

    /// Oracle that fails with a non-exhaustion error above the limit.
    struct HostileMapOps;

    impl MapOps for HostileMapOps {
        fn map(&mut self, size: usize) -> std::result::Result<usize, MapFailure> {
            Err(MapFailure::Fatal(Error::MapFailed {
                size,
                errno: nix::errno::Errno::EPERM,
            }))
        }

        fn map_fixed(&mut self, _: usize, _: usize) -> std::result::Result<(), MapFailure> {
            unreachable!("fatal map error must abort the search");
        }

        fn unmap(&mut self, _: usize, _: usize) -> Result<()> {
            Ok(())
        }
    }

    fn strategies() -> [ProbeStrategy; 3] {
        [
            ProbeStrategy::Binary,
            ProbeStrategy::LinearDescending,
            ProbeStrategy::LinearAscending,
        ]
    }

    #[test]
    fn zero_bound_returns_empty_without_mapping() {
        let mut ops = OracleMapOps::new(usize::MAX);
        let info = probe_segment(
            &mut ops,
            0,
            ProbeStrategy::Binary,
            DEFAULT_PROBE_GRANULARITY,
            &RetryPolicy::default(),
        )
        .unwrap();
        assert!(info.is_empty());
        assert_eq!(ops.map_calls, 0);

        // A sub-page bound aligns down to zero and is treated identically.
        let info = probe_segment(
            &mut ops,
            page_size() - 1,
            ProbeStrategy::Binary,
            DEFAULT_PROBE_GRANULARITY,
            &RetryPolicy::default(),
        )
        .unwrap();
        assert!(info.is_empty());
        assert_eq!(ops.map_calls, 0);
    }

    #[test]
    fn result_never_exceeds_bound_and_is_page_aligned() {
        let page = page_size();
        for strategy in strategies() {
            for max in [page, 7 * page, 64 * page] {
                let mut ops = OracleMapOps::new(1 << 40);
                let info = probe_segment(&mut ops, max, strategy, page, &RetryPolicy::default())
                    .unwrap();
                assert!(info.size <= max);
                assert_eq!(info.size % page, 0);
                assert_eq!(info.addr % page, 0);
                assert_eq!(ops.live_count(), 1, "exactly the result stays mapped");
            }
        }
    }

    #[test]
    fn strategies_converge_to_the_same_maximum() {
        let page = page_size();
        let max = 256 * page;
        for capacity in [3 * page + 17, 100 * page, 255 * page + page / 2] {
            let expected = crate::align::align_down(capacity, page).min(max);
            for strategy in strategies() {
                let mut ops = OracleMapOps::new(capacity);
                let info =
                    probe_segment(&mut ops, max, strategy, page, &RetryPolicy::default()).unwrap();
                assert_eq!(
                    info.size, expected,
                    "strategy {strategy:?} diverged for capacity {capacity}"
                );
            }
        }
    }

    #[test]
    fn binary_search_honors_granularity() {
        let page = page_size();
        let mut coarse = OracleMapOps::new(100 * page);
        probe_segment(
            &mut coarse,
            256 * page,
            ProbeStrategy::Binary,
            64 * page,
            &RetryPolicy::default(),
        )
        .unwrap();
        let mut fine = OracleMapOps::new(100 * page);
        probe_segment(
            &mut fine,
            256 * page,
            ProbeStrategy::Binary,
            page,
            &RetryPolicy::default(),
        )
        .unwrap();
        assert!(coarse.map_calls < fine.map_calls);
    }

    #[test]
    fn nothing_mappable_is_a_hard_error() {
        let mut ops = OracleMapOps::new(0);
        let err = probe_segment(
            &mut ops,
            64 * page_size(),
            ProbeStrategy::Binary,
            page_size(),
            &RetryPolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::NoAdequateSegment));
    }

    #[test]
    fn fatal_map_errors_abort_immediately() {
        let err = probe_segment(
            &mut HostileMapOps,
            64 * page_size(),
            ProbeStrategy::Binary,
            page_size(),
            &RetryPolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::MapFailed {
                errno: nix::errno::Errno::EPERM,
                ..
            }
        ));
    }

    #[test]
    fn probe_against_real_address_space() {
        // A modest bound the test host can certainly satisfy.
        let mut ops = crate::mmap::SystemMapOps::default();
        let max = 16 * 1024 * 1024;
        let info = probe_segment(
            &mut ops,
            max,
            ProbeStrategy::Binary,
            DEFAULT_PROBE_GRANULARITY,
            &RetryPolicy::default(),
        )
        .unwrap();
        assert_eq!(info.size, max);
        ops.unmap(info.addr, info.size).unwrap();
    }
}
