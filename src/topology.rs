//! Job topology: which ranks share a physical host.
//!
//! Segment negotiation cares about exactly one structural fact: the
//! grouping of ranks into host groups ("supernodes"). [`Topology`] derives
//! everything the protocol needs from a per-rank host id table, which the
//! surrounding runtime obtains from its launcher (see [`crate::slurm`] for
//! the SLURM-derived shortcut).

use crate::error::{Error, Result};

/// The host grouping of a parallel job, as seen from one rank.
#[derive(Debug, Clone)]
pub struct Topology {
    rank: usize,
    nranks: usize,
    host_of: Vec<usize>,
    host: usize,
    host_members: Vec<usize>,
    host_rank: usize,
    host_count: usize,
}

impl Topology {
    /// Build a topology from this process's rank and the host id of every
    /// rank in the job.
    ///
    /// Host ids only need to be consistent, not dense: two ranks share a
    /// host iff their ids are equal.
    ///
    /// # Errors
    ///
    /// Returns an error if `rank` is out of range or `host_of` is empty.
    pub fn new(rank: usize, host_of: Vec<usize>) -> Result<Self> {
        if host_of.is_empty() || rank >= host_of.len() {
            return Err(Error::Internal(format!(
                "rank {rank} out of range for a {}-rank host table",
                host_of.len()
            )));
        }
        let nranks = host_of.len();
        let host = host_of[rank];
        let host_members: Vec<usize> = (0..nranks).filter(|&r| host_of[r] == host).collect();
        let host_rank = host_members
            .iter()
            .position(|&r| r == rank)
            .expect("own rank is always a member of its host group");
        let mut seen = host_of.clone();
        seen.sort_unstable();
        seen.dedup();
        let host_count = seen.len();
        Ok(Topology {
            rank,
            nranks,
            host_of,
            host,
            host_members,
            host_rank,
            host_count,
        })
    }

    /// Convenience constructor: `nranks` ranks distributed blockwise,
    /// `per_host` per physical host.
    pub fn blocked(rank: usize, nranks: usize, per_host: usize) -> Result<Self> {
        if per_host == 0 {
            return Err(Error::Internal("per_host must be nonzero".into()));
        }
        Topology::new(rank, (0..nranks).map(|r| r / per_host).collect())
    }

    /// This process's rank in the job.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Total number of ranks in the job.
    pub fn nranks(&self) -> usize {
        self.nranks
    }

    /// Host id of an arbitrary rank.
    pub fn host_of(&self, rank: usize) -> usize {
        self.host_of[rank]
    }

    /// Number of distinct hosts in the job.
    pub fn host_count(&self) -> usize {
        self.host_count
    }

    /// Ranks co-located with this process, in ascending order (self
    /// included).
    pub fn host_members(&self) -> &[usize] {
        &self.host_members
    }

    /// Number of ranks on this process's host.
    pub fn host_size(&self) -> usize {
        self.host_members.len()
    }

    /// This process's index within its host group.
    pub fn host_rank(&self) -> usize {
        self.host_rank
    }

    /// Lowest rank on this process's host (the host leader).
    pub fn host_leader(&self) -> usize {
        self.host_members[0]
    }

    /// Whether `peer` runs on the same host as this process.
    pub fn is_colocated(&self, peer: usize) -> bool {
        peer < self.nranks && self.host_of[peer] == self.host
    }

    /// Whether any host in the job holds more than one rank.
    ///
    /// When false, size negotiation degenerates to a purely local probe.
    pub fn any_colocation(&self) -> bool {
        self.host_count != self.nranks
    }

    /// Size of the widest host group in the job.
    ///
    /// Sequential probing is paced in this many barrier-separated rounds
    /// so that no two co-located ranks ever probe concurrently.
    pub fn widest_host(&self) -> usize {
        let mut counts = vec![0usize; self.nranks];
        let mut widest = 0;
        for &h in &self.host_of {
            // Host ids are not necessarily dense; bucket by first member.
            let bucket = self.host_of.iter().position(|&x| x == h).unwrap_or(0);
            counts[bucket] += 1;
            widest = widest.max(counts[bucket]);
        }
        widest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_hosts_of_two() {
        let t = Topology::new(2, vec![0, 0, 1, 1]).unwrap();
        assert_eq!(t.rank(), 2);
        assert_eq!(t.nranks(), 4);
        assert_eq!(t.host_count(), 2);
        assert_eq!(t.host_members(), &[2, 3]);
        assert_eq!(t.host_rank(), 0);
        assert_eq!(t.host_leader(), 2);
        assert!(t.is_colocated(3));
        assert!(!t.is_colocated(0));
        assert!(t.any_colocation());
        assert_eq!(t.widest_host(), 2);
    }

    #[test]
    fn singleton_hosts_mean_no_colocation() {
        let t = Topology::new(1, vec![0, 1, 2]).unwrap();
        assert!(!t.any_colocation());
        assert_eq!(t.host_size(), 1);
        assert_eq!(t.widest_host(), 1);
    }

    #[test]
    fn ragged_hosts_report_the_widest() {
        // Host 7 holds three ranks, host 3 holds one.
        let t = Topology::new(0, vec![7, 7, 3, 7]).unwrap();
        assert_eq!(t.host_count(), 2);
        assert_eq!(t.host_members(), &[0, 1, 3]);
        assert_eq!(t.widest_host(), 3);
    }

    #[test]
    fn blocked_distribution() {
        let t = Topology::blocked(5, 8, 4).unwrap();
        assert_eq!(t.host_of(0), 0);
        assert_eq!(t.host_of(5), 1);
        assert_eq!(t.host_members(), &[4, 5, 6, 7]);
        assert_eq!(t.host_rank(), 1);
    }

    #[test]
    fn out_of_range_rank_is_rejected() {
        assert!(Topology::new(3, vec![0, 0]).is_err());
        assert!(Topology::new(0, vec![]).is_err());
    }
}
