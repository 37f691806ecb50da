//! SLURM scheduler environment helpers.
//!
//! When a job is launched under SLURM, the scheduler's environment already
//! describes the host grouping that segment negotiation needs, so the
//! runtime can build a [`Topology`](crate::Topology) without any
//! communication. All functions return `None` outside a SLURM job.

use std::env;

use crate::error::Result;
use crate::topology::Topology;

/// Check if running under the SLURM job scheduler.
pub fn is_slurm_job() -> bool {
    env::var("SLURM_JOB_ID").is_ok()
}

/// Get the SLURM job ID.
pub fn job_id() -> Option<String> {
    env::var("SLURM_JOB_ID").ok()
}

/// Get the host-local rank of this process.
pub fn local_rank() -> Option<usize> {
    env::var("SLURM_LOCALID").ok().and_then(|s| s.parse().ok())
}

/// Get the number of tasks per node.
pub fn local_size() -> Option<usize> {
    env::var("SLURM_NTASKS_PER_NODE")
        .ok()
        .and_then(|s| s.parse().ok())
        .or_else(|| {
            // Fallback: parse first entry of SLURM_TASKS_PER_NODE (format: "4(x2)")
            env::var("SLURM_TASKS_PER_NODE")
                .ok()
                .and_then(|s| s.split('(').next().and_then(|n| n.parse().ok()))
        })
}

/// Get the total number of nodes allocated to the job.
pub fn num_nodes() -> Option<usize> {
    env::var("SLURM_NNODES").ok().and_then(|s| s.parse().ok())
}

/// Build a blockwise [`Topology`] from the SLURM environment.
///
/// Requires `SLURM_NTASKS_PER_NODE` (or its `SLURM_TASKS_PER_NODE`
/// fallback); SLURM's default block distribution places ranks
/// `[k*per_node, (k+1)*per_node)` on node `k`, which is exactly
/// [`Topology::blocked`]. Returns `None` when the environment does not
/// describe the layout.
pub fn topology(rank: usize, nranks: usize) -> Option<Result<Topology>> {
    let per_node = local_size()?;
    Some(Topology::blocked(rank, nranks, per_node))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that mutate environment variables are combined into a single
    /// test to avoid data races when tests run in parallel; `env::set_var`
    /// is not thread-safe.
    #[test]
    fn slurm_env_parsing() {
        // --- local_size: parses SLURM_TASKS_PER_NODE "4(x2)" format ---
        unsafe {
            std::env::set_var("SLURM_TASKS_PER_NODE", "4(x2)");
            std::env::remove_var("SLURM_NTASKS_PER_NODE");
        }
        assert_eq!(local_size(), Some(4));

        // --- topology derives the block distribution ---
        let topo = topology(5, 8).unwrap().unwrap();
        assert_eq!(topo.host_of(0), 0);
        assert_eq!(topo.host_members(), &[4, 5, 6, 7]);

        // --- local_size: SLURM_NTASKS_PER_NODE takes priority ---
        unsafe {
            std::env::set_var("SLURM_NTASKS_PER_NODE", "8");
        }
        assert_eq!(local_size(), Some(8));

        // --- no layout information, no topology ---
        unsafe {
            std::env::remove_var("SLURM_NTASKS_PER_NODE");
            std::env::remove_var("SLURM_TASKS_PER_NODE");
        }
        assert_eq!(local_size(), None);
        assert!(topology(0, 4).is_none());

        // --- job detection ---
        unsafe {
            std::env::set_var("SLURM_JOB_ID", "12345");
        }
        assert!(is_slurm_job());
        assert_eq!(job_id(), Some("12345".to_string()));
        unsafe {
            std::env::remove_var("SLURM_JOB_ID");
        }
        assert!(!is_slurm_job());
    }
}
