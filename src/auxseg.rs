//! Auxiliary-region carve-out.
//!
//! Internal subsystems (collectives scratch space, handler tables, and the
//! like) need segment-resident memory without knowing about each other.
//! Each registers a client once at startup; before attachment the registry
//! queries every client for `{min, optimal}` sizes and reserves one
//! page-aligned total uniformly from every node's segment; after the
//! segment is mapped, clients are granted disjoint, cache-line-aligned
//! sub-windows in registration order.
//!
//! Under the degenerate whole-address-space mode there is no mapped
//! segment to carve, so the auxiliary block is heap-allocated and its
//! location exchanged among all nodes with Bruck's algorithm — the one
//! exchange this crate performs itself, because this path runs before a
//! full messaging layer exists.

use tracing::debug;

use crate::align::{align_up, page_align_up, page_size, CACHE_LINE_BYTES};
use crate::collective::{bruck_concat, RankMessaging};
use crate::error::{Error, Result};
use crate::SegmentInfo;

/// A subsystem's declared need for auxiliary space, in bytes, before any
/// alignment rounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxsegRequest {
    /// The least space the subsystem can operate with.
    pub min_size: usize,
    /// The space it would like.
    pub optimal_size: usize,
}

/// A subsystem that consumes auxiliary segment space.
///
/// `query` is called exactly once, before the segment exists, to size the
/// reservation; `grant` is called exactly once after attachment with the
/// per-node table of this client's sub-window.
pub trait AuxsegClient {
    /// Declare the space requirement.
    fn query(&mut self) -> AuxsegRequest;

    /// Receive this client's sub-window on every node, in rank order.
    fn grant(&mut self, windows: &[SegmentInfo]);
}

/// Order-stable registry of auxiliary-space clients.
pub(crate) struct AuxsegRegistry {
    clients: Vec<Box<dyn AuxsegClient>>,
    requests: Vec<AuxsegRequest>,
    total: Option<usize>,
    /// Backing storage for the whole-address-space variant.
    everything_backing: Option<Vec<u8>>,
}

impl AuxsegRegistry {
    pub(crate) fn new() -> Self {
        AuxsegRegistry {
            clients: Vec::new(),
            requests: Vec::new(),
            total: None,
            everything_backing: None,
        }
    }

    /// Register a client. Must happen before the size query runs.
    pub(crate) fn register(&mut self, client: Box<dyn AuxsegClient>) -> Result<()> {
        if self.total.is_some() {
            return Err(Error::Internal(
                "auxiliary clients must register before segment sizing".into(),
            ));
        }
        self.clients.push(client);
        Ok(())
    }

    /// Collect every client's requirement and return the page-aligned
    /// total to reserve on every node. Idempotent; the first call
    /// computes, later calls return the cached value.
    pub(crate) fn preinit(&mut self) -> usize {
        if let Some(total) = self.total {
            return total;
        }
        let mut sum = 0usize;
        self.requests = self
            .clients
            .iter_mut()
            .map(|c| {
                let req = c.query();
                sum += align_up(req.optimal_size, CACHE_LINE_BYTES);
                req
            })
            .collect();
        let total = page_align_up(sum);
        debug!(clients = self.requests.len(), total, "auxiliary region sized");
        self.total = Some(total);
        total
    }

    /// The reserved total; zero before `preinit`.
    pub(crate) fn total_size(&self) -> usize {
        self.total.unwrap_or(0)
    }

    /// Verify the reservation leaves room in the advertised segment.
    pub(crate) fn check_fits(&self, max_global: usize) -> Result<()> {
        let total = self.total_size();
        if total >= max_global {
            return Err(Error::AuxsegTooLarge {
                auxseg: total,
                avail: max_global,
            });
        }
        Ok(())
    }

    /// The size to actually acquire for a client request: the request
    /// plus the auxiliary reservation.
    pub(crate) fn preattach(&self, client_request: usize) -> usize {
        debug_assert_eq!(client_request % page_size(), 0);
        client_request + self.total_size()
    }

    /// Split every node's full segment into the client-visible segment
    /// and the auxiliary region, then grant each registered client its
    /// sub-window in registration order.
    ///
    /// The client segment sits at the base when `client_at_base`;
    /// otherwise the auxiliary region does (the default elsewhere in the
    /// crate, which keeps a client overflow from trampling internal
    /// state).
    pub(crate) fn attach(
        &mut self,
        full: &[SegmentInfo],
        client_at_base: bool,
    ) -> (Vec<SegmentInfo>, Vec<SegmentInfo>) {
        let total = self.total_size();
        let mut client_table = Vec::with_capacity(full.len());
        let mut aux_table = Vec::with_capacity(full.len());
        for si in full {
            if si.size == 0 {
                client_table.push(SegmentInfo::EMPTY);
                aux_table.push(SegmentInfo::EMPTY);
            } else if client_at_base {
                client_table.push(SegmentInfo {
                    addr: si.addr,
                    size: si.size - total,
                });
                aux_table.push(SegmentInfo {
                    addr: si.addr + si.size - total,
                    size: total,
                });
            } else {
                client_table.push(SegmentInfo {
                    addr: si.addr + total,
                    size: si.size - total,
                });
                aux_table.push(SegmentInfo {
                    addr: si.addr,
                    size: total,
                });
            }
        }
        self.grant_all(&aux_table);
        (client_table, aux_table)
    }

    /// Whole-address-space variant: heap-allocate the auxiliary block and
    /// exchange locations with Bruck's algorithm, then grant.
    pub(crate) fn attach_everything(
        &mut self,
        msg: &dyn RankMessaging,
        rank: usize,
        nranks: usize,
    ) -> Result<Vec<SegmentInfo>> {
        let total = self.total_size();
        let margin = page_size().max(CACHE_LINE_BYTES);
        let mut backing = vec![0u8; total + margin];
        let addr = align_up(backing.as_mut_ptr() as usize, margin);
        self.everything_backing = Some(backing);

        let mut block = Vec::with_capacity(16);
        block.extend_from_slice(&(addr as u64).to_ne_bytes());
        block.extend_from_slice(&(total as u64).to_ne_bytes());
        let all = bruck_concat(msg, rank, nranks, &block)?;
        let aux_table: Vec<SegmentInfo> = all
            .chunks_exact(16)
            .map(|c| SegmentInfo {
                addr: u64::from_ne_bytes(c[..8].try_into().expect("8-byte word")) as usize,
                size: u64::from_ne_bytes(c[8..].try_into().expect("8-byte word")) as usize,
            })
            .collect();
        self.grant_all(&aux_table);
        Ok(aux_table)
    }

    /// Walk the registry in registration order, handing each client a
    /// shrinking window that advances by the previous client's optimal
    /// size, re-aligned to the cache line.
    fn grant_all(&mut self, aux_table: &[SegmentInfo]) {
        if self.clients.is_empty() {
            return;
        }
        let mut windows: Vec<SegmentInfo> = aux_table
            .iter()
            .map(|si| SegmentInfo {
                addr: si.addr,
                size: self.requests[0].optimal_size,
            })
            .collect();
        for i in 0..self.clients.len() {
            self.clients[i].grant(&windows);
            if i + 1 < self.clients.len() {
                for w in windows.iter_mut() {
                    w.addr = align_up(w.addr + self.requests[i].optimal_size, CACHE_LINE_BYTES);
                    w.size = self.requests[i + 1].optimal_size;
                }
            }
        }
    }
}

impl std::fmt::Debug for AuxsegRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuxsegRegistry")
            .field("clients", &self.clients.len())
            .field("total", &self.total)
            .finish()
    }
}
