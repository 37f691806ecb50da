//! Bootstrap collective seams.
//!
//! Segment establishment never implements job-wide communication itself;
//! it consumes three primitives supplied by the surrounding launch
//! infrastructure through the [`Collectives`] trait. Every call is
//! collective: all participating processes must call the same operation
//! with the same sizes, the same number of times, and every call blocks
//! until the collective completes.
//!
//! The single exception is [`bruck_concat`]: the degenerate
//! whole-address-space mode must exchange auxiliary-region addresses
//! before a full messaging layer exists, so this module carries the one
//! self-performed exchange, expressed over the minimal [`RankMessaging`]
//! seam.

use crate::error::{Error, Result};

/// Job-wide bootstrap collectives supplied by the launch infrastructure.
pub trait Collectives {
    /// All-to-all gather: every rank contributes `local`, every rank
    /// receives the concatenation of all contributions in rank order.
    /// `all` must be `local.len() * nranks` bytes.
    fn exchange(&self, local: &[u8], all: &mut [u8]) -> Result<()>;

    /// Job-wide rendezvous; returns once every rank has entered.
    fn barrier(&self) -> Result<()>;

    /// Broadcast among the ranks of one host. `root` is a host-local
    /// index; `buf` is input at the root and output everywhere else.
    fn supernode_broadcast(&self, buf: &mut [u8], root: usize) -> Result<()>;
}

/// Exchange one `u64` per rank; result is indexed by rank.
pub(crate) fn exchange_u64(coll: &dyn Collectives, nranks: usize, value: u64) -> Result<Vec<u64>> {
    let local = value.to_ne_bytes();
    let mut all = vec![0u8; 8 * nranks];
    coll.exchange(&local, &mut all)?;
    Ok(all
        .chunks_exact(8)
        .map(|c| u64::from_ne_bytes(c.try_into().expect("8-byte chunk")))
        .collect())
}

/// Exchange a fixed number of `u64` words per rank; result is the flat
/// rank-ordered concatenation.
pub(crate) fn exchange_words(
    coll: &dyn Collectives,
    nranks: usize,
    local: &[u64],
) -> Result<Vec<u64>> {
    let mut bytes = Vec::with_capacity(local.len() * 8);
    for w in local {
        bytes.extend_from_slice(&w.to_ne_bytes());
    }
    let mut all = vec![0u8; bytes.len() * nranks];
    coll.exchange(&bytes, &mut all)?;
    Ok(all
        .chunks_exact(8)
        .map(|c| u64::from_ne_bytes(c.try_into().expect("8-byte chunk")))
        .collect())
}

/// Host-scoped broadcast of one `u64` from host-local rank `root`.
pub(crate) fn broadcast_u64(
    coll: &dyn Collectives,
    value: &mut u64,
    root: usize,
) -> Result<()> {
    let mut buf = value.to_ne_bytes();
    coll.supernode_broadcast(&mut buf, root)?;
    *value = u64::from_ne_bytes(buf);
    Ok(())
}

/// Minimal rank-to-rank messaging used only by the degenerate
/// whole-address-space auxiliary exchange.
///
/// `send` must not block waiting for the receiver (the transports backing
/// this seam buffer in flight); `recv` blocks until a message from `src`
/// arrives.
pub trait RankMessaging {
    /// Deliver `bytes` to rank `dest`.
    fn send(&self, dest: usize, bytes: &[u8]) -> Result<()>;

    /// Receive the next message sent by rank `src`.
    fn recv(&self, src: usize) -> Result<Vec<u8>>;
}

/// All-gather of one fixed-size block per rank via Bruck's concatenation
/// algorithm.
///
/// `log2(nranks)` rounds; in round `k` each rank relays the
/// `min(2^k, nranks - 2^k)` blocks accumulated so far to the rank `2^k`
/// below it, then a final rotation restores rank order. Returns the
/// rank-ordered concatenation of every rank's block.
pub fn bruck_concat(
    msg: &dyn RankMessaging,
    rank: usize,
    nranks: usize,
    block: &[u8],
) -> Result<Vec<u8>> {
    let len = block.len();
    let mut buf = vec![0u8; len * nranks];
    buf[..len].copy_from_slice(block);

    let mut distance = 1usize;
    while distance < nranks {
        let nblocks = distance.min(nranks - distance);
        let dest = (rank + nranks - distance) % nranks;
        let src = (rank + distance) % nranks;

        msg.send(dest, &buf[..nblocks * len])?;
        let incoming = msg.recv(src)?;
        if incoming.len() != nblocks * len {
            return Err(Error::CollectiveSize {
                got: incoming.len(),
                expected: nblocks * len,
            });
        }
        buf[distance * len..(distance + nblocks) * len].copy_from_slice(&incoming);
        distance *= 2;
    }

    // Rotate so entry i describes rank i rather than rank (self + i).
    let split = len * (nranks - rank);
    let mut out = Vec::with_capacity(buf.len());
    out.extend_from_slice(&buf[split..]);
    out.extend_from_slice(&buf[..split]);
    debug_assert_eq!(&out[rank * len..(rank + 1) * len], block);
    Ok(out)
}

/// In-process simulation of a parallel job, for tests only.
///
/// One thread plays each rank; collectives are backed by shared slots and
/// [`std::sync::Barrier`]s (one global, one per host so host-scoped
/// operations never entangle differently-sized hosts).
#[cfg(test)]
pub(crate) mod sim {
    use super::{Collectives, RankMessaging};
    use crate::error::{Error, Result};
    use std::sync::mpsc::{Receiver, Sender};
    use std::sync::{Arc, Barrier, Mutex};

    struct Shared {
        nranks: usize,
        host_of: Vec<usize>,
        global: Barrier,
        host_barriers: Vec<Barrier>,
        exchange_slots: Mutex<Vec<Option<Vec<u8>>>>,
        bcast_slots: Mutex<Vec<Option<Vec<u8>>>>,
    }

    /// Handle for one simulated rank; clone-free, one per thread.
    pub struct SimRank {
        rank: usize,
        host: usize,
        shared: Arc<Shared>,
    }

    /// Build one [`SimRank`] handle per rank for the given host table.
    pub fn sim_job(host_of: Vec<usize>) -> Vec<SimRank> {
        let nranks = host_of.len();
        let mut hosts: Vec<usize> = host_of.clone();
        hosts.sort_unstable();
        hosts.dedup();
        let host_barriers = hosts
            .iter()
            .map(|h| Barrier::new(host_of.iter().filter(|&&x| x == *h).count()))
            .collect();
        // Re-index host ids densely so barriers line up.
        let dense: Vec<usize> = host_of
            .iter()
            .map(|h| hosts.iter().position(|x| x == h).unwrap())
            .collect();
        let shared = Arc::new(Shared {
            nranks,
            host_of: dense.clone(),
            global: Barrier::new(nranks),
            host_barriers,
            exchange_slots: Mutex::new(vec![None; nranks]),
            bcast_slots: Mutex::new(vec![None; hosts.len()]),
        });
        (0..nranks)
            .map(|rank| SimRank {
                rank,
                host: dense[rank],
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    impl SimRank {
        fn host_barrier(&self) {
            self.shared.host_barriers[self.host].wait();
        }

        fn host_members(&self) -> Vec<usize> {
            (0..self.shared.nranks)
                .filter(|&r| self.shared.host_of[r] == self.host)
                .collect()
        }
    }

    impl Collectives for SimRank {
        fn exchange(&self, local: &[u8], all: &mut [u8]) -> Result<()> {
            if all.len() != local.len() * self.shared.nranks {
                return Err(Error::CollectiveSize {
                    got: all.len(),
                    expected: local.len() * self.shared.nranks,
                });
            }
            self.shared.exchange_slots.lock().unwrap()[self.rank] = Some(local.to_vec());
            self.shared.global.wait();
            {
                let slots = self.shared.exchange_slots.lock().unwrap();
                for (r, slot) in slots.iter().enumerate() {
                    let data = slot.as_ref().expect("every rank contributed");
                    all[r * local.len()..(r + 1) * local.len()].copy_from_slice(data);
                }
            }
            self.shared.global.wait();
            self.shared.exchange_slots.lock().unwrap()[self.rank] = None;
            Ok(())
        }

        fn barrier(&self) -> Result<()> {
            self.shared.global.wait();
            Ok(())
        }

        fn supernode_broadcast(&self, buf: &mut [u8], root: usize) -> Result<()> {
            let members = self.host_members();
            if root >= members.len() {
                return Err(Error::Internal(format!(
                    "broadcast root {root} out of range for host of {}",
                    members.len()
                )));
            }
            if members[root] == self.rank {
                self.shared.bcast_slots.lock().unwrap()[self.host] = Some(buf.to_vec());
            }
            self.host_barrier();
            {
                let slots = self.shared.bcast_slots.lock().unwrap();
                let data = slots[self.host].as_ref().expect("root published");
                if data.len() != buf.len() {
                    return Err(Error::CollectiveSize {
                        got: data.len(),
                        expected: buf.len(),
                    });
                }
                buf.copy_from_slice(data);
            }
            self.host_barrier();
            if members[root] == self.rank {
                self.shared.bcast_slots.lock().unwrap()[self.host] = None;
            }
            self.host_barrier();
            Ok(())
        }
    }

    /// Channel-backed [`RankMessaging`] fabric for Bruck tests.
    pub struct SimFabric {
        rank: usize,
        // [src] -> receiver at this rank
        rx: Vec<Mutex<Receiver<Vec<u8>>>>,
        // [dest][src] -> sender
        tx: Vec<Vec<Sender<Vec<u8>>>>,
    }

    /// Build a fully-connected messaging fabric of `nranks` endpoints.
    pub fn sim_fabric(nranks: usize) -> Vec<SimFabric> {
        let mut senders: Vec<Vec<Option<Sender<Vec<u8>>>>> = (0..nranks)
            .map(|_| (0..nranks).map(|_| None).collect())
            .collect();
        let mut receivers: Vec<Vec<Option<Mutex<Receiver<Vec<u8>>>>>> = (0..nranks)
            .map(|_| (0..nranks).map(|_| None).collect())
            .collect();
        for dest in 0..nranks {
            for src in 0..nranks {
                let (tx, rx) = std::sync::mpsc::channel();
                senders[dest][src] = Some(tx);
                receivers[dest][src] = Some(Mutex::new(rx));
            }
        }
        let all_senders: Vec<Vec<Sender<Vec<u8>>>> = senders
            .into_iter()
            .map(|row| row.into_iter().map(Option::unwrap).collect())
            .collect();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, row)| SimFabric {
                rank,
                rx: row.into_iter().map(Option::unwrap).collect(),
                tx: all_senders.clone(),
            })
            .collect()
    }

    impl RankMessaging for SimFabric {
        fn send(&self, dest: usize, bytes: &[u8]) -> Result<()> {
            self.tx[dest][self.rank]
                .send(bytes.to_vec())
                .map_err(|_| Error::Internal("sim fabric peer hung up".into()))
        }

        fn recv(&self, src: usize) -> Result<Vec<u8>> {
            self.rx[src]
                .lock()
                .unwrap()
                .recv()
                .map_err(|_| Error::Internal("sim fabric peer hung up".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::sim::{sim_fabric, sim_job};
    use super::*;

    #[test]
    fn exchange_gathers_in_rank_order() {
        let handles: Vec<_> = sim_job(vec![0, 0, 1, 1])
            .into_iter()
            .enumerate()
            .map(|(rank, c)| {
                std::thread::spawn(move || exchange_u64(&c, 4, 100 + rank as u64).unwrap())
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), vec![100, 101, 102, 103]);
        }
    }

    #[test]
    fn broadcast_is_host_scoped() {
        // Hosts of different sizes broadcast concurrently without
        // entangling: host 0 has one rank, host 1 has three.
        let handles: Vec<_> = sim_job(vec![0, 1, 1, 1])
            .into_iter()
            .enumerate()
            .map(|(rank, c)| {
                std::thread::spawn(move || {
                    let mut v = if rank == 0 {
                        7u64
                    } else if rank == 1 {
                        42u64
                    } else {
                        0u64
                    };
                    broadcast_u64(&c, &mut v, 0).unwrap();
                    (rank, v)
                })
            })
            .collect();
        for h in handles {
            let (rank, v) = h.join().unwrap();
            let expected = if rank == 0 { 7 } else { 42 };
            assert_eq!(v, expected);
        }
    }

    #[test]
    fn bruck_restores_rank_order() {
        for nranks in [1usize, 2, 3, 5, 8, 13] {
            let handles: Vec<_> = sim_fabric(nranks)
                .into_iter()
                .enumerate()
                .map(|(rank, fabric)| {
                    std::thread::spawn(move || {
                        let block = [rank as u8; 16];
                        bruck_concat(&fabric, rank, nranks, &block).unwrap()
                    })
                })
                .collect();
            for h in handles {
                let out = h.join().unwrap();
                assert_eq!(out.len(), 16 * nranks);
                for r in 0..nranks {
                    assert!(
                        out[r * 16..(r + 1) * 16].iter().all(|&b| b == r as u8),
                        "rank {r}'s block out of place with {nranks} ranks"
                    );
                }
            }
        }
    }
}
