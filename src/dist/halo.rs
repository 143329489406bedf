//! Neighbour halos: the non-local vertex data a rank needs to read to
//! evaluate its local edges.

use hashbrown::HashMap;

use crate::comm::{collective, wire, Communicator, Wait};
use crate::dist::distribution::GlobalId;
use crate::dist::graph::DistGraph;
use crate::error::PartError;

const TAG_HALO: u16 = 0x20;

/// Halo of a graph under its current row distribution.
///
/// Holds the sorted-unique non-local neighbour ids, the forward map from
/// global id to halo slot, and the per-neighbour exchange plan. A halo is
/// stale after any redistribution and must be rebuilt before the next read.
#[derive(Clone, Debug, Default)]
pub struct Halo {
    /// Sorted unique non-local global ids; index order defines slot order.
    required: Vec<GlobalId>,
    slot_of: HashMap<GlobalId, usize>,
    /// Per peer: the slots whose values that peer provides.
    recv_from: Vec<(usize, Vec<usize>)>,
    /// Per peer: the local indices that peer asked for.
    send_to: Vec<(usize, Vec<usize>)>,
}

impl Halo {
    /// Build the halo for the graph's current distribution.
    ///
    /// Every rank sends each owner the list of ids it needs; the requests a
    /// rank receives become its provide plan. Ids are self-sizing, so one
    /// all-to-all covers both the size and the id phase.
    pub fn build<C: Communicator>(comm: &C, graph: &DistGraph) -> Result<Self, PartError> {
        let required = graph.non_local_neighbors();
        let slot_of: HashMap<GlobalId, usize> = required
            .iter()
            .enumerate()
            .map(|(slot, &g)| (g, slot))
            .collect();

        let p = comm.size();
        let mut requests: Vec<Vec<u64>> = vec![Vec::new(); p];
        let mut slots_per_peer: Vec<Vec<usize>> = vec![Vec::new(); p];
        for (slot, &g) in required.iter().enumerate() {
            let owner = graph.dist.owner_of(g);
            requests[owner].push(g as u64);
            slots_per_peer[owner].push(slot);
        }
        let recv_from: Vec<(usize, Vec<usize>)> = slots_per_peer
            .into_iter()
            .enumerate()
            .filter(|(_, slots)| !slots.is_empty())
            .collect();

        let byte_messages: Vec<Vec<u8>> = requests
            .iter()
            .map(|m| wire::cast_slice(m).to_vec())
            .collect();
        let incoming = collective::all_to_allv(comm, &byte_messages)?;

        let mut send_to = Vec::new();
        for (peer, part) in incoming.iter().enumerate() {
            if part.is_empty() {
                continue;
            }
            let ids = wire::pod_vec_from::<u64>(part);
            let mut locals = Vec::with_capacity(ids.len());
            for &g in &ids {
                let local = graph.dist.local_of(g as usize).ok_or_else(|| {
                    PartError::collective(
                        comm,
                        "halo_build",
                        format!("rank {peer} requested non-owned id {g}"),
                    )
                })?;
                locals.push(local);
            }
            send_to.push((peer, locals));
        }

        Ok(Halo {
            required,
            slot_of,
            recv_from,
            send_to,
        })
    }

    pub fn len(&self) -> usize {
        self.required.len()
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty()
    }

    /// Halo slot of a non-local global id.
    pub fn slot(&self, global: GlobalId) -> Option<usize> {
        self.slot_of.get(&global).copied()
    }

    /// Sorted non-local ids in slot order.
    pub fn required_ids(&self) -> &[GlobalId] {
        &self.required
    }

    /// Per-neighbour (peer, provided value count), ascending peer order.
    /// This is the direction-aware adjacency the PE graph is built from.
    pub fn require_counts(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.recv_from.iter().map(|(peer, slots)| (*peer, slots.len()))
    }

    /// Pull the current value of every halo slot from its owner. Blocking;
    /// all ranks of the group must call it together.
    pub fn update<C, T>(&self, comm: &C, local: &[T]) -> Result<Vec<T>, PartError>
    where
        C: Communicator,
        T: bytemuck::Pod,
    {
        // post receives first, then sends, then drain
        let elem = std::mem::size_of::<T>();
        let mut pending = Vec::with_capacity(self.recv_from.len());
        for (peer, slots) in &self.recv_from {
            pending.push((*peer, slots, comm.irecv(*peer, TAG_HALO, slots.len() * elem)));
        }
        for (peer, locals) in &self.send_to {
            let payload: Vec<T> = locals.iter().map(|&l| local[l]).collect();
            comm.isend(*peer, TAG_HALO, wire::cast_slice(&payload));
        }
        let mut out = vec![T::zeroed(); self.required.len()];
        for (peer, slots, handle) in pending {
            let msg = handle.wait().ok_or_else(|| {
                PartError::collective(comm, "halo_update", format!("no data from rank {peer}"))
            })?;
            if msg.len() != slots.len() * elem {
                return Err(PartError::collective(
                    comm,
                    "halo_update",
                    format!(
                        "rank {peer} sent {} bytes, expected {}",
                        msg.len(),
                        slots.len() * elem
                    ),
                ));
            }
            let values = wire::pod_vec_from::<T>(&msg);
            for (&slot, &v) in slots.iter().zip(values.iter()) {
                out[slot] = v;
            }
        }
        Ok(out)
    }

    /// Halo update of a usize-valued vector (partitions, matchings).
    pub fn update_usize<C: Communicator>(
        &self,
        comm: &C,
        local: &[usize],
    ) -> Result<Vec<usize>, PartError> {
        let as_u64: Vec<u64> = local.iter().map(|&v| v as u64).collect();
        let halo = self.update(comm, &as_u64)?;
        Ok(halo.into_iter().map(|v| v as usize).collect())
    }
}

/// Resolve the block of a neighbour id through local data or the halo.
pub fn neighbor_value<T: Copy>(
    graph: &DistGraph,
    halo: &Halo,
    local_values: &[T],
    halo_values: &[T],
    neighbor: GlobalId,
) -> Result<T, PartError> {
    if let Some(local) = graph.dist.local_of(neighbor) {
        Ok(local_values[local])
    } else {
        let slot = halo.slot(neighbor).ok_or_else(|| {
            PartError::InconsistentInput(format!("neighbour {neighbor} has no halo slot"))
        })?;
        Ok(halo_values[slot])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{NoComm, ThreadComm};
    use crate::dist::distribution::Distribution;

    #[test]
    fn serial_halo_is_empty() {
        let comm = NoComm;
        let dist = Distribution::block(0, 1, 3);
        let g = DistGraph::new(
            dist,
            vec![0, 1, 3, 4],
            vec![1, 0, 2, 1],
            vec![1.0; 4],
        )
        .unwrap();
        let halo = Halo::build(&comm, &g).unwrap();
        assert!(halo.is_empty());
    }

    /// Path 0-1-2-3 split over two ranks: each side needs exactly one
    /// non-local neighbour.
    #[test]
    fn two_rank_path_halo() {
        let comms = ThreadComm::group(2);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    let rank = comm.rank();
                    let dist = Distribution::block(rank, 2, 4);
                    let g = if rank == 0 {
                        DistGraph::new(
                            dist,
                            vec![0, 1, 3],
                            vec![1, 0, 2],
                            vec![1.0; 3],
                        )
                        .unwrap()
                    } else {
                        DistGraph::new(
                            dist,
                            vec![0, 2, 3],
                            vec![1, 3, 2],
                            vec![1.0; 3],
                        )
                        .unwrap()
                    };
                    let halo = Halo::build(&comm, &g).unwrap();
                    assert_eq!(halo.len(), 1);
                    let expected_remote = if rank == 0 { 2 } else { 1 };
                    assert_eq!(halo.required_ids(), &[expected_remote]);

                    // every local value is its global id; the halo returns
                    // the owner's current value
                    let local: Vec<u64> =
                        (0..2).map(|l| g.dist.global_of(l) as u64).collect();
                    let halo_vals = halo.update(&comm, &local).unwrap();
                    assert_eq!(halo_vals, vec![expected_remote as u64]);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
