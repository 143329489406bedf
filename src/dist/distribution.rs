//! Row distributions: which rank owns which global indices.

use std::sync::Arc;

use hashbrown::HashMap;

use crate::comm::{collective, Communicator};
use crate::error::PartError;

/// Stable global index of a point/vertex.
pub type GlobalId = usize;

/// A mapping of global indices to ranks. Coordinates, weights, the
/// partition vector and the graph rows all share one distribution; the
/// distribution is immutable between explicit redistribution points.
#[derive(Clone, Debug)]
pub enum Distribution {
    /// Contiguous range per rank; `bounds` has `size + 1` entries and
    /// `bounds[size]` is the global size.
    Block {
        rank: usize,
        bounds: Arc<Vec<usize>>,
    },
    /// Explicit ascending index list per rank. The owner map is replicated
    /// so that `owner_of` stays a local lookup.
    General {
        rank: usize,
        owned: Arc<Vec<GlobalId>>,
        local_of: Arc<HashMap<GlobalId, usize>>,
        owner: Arc<Vec<u32>>,
    },
}

impl Distribution {
    /// Even block distribution of `global_n` indices over `size` ranks.
    pub fn block(rank: usize, size: usize, global_n: usize) -> Self {
        let mut bounds = Vec::with_capacity(size + 1);
        for r in 0..=size {
            bounds.push(r * global_n / size);
        }
        Distribution::Block {
            rank,
            bounds: Arc::new(bounds),
        }
    }

    /// Block distribution with explicit range boundaries; `bounds` must be
    /// non-decreasing with `size + 1` entries.
    pub fn from_bounds(rank: usize, bounds: Vec<usize>) -> Self {
        debug_assert!(bounds.windows(2).all(|w| w[0] <= w[1]));
        Distribution::Block {
            rank,
            bounds: Arc::new(bounds),
        }
    }

    /// General distribution from this rank's ascending owned list. Runs an
    /// all-gather to assemble the replicated owner map; every rank must
    /// call it with disjoint lists covering `0..global_n`.
    pub fn general<C: Communicator>(
        comm: &C,
        owned: Vec<GlobalId>,
        global_n: usize,
    ) -> Result<Self, PartError> {
        debug_assert!(owned.windows(2).all(|w| w[0] < w[1]));
        let encoded: Vec<u64> = owned.iter().map(|&g| g as u64).collect();
        let parts = collective::all_gather_varlen(comm, crate::comm::wire::cast_slice(&encoded))?;
        let mut owner = vec![u32::MAX; global_n];
        for (r, part) in parts.iter().enumerate() {
            for &g in crate::comm::wire::cast_slice_from::<u64>(part) {
                let g = g as usize;
                if g >= global_n || owner[g] != u32::MAX {
                    return Err(PartError::InconsistentInput(format!(
                        "global index {g} owned twice or out of range in general distribution"
                    )));
                }
                owner[g] = r as u32;
            }
        }
        if owner.iter().any(|&o| o == u32::MAX) {
            return Err(PartError::InconsistentInput(
                "general distribution does not cover all global indices".into(),
            ));
        }
        let local_of: HashMap<GlobalId, usize> =
            owned.iter().enumerate().map(|(l, &g)| (g, l)).collect();
        Ok(Distribution::General {
            rank: comm.rank(),
            owned: Arc::new(owned),
            local_of: Arc::new(local_of),
            owner: Arc::new(owner),
        })
    }

    pub fn rank(&self) -> usize {
        match self {
            Distribution::Block { rank, .. } => *rank,
            Distribution::General { rank, .. } => *rank,
        }
    }

    pub fn global_size(&self) -> usize {
        match self {
            Distribution::Block { bounds, .. } => *bounds.last().expect("bounds non-empty"),
            Distribution::General { owner, .. } => owner.len(),
        }
    }

    pub fn local_size(&self) -> usize {
        match self {
            Distribution::Block { rank, bounds } => bounds[*rank + 1] - bounds[*rank],
            Distribution::General { owned, .. } => owned.len(),
        }
    }

    /// Owning rank of a global index.
    pub fn owner_of(&self, global: GlobalId) -> usize {
        match self {
            Distribution::Block { bounds, .. } => {
                debug_assert!(global < self.global_size());
                bounds.partition_point(|&b| b <= global) - 1
            }
            Distribution::General { owner, .. } => owner[global] as usize,
        }
    }

    pub fn is_local(&self, global: GlobalId) -> bool {
        self.owner_of(global) == self.rank()
    }

    /// Local slot of a global index, if owned here.
    pub fn local_of(&self, global: GlobalId) -> Option<usize> {
        match self {
            Distribution::Block { rank, bounds } => {
                let (lo, hi) = (bounds[*rank], bounds[rank + 1]);
                (global >= lo && global < hi).then(|| global - lo)
            }
            Distribution::General { local_of, .. } => local_of.get(&global).copied(),
        }
    }

    /// Global index of a local slot.
    pub fn global_of(&self, local: usize) -> GlobalId {
        match self {
            Distribution::Block { rank, bounds } => bounds[*rank] + local,
            Distribution::General { owned, .. } => owned[local],
        }
    }

    /// Iterate this rank's owned global ids in local order.
    pub fn owned_ids(&self) -> impl Iterator<Item = GlobalId> + '_ {
        (0..self.local_size()).map(move |l| self.global_of(l))
    }
}

/// Check that two vectors sharing this distribution agree on local size.
pub fn check_aligned(
    context: &'static str,
    left: usize,
    right: usize,
) -> Result<(), PartError> {
    if left != right {
        return Err(PartError::WrongDistribution {
            context,
            left,
            right,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::NoComm;

    #[test]
    fn block_owner_and_locals() {
        let dist = Distribution::block(1, 3, 10);
        // bounds: [0, 3, 6, 10]
        assert_eq!(dist.local_size(), 3);
        assert_eq!(dist.owner_of(0), 0);
        assert_eq!(dist.owner_of(3), 1);
        assert_eq!(dist.owner_of(9), 2);
        assert_eq!(dist.local_of(4), Some(1));
        assert_eq!(dist.local_of(9), None);
        assert_eq!(dist.global_of(2), 5);
    }

    #[test]
    fn general_single_rank() {
        let comm = NoComm;
        let dist = Distribution::general(&comm, vec![0, 1, 2, 3], 4).unwrap();
        assert_eq!(dist.local_size(), 4);
        assert!(dist.is_local(2));
        assert_eq!(dist.local_of(3), Some(3));
    }

    #[test]
    fn general_rejects_gaps() {
        let comm = NoComm;
        let err = Distribution::general(&comm, vec![0, 2], 4).unwrap_err();
        assert!(matches!(err, PartError::InconsistentInput(_)));
    }

    #[test]
    fn aligned_check() {
        assert!(check_aligned("test", 3, 3).is_ok());
        assert!(matches!(
            check_aligned("test", 3, 4),
            Err(PartError::WrongDistribution { .. })
        ));
    }
}
