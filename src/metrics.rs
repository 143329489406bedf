//! Partition quality metrics over distributed graphs.
//!
//! Every metric first accumulates local counters over owned rows, using a
//! halo-updated partition for non-local neighbours, and then reduces across
//! the group.

use hashbrown::HashSet;

use crate::comm::{collective, wire, Communicator};
use crate::dist::{check_aligned, BlockId, DistGraph, Halo};
use crate::error::PartError;

/// Small replicated sparse graph over blocks or ranks.
#[derive(Clone, Debug)]
pub struct SparseBlockGraph {
    pub n: usize,
    pub ia: Vec<usize>,
    pub ja: Vec<usize>,
    pub vals: Vec<f64>,
}

impl SparseBlockGraph {
    pub fn degree(&self, b: usize) -> usize {
        self.ia[b + 1] - self.ia[b]
    }

    pub fn neighbors(&self, b: usize) -> &[usize] {
        &self.ja[self.ia[b]..self.ia[b + 1]]
    }

    pub fn max_degree(&self) -> usize {
        (0..self.n).map(|b| self.degree(b)).max().unwrap_or(0)
    }

    pub fn edge_count(&self) -> usize {
        self.ja.len() / 2
    }

    fn from_dense(n: usize, dense: &[u8]) -> Self {
        let mut ia = Vec::with_capacity(n + 1);
        let mut ja = Vec::new();
        ia.push(0);
        for a in 0..n {
            for b in 0..n {
                if dense[a * n + b] != 0 {
                    ja.push(b);
                }
            }
            ia.push(ja.len());
        }
        let vals = vec![1.0; ja.len()];
        SparseBlockGraph { n, ia, ja, vals }
    }
}

/// Summary metrics of a finished partition.
#[derive(Clone, Debug, Default)]
pub struct PartitionMetrics {
    /// Edge cut (weighted when requested).
    pub cut: f64,
    /// Imbalance per node weight.
    pub imbalance: Vec<f64>,
    /// Maximum per-block communication volume.
    pub comm_volume_max: u64,
    /// Total communication volume over all blocks.
    pub comm_volume_total: u64,
    /// Maximum degree of the block graph.
    pub max_block_degree: usize,
    /// Border node count per block.
    pub border_nodes: Vec<u64>,
    /// Inner node count per block.
    pub inner_nodes: Vec<u64>,
    /// False when an iteration cap was hit before balance was reached.
    pub converged: bool,
    /// Outer k-means iterations taken.
    pub kmeans_iterations: usize,
    /// Balance-loop iterations per outer k-means iteration.
    pub balance_iterations: Vec<usize>,
    /// Cumulative cut gain realized by local refinement.
    pub refinement_gain: f64,
    /// Seconds spent in the initial partitioner.
    pub time_initial: f64,
    /// Seconds spent in multilevel refinement.
    pub time_refine: f64,
}

/// Check partition shape: aligned sizes, dense block ids in `[0, k)`.
pub fn validate_partition<C: Communicator>(
    comm: &C,
    graph: &DistGraph,
    part: &[BlockId],
    k: usize,
) -> Result<(), PartError> {
    check_aligned("partition", graph.local_n(), part.len())?;
    let local_max = part.iter().copied().max().unwrap_or(0);
    let mut buf = [local_max as u64];
    collective::max_u64(comm, &mut buf)?;
    if buf[0] as usize >= k {
        return Err(PartError::InconsistentInput(format!(
            "block id {} in a partition of {k} blocks",
            buf[0]
        )));
    }
    Ok(())
}

/// Edge cut: each crossing edge counted from both sides, halved at the end.
pub fn cut<C: Communicator>(
    comm: &C,
    graph: &DistGraph,
    halo: &Halo,
    part: &[BlockId],
    weighted: bool,
) -> Result<f64, PartError> {
    check_aligned("cut", graph.local_n(), part.len())?;
    let halo_part = halo.update_usize(comm, part)?;
    let mut local = 0.0;
    for i in 0..graph.local_n() {
        let my_block = part[i];
        let (cols, vals) = graph.row(i);
        for (&c, &w) in cols.iter().zip(vals) {
            let other = crate::dist::neighbor_value(graph, halo, part, &halo_part, c)?;
            if other != my_block {
                local += if weighted { w } else { 1.0 };
            }
        }
    }
    let mut buf = [local];
    collective::sum_f64(comm, &mut buf)?;
    Ok(buf[0] / 2.0)
}

/// Global block weights `W[w][b]`.
pub fn block_weights<C: Communicator>(
    comm: &C,
    part: &[BlockId],
    weights: &[Vec<f64>],
    k: usize,
) -> Result<Vec<Vec<f64>>, PartError> {
    let mut out = vec![vec![0.0; k]; weights.len()];
    for (w, weight) in weights.iter().enumerate() {
        check_aligned("block_weights", part.len(), weight.len())?;
        for (i, &b) in part.iter().enumerate() {
            out[w][b] += weight[i];
        }
        collective::sum_f64(comm, &mut out[w])?;
    }
    Ok(out)
}

/// Imbalance of one weight against explicit targets:
/// `max_b (W[b] - T[b]) / T[b]`.
pub fn imbalance_against<C: Communicator>(
    comm: &C,
    part: &[BlockId],
    weight: &[f64],
    targets: &[f64],
) -> Result<f64, PartError> {
    let weights = [weight.to_vec()];
    let sums = block_weights(comm, part, &weights, targets.len())?;
    Ok(max_imbalance(&sums[0], targets))
}

/// Imbalance from already-reduced block weights.
pub fn max_imbalance(block_weights: &[f64], targets: &[f64]) -> f64 {
    block_weights
        .iter()
        .zip(targets)
        .map(|(&w, &t)| (w - t) / t)
        .fold(f64::NEG_INFINITY, f64::max)
}

/// Uniform targets: total weight split evenly over `k` blocks.
pub fn uniform_targets<C: Communicator>(
    comm: &C,
    weights: &[Vec<f64>],
    k: usize,
) -> Result<Vec<Vec<f64>>, PartError> {
    let mut totals: Vec<f64> = weights.iter().map(|w| w.iter().sum()).collect();
    collective::sum_f64(comm, &mut totals)?;
    Ok(totals.iter().map(|&t| vec![t / k as f64; k]).collect())
}

/// Per-vertex border indicator: 1 iff some neighbour sits in another block.
pub fn border_nodes<C: Communicator>(
    comm: &C,
    graph: &DistGraph,
    halo: &Halo,
    part: &[BlockId],
) -> Result<Vec<u8>, PartError> {
    check_aligned("border_nodes", graph.local_n(), part.len())?;
    let halo_part = halo.update_usize(comm, part)?;
    let mut border = vec![0u8; graph.local_n()];
    for i in 0..graph.local_n() {
        let my_block = part[i];
        let (cols, _) = graph.row(i);
        for &c in cols {
            let other = crate::dist::neighbor_value(graph, halo, part, &halo_part, c)?;
            if other != my_block {
                border[i] = 1;
                break;
            }
        }
    }
    Ok(border)
}

/// Border and inner node counts per block, globally reduced.
pub fn border_inner_counts<C: Communicator>(
    comm: &C,
    graph: &DistGraph,
    halo: &Halo,
    part: &[BlockId],
    k: usize,
) -> Result<(Vec<u64>, Vec<u64>), PartError> {
    let border = border_nodes(comm, graph, halo, part)?;
    let mut border_per_block = vec![0u64; k];
    let mut inner_per_block = vec![0u64; k];
    for (i, &is_border) in border.iter().enumerate() {
        if is_border != 0 {
            border_per_block[part[i]] += 1;
        } else {
            inner_per_block[part[i]] += 1;
        }
    }
    collective::sum_u64(comm, &mut border_per_block)?;
    collective::sum_u64(comm, &mut inner_per_block)?;
    Ok((border_per_block, inner_per_block))
}

/// Per-block communication volume: for every node, the number of *distinct*
/// other blocks its neighbours hit, summed per source block.
pub fn comm_volume<C: Communicator>(
    comm: &C,
    graph: &DistGraph,
    halo: &Halo,
    part: &[BlockId],
    k: usize,
) -> Result<Vec<u64>, PartError> {
    check_aligned("comm_volume", graph.local_n(), part.len())?;
    let halo_part = halo.update_usize(comm, part)?;
    let mut volume = vec![0u64; k];
    let mut seen: HashSet<BlockId> = HashSet::new();
    for i in 0..graph.local_n() {
        let my_block = part[i];
        seen.clear();
        let (cols, _) = graph.row(i);
        for &c in cols {
            let other = crate::dist::neighbor_value(graph, halo, part, &halo_part, c)?;
            if other != my_block && seen.insert(other) {
                volume[my_block] += 1;
            }
        }
    }
    collective::sum_u64(comm, &mut volume)?;
    Ok(volume)
}

/// Block graph: k×k boolean adjacency, reduced by a global ring shift. Each
/// round every rank ORs its local block edges into the tile passing
/// through, so after `p` steps every rank holds the full reduction.
/// Quadratic in `k`; acknowledged expensive for very large block counts.
pub fn block_graph<C: Communicator>(
    comm: &C,
    graph: &DistGraph,
    halo: &Halo,
    part: &[BlockId],
    k: usize,
) -> Result<SparseBlockGraph, PartError> {
    check_aligned("block_graph", graph.local_n(), part.len())?;
    let halo_part = halo.update_usize(comm, part)?;

    let mut local_edges: HashSet<(BlockId, BlockId)> = HashSet::new();
    for i in 0..graph.local_n() {
        let a = part[i];
        let (cols, _) = graph.row(i);
        for &c in cols {
            let b = crate::dist::neighbor_value(graph, halo, part, &halo_part, c)?;
            if a != b {
                local_edges.insert((a, b));
                local_edges.insert((b, a));
            }
        }
    }

    // after p (write, shift) steps the tile held here has passed every rank
    let mut tile = vec![0u8; k * k];
    for _ in 0..comm.size() {
        for &(a, b) in &local_edges {
            tile[a * k + b] = 1;
        }
        tile = ring_shift_tile(comm, tile)?;
    }
    Ok(SparseBlockGraph::from_dense(k, &tile))
}

fn ring_shift_tile<C: Communicator>(comm: &C, tile: Vec<u8>) -> Result<Vec<u8>, PartError> {
    let shifted = collective::ring_shift(comm, &tile)?;
    if shifted.len() != tile.len() {
        return Err(PartError::collective(
            comm,
            "block_graph",
            format!("tile arrived with {} bytes, expected {}", shifted.len(), tile.len()),
        ));
    }
    Ok(shifted)
}

/// PE graph: one row per rank, edge (p, q) iff p owns a row referencing a
/// column owned by q; the weight is the number of referenced values.
/// Derived from the halo's require plan, then replicated by an all-gather.
pub fn pe_graph<C: Communicator>(comm: &C, halo: &Halo) -> Result<SparseBlockGraph, PartError> {
    let p = comm.size();
    let my_row: Vec<u64> = halo
        .require_counts()
        .flat_map(|(peer, count)| [peer as u64, count as u64])
        .collect();
    let rows = collective::all_gather_varlen(comm, wire::cast_slice(&my_row))?;

    let mut ia = Vec::with_capacity(p + 1);
    let mut ja = Vec::new();
    let mut vals = Vec::new();
    ia.push(0);
    for row in &rows {
        let pairs = wire::pod_vec_from::<u64>(row);
        for pair in pairs.chunks_exact(2) {
            ja.push(pair[0] as usize);
            vals.push(pair[1] as f64);
        }
        ia.push(ja.len());
    }
    Ok(SparseBlockGraph {
        n: p,
        ia,
        ja,
        vals,
    })
}

/// Collect the full metrics bundle for a finished partition.
pub fn gather_metrics<C: Communicator>(
    comm: &C,
    graph: &DistGraph,
    halo: &Halo,
    part: &[BlockId],
    weights: &[Vec<f64>],
    targets: &[Vec<f64>],
    k: usize,
) -> Result<PartitionMetrics, PartError> {
    validate_partition(comm, graph, part, k)?;
    let sums = block_weights(comm, part, weights, k)?;
    let imbalance: Vec<f64> = sums
        .iter()
        .zip(targets)
        .map(|(w, t)| max_imbalance(w, t))
        .collect();
    let cut = cut(comm, graph, halo, part, true)?;
    let volume = comm_volume(comm, graph, halo, part, k)?;
    let (border, inner) = border_inner_counts(comm, graph, halo, part, k)?;
    let bg = block_graph(comm, graph, halo, part, k)?;
    Ok(PartitionMetrics {
        cut,
        imbalance,
        comm_volume_max: volume.iter().copied().max().unwrap_or(0),
        comm_volume_total: volume.iter().sum(),
        max_block_degree: bg.max_degree(),
        border_nodes: border,
        inner_nodes: inner,
        converged: true,
        ..PartitionMetrics::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::NoComm;
    use crate::dist::Distribution;

    /// 2x2 grid: 0-1, 0-2, 1-3, 2-3 with unit weights.
    fn grid4() -> DistGraph {
        let dist = Distribution::block(0, 1, 4);
        DistGraph::new(
            dist,
            vec![0, 2, 4, 6, 8],
            vec![1, 2, 0, 3, 0, 3, 1, 2],
            vec![1.0; 8],
        )
        .unwrap()
    }

    #[test]
    fn cut_of_vertical_split() {
        let comm = NoComm;
        let g = grid4();
        let halo = Halo::build(&comm, &g).unwrap();
        let part = vec![0, 1, 0, 1];
        assert_eq!(cut(&comm, &g, &halo, &part, false).unwrap(), 2.0);
        // all in one block: no cut
        assert_eq!(cut(&comm, &g, &halo, &[0; 4], false).unwrap(), 0.0);
    }

    #[test]
    fn border_and_volume() {
        let comm = NoComm;
        let g = grid4();
        let halo = Halo::build(&comm, &g).unwrap();
        let part = vec![0, 1, 0, 1];
        let (border, inner) = border_inner_counts(&comm, &g, &halo, &part, 2).unwrap();
        assert_eq!(border, vec![2, 2]);
        assert_eq!(inner, vec![0, 0]);
        let volume = comm_volume(&comm, &g, &halo, &part, 2).unwrap();
        assert_eq!(volume, vec![2, 2]);
    }

    #[test]
    fn block_graph_has_zero_diagonal() {
        let comm = NoComm;
        let g = grid4();
        let halo = Halo::build(&comm, &g).unwrap();
        let part = vec![0, 1, 2, 3];
        let bg = block_graph(&comm, &g, &halo, &part, 4).unwrap();
        for b in 0..4 {
            assert!(!bg.neighbors(b).contains(&b));
        }
        assert_eq!(bg.edge_count(), 4);
    }

    #[test]
    fn imbalance_of_uneven_split() {
        let comm = NoComm;
        let part = vec![0, 0, 0, 1];
        let weights = vec![vec![1.0; 4]];
        let targets = uniform_targets(&comm, &weights, 2).unwrap();
        let imba = imbalance_against(&comm, &part, &weights[0], &targets[0]).unwrap();
        assert!((imba - 0.5).abs() < 1e-12);
    }

    #[test]
    fn partition_validation_rejects_large_ids() {
        let comm = NoComm;
        let g = grid4();
        assert!(validate_partition(&comm, &g, &[0, 1, 2, 5], 4).is_err());
        assert!(validate_partition(&comm, &g, &[0, 1, 2, 3], 4).is_ok());
    }
}
