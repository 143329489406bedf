//! Distributed local refinement: pairwise FM boundary exchanges on an
//! edge-colored schedule.
//!
//! Every color class of the block graph is a matching of block pairs; the
//! two sides of a pair exchange their border regions, run the identical
//! deterministic two-way FM, and apply the same move list to their own
//! vertices. With one rank all pairs are handled locally; with `k == p`
//! ranks exchange pairwise and moved vertices migrate to their new owner
//! after every sweep.

pub mod coloring;
pub mod fm;

use hashbrown::HashMap;
use tracing::{debug, info, warn};

use crate::comm::{collective, wire, Communicator};
use crate::dist::{
    redistribute_f64, redistribute_graph, redistribute_points, redistribute_usize, BlockId,
    Distribution, GlobalId, Halo,
};
use crate::error::PartError;
use crate::metrics::PartitionMetrics;
use crate::multilevel::Level;
use crate::settings::Settings;
use fm::{two_way_fm, Region};

const MAX_SWEEPS: usize = 20;

/// Refine the partition of one level in place. Returns the cumulative cut
/// gain. Levels that are neither serial (`p == 1`) nor block-per-rank
/// (`k == p`) are left untouched.
pub fn refine_level<C: Communicator>(
    comm: &C,
    level: &mut Level,
    targets: &[Vec<f64>],
    settings: &Settings,
    metrics: &mut PartitionMetrics,
) -> Result<f64, PartError> {
    let k = targets[0].len();
    let p = comm.size();
    if p > 1 && k != p {
        warn!(k, p, "pairwise refinement needs one block per rank; skipping");
        return Ok(0.0);
    }
    if p > 1 {
        migrate_to_partition(comm, level)?;
    }

    let mut total_gain = 0.0;
    let mut no_gain_sweeps = 0;
    let mut prev_color_gains: Vec<f64> = Vec::new();

    for sweep in 0..MAX_SWEEPS {
        let halo = Halo::build(comm, &level.graph)?;
        let block_graph =
            crate::metrics::block_graph(comm, &level.graph, &halo, &level.partition, k)?;
        let classes = coloring::color_block_pairs(&block_graph);
        let mut color_gains = vec![0.0; classes.len()];
        let mut moved_any = false;

        for (color, pairs) in classes.iter().enumerate() {
            if settings.skip_no_gain_colors
                && prev_color_gains.get(color).is_some_and(|&g| g <= 0.0)
            {
                continue;
            }
            // moves of earlier colors shift both the partition and the
            // block weights; refresh the shared view per color
            let halo_part = halo.update_usize(comm, &level.partition)?;
            let mut block_weights =
                crate::metrics::block_weights(comm, &level.partition, &level.weights, k)?;

            if p == 1 {
                for &(a, b) in pairs {
                    let gain = refine_pair_local(
                        level,
                        (a, b),
                        targets,
                        &mut block_weights,
                        settings,
                    );
                    color_gains[color] += gain;
                    moved_any |= gain != 0.0;
                }
            } else {
                let rank = comm.rank();
                if let Some(&(a, b)) = pairs.iter().find(|&&(a, b)| a == rank || b == rank) {
                    let gain = refine_pair_exchange(
                        comm,
                        level,
                        &halo,
                        &halo_part,
                        (a, b),
                        targets,
                        &block_weights,
                        settings,
                    )?;
                    if rank == a {
                        color_gains[color] += gain;
                    }
                    moved_any |= gain != 0.0;
                }
            }
        }

        collective::sum_f64(comm, &mut color_gains)?;
        let sweep_gain: f64 = color_gains.iter().sum();
        total_gain += sweep_gain;
        prev_color_gains = color_gains;
        debug!(sweep, gain = sweep_gain, "refinement sweep");

        if p > 1 && collective::any_true(comm, moved_any)? {
            migrate_to_partition(comm, level)?;
        }

        if sweep_gain < settings.min_gain_for_next_round {
            no_gain_sweeps += 1;
            if no_gain_sweeps >= settings.stop_after_no_gain_rounds {
                break;
            }
        } else {
            no_gain_sweeps = 0;
        }
    }

    info!(gain = total_gain, "local refinement finished");
    metrics.refinement_gain += total_gain;
    Ok(total_gain)
}

/// Move every vertex to the rank matching its block: the distribution
/// follows the partition. No-op on one rank.
pub fn migrate_to_partition<C: Communicator>(
    comm: &C,
    level: &mut Level,
) -> Result<(), PartError> {
    let p = comm.size();
    if p == 1 {
        return Ok(());
    }
    let old_dist = level.graph.dist.clone();
    let mut claims: Vec<Vec<u64>> = vec![Vec::new(); p];
    for (local, &block) in level.partition.iter().enumerate() {
        claims[block].push(old_dist.global_of(local) as u64);
    }
    let incoming = collective::all_to_allv(
        comm,
        &claims
            .iter()
            .map(|m| wire::cast_slice(m).to_vec())
            .collect::<Vec<_>>(),
    )?;
    let mut owned: Vec<GlobalId> = incoming
        .iter()
        .flat_map(|bytes| wire::pod_vec_from::<u64>(bytes))
        .map(|g| g as usize)
        .collect();
    owned.sort_unstable();
    let new_dist = Distribution::general(comm, owned, old_dist.global_size())?;

    level.graph = redistribute_graph(comm, &level.graph, &new_dist)?;
    level.points = redistribute_points(comm, &old_dist, &new_dist, &level.points)?;
    for weights in level.weights.iter_mut() {
        *weights = redistribute_f64(comm, &old_dist, &new_dist, weights, 1)?;
    }
    level.partition = redistribute_usize(comm, &old_dist, &new_dist, &level.partition)?;
    Ok(())
}

/// Grow a side of the border region: BFS inside `block` from the border
/// vertices until `min_border_nodes` vertices are collected or the
/// frontier dries up.
fn grow_side(
    level: &Level,
    seeds: Vec<usize>,
    block: BlockId,
    min_border_nodes: usize,
) -> Vec<usize> {
    let mut in_region = vec![false; level.graph.local_n()];
    let mut region = Vec::new();
    let mut frontier = Vec::new();
    for s in seeds {
        if !in_region[s] {
            in_region[s] = true;
            region.push(s);
            frontier.push(s);
        }
    }
    while region.len() < min_border_nodes && !frontier.is_empty() {
        let mut next = Vec::new();
        for &u in &frontier {
            let (cols, _) = level.graph.row(u);
            for &v_gid in cols {
                if let Some(v) = level.graph.dist.local_of(v_gid) {
                    if !in_region[v] && level.partition[v] == block {
                        in_region[v] = true;
                        region.push(v);
                        next.push(v);
                    }
                }
            }
        }
        frontier = next;
    }
    region.sort_unstable();
    region
}

/// Local border vertices of `block` with a neighbour in `other`.
fn border_of(
    level: &Level,
    halo: &Halo,
    halo_part: &[usize],
    block: BlockId,
    other: BlockId,
) -> Vec<usize> {
    let mut out = Vec::new();
    for u in 0..level.graph.local_n() {
        if level.partition[u] != block {
            continue;
        }
        let (cols, _) = level.graph.row(u);
        let touches = cols.iter().any(|&v_gid| {
            match level.graph.dist.local_of(v_gid) {
                Some(v) => level.partition[v] == other,
                None => halo
                    .slot(v_gid)
                    .map(|s| halo_part[s] == other)
                    .unwrap_or(false),
            }
        });
        if touches {
            out.push(u);
        }
    }
    out
}

/// One half of a region in wire form: the sender's block weight vector
/// followed by its vertices with their pair-restricted edge lists.
fn encode_half(
    level: &Level,
    halo: &Halo,
    halo_part: &[usize],
    members: &[usize],
    pair: (BlockId, BlockId),
    my_weight: &[f64],
) -> Vec<u64> {
    let dim = level.points.dim();
    let mut msg: Vec<u64> = Vec::new();
    msg.extend(my_weight.iter().map(|w| w.to_bits()));
    msg.push(members.len() as u64);
    for &u in members {
        msg.push(level.graph.dist.global_of(u) as u64);
        for weights in &level.weights {
            msg.push(weights[u].to_bits());
        }
        for &x in level.points.point(u) {
            msg.push(x.to_bits());
        }
        let (cols, vals) = level.graph.row(u);
        let mut edges: Vec<(u64, u64, u64)> = Vec::new();
        for (&v_gid, &w) in cols.iter().zip(vals) {
            let v_block = match level.graph.dist.local_of(v_gid) {
                Some(v) => level.partition[v],
                None => match halo.slot(v_gid) {
                    Some(s) => halo_part[s],
                    None => continue,
                },
            };
            let side = if v_block == pair.0 {
                0u64
            } else if v_block == pair.1 {
                1u64
            } else {
                continue;
            };
            edges.push((v_gid as u64, w.to_bits(), side));
        }
        msg.push(edges.len() as u64);
        for (gid, w, side) in edges {
            msg.push(gid);
            msg.push(w);
            msg.push(side);
        }
    }
    msg
}

struct HalfVertices {
    gids: Vec<GlobalId>,
    weights: Vec<Vec<f64>>,
    coords: Vec<f64>,
    edges: Vec<Vec<(GlobalId, f64, u8)>>,
    block_weight: Vec<f64>,
}

fn decode_half(words: &[u64], num_weights: usize, dim: usize) -> HalfVertices {
    let mut half = HalfVertices {
        gids: Vec::new(),
        weights: vec![Vec::new(); num_weights],
        coords: Vec::new(),
        edges: Vec::new(),
        block_weight: Vec::with_capacity(num_weights),
    };
    let mut at = 0;
    for _ in 0..num_weights {
        half.block_weight.push(f64::from_bits(words[at]));
        at += 1;
    }
    let count = words[at] as usize;
    at += 1;
    for _ in 0..count {
        half.gids.push(words[at] as usize);
        at += 1;
        for w in 0..num_weights {
            half.weights[w].push(f64::from_bits(words[at]));
            at += 1;
        }
        for _ in 0..dim {
            half.coords.push(f64::from_bits(words[at]));
            at += 1;
        }
        let edge_count = words[at] as usize;
        at += 1;
        let mut edges = Vec::with_capacity(edge_count);
        for _ in 0..edge_count {
            edges.push((
                words[at] as usize,
                f64::from_bits(words[at + 1]),
                words[at + 2] as u8,
            ));
            at += 3;
        }
        half.edges.push(edges);
    }
    half
}

/// Merge the two halves into the shared region. Vertices are sorted by
/// global id so both ranks build the identical structure; edges whose far
/// end lies outside the region fold into the per-side external weights.
fn merge_halves(
    halves: [&HalfVertices; 2],
    num_weights: usize,
    dim: usize,
) -> Region {
    let mut order: Vec<(GlobalId, u8, usize)> = Vec::new();
    for (side, half) in halves.iter().enumerate() {
        for (i, &gid) in half.gids.iter().enumerate() {
            order.push((gid, side as u8, i));
        }
    }
    order.sort_unstable();

    let n = order.len();
    let index_of: HashMap<GlobalId, usize> = order
        .iter()
        .enumerate()
        .map(|(idx, &(gid, _, _))| (gid, idx))
        .collect();

    let mut region = Region {
        gids: Vec::with_capacity(n),
        side: Vec::with_capacity(n),
        weights: vec![Vec::with_capacity(n); num_weights],
        coords: Vec::with_capacity(n * dim),
        dim,
        edges: vec![Vec::new(); n],
        ext: vec![[0.0, 0.0]; n],
    };
    for (idx, &(gid, side, i)) in order.iter().enumerate() {
        let half = halves[side as usize];
        region.gids.push(gid);
        region.side.push(side);
        for w in 0..num_weights {
            region.weights[w].push(half.weights[w][i]);
        }
        region
            .coords
            .extend_from_slice(&half.coords[i * dim..(i + 1) * dim]);
        for &(v_gid, w, v_side) in &half.edges[i] {
            match index_of.get(&v_gid) {
                Some(&v_idx) => region.edges[idx].push((v_idx, w)),
                None => region.ext[idx][v_side as usize] += w,
            }
        }
    }
    region
}

fn build_half(
    level: &Level,
    halo: &Halo,
    halo_part: &[usize],
    pair: (BlockId, BlockId),
    block: BlockId,
    settings: &Settings,
    block_weight: &[f64],
) -> (Vec<usize>, Vec<u64>) {
    let other = if block == pair.0 { pair.1 } else { pair.0 };
    let seeds = border_of(level, halo, halo_part, block, other);
    let members = grow_side(level, seeds, block, settings.min_border_nodes);
    let words = encode_half(level, halo, halo_part, &members, pair, block_weight);
    (members, words)
}

/// Apply the agreed move list to the locally owned vertices and update the
/// running block weights.
fn apply_moves(
    level: &mut Level,
    region: &Region,
    moves: &[(usize, u8)],
    pair: (BlockId, BlockId),
    block_weights: &mut [Vec<f64>],
) {
    for &(idx, to) in moves {
        let gid = region.gids[idx];
        let from_block = if region.side[idx] == 0 { pair.0 } else { pair.1 };
        let to_block = if to == 0 { pair.0 } else { pair.1 };
        for w in 0..region.weights.len() {
            block_weights[w][from_block] -= region.weights[w][idx];
            block_weights[w][to_block] += region.weights[w][idx];
        }
        if let Some(local) = level.graph.dist.local_of(gid) {
            level.partition[local] = to_block;
        }
    }
}

/// Serial pair refinement: both sides of the pair are owned here.
fn refine_pair_local(
    level: &mut Level,
    pair: (BlockId, BlockId),
    targets: &[Vec<f64>],
    block_weights: &mut [Vec<f64>],
    settings: &Settings,
) -> f64 {
    let num_weights = level.weights.len();
    let dim = level.points.dim();
    let halo = Halo::default();
    let halo_part: Vec<usize> = Vec::new();

    let weight_a: Vec<f64> = (0..num_weights).map(|w| block_weights[w][pair.0]).collect();
    let weight_b: Vec<f64> = (0..num_weights).map(|w| block_weights[w][pair.1]).collect();
    let (_, words_a) =
        build_half(level, &halo, &halo_part, pair, pair.0, settings, &weight_a);
    let (_, words_b) =
        build_half(level, &halo, &halo_part, pair, pair.1, settings, &weight_b);
    let half_a = decode_half(&words_a, num_weights, dim);
    let half_b = decode_half(&words_b, num_weights, dim);
    let region = merge_halves([&half_a, &half_b], num_weights, dim);
    if region.is_empty() {
        return 0.0;
    }

    let pair_weights = [half_a.block_weight.clone(), half_b.block_weight.clone()];
    let pair_targets = [
        (0..num_weights).map(|w| targets[w][pair.0]).collect(),
        (0..num_weights).map(|w| targets[w][pair.1]).collect(),
    ];
    let outcome = two_way_fm(&region, pair_weights, &pair_targets, settings);
    apply_moves(level, &region, &outcome.moves, pair, block_weights);
    outcome.gain
}

/// Distributed pair refinement: this rank owns one side, the peer rank the
/// other. Both run the identical FM and apply the shared move list.
#[allow(clippy::too_many_arguments)]
fn refine_pair_exchange<C: Communicator>(
    comm: &C,
    level: &mut Level,
    halo: &Halo,
    halo_part: &[usize],
    pair: (BlockId, BlockId),
    targets: &[Vec<f64>],
    block_weights: &[Vec<f64>],
    settings: &Settings,
) -> Result<f64, PartError> {
    let rank = comm.rank();
    let num_weights = level.weights.len();
    let dim = level.points.dim();
    let my_block = rank;
    let peer = if pair.0 == rank { pair.1 } else { pair.0 };

    let my_weight: Vec<f64> = (0..num_weights).map(|w| block_weights[w][my_block]).collect();
    let (_, my_words) =
        build_half(level, halo, halo_part, pair, my_block, settings, &my_weight);
    let peer_bytes = collective::swap_with(comm, peer, wire::cast_slice(&my_words))?;
    let peer_words = wire::pod_vec_from::<u64>(&peer_bytes);

    let my_half = decode_half(&my_words, num_weights, dim);
    let peer_half = decode_half(&peer_words, num_weights, dim);
    let (half_a, half_b) = if my_block == pair.0 {
        (&my_half, &peer_half)
    } else {
        (&peer_half, &my_half)
    };
    let region = merge_halves([half_a, half_b], num_weights, dim);
    if region.is_empty() {
        return Ok(0.0);
    }

    let pair_weights = [half_a.block_weight.clone(), half_b.block_weight.clone()];
    let pair_targets = [
        (0..num_weights).map(|w| targets[w][pair.0]).collect(),
        (0..num_weights).map(|w| targets[w][pair.1]).collect(),
    ];
    let outcome = two_way_fm(&region, pair_weights, &pair_targets, settings);

    let mut scratch_weights = block_weights.to_vec();
    apply_moves(level, &region, &outcome.moves, pair, &mut scratch_weights);
    Ok(outcome.gain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::NoComm;
    use crate::dist::DistGraph;
    use crate::geometry::Points;

    /// 4x4 grid with a deliberately ragged 2-block split.
    fn ragged_grid() -> Level {
        let side = 4;
        let n = side * side;
        let dist = Distribution::block(0, 1, n);
        let mut ia = vec![0];
        let mut ja = Vec::new();
        for i in 0..side {
            for j in 0..side {
                if i > 0 {
                    ja.push((i - 1) * side + j);
                }
                if j > 0 {
                    ja.push(i * side + j - 1);
                }
                if j + 1 < side {
                    ja.push(i * side + j + 1);
                }
                if i + 1 < side {
                    ja.push((i + 1) * side + j);
                }
                ia.push(ja.len());
            }
        }
        let vals = vec![1.0; ja.len()];
        let graph = DistGraph::new(dist, ia, ja, vals).unwrap();
        let mut coords = Vec::new();
        for i in 0..side {
            for j in 0..side {
                coords.push(j as f64);
                coords.push(i as f64);
            }
        }
        // zig-zag split: 8 vertices per block but a poor boundary; even
        // rows hold [0,0,1,1], odd rows [1,1,0,0]
        let partition: Vec<BlockId> = (0..n)
            .map(|v| {
                let (row, col) = (v / side, v % side);
                (usize::from(col >= side / 2) + row) % 2
            })
            .collect();
        Level {
            graph,
            points: Points::new(2, coords).unwrap(),
            weights: vec![vec![1.0; n]],
            partition,
        }
    }

    #[test]
    fn refinement_reduces_the_cut() {
        let comm = NoComm;
        let mut level = ragged_grid();
        let targets = vec![vec![8.0, 8.0]];
        // blocks of 8 need headroom for single-vertex excursions
        let settings = Settings {
            num_blocks: 2,
            min_border_nodes: 16,
            min_gain_for_next_round: 0.5,
            epsilon: 0.2,
            ..Settings::default()
        };
        let halo = Halo::build(&comm, &level.graph).unwrap();
        let before = crate::metrics::cut(&comm, &level.graph, &halo, &level.partition, false)
            .unwrap();
        let mut metrics = PartitionMetrics::default();
        let gain =
            refine_level(&comm, &mut level, &targets, &settings, &mut metrics).unwrap();
        let after = crate::metrics::cut(&comm, &level.graph, &halo, &level.partition, false)
            .unwrap();
        assert!(after < before, "cut {before} did not improve ({after})");
        // reported gains account exactly for the cut change
        assert_eq!(before - after, gain);
    }

    #[test]
    fn balanced_partition_stays_balanced() {
        let comm = NoComm;
        let mut level = ragged_grid();
        let targets = vec![vec![8.0, 8.0]];
        let settings = Settings {
            num_blocks: 2,
            min_border_nodes: 16,
            epsilon: 0.2,
            ..Settings::default()
        };
        let mut metrics = PartitionMetrics::default();
        refine_level(&comm, &mut level, &targets, &settings, &mut metrics).unwrap();
        let sums =
            crate::metrics::block_weights(&comm, &level.partition, &level.weights, 2).unwrap();
        for b in 0..2 {
            assert!(sums[0][b] <= 8.0 * (1.0 + settings.epsilon) + 1e-9);
        }
    }
}
