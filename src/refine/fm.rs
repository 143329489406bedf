//! Two-way Fiduccia-Mattheyses on an exchanged border region.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::dist::GlobalId;
use crate::settings::{Settings, TieBreak};

/// Border region of one block pair, identical on both participating ranks.
///
/// `edges[u]` lists intra-region adjacency by index; `ext[u]` carries the
/// edge weight from u to pair vertices *outside* the region, split by pair
/// side. Edges to blocks other than the pair are irrelevant to the
/// exchange and are dropped at extraction.
#[derive(Clone, Debug, Default)]
pub struct Region {
    pub gids: Vec<GlobalId>,
    /// 0 = first block of the pair, 1 = second.
    pub side: Vec<u8>,
    pub weights: Vec<Vec<f64>>,
    /// dim-strided coordinates, used by geometric tie-breaking.
    pub coords: Vec<f64>,
    pub dim: usize,
    pub edges: Vec<Vec<(usize, f64)>>,
    pub ext: Vec<[f64; 2]>,
}

impl Region {
    pub fn len(&self) -> usize {
        self.gids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gids.is_empty()
    }
}

/// Result of one pairwise exchange: region indices with their new side and
/// the cut gain realized by applying the whole move list.
#[derive(Clone, Debug, Default)]
pub struct FmOutcome {
    pub moves: Vec<(usize, u8)>,
    pub gain: f64,
}

#[derive(Debug)]
struct HeapEntry {
    gain: f64,
    tie: f64,
    gid: GlobalId,
    generation: u64,
    index: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.gain
            .total_cmp(&other.gain)
            .then(self.tie.total_cmp(&other.tie))
            // lower id wins among equals so both ranks pop identically
            .then(other.gid.cmp(&self.gid))
    }
}

/// Gain of moving region vertex `u` to the opposite side.
fn move_gain(region: &Region, side: &[u8], u: usize) -> f64 {
    let own = side[u] as usize;
    let other = 1 - own;
    let mut gain = region.ext[u][other] - region.ext[u][own];
    for &(v, w) in &region.edges[u] {
        if side[v] as usize == own {
            gain -= w;
        } else {
            gain += w;
        }
    }
    gain
}

/// Diffusion potentials toward each side: a few Jacobi sweeps of heat
/// seeded on the opposite side; a higher potential means better connected.
fn diffusion_potentials(region: &Region) -> [Vec<f64>; 2] {
    const SWEEPS: usize = 8;
    let n = region.len();
    let mut result = [vec![0.0; n], vec![0.0; n]];
    for target in 0..2 {
        let mut phi: Vec<f64> = (0..n)
            .map(|u| if region.side[u] == target as u8 { 1.0 } else { 0.0 })
            .collect();
        for _ in 0..SWEEPS {
            let mut next = phi.clone();
            for u in 0..n {
                let mut acc = 0.0;
                let mut degree = 0.0;
                for &(v, w) in &region.edges[u] {
                    acc += w * phi[v];
                    degree += w;
                }
                if degree > 0.0 {
                    next[u] = 0.5 * phi[u] + 0.5 * acc / degree;
                }
            }
            phi = next;
        }
        result[target] = phi;
    }
    result
}

fn centroid_of_side(region: &Region, side_id: u8) -> Vec<f64> {
    let dim = region.dim;
    let mut acc = vec![0.0; dim];
    let mut count = 0.0;
    for u in 0..region.len() {
        if region.side[u] == side_id {
            for d in 0..dim {
                acc[d] += region.coords[u * dim + d];
            }
            count += 1.0;
        }
    }
    if count > 0.0 {
        for a in acc.iter_mut() {
            *a /= count;
        }
    }
    acc
}

/// Secondary heap key for a prospective move of `u` to `target`.
fn tie_value(
    region: &Region,
    settings: &Settings,
    potentials: &[Vec<f64>; 2],
    centroids: &[Vec<f64>; 2],
    balance_pull: f64,
    u: usize,
    target: usize,
) -> f64 {
    match settings.tie_break {
        TieBreak::Geometric => {
            // nearer the target centroid is better
            let dim = region.dim;
            let mut d = 0.0;
            for k in 0..dim {
                let diff = region.coords[u * dim + k] - centroids[target][k];
                d += diff * diff;
            }
            -d
        }
        TieBreak::Diffusion => potentials[target][u],
        TieBreak::Plain => {
            if settings.gain_over_balance {
                0.0
            } else {
                balance_pull
            }
        }
    }
}

/// Run two-way FM over the region.
///
/// `block_weights[side][w]` and `targets[side][w]` describe the *global*
/// pair weights; the balance cap `(1 + eps) * target` is enforced per move
/// and per weight. The move sequence is rolled back to the prefix with the
/// largest cumulative gain, so the reported gain is exactly the cut
/// reduction of the returned moves. No vertex moves twice.
pub fn two_way_fm(
    region: &Region,
    mut block_weights: [Vec<f64>; 2],
    targets: &[Vec<f64>; 2],
    settings: &Settings,
) -> FmOutcome {
    let n = region.len();
    if n == 0 {
        return FmOutcome::default();
    }
    let num_weights = region.weights.len();
    let mut side: Vec<u8> = region.side.clone();
    let mut locked = vec![false; n];
    let mut generation = vec![0u64; n];

    let potentials = if settings.tie_break == TieBreak::Diffusion {
        diffusion_potentials(region)
    } else {
        [Vec::new(), Vec::new()]
    };
    let centroids = [centroid_of_side(region, 0), centroid_of_side(region, 1)];

    let push = |heaps: &mut [BinaryHeap<HeapEntry>; 2],
                side: &[u8],
                generation: &[u64],
                block_weights: &[Vec<f64>; 2],
                u: usize| {
        let own = side[u] as usize;
        let target = 1 - own;
        // pull toward the lighter side when balance breaks ties
        let balance_pull = (block_weights[own][0] - targets[own][0]) / targets[own][0];
        let tie = tie_value(
            region,
            settings,
            &potentials,
            &centroids,
            balance_pull,
            u,
            target,
        );
        heaps[own].push(HeapEntry {
            gain: move_gain(region, side, u),
            tie,
            gid: region.gids[u],
            generation: generation[u],
            index: u,
        });
    };

    let mut heaps: [BinaryHeap<HeapEntry>; 2] = [BinaryHeap::new(), BinaryHeap::new()];
    for u in 0..n {
        push(&mut heaps, &side, &generation, &block_weights, u);
    }

    let fits = |block_weights: &[Vec<f64>; 2], target_side: usize, u: usize| -> bool {
        (0..num_weights).all(|w| {
            block_weights[target_side][w] + region.weights[w][u]
                <= targets[target_side][w] * (1.0 + settings.epsilon_for(w))
        })
    };

    let mut sequence: Vec<(usize, u8, f64)> = Vec::new();
    let mut cumulative = 0.0;
    loop {
        // freshest feasible candidate per side; entries blocked only by the
        // balance cap are deferred and re-pushed after the move
        let mut deferred: Vec<(usize, HeapEntry)> = Vec::new();
        let mut candidates: Vec<(usize, f64, f64, GlobalId, usize)> = Vec::new();
        for s in 0..2 {
            loop {
                let top = heaps[s].peek().map(|top| {
                    let stale = locked[top.index]
                        || top.generation != generation[top.index]
                        || side[top.index] as usize != s;
                    (top.gain, top.tie, top.gid, top.index, stale)
                });
                let Some((gain, tie, gid, index, stale)) = top else { break };
                if stale {
                    heaps[s].pop();
                } else if !fits(&block_weights, 1 - s, index) {
                    let entry = heaps[s].pop().expect("peeked entry");
                    deferred.push((s, entry));
                } else {
                    candidates.push((s, gain, tie, gid, index));
                    break;
                }
            }
        }
        candidates.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then(b.2.total_cmp(&a.2))
                .then(a.3.cmp(&b.3))
                .then(a.0.cmp(&b.0))
        });
        let chosen = candidates.first().map(|&(s, _, _, _, u)| (s, u));
        if let Some((s, _)) = chosen {
            // take the winner off its heap before the deferred entries,
            // which may outrank it, go back in
            heaps[s].pop();
        }
        for (s, entry) in deferred {
            heaps[s].push(entry);
        }
        let Some((s, u)) = chosen else { break };

        let target = 1 - s;
        let gain = move_gain(region, &side, u);
        for w in 0..num_weights {
            block_weights[s][w] -= region.weights[w][u];
            block_weights[target][w] += region.weights[w][u];
        }
        side[u] = target as u8;
        locked[u] = true;
        cumulative += gain;
        sequence.push((u, target as u8, cumulative));

        // neighbour gains changed; re-key them lazily
        for &(v, _) in &region.edges[u] {
            if !locked[v] {
                generation[v] += 1;
                push(&mut heaps, &side, &generation, &block_weights, v);
            }
        }
    }

    // keep the best prefix; a non-positive best keeps nothing
    let mut best_len = 0;
    let mut best_gain = 0.0;
    for (i, &(_, _, cum)) in sequence.iter().enumerate() {
        if cum > best_gain {
            best_gain = cum;
            best_len = i + 1;
        }
    }
    FmOutcome {
        moves: sequence[..best_len]
            .iter()
            .map(|&(u, to, _)| (u, to))
            .collect(),
        gain: best_gain,
    }
}
