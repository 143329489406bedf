//! Hard-balance post-processing: fuzzy memberships and the batched
//! rebalance walk.

use tracing::debug;

use crate::comm::{collective, Communicator};
use crate::dist::{check_aligned, BlockId};
use crate::error::PartError;
use crate::geometry::{dist_sq, Points};
use crate::settings::{BalanceMethod, Settings};

/// Fuzzy assignment of one point: the closest centers with their plain
/// Euclidean distances, ascending.
pub type FuzzyEntry = Vec<(f64, BlockId)>;

/// For every local point, the `centers_to_use` nearest block centroids of
/// the given partition.
pub fn fuzzify<C: Communicator>(
    comm: &C,
    points: &Points,
    partition: &[BlockId],
    k: usize,
    node_weights: &[Vec<f64>],
    centers_to_use: usize,
) -> Result<Vec<FuzzyEntry>, PartError> {
    let local_n = points.len();
    check_aligned("fuzzify", local_n, partition.len())?;
    let sample: Vec<usize> = (0..local_n).collect();
    let centers = super::seeding::centers_of_partition(
        comm,
        points,
        partition,
        k,
        &sample,
        &node_weights[0],
    )?;
    let ctu = centers_to_use.min(k);

    let mut fuzzy = Vec::with_capacity(local_n);
    for i in 0..local_n {
        let mut distances: Vec<(f64, BlockId)> = centers
            .iter()
            .enumerate()
            .map(|(c, center)| {
                // empty blocks never appear among the closest centers
                let d = center
                    .as_ref()
                    .map(|center| dist_sq(center, points.point(i)).sqrt())
                    .unwrap_or(f64::INFINITY);
                (d, c)
            })
            .collect();
        distances.sort_by(|a, b| a.0.partial_cmp(&b.0).expect("finite distance").then(a.1.cmp(&b.1)));
        distances.truncate(ctu);
        fuzzy.push(distances);
    }
    Ok(fuzzy)
}

/// Inverse-square memberships per point: `m[i][j] = 1 / (d_j^2 * sum_t 1/d_t^2)`.
pub fn memberships(fuzzy: &[FuzzyEntry]) -> Vec<Vec<f64>> {
    fuzzy
        .iter()
        .map(|entry| {
            if let Some(hit) = entry.iter().position(|&(d, _)| d < 1e-12) {
                // a point on a center belongs there outright
                let mut m = vec![0.0; entry.len()];
                m[hit] = 1.0;
                return m;
            }
            let inv_sum: f64 = entry.iter().map(|&(d, _)| 1.0 / (d * d)).sum();
            entry
                .iter()
                .map(|&(d, _)| 1.0 / (d * d * inv_sum))
                .collect()
        })
        .collect()
}

/// Collapse the membership vector of every point into one crispness value:
/// `sum_c (m_c - 1/ctu)^2`. Low values mark fuzzy points between centers.
pub fn membership_one_value(fuzzy: &[FuzzyEntry]) -> Vec<f64> {
    let memberships = memberships(fuzzy);
    memberships
        .iter()
        .map(|m| {
            let flat = 1.0 / m.len() as f64;
            m.iter().map(|&x| (x - flat) * (x - flat)).sum()
        })
        .collect()
}

/// Crispness normalized by the global per-block maximum.
pub fn membership_normalized<C: Communicator>(
    comm: &C,
    fuzzy: &[FuzzyEntry],
    partition: &[BlockId],
    k: usize,
) -> Result<Vec<f64>, PartError> {
    let mut values = membership_one_value(fuzzy);
    let mut max_per_block = vec![f64::NEG_INFINITY; k];
    for (i, &b) in partition.iter().enumerate() {
        max_per_block[b] = max_per_block[b].max(values[i]);
    }
    collective::max_f64(comm, &mut max_per_block)?;
    for (i, &b) in partition.iter().enumerate() {
        if max_per_block[b] > 0.0 {
            values[i] /= max_per_block[b];
        }
    }
    Ok(values)
}

/// Move points between blocks to shrink the maximum imbalance.
///
/// Local points are walked in an order that prefers points of overweight
/// blocks with fuzzy membership; a move is accepted only when it strictly
/// reduces the maximum imbalance over all weights and keeps the receiving
/// block under its caps. Block weights are re-synchronized globally after
/// every batch; the first batches restart the walk with a fresh order.
/// Returns the number of local moves.
pub fn rebalance<C: Communicator>(
    comm: &C,
    points: &Points,
    node_weights: &[Vec<f64>],
    targets: &[Vec<f64>],
    partition: &mut [BlockId],
    settings: &Settings,
    point_share: f64,
) -> Result<usize, PartError> {
    const CENTERS_TO_USE: usize = 6;
    const MAX_RESTARTS: usize = 5;

    let local_n = points.len();
    let num_weights = node_weights.len();
    let k = targets[0].len();
    check_aligned("rebalance", local_n, partition.len())?;

    let fuzzy = fuzzify(comm, points, partition, k, node_weights, CENTERS_TO_USE)?;
    let crispness = membership_normalized(comm, &fuzzy, partition, k)?;

    let mut block_weights = crate::metrics::block_weights(comm, partition, node_weights, k)?;
    let mut imbalance = vec![vec![0.0; k]; num_weights];
    let mut max_imbalance = vec![f64::NEG_INFINITY; k];
    let refresh_imbalances = |block_weights: &[Vec<f64>],
                              imbalance: &mut Vec<Vec<f64>>,
                              max_imbalance: &mut Vec<f64>| {
        for b in 0..k {
            max_imbalance[b] = f64::NEG_INFINITY;
        }
        for w in 0..num_weights {
            for b in 0..k {
                imbalance[w][b] = (block_weights[w][b] - targets[w][b]) / targets[w][b];
                max_imbalance[b] = max_imbalance[b].max(imbalance[w][b]);
            }
        }
    };
    refresh_imbalances(&block_weights, &mut imbalance, &mut max_imbalance);

    let sort_order = |partition: &[BlockId], max_imbalance: &[f64]| -> Vec<usize> {
        let mut order: Vec<usize> = (0..local_n).collect();
        match settings.balance_method {
            BalanceMethod::RebImbaSq => order.sort_by(|&i, &j| {
                let fi = max_imbalance[partition[i]].powi(2) / crispness[i];
                let fj = max_imbalance[partition[j]].powi(2) / crispness[j];
                fj.partial_cmp(&fi).unwrap_or(std::cmp::Ordering::Equal).then(i.cmp(&j))
            }),
            _ => order.sort_by(|&i, &j| {
                let (bi, bj) = (partition[i], partition[j]);
                if bi == bj || max_imbalance[bi] == max_imbalance[bj] {
                    return crispness[i]
                        .partial_cmp(&crispness[j])
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(i.cmp(&j));
                }
                max_imbalance[bj]
                    .partial_cmp(&max_imbalance[bi])
                    .unwrap_or(std::cmp::Ordering::Equal)
            }),
        }
        order
    };
    let mut order = sort_order(partition, &max_imbalance);

    let mut to_check = [local_n as u64];
    collective::min_u64(comm, &mut to_check)?;
    let points_to_check = ((to_check[0] as f64) * point_share) as usize;

    let mut batch = [((local_n as f64 * settings.batch_percent) as u64) + 1];
    collective::min_u64(comm, &mut batch)?;
    let mut batch = batch[0] as usize;

    let mut has_moved = vec![false; local_n];
    let mut weight_diff = vec![vec![0.0; k]; num_weights];
    let mut moves = 0usize;
    let mut walked = 0usize;
    let mut restarts = 0usize;
    let mut me_done = points_to_check == 0;

    loop {
        // process one batch of local points
        let mut steps = 0;
        while !me_done && steps < batch {
            let i = order[walked];
            let my_block = partition[i];
            steps += 1;
            if walked + 1 < points_to_check {
                walked += 1;
            } else {
                me_done = true;
            }
            if has_moved[i] || max_imbalance[my_block] < -0.05 {
                continue;
            }

            let my_weights: Vec<f64> = node_weights.iter().map(|w| w[i]).collect();
            // imbalance of this block after the removal
            let removed: Vec<f64> = (0..num_weights)
                .map(|w| imbalance[w][my_block] - my_weights[w] / targets[w][my_block])
                .collect();
            let removed_max = removed.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            if removed_max <= 0.0 {
                continue;
            }

            let mut best_block = my_block;
            let mut best_max = f64::MAX;
            let mut best_imbalances: Vec<f64> = Vec::new();
            for &(_, candidate) in &fuzzy[i] {
                if candidate == my_block || candidate >= k {
                    continue;
                }
                if max_imbalance[candidate] > settings.epsilon_for(0)
                    || (0..num_weights)
                        .any(|w| imbalance[w][candidate] > settings.epsilon_for(w))
                {
                    continue;
                }
                let added: Vec<f64> = (0..num_weights)
                    .map(|w| imbalance[w][candidate] + my_weights[w] / targets[w][candidate])
                    .collect();
                let added_max = added.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                if added_max < best_max {
                    best_max = added_max;
                    best_block = candidate;
                    best_imbalances = added;
                }
            }

            // moving must not shift the maximum: the receiver may not end up
            // worse than the donor after removal
            if best_block != my_block && removed_max < best_max {
                best_block = my_block;
            }

            if best_block != my_block {
                max_imbalance[best_block] = best_imbalances
                    .iter()
                    .copied()
                    .fold(f64::NEG_INFINITY, f64::max);
                max_imbalance[my_block] = removed_max;
                partition[i] = best_block;
                for w in 0..num_weights {
                    weight_diff[w][my_block] -= my_weights[w];
                    weight_diff[w][best_block] += my_weights[w];
                    imbalance[w][my_block] = removed[w];
                    imbalance[w][best_block] = best_imbalances[w];
                }
                moves += 1;
                has_moved[i] = true;
            }
        }

        // batch boundary: fold everyone's weight deltas into the global
        // block weights and recompute the imbalances
        for w in 0..num_weights {
            collective::sum_f64(comm, &mut weight_diff[w])?;
            for b in 0..k {
                block_weights[w][b] += weight_diff[w][b];
                weight_diff[w][b] = 0.0;
            }
        }
        refresh_imbalances(&block_weights, &mut imbalance, &mut max_imbalance);

        if restarts < MAX_RESTARTS {
            order = sort_order(partition, &max_imbalance);
            walked = 0;
            restarts += 1;
        } else {
            let cap = (local_n / 1000 + 1).max(1000);
            let candidate = (((batch as f64) * 1.05) as usize + 1).min(cap);
            let mut grown = [candidate as u64];
            collective::min_u64(comm, &mut grown)?;
            batch = grown[0] as usize;
        }

        if collective::all_true(comm, me_done)? {
            break;
        }
    }

    debug!(moves, "rebalance walk finished");
    Ok(moves)
}
