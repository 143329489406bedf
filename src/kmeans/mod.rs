//! Balanced k-means partitioning of a distributed point set.
//!
//! The core follows the balanced k-means scheme with per-block influence
//! factors: points are assigned by *effective* distance (squared Euclidean
//! distance scaled by per-block per-weight influences), influences adapt
//! until the target block weights are met, and progressive sampling gives
//! fast coarse convergence before exact refinement.

pub mod assign;
pub mod hierarchical;
pub mod rebalance;
pub mod seeding;

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::comm::{collective, Communicator};
use crate::dist::{check_aligned, BlockId, Distribution};
use crate::error::PartError;
use crate::geometry::{BoundingBox, Points};
use crate::metrics::PartitionMetrics;
use crate::settings::{BalanceMethod, SampleOrder, Settings};
use assign::{assign_blocks, InfluenceState};
use seeding::CenterGroups;

/// Result of a k-means invocation: the partition plus the final replicated
/// centers and influences.
#[derive(Clone, Debug)]
pub struct KMeansResult {
    pub partition: Vec<BlockId>,
    pub centers: Vec<Vec<f64>>,
    pub influence: Vec<Vec<f64>>,
}

/// Deterministic interleaved visiting order of `0..n`: indices sorted by
/// their bit-reversed value, so every sampling prefix covers the index
/// range uniformly. Reproducible across reruns, unlike a shuffle.
pub(crate) fn interleaved_order(n: usize) -> Vec<usize> {
    if n <= 1 {
        return (0..n).collect();
    }
    let bits = usize::BITS - (n - 1).leading_zeros();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by_key(|&i| i.reverse_bits() >> (usize::BITS - bits));
    order
}

fn sample_order(settings: &Settings, rank: usize, n: usize) -> Vec<usize> {
    match settings.sample_order {
        SampleOrder::Interleave => interleaved_order(n),
        SampleOrder::FisherYates => {
            let mut order: Vec<usize> = (0..n).collect();
            let mut rng = SmallRng::seed_from_u64(settings.rng_seed.wrapping_add(rank as u64));
            order.shuffle(&mut rng);
            order
        }
    }
}

/// Per-point weights normalized to sum to one across weight indices; all
/// ones when there is a single weight.
pub(crate) fn normalize_weights(node_weights: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let num_weights = node_weights.len();
    let local_n = node_weights[0].len();
    if num_weights == 1 {
        return vec![vec![1.0; local_n]];
    }
    let mut normalized = vec![vec![1.0; local_n]; num_weights];
    for i in 0..local_n {
        let sum: f64 = node_weights.iter().map(|w| w[i]).sum();
        for (w, weights) in node_weights.iter().enumerate() {
            normalized[w][i] = if sum > 0.0 {
                weights[i] / sum
            } else {
                1.0 / num_weights as f64
            };
        }
    }
    normalized
}

fn group_prefix_of(groups: &CenterGroups) -> Vec<usize> {
    let mut prefix = Vec::with_capacity(groups.len() + 1);
    prefix.push(0);
    for group in groups {
        prefix.push(prefix.last().expect("non-empty") + group.len());
    }
    prefix
}

/// Balanced k-means core (the heart of the partitioner).
///
/// `prev_partition` holds each point's block in the previous hierarchy
/// level (all zeros in the flat case); with `settings.repartition` it is
/// instead the partition being rebalanced and also seeds the result.
/// `center_groups[b]` are the initial centers subdividing old block b; the
/// flat case passes a single group.
#[allow(clippy::too_many_arguments)]
pub fn compute_partition<C: Communicator>(
    comm: &C,
    points: &Points,
    dist: &Distribution,
    node_weights: &[Vec<f64>],
    targets: &[Vec<f64>],
    prev_partition: &[BlockId],
    center_groups: CenterGroups,
    settings: &Settings,
    metrics: &mut PartitionMetrics,
) -> Result<KMeansResult, PartError> {
    let local_n = points.len();
    let global_n = dist.global_size();
    let dim = points.dim();
    let num_weights = node_weights.len();
    let p = comm.size();

    check_aligned("kmeans points", local_n, prev_partition.len())?;
    for weights in node_weights {
        check_aligned("kmeans weights", local_n, weights.len())?;
    }

    let group_prefix = group_prefix_of(&center_groups);
    let k = *group_prefix.last().expect("non-empty prefix");
    let mut centers: Vec<Vec<f64>> = center_groups.into_iter().flatten().collect();
    debug_assert!(centers.iter().all(|c| c.len() == dim));

    // total weights and feasibility of the targets
    let mut weight_sums: Vec<f64> = node_weights.iter().map(|w| w.iter().sum()).collect();
    collective::sum_f64(comm, &mut weight_sums)?;
    for w in 0..num_weights {
        let target_sum: f64 = targets[w].iter().sum();
        if weight_sums[w] > target_sum * (1.0 + settings.epsilon_for(w)) {
            return Err(PartError::InvalidConfiguration(format!(
                "total weight {} of weight {w} does not fit the target block weights (sum {})",
                weight_sums[w], target_sum
            )));
        }
    }

    let normalized_weights = normalize_weights(node_weights);

    let local_bbox = BoundingBox::local(points);
    let global_bbox = BoundingBox::global(comm, points)?;
    let diagonal = global_bbox.diagonal();
    let volume = global_bbox.volume();
    let expected_block_diameter = if volume > 0.0 {
        (volume / k as f64).powf(1.0 / dim as f64)
    } else {
        diagonal / k as f64
    };

    if settings.erode_influence && num_weights > 1 {
        warn!("influence erosion combined with multiple node weights is experimental");
    }

    let mut upper_own = vec![f64::MAX; local_n];
    let mut lower_next = vec![0.0; local_n];
    let mut influence = InfluenceState::new(num_weights, k, settings.influence_change_cap);

    // progressive sampling schedule; sample counts double per round until
    // every local point participates
    let avg_blocks_per_rank = k as f64 / p as f64;
    let (order, samples) = if settings.min_sampling_nodes < 0 {
        ((0..local_n).collect::<Vec<usize>>(), Vec::new())
    } else {
        let min_nodes =
            ((settings.min_sampling_nodes as f64 * avg_blocks_per_rank).ceil() as usize).max(1);
        let everyone_large = collective::all_true(comm, local_n > min_nodes)?;
        if everyone_large {
            let order = sample_order(settings, comm.rank(), local_n);
            let global_min = (settings.min_sampling_nodes as f64 * k as f64).max(1.0);
            let rounds = (global_n as f64 / global_min).log2().ceil().max(0.0) as usize + 1;
            let mut samples = Vec::with_capacity(rounds);
            samples.push(min_nodes.min(local_n));
            for r in 1..rounds {
                samples.push((samples[r - 1] * 2).min(local_n));
            }
            *samples.last_mut().expect("at least one round") = local_n;
            (order, samples)
        } else {
            ((0..local_n).collect(), Vec::new())
        }
    };
    let sampling_rounds = samples.len();
    if sampling_rounds > 0 {
        debug!(rounds = sampling_rounds, "progressive sampling enabled");
    }

    let threshold = 0.002 * diagonal;
    let mut result: Vec<BlockId> = if settings.repartition {
        prev_partition.to_vec()
    } else {
        vec![0; local_n]
    };
    let mut most_balanced = result.clone();
    let mut best_imbalance = f64::MAX;
    let mut imbalances = vec![1.0; num_weights];
    let mut imbalances_old = vec![0.0; num_weights];
    let mut balanced;
    let mut delta;
    let mut iter = 0;

    loop {
        let sample: Vec<usize> = if iter < sampling_rounds {
            let mut s = order[..samples[iter]].to_vec();
            s.sort_unstable();
            s
        } else {
            let mut s = order.clone();
            s.sort_unstable();
            s
        };
        let full_sample = sample.len() == local_n;

        // scale targets to the sampled share of the total weight
        let mut sampled_sums: Vec<f64> = node_weights
            .iter()
            .map(|w| sample.iter().map(|&i| w[i]).sum())
            .collect();
        collective::sum_f64(comm, &mut sampled_sums)?;
        let adjusted: Vec<Vec<f64>> = targets
            .iter()
            .enumerate()
            .map(|(w, t)| {
                let ratio = sampled_sums[w] / weight_sums[w];
                t.iter().map(|&x| x * ratio).collect()
            })
            .collect();

        let stats = assign_blocks(
            comm,
            points,
            node_weights,
            &normalized_weights,
            &sample,
            &centers,
            &group_prefix,
            prev_partition,
            &adjusted,
            &local_bbox,
            &mut result,
            &mut upper_own,
            &mut lower_next,
            &mut influence,
            &mut imbalances,
            settings,
        )?;
        metrics.balance_iterations.push(stats.balance_iterations);

        // recompute centers from the sampled assignment; an empty block
        // keeps its previous position
        let new_centers = seeding::centers_of_partition(
            comm,
            points,
            &result,
            k,
            &sample,
            &node_weights[0],
        )?;
        let mut deltas = vec![0.0; k];
        let mut sq_deltas = vec![0.0; k];
        let old_influence = influence.influence.clone();
        let mut erosion_min_ratio = f64::INFINITY;
        for (j, candidate) in new_centers.into_iter().enumerate() {
            if let Some(center) = candidate {
                sq_deltas[j] = crate::geometry::dist_sq(&centers[j], &center);
                deltas[j] = sq_deltas[j].sqrt();
                centers[j] = center;
            }
            if settings.erode_influence {
                // centers that stopped moving erode their influence toward 1
                let drift = (deltas[j] / expected_block_diameter - 0.1).max(0.0);
                let erosion = 2.0 / (1.0 + (-drift).exp()) - 1.0;
                for w in 0..num_weights {
                    let old = influence.influence[w][j];
                    influence.influence[w][j] = ((1.0 - erosion) * old.ln()).exp();
                    erosion_min_ratio = erosion_min_ratio.min(old / influence.influence[w][j]);
                }
            }
        }

        delta = deltas.iter().copied().fold(0.0, f64::max);
        let delta_sq = delta * delta;
        let max_influence = influence.max_influence();

        // widen the own-center bound by the drift, shrink the next-center
        // bound by the worst drift and influence growth
        for &i in &sample {
            let cluster = result[i];
            let effect = influence.effect(&normalized_weights, i, cluster);
            if settings.erode_influence {
                upper_own[i] *=
                    influence.influence[0][cluster] / old_influence[0][cluster] + 1e-6;
                lower_next[i] *= erosion_min_ratio - 1e-6;
            }
            upper_own[i] +=
                (2.0 * deltas[cluster] * (upper_own[i] / effect).sqrt() + sq_deltas[cluster])
                    * (effect + 1e-6);
            let pure = (lower_next[i] / max_influence).sqrt();
            if pure < delta {
                lower_next[i] = 0.0;
            } else {
                lower_next[i] += (-2.0 * delta * pure + delta_sq) * (max_influence + 1e-6);
                if !(lower_next[i] > 0.0) {
                    lower_next[i] = 0.0;
                }
            }
        }

        // balance of the sampled weights against the adjusted targets
        let mut block_weights = vec![vec![0.0; k]; num_weights];
        for &i in &sample {
            for (w, weight) in node_weights.iter().enumerate() {
                block_weights[w][result[i]] += weight[i];
            }
        }
        for weights in block_weights.iter_mut() {
            collective::sum_f64(comm, weights)?;
        }
        balanced = (0..num_weights).all(|w| {
            (0..k).all(|b| {
                block_weights[w][b] <= adjusted[w][b] * (1.0 + settings.epsilon_for(w))
            })
        });

        // a stagnating imbalance counts as converged
        let imbalance_diff: f64 = imbalances
            .iter()
            .zip(&imbalances_old)
            .map(|(a, b)| (a - b).abs())
            .sum();
        if imbalance_diff / (num_weights as f64) < 0.001 {
            balanced = true;
        }
        imbalances_old.copy_from_slice(&imbalances);

        if settings.keep_most_balanced && full_sample {
            // with one weight keep the minimum imbalance; with several keep
            // the solution whose worst weight is smallest
            let candidate = if num_weights == 1 {
                imbalances[0]
            } else {
                imbalances.iter().copied().fold(f64::NEG_INFINITY, f64::max)
            };
            if candidate < best_imbalance {
                most_balanced.copy_from_slice(&result);
                best_imbalance = candidate;
            }
        }

        iter += 1;
        debug!(
            iteration = iter,
            delta,
            balanced,
            imbalance = imbalances.iter().copied().fold(f64::NAN, f64::max),
            "k-means iteration"
        );

        let keep_going =
            iter < sampling_rounds || (iter < settings.max_kmeans_iterations && (delta > threshold || !balanced));
        if !keep_going {
            break;
        }
    }

    metrics.kmeans_iterations = iter;
    metrics.converged = balanced && delta <= threshold;
    info!(
        iterations = iter,
        converged = metrics.converged,
        "k-means finished"
    );

    let partition = if settings.keep_most_balanced && best_imbalance < f64::MAX {
        most_balanced
    } else {
        result
    };
    Ok(KMeansResult {
        partition,
        centers,
        influence: influence.influence,
    })
}

/// Flat k-means with SFC-seeded centers.
pub fn compute_partition_seeded<C: Communicator>(
    comm: &C,
    points: &Points,
    dist: &Distribution,
    node_weights: &[Vec<f64>],
    targets: &[Vec<f64>],
    settings: &Settings,
    metrics: &mut PartitionMetrics,
) -> Result<KMeansResult, PartError> {
    let centers =
        seeding::centers_from_sfc_flat(comm, points, dist, settings.num_blocks, settings)?;
    let prev = vec![0; points.len()];
    compute_partition(
        comm,
        points,
        dist,
        node_weights,
        targets,
        &prev,
        vec![centers],
        settings,
        metrics,
    )
}

/// Repartition an already partitioned point set against (possibly new)
/// target block weights, preserving locality.
///
/// When the partition equals the distribution (one block per rank) the
/// centers are seeded from each rank's center of mass; otherwise from the
/// centroids of the previous partition.
#[allow(clippy::too_many_arguments)]
pub fn compute_repartition<C: Communicator>(
    comm: &C,
    points: &Points,
    dist: &Distribution,
    node_weights: &[Vec<f64>],
    targets: &[Vec<f64>],
    previous: &[BlockId],
    settings: &Settings,
    metrics: &mut PartitionMetrics,
) -> Result<KMeansResult, PartError> {
    let k = settings.num_blocks;
    let local_n = points.len();
    check_aligned("repartition", local_n, previous.len())?;

    let rank = comm.rank();
    let partition_is_distribution = k == comm.size()
        && collective::all_true(comm, previous.iter().all(|&b| b == rank))?;
    let centers: Vec<Vec<f64>> = if partition_is_distribution {
        seeding::local_mass_centers(comm, points, &node_weights[0])?
    } else {
        let sample: Vec<usize> = (0..local_n).collect();
        let bbox = BoundingBox::global(comm, points)?;
        let fallback: Vec<f64> = bbox
            .min
            .iter()
            .zip(&bbox.max)
            .map(|(lo, hi)| (lo + hi) / 2.0)
            .collect();
        seeding::centers_of_partition(comm, points, previous, k, &sample, &node_weights[0])?
            .into_iter()
            .map(|c| c.unwrap_or_else(|| fallback.clone()))
            .collect()
    };

    let mut repart_settings = settings.clone();
    repart_settings.repartition = true;
    compute_partition(
        comm,
        points,
        dist,
        node_weights,
        targets,
        previous,
        vec![centers],
        &repart_settings,
        metrics,
    )
}

/// Chase hard balance constraints: repeated repartition or rebalance passes
/// with a tightening tolerance schedule, keeping the best solution seen.
#[allow(clippy::too_many_arguments)]
pub fn compute_partition_target_balance<C: Communicator>(
    comm: &C,
    points: &Points,
    dist: &Distribution,
    node_weights: &[Vec<f64>],
    targets: &[Vec<f64>],
    partition: &mut Vec<BlockId>,
    settings: &Settings,
    metrics: &mut PartitionMetrics,
) -> Result<(), PartError> {
    let num_weights = node_weights.len();
    let k = targets[0].len();

    let sums = crate::metrics::block_weights(comm, partition, node_weights, k)?;
    let mut imbalances: Vec<f64> = sums
        .iter()
        .zip(targets)
        .map(|(w, t)| crate::metrics::max_imbalance(w, t))
        .collect();
    let mut current_max = imbalances.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    // schedule: walk the tolerance from the current imbalance down toward
    // the requested epsilon, with a little slack
    let mut gap = current_max - settings.epsilon;
    if gap < 0.0 {
        gap = -gap;
    } else if gap == 0.0 {
        gap = 1e-5;
    } else {
        gap *= 1.2;
    }
    const TRIES: usize = 5;
    let step = gap / (TRIES + 1) as f64;
    let mut point_share = 0.005;
    let mut best = partition.clone();
    let mut best_max = current_max;

    let mut pass_settings = settings.clone();
    pass_settings.epsilons = vec![(current_max - step).max(settings.epsilon); num_weights];
    let local_n = points.len().max(1);
    pass_settings.batch_percent = (100.0 / local_n as f64).min(1.0);

    for attempt in 0..TRIES {
        if pass_settings.balance_method == BalanceMethod::Repart {
            let result = compute_repartition(
                comm,
                points,
                dist,
                node_weights,
                targets,
                partition,
                &pass_settings,
                metrics,
            )?;
            *partition = result.partition;
        } else {
            let moves = rebalance::rebalance(
                comm,
                points,
                node_weights,
                targets,
                partition,
                &pass_settings,
                point_share,
            )?;
            let mut total_moves = [moves as u64];
            collective::sum_u64(comm, &mut total_moves)?;
            let expected = dist.global_size() as f64 * point_share / k as f64;
            if (total_moves[0] as f64) < expected * 0.1 || (total_moves[0] as f64) > expected * 0.9
            {
                point_share += 0.05;
            }
        }

        let sums = crate::metrics::block_weights(comm, partition, node_weights, k)?;
        for (w, (sums_w, t)) in sums.iter().zip(targets).enumerate() {
            imbalances[w] = crate::metrics::max_imbalance(sums_w, t);
        }
        current_max = imbalances.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if current_max < best_max {
            best.copy_from_slice(partition);
            best_max = current_max;
        }
        for eps in pass_settings.epsilons.iter_mut() {
            *eps = (*eps - step).max(settings.epsilon);
        }
        debug!(attempt, imbalance = current_max, "target-balance pass");
        if current_max <= settings.epsilon {
            break;
        }
    }

    *partition = best;
    Ok(())
}
