//! Point-to-center assignment with triangle-inequality pruning and
//! influence-based balance correction.

use tracing::debug;

use crate::comm::{collective, Communicator};
use crate::dist::BlockId;
use crate::error::PartError;
use crate::geometry::{dist_sq, BoundingBox, Points};
use crate::settings::Settings;

/// Per-block per-weight influence multipliers and their clamp state.
#[derive(Clone, Debug)]
pub struct InfluenceState {
    /// `influence[w][b] > 0`; scales squared distances into effective ones.
    pub influence: Vec<Vec<f64>>,
    /// Direction of the last imbalance per (weight, block).
    grew: Vec<Vec<bool>>,
    /// Per-block clamp bounds on the per-iteration influence change.
    clamp_hi: Vec<f64>,
    clamp_lo: Vec<f64>,
    seen_iteration: bool,
}

impl InfluenceState {
    pub fn new(num_weights: usize, k: usize, change_cap: f64) -> Self {
        InfluenceState {
            influence: vec![vec![1.0; k]; num_weights],
            grew: vec![vec![false; k]; num_weights],
            clamp_hi: vec![1.0 + change_cap; k],
            clamp_lo: vec![1.0 - change_cap; k],
            seen_iteration: false,
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.clamp_hi.len()
    }

    /// Effective-distance multiplier of block `b` for point `i`.
    pub fn effect(&self, normalized_weights: &[Vec<f64>], i: usize, b: usize) -> f64 {
        self.influence
            .iter()
            .zip(normalized_weights)
            .map(|(inf, nw)| inf[b] * nw[i])
            .sum()
    }

    fn min_influence(&self, b: usize) -> f64 {
        self.influence
            .iter()
            .map(|inf| inf[b])
            .fold(f64::INFINITY, f64::min)
    }

    pub fn max_influence(&self) -> f64 {
        self.influence
            .iter()
            .flatten()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max)
    }
}

/// Statistics of one `assign_blocks` call.
#[derive(Clone, Copy, Debug, Default)]
pub struct AssignStats {
    pub balance_iterations: usize,
    pub skipped_points: usize,
}

/// Center order used by the pruned scan: for every old-block segment the
/// center indices sorted ascending by minimum effective distance from the
/// local bounding box.
struct CenterFilter {
    order: Vec<usize>,
    eff_min_dist: Vec<f64>,
    min_dist: Vec<f64>,
}

impl CenterFilter {
    fn new(
        centers: &[Vec<f64>],
        bbox: &BoundingBox,
        inf: &InfluenceState,
        group_prefix: &[usize],
    ) -> Self {
        let k = centers.len();
        let min_dist: Vec<f64> = centers.iter().map(|c| bbox.dist_sq_to(c)).collect();
        let mut filter = CenterFilter {
            order: (0..k).collect(),
            eff_min_dist: vec![0.0; k],
            min_dist,
        };
        filter.refresh(inf, group_prefix);
        filter
    }

    /// Re-sort every old-block segment after an influence change.
    fn refresh(&mut self, inf: &InfluenceState, group_prefix: &[usize]) {
        let k = self.min_dist.len();
        let mut eff: Vec<f64> = (0..k)
            .map(|b| self.min_dist[b] * inf.min_influence(b))
            .collect();
        for window in group_prefix.windows(2) {
            let (start, end) = (window[0], window[1]);
            let segment = &mut self.order[start..end];
            segment.sort_by(|&a, &b| {
                eff[a]
                    .partial_cmp(&eff[b])
                    .expect("finite distances")
                    .then(a.cmp(&b))
            });
            let sorted: Vec<f64> = segment.iter().map(|&c| eff[c]).collect();
            eff[start..end].copy_from_slice(&sorted);
        }
        self.eff_min_dist = eff;
    }
}

/// Assign sampled points to the block with the smallest effective distance,
/// then adapt influences until every weight is balanced or the balance
/// iteration cap is hit.
///
/// `upper_own` and `lower_next` are the triangle bounds per local point:
/// when `lower_next[i] > upper_own[i]` the assignment provably cannot have
/// changed and the center scan is skipped. Both bounds and the influence
/// state are updated in place.
#[allow(clippy::too_many_arguments)]
pub fn assign_blocks<C: Communicator>(
    comm: &C,
    points: &Points,
    node_weights: &[Vec<f64>],
    normalized_weights: &[Vec<f64>],
    sample: &[usize],
    centers: &[Vec<f64>],
    group_prefix: &[usize],
    old_block: &[BlockId],
    targets: &[Vec<f64>],
    bbox: &BoundingBox,
    assignment: &mut [BlockId],
    upper_own: &mut [f64],
    lower_next: &mut [f64],
    inf: &mut InfluenceState,
    imbalance: &mut [f64],
    settings: &Settings,
) -> Result<AssignStats, PartError> {
    let num_weights = node_weights.len();
    let k = centers.len();
    debug_assert_eq!(*group_prefix.last().expect("non-empty prefix"), k);
    debug_assert_eq!(inf.num_blocks(), k);

    let mut filter = CenterFilter::new(centers, bbox, inf, group_prefix);
    let mut stats = AssignStats::default();
    let mut effect_of_own = vec![0.0; sample.len()];

    let mut all_balanced;
    let mut iter = 0;
    loop {
        let mut block_weights = vec![vec![0.0; k]; num_weights];
        let mut skipped = 0usize;

        for (s, &i) in sample.iter().enumerate() {
            let old_cluster = assignment[i];
            let father = old_block[i];
            effect_of_own[s] = inf.effect(normalized_weights, i, old_cluster);

            let mut resolved = false;
            if lower_next[i] > upper_own[i] {
                skipped += 1;
                resolved = true;
            } else {
                // tighten the upper bound with the exact own distance and retry
                let own_dist = dist_sq(centers[old_cluster].as_slice(), points.point(i));
                upper_own[i] = own_dist * effect_of_own[s];
                if lower_next[i] > upper_own[i] {
                    skipped += 1;
                    resolved = true;
                }
            }

            if !resolved {
                // scan the centers of the father block in ascending order of
                // minimum effective distance, stopping once even the lower
                // bound exceeds the current second best
                let (range_start, range_end) = if settings.repartition {
                    (0, k)
                } else {
                    (group_prefix[father], group_prefix[father + 1])
                };
                let mut best = old_cluster;
                let mut best_value = f64::INFINITY;
                let mut best_effect = effect_of_own[s];
                let mut second_value = f64::INFINITY;
                let mut c = range_start;
                while c < range_end && second_value > filter.eff_min_dist[c] {
                    let j = filter.order[c];
                    let sq = dist_sq(centers[j].as_slice(), points.point(i));
                    let effect = inf.effect(normalized_weights, i, j);
                    let effective = sq * effect;
                    if effective < best_value {
                        second_value = best_value;
                        best = j;
                        best_value = effective;
                        best_effect = effect;
                    } else if effective < second_value {
                        second_value = effective;
                    }
                    c += 1;
                }
                upper_own[i] = best_value;
                lower_next[i] = second_value;
                effect_of_own[s] = best_effect;
                assignment[i] = best;
            }

            for (w, weight) in node_weights.iter().enumerate() {
                block_weights[w][assignment[i]] += weight[i];
            }
        }
        stats.skipped_points = skipped;

        for weights in block_weights.iter_mut() {
            collective::sum_f64(comm, weights)?;
        }

        // imbalance per weight; the maximum over the new blocks
        all_balanced = true;
        for w in 0..num_weights {
            let mut worst = f64::NEG_INFINITY;
            for b in 0..k {
                let target = targets[w][b];
                worst = worst.max((block_weights[w][b] - target) / target);
            }
            imbalance[w] = worst;
            if worst > settings.epsilon_for(w) {
                all_balanced = false;
            }
        }

        // adapt influences toward balance
        let mut min_ratio = f64::INFINITY;
        for w in 0..num_weights {
            for b in 0..k {
                let ratio = block_weights[w][b] / targets[w][b];
                if (ratio - 1.0).abs() < settings.epsilon_for(w)
                    && settings.freeze_balanced_influence
                {
                    min_ratio = min_ratio.min(1.0);
                    continue;
                }
                let multiplier = ratio
                    .powf(settings.effective_influence_exponent())
                    .clamp(inf.clamp_lo[b], inf.clamp_hi[b]);
                inf.influence[w][b] *= multiplier;
                min_ratio = min_ratio.min(multiplier);

                if settings.tighten_bounds && inf.seen_iteration && (ratio > 1.0) != inf.grew[w][b]
                {
                    // imbalance direction flipped: tighten the clamp toward 1
                    inf.clamp_hi[b] = 0.1 + 0.9 * inf.clamp_hi[b];
                    inf.clamp_lo[b] = 0.1 + 0.9 * inf.clamp_lo[b];
                }
                inf.grew[w][b] = ratio > 1.0;
            }
        }
        inf.seen_iteration = true;

        // rescale the triangle bounds by the influence motion
        for (s, &i) in sample.iter().enumerate() {
            let cluster = assignment[i];
            let new_effect = inf.effect(normalized_weights, i, cluster);
            upper_own[i] *= new_effect / effect_of_own[s] + 1e-5;
            lower_next[i] *= min_ratio - 1e-5;
        }

        filter.refresh(inf, group_prefix);

        iter += 1;
        debug!(
            iteration = iter,
            skipped,
            max_imbalance = imbalance.iter().copied().fold(f64::NAN, f64::max),
            influence_spread = inf.max_influence(),
            "balance loop"
        );

        if all_balanced || iter >= settings.balance_iterations {
            break;
        }
    }

    stats.balance_iterations = iter;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::NoComm;

    fn unit_square_points() -> Points {
        let mut data = Vec::new();
        for i in 0..10 {
            for j in 0..10 {
                data.push(i as f64 / 9.0);
                data.push(j as f64 / 9.0);
            }
        }
        Points::new(2, data).unwrap()
    }

    fn run_assign(settings: &Settings, centers: Vec<Vec<f64>>) -> (Vec<BlockId>, Vec<f64>) {
        let comm = NoComm;
        let points = unit_square_points();
        let n = points.len();
        let k = centers.len();
        let weights = vec![vec![1.0; n]];
        let normalized = vec![vec![1.0; n]];
        let sample: Vec<usize> = (0..n).collect();
        let targets = vec![vec![n as f64 / k as f64; k]];
        let bbox = BoundingBox::local(&points);
        let mut assignment = vec![0; n];
        let mut upper = vec![f64::MAX; n];
        let mut lower = vec![0.0; n];
        let mut inf = InfluenceState::new(1, k, settings.influence_change_cap);
        let mut imbalance = vec![1.0];
        assign_blocks(
            &comm,
            &points,
            &weights,
            &normalized,
            &sample,
            &centers,
            &[0, k],
            &vec![0; n],
            &targets,
            &bbox,
            &mut assignment,
            &mut upper,
            &mut lower,
            &mut inf,
            &mut imbalance,
            settings,
        )
        .unwrap();
        (assignment, imbalance)
    }

    #[test]
    fn symmetric_centers_split_evenly() {
        let settings = Settings::default();
        let (assignment, imbalance) = run_assign(
            &settings,
            vec![vec![0.25, 0.5], vec![0.75, 0.5]],
        );
        let left = assignment.iter().filter(|&&b| b == 0).count();
        assert_eq!(left, 50);
        assert!(imbalance[0] <= settings.epsilon);
    }

    #[test]
    fn influence_pulls_biased_centers_toward_balance() {
        let settings = Settings {
            balance_iterations: 60,
            ..Settings::default()
        };
        // both centers on the left: without influence adaptation one block
        // would swallow nearly everything
        let (assignment, _imbalance) =
            run_assign(&settings, vec![vec![0.05, 0.5], vec![0.2, 0.5]]);
        let smaller = assignment
            .iter()
            .filter(|&&b| b == 0)
            .count()
            .min(assignment.iter().filter(|&&b| b == 1).count());
        assert!(
            smaller >= 35,
            "influence adaptation left blocks at {smaller}/100 split"
        );
    }

    #[test]
    fn bounds_allow_skipping_after_convergence() {
        let comm = NoComm;
        let points = unit_square_points();
        let n = points.len();
        let settings = Settings::default();
        let centers = vec![vec![0.25, 0.5], vec![0.75, 0.5]];
        let weights = vec![vec![1.0; n]];
        let normalized = vec![vec![1.0; n]];
        let sample: Vec<usize> = (0..n).collect();
        let targets = vec![vec![n as f64 / 2.0; 2]];
        let bbox = BoundingBox::local(&points);
        let mut assignment = vec![0; n];
        let mut upper = vec![f64::MAX; n];
        let mut lower = vec![0.0; n];
        let mut inf = InfluenceState::new(1, 2, settings.influence_change_cap);
        let mut imbalance = vec![1.0];
        let mut call = |assignment: &mut [BlockId],
                        upper: &mut [f64],
                        lower: &mut [f64],
                        inf: &mut InfluenceState,
                        imbalance: &mut [f64]| {
            assign_blocks(
                &comm,
                &points,
                &weights,
                &normalized,
                &sample,
                &centers,
                &[0, 2],
                &vec![0; n],
                &targets,
                &bbox,
                assignment,
                upper,
                lower,
                inf,
                imbalance,
                &settings,
            )
            .unwrap()
        };
        let first = call(
            &mut assignment,
            &mut upper,
            &mut lower,
            &mut inf,
            &mut imbalance,
        );
        let again = call(
            &mut assignment,
            &mut upper,
            &mut lower,
            &mut inf,
            &mut imbalance,
        );
        // a converged, balanced state skips pruned points on the rerun
        assert_eq!(first.balance_iterations, 1);
        assert!(again.skipped_points > 0);
    }
}
