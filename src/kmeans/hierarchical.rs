//! Top-down hierarchical k-means along a processor tree.

use tracing::{debug, info};

use crate::comm::Communicator;
use crate::comm_tree::CommTree;
use crate::dist::{BlockId, Distribution};
use crate::error::PartError;
use crate::geometry::Points;
use crate::metrics::PartitionMetrics;
use crate::settings::Settings;

use super::seeding;

/// Partition a point set level by level along the tree: every block of the
/// previous level is subdivided among its children, with centers seeded on
/// the curve inside the block and the assignment constrained to the
/// parent's center range.
///
/// Callers are expected to have redistributed the points along the curve
/// first (the driver does); the per-block prefix sums the seeding relies on
/// are meaningful under any distribution, but curve locality keeps them
/// cheap.
pub fn compute_hierarchical_partition<C: Communicator>(
    comm: &C,
    points: &Points,
    dist: &Distribution,
    node_weights: &[Vec<f64>],
    tree: &CommTree,
    settings: &Settings,
    metrics: &mut PartitionMetrics,
) -> Result<Vec<BlockId>, PartError> {
    if settings.num_blocks != tree.num_leaves() {
        return Err(PartError::InvalidConfiguration(format!(
            "tree has {} leaves but numBlocks is {}",
            tree.num_leaves(),
            settings.num_blocks
        )));
    }

    // every point starts in the single root block
    let mut partition: Vec<BlockId> = vec![0; points.len()];

    // level 0 is the root; each further level subdivides the previous one
    for h in 1..tree.num_levels() {
        let groups = tree.grouping(h);
        let targets = tree.balance_vectors(h);
        let total_new_blocks: usize = groups.iter().sum();
        info!(
            level = h,
            blocks = total_new_blocks,
            "hierarchy level"
        );

        let centers =
            seeding::centers_from_sfc(comm, points, dist, &partition, &groups, settings)?;
        let result = super::compute_partition(
            comm,
            points,
            dist,
            node_weights,
            &targets,
            &partition,
            centers,
            settings,
            metrics,
        )?;
        partition = result.partition;

        if settings.focus_on_balance {
            super::compute_partition_target_balance(
                comm,
                points,
                dist,
                node_weights,
                &targets,
                &mut partition,
                settings,
                metrics,
            )?;
        }

        let sums = crate::metrics::block_weights(comm, &partition, node_weights, total_new_blocks)?;
        for (w, t) in sums.iter().zip(&targets) {
            debug!(
                level = h,
                imbalance = crate::metrics::max_imbalance(w, t),
                "level imbalance"
            );
        }
    }

    Ok(partition)
}

/// Hierarchical partition followed by one repartition pass at the finest
/// level to smooth block boundaries across the whole leaf set.
pub fn compute_hier_plus_repart<C: Communicator>(
    comm: &C,
    points: &Points,
    dist: &Distribution,
    node_weights: &[Vec<f64>],
    tree: &CommTree,
    settings: &Settings,
    metrics: &mut PartitionMetrics,
) -> Result<Vec<BlockId>, PartError> {
    let partition =
        compute_hierarchical_partition(comm, points, dist, node_weights, tree, settings, metrics)?;
    let targets = tree.leaf_targets();
    let result = super::compute_repartition(
        comm,
        points,
        dist,
        node_weights,
        &targets,
        &partition,
        settings,
        metrics,
    )?;
    Ok(result.partition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::NoComm;
    use crate::settings::InitialPartition;

    fn grid_points(side: usize) -> Points {
        let mut data = Vec::new();
        for i in 0..side {
            for j in 0..side {
                data.push(i as f64);
                data.push(j as f64);
            }
        }
        Points::new(2, data).unwrap()
    }

    #[test]
    fn two_level_tree_produces_all_leaves() {
        let comm = NoComm;
        let side = 12;
        let n = side * side;
        let points = grid_points(side);
        let dist = Distribution::block(0, 1, n);
        let weights = vec![vec![1.0; n]];
        let mut tree = CommTree::from_arities(&[2, 3], 1).unwrap();
        tree.scale_capacities(&[n as f64]);
        let settings = Settings {
            num_blocks: 6,
            initial_partition: InitialPartition::HierKMeans,
            hier_levels: vec![2, 3],
            min_sampling_nodes: -1,
            ..Settings::default()
        };
        let mut metrics = PartitionMetrics::default();
        let part = compute_hierarchical_partition(
            &comm, &points, &dist, &weights, &tree, &settings, &mut metrics,
        )
        .unwrap();
        let mut seen = vec![false; 6];
        for &b in &part {
            assert!(b < 6);
            seen[b] = true;
        }
        assert!(seen.iter().all(|&s| s), "every leaf block appears");
    }

    /// An identity tree (root with k equal leaves) must behave like flat
    /// k-means: one level, k blocks, same seeding path.
    #[test]
    fn identity_tree_matches_flat_kmeans() {
        let comm = NoComm;
        let side = 10;
        let n = side * side;
        let points = grid_points(side);
        let dist = Distribution::block(0, 1, n);
        let weights = vec![vec![1.0; n]];
        let mut tree = CommTree::flat(4, 1).unwrap();
        tree.scale_capacities(&[n as f64]);
        let settings = Settings {
            num_blocks: 4,
            min_sampling_nodes: -1,
            ..Settings::default()
        };

        let mut metrics = PartitionMetrics::default();
        let hier = compute_hierarchical_partition(
            &comm, &points, &dist, &weights, &tree, &settings, &mut metrics,
        )
        .unwrap();

        let targets = tree.leaf_targets();
        let mut metrics = PartitionMetrics::default();
        let flat = super::super::compute_partition_seeded(
            &comm, &points, &dist, &weights, &targets, &settings, &mut metrics,
        )
        .unwrap();
        assert_eq!(hier, flat.partition);
    }
}
