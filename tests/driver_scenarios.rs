//! End-to-end scenarios on a single rank.

mod common;

use common::{block_counts, grid_graph, lattice_3d, two_squares};
use geopart::prelude::*;

fn default_settings(k: usize) -> Settings {
    Settings {
        num_blocks: k,
        dimensions: 2,
        epsilon: 0.05,
        min_sampling_nodes: -1,
        ..Settings::default()
    }
}

#[test]
fn grid_16x16_into_four_compact_blocks() {
    let comm = NoComm;
    let (mut graph, mut points) = grid_graph(0, 1, 16);
    let mut weights = vec![vec![1.0; 256]];
    let settings = default_settings(4);

    let (partition, metrics) = partition_graph(
        &comm,
        &mut graph,
        &mut points,
        &mut weights,
        None,
        None,
        &settings,
    )
    .unwrap();

    assert_eq!(partition.len(), 256);
    let counts = block_counts(&partition, 4);
    assert!(counts.iter().all(|&c| c > 0));
    assert!(
        metrics.imbalance[0] <= 0.05 + 1e-9,
        "imbalance {}",
        metrics.imbalance[0]
    );
    // four quadrants cut 32 edges; allow a slightly ragged boundary
    assert!(metrics.cut <= 36.0, "cut {}", metrics.cut);
}

#[test]
fn disconnected_squares_split_along_components() {
    let comm = NoComm;
    let (mut graph, mut points) = two_squares(10);
    let mut weights = vec![vec![1.0; 200]];
    let settings = default_settings(2);

    let (partition, metrics) = partition_graph(
        &comm,
        &mut graph,
        &mut points,
        &mut weights,
        None,
        None,
        &settings,
    )
    .unwrap();

    assert_eq!(metrics.cut, 0.0);
    assert!(metrics.imbalance[0].abs() < 1e-9);
    // each component is one block
    for component in 0..2 {
        let first = partition[component * 100];
        for v in 0..100 {
            assert_eq!(partition[component * 100 + v], first);
        }
    }
    assert_ne!(partition[0], partition[100]);
}

#[test]
fn k_equals_one_puts_everything_in_block_zero() {
    let comm = NoComm;
    let (mut graph, mut points) = grid_graph(0, 1, 8);
    let mut weights = vec![vec![1.0; 64]];
    let settings = default_settings(1);

    let (partition, metrics) = partition_graph(
        &comm,
        &mut graph,
        &mut points,
        &mut weights,
        None,
        None,
        &settings,
    )
    .unwrap();
    assert!(partition.iter().all(|&b| b == 0));
    assert_eq!(metrics.cut, 0.0);
}

#[test]
fn k_equals_n_gives_every_vertex_its_own_block() {
    let comm = NoComm;
    let side = 4;
    let n = side * side;
    let (mut graph, mut points) = grid_graph(0, 1, side);
    let mut weights = vec![vec![1.0; n]];
    let settings = Settings {
        refine: false,
        ..default_settings(n)
    };

    let (partition, _) = partition_graph(
        &comm,
        &mut graph,
        &mut points,
        &mut weights,
        None,
        None,
        &settings,
    )
    .unwrap();
    let counts = block_counts(&partition, n);
    assert!(counts.iter().all(|&c| c == 1));
}

#[test]
fn identical_runs_agree_bit_for_bit() {
    let run = || {
        let comm = NoComm;
        let (mut graph, mut points) = grid_graph(0, 1, 12);
        let mut weights = vec![vec![1.0; 144]];
        let settings = default_settings(3);
        partition_graph(
            &comm,
            &mut graph,
            &mut points,
            &mut weights,
            None,
            None,
            &settings,
        )
        .unwrap()
        .0
    };
    assert_eq!(run(), run());
}

#[test]
fn two_weights_both_balance() {
    let comm = NoComm;
    let side = 16;
    let n = side * side;
    let (graph, points) = grid_graph(0, 1, side);
    // weight 1 uniform; weight 2 jumps between 1 and 10
    let heavy: Vec<f64> = (0..n)
        .map(|v| if (v * 7 + 3) % 5 == 0 { 10.0 } else { 1.0 })
        .collect();
    let weights = vec![vec![1.0; n], heavy];
    let settings = Settings {
        num_node_weights: 2,
        epsilon: 0.1,
        keep_most_balanced: true,
        balance_iterations: 30,
        ..default_settings(2)
    };

    let targets: Vec<Vec<f64>> = weights
        .iter()
        .map(|w| {
            let total: f64 = w.iter().sum();
            vec![total / 2.0; 2]
        })
        .collect();
    let mut metrics = PartitionMetrics::default();
    let mut partition = geopart::kmeans::compute_partition_seeded(
        &comm,
        &points,
        &graph.dist,
        &weights,
        &targets,
        &settings,
        &mut metrics,
    )
    .unwrap()
    .partition;
    geopart::kmeans::compute_partition_target_balance(
        &comm,
        &points,
        &graph.dist,
        &weights,
        &targets,
        &mut partition,
        &settings,
        &mut metrics,
    )
    .unwrap();

    let sums = geopart::metrics::block_weights(&comm, &partition, &weights, 2).unwrap();
    for (w, t) in sums.iter().zip(&targets) {
        let imbalance = geopart::metrics::max_imbalance(w, t);
        assert!(imbalance <= 0.1 + 1e-9, "imbalance {imbalance}");
    }
}

#[test]
fn hierarchical_tree_fills_every_leaf_within_capacity() {
    let comm = NoComm;
    let side = 24;
    let n = side * side;
    let (mut graph, mut points) = grid_graph(0, 1, side);
    let mut weights = vec![vec![1.0; n]];
    let tree = CommTree::from_arities(&[3, 4], 1).unwrap();
    let settings = Settings {
        initial_partition: InitialPartition::HierKMeans,
        hier_levels: vec![3, 4],
        refine: false,
        ..default_settings(12)
    };

    let (partition, metrics) = partition_graph(
        &comm,
        &mut graph,
        &mut points,
        &mut weights,
        None,
        Some(&tree),
        &settings,
    )
    .unwrap();

    let counts = block_counts(&partition, 12);
    assert!(counts.iter().all(|&c| c > 0), "counts {counts:?}");
    // per-leaf capacity is n / 12; allow the tolerance plus rounding
    let capacity = n as f64 / 12.0;
    for &c in &counts {
        assert!(
            (c as f64) <= capacity * 1.2,
            "block of {c} vertices exceeds capacity {capacity}"
        );
    }
    assert_eq!(metrics.imbalance.len(), 1);
}

#[test]
fn repartition_preserves_locality() {
    let comm = NoComm;
    let side = 16;
    let n = side * side;
    let (graph, points) = grid_graph(0, 1, side);
    let weights = vec![vec![1.0; n]];
    // previous partition: left and right halves
    let previous: Vec<BlockId> = (0..n).map(|v| usize::from(v % side >= side / 2)).collect();
    // perturbed targets: shift a tenth of the weight between the blocks
    let targets = vec![vec![n as f64 * 0.55, n as f64 * 0.45]];
    let settings = default_settings(2);

    let mut metrics = PartitionMetrics::default();
    let result = geopart::kmeans::compute_repartition(
        &comm,
        &points,
        &graph.dist,
        &weights,
        &targets,
        &previous,
        &settings,
        &mut metrics,
    )
    .unwrap();

    let moved = result
        .partition
        .iter()
        .zip(&previous)
        .filter(|(a, b)| a != b)
        .count();
    assert!(
        moved <= n / 5,
        "repartition moved {moved} of {n} vertices"
    );
    let sums =
        geopart::metrics::block_weights(&comm, &result.partition, &weights, 2).unwrap();
    let imbalance = geopart::metrics::max_imbalance(&sums[0], &targets[0]);
    assert!(imbalance <= 0.05 + 1e-9, "imbalance {imbalance}");
}

#[test]
fn three_dimensional_lattice_partitions_cleanly() {
    let comm = NoComm;
    let side = 6;
    let n = side * side * side;
    let (mut graph, mut points) = lattice_3d(side);
    let mut weights = vec![vec![1.0; n]];
    let settings = Settings {
        dimensions: 3,
        epsilon: 0.1,
        ..default_settings(4)
    };

    let (partition, metrics) = partition_graph(
        &comm,
        &mut graph,
        &mut points,
        &mut weights,
        None,
        None,
        &settings,
    )
    .unwrap();

    let counts = block_counts(&partition, 4);
    assert!(counts.iter().all(|&c| c > 0), "counts {counts:?}");
    assert!(
        metrics.imbalance[0] <= 0.1 + 1e-9,
        "imbalance {}",
        metrics.imbalance[0]
    );
    // the cumulative FM gain never goes negative
    assert!(metrics.refinement_gain >= 0.0);
}

#[test]
fn invalid_settings_are_rejected_before_any_work() {
    let comm = NoComm;
    let (mut graph, mut points) = grid_graph(0, 1, 4);
    let mut weights = vec![vec![1.0; 16]];
    let settings = Settings {
        num_blocks: 0,
        ..Settings::default()
    };
    let err = partition_graph(
        &comm,
        &mut graph,
        &mut points,
        &mut weights,
        None,
        None,
        &settings,
    )
    .unwrap_err();
    assert!(matches!(err, PartError::InvalidConfiguration(_)));
    assert_eq!(err.exit_code(), 126);
}

#[test]
fn mismatched_weight_length_is_a_distribution_error() {
    let comm = NoComm;
    let (mut graph, mut points) = grid_graph(0, 1, 4);
    let mut weights = vec![vec![1.0; 15]];
    let settings = default_settings(2);
    let err = partition_graph(
        &comm,
        &mut graph,
        &mut points,
        &mut weights,
        None,
        None,
        &settings,
    )
    .unwrap_err();
    assert!(matches!(err, PartError::WrongDistribution { .. }));
}
