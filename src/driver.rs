//! Orchestration: initial partitioning plus multilevel refinement.

use std::time::Instant;

use tracing::{info, warn};

use crate::comm::{collective, Communicator};
use crate::comm_tree::CommTree;
use crate::dist::{
    check_aligned, redistribute_f64, redistribute_graph, redistribute_points, redistribute_usize,
    BlockId, DistGraph, Halo,
};
use crate::error::PartError;
use crate::geometry::Points;
use crate::metrics::{gather_metrics, PartitionMetrics};
use crate::multilevel::Level;
use crate::settings::{InitialPartition, Settings};
use crate::{kmeans, sfc};

/// Partition a distributed graph with coordinates.
///
/// The graph, coordinates and weights are redistributed in place when the
/// settings ask for curve-order migration or when refinement moves
/// vertices; the returned partition is aligned with the graph's row
/// distribution as left behind. `previous` supplies the partition to
/// refine in repartition mode; `tree` the processor hierarchy for the
/// hierarchical methods (a uniform tree is built from `hier_levels` when
/// absent).
pub fn partition_graph<C: Communicator>(
    comm: &C,
    graph: &mut DistGraph,
    points: &mut Points,
    weights: &mut Vec<Vec<f64>>,
    previous: Option<&[BlockId]>,
    tree: Option<&CommTree>,
    settings: &Settings,
) -> Result<(Vec<BlockId>, PartitionMetrics), PartError> {
    settings.validate_global(comm)?;
    let k = settings.num_blocks;
    let num_weights = settings.num_node_weights;

    // input-shape checks are per rank; and-reduce the verdict so a rank
    // with misaligned inputs cannot leave the others stuck in a collective
    let local_check = (|| -> Result<(), PartError> {
        check_aligned("driver coordinates", graph.local_n(), points.len())?;
        if weights.len() != num_weights {
            return Err(PartError::InvalidConfiguration(format!(
                "{} weight vectors given, settings expect {num_weights}",
                weights.len()
            )));
        }
        for w in weights.iter() {
            check_aligned("driver weights", graph.local_n(), w.len())?;
        }
        if points.dim() != settings.dimensions {
            return Err(PartError::InvalidConfiguration(format!(
                "points are {}-dimensional, settings say {}",
                points.dim(),
                settings.dimensions
            )));
        }
        Ok(())
    })();
    let all_ok = collective::all_true(comm, local_check.is_ok())?;
    local_check?;
    if !all_ok {
        return Err(PartError::InvalidConfiguration(
            "inputs rejected on another rank".into(),
        ));
    }

    let mut totals: Vec<f64> = weights.iter().map(|w| w.iter().sum()).collect();
    collective::sum_f64(comm, &mut totals)?;

    // target block weights: the processor tree's leaf capacities, scaled to
    // the actual point weight, or a uniform split
    let targets: Vec<Vec<f64>> = match tree {
        Some(tree) => {
            let mut tree = tree.clone();
            tree.scale_capacities(&totals);
            tree.validate(k, &totals, settings.epsilon)?;
            tree.leaf_targets()
        }
        None => totals.iter().map(|&t| vec![t / k as f64; k]).collect(),
    };

    // curve-order migration: always on for the hierarchical methods, whose
    // per-block prefix sums want curve locality
    let mut previous: Option<Vec<BlockId>> = previous.map(|p| p.to_vec());
    if settings.redistribute_by_sfc || settings.is_hierarchical() {
        let new_dist = sfc::sfc_distribution(comm, &graph.dist, points, settings.sfc_resolution)?;
        let old_dist = graph.dist.clone();
        *points = redistribute_points(comm, &old_dist, &new_dist, points)?;
        for w in weights.iter_mut() {
            *w = redistribute_f64(comm, &old_dist, &new_dist, w, 1)?;
        }
        if let Some(prev) = previous.as_mut() {
            *prev = redistribute_usize(comm, &old_dist, &new_dist, prev)?;
        }
        *graph = redistribute_graph(comm, graph, &new_dist)?;
    }

    let mut metrics = PartitionMetrics::default();
    let start = Instant::now();
    let mut partition: Vec<BlockId> = if settings.repartition {
        let prev = previous.as_deref().ok_or_else(|| {
            PartError::InvalidConfiguration(
                "repartition mode needs a previous partition".into(),
            )
        })?;
        kmeans::compute_repartition(
            comm,
            points,
            &graph.dist,
            weights,
            &targets,
            prev,
            settings,
            &mut metrics,
        )?
        .partition
    } else {
        match settings.initial_partition {
            InitialPartition::Sfc => {
                metrics.converged = true;
                sfc::sfc_partition(comm, points, &weights[0], k, settings.sfc_resolution)?
            }
            InitialPartition::KMeans => {
                kmeans::compute_partition_seeded(
                    comm,
                    points,
                    &graph.dist,
                    weights,
                    &targets,
                    settings,
                    &mut metrics,
                )?
                .partition
            }
            InitialPartition::HierKMeans | InitialPartition::HierRepart => {
                let mut tree = match tree {
                    Some(tree) => tree.clone(),
                    None => CommTree::from_arities(&settings.hier_levels, num_weights)?,
                };
                tree.scale_capacities(&totals);
                if settings.initial_partition == InitialPartition::HierRepart {
                    kmeans::hierarchical::compute_hier_plus_repart(
                        comm,
                        points,
                        &graph.dist,
                        weights,
                        &tree,
                        settings,
                        &mut metrics,
                    )?
                } else {
                    kmeans::hierarchical::compute_hierarchical_partition(
                        comm,
                        points,
                        &graph.dist,
                        weights,
                        &tree,
                        settings,
                        &mut metrics,
                    )?
                }
            }
        }
    };
    metrics.time_initial = start.elapsed().as_secs_f64();
    info!(
        time = metrics.time_initial,
        "initial partition computed"
    );

    // multilevel refinement with pairwise FM at every level
    let has_edges = collective::any_true(comm, graph.local_edge_count() > 0)?;
    if settings.refine && has_edges {
        let refinable = comm.size() == 1 || k == comm.size();
        if refinable {
            let start = Instant::now();
            let mut level = Level {
                graph: graph.clone(),
                points: points.clone(),
                weights: weights.clone(),
                partition,
            };
            crate::multilevel::multilevel_refine(comm, &mut level, &targets, settings, &mut metrics)?;
            *graph = level.graph;
            *points = level.points;
            *weights = level.weights;
            partition = level.partition;
            metrics.time_refine = start.elapsed().as_secs_f64();
        } else {
            warn!(
                k,
                p = comm.size(),
                "refinement skipped: needs one block per rank or a single rank"
            );
        }
    }

    // final quality metrics
    let halo = Halo::build(comm, graph)?;
    let quality = gather_metrics(comm, graph, &halo, &partition, weights, &targets, k)?;
    metrics.cut = quality.cut;
    metrics.imbalance = quality.imbalance;
    metrics.comm_volume_max = quality.comm_volume_max;
    metrics.comm_volume_total = quality.comm_volume_total;
    metrics.max_block_degree = quality.max_block_degree;
    metrics.border_nodes = quality.border_nodes;
    metrics.inner_nodes = quality.inner_nodes;

    Ok((partition, metrics))
}
