//! # geopart
//!
//! A distributed geometric graph partitioner: divides a weighted graph with
//! vertex coordinates (or a bare point set) across k blocks to minimize the
//! edge cut while respecting per-block weight balance, including multiple
//! vertex weights and heterogeneous target block sizes along a processor
//! hierarchy.
//!
//! ## Pieces
//! - Balanced k-means with space-filling-curve seeding, influence-based
//!   balance correction, triangle-inequality pruning and progressive
//!   sampling; a hierarchical variant follows a processor tree top-down.
//! - Multi-level refinement: heavy-edge-matching coarsening with pairwise
//!   Fiduccia-Mattheyses boundary exchanges on an edge-colored schedule.
//! - The distributed machinery underneath: row-block distributions, a CSR
//!   graph with neighbour halos, block/PE graph extraction, and partition
//!   quality metrics.
//!
//! ## Process model
//! One shared-nothing process (or thread) per rank; work inside a rank is
//! sequential. Every collective takes an explicit [`comm::Communicator`]
//! handle; backends cover serial use ([`comm::NoComm`]), thread-per-rank
//! groups ([`comm::ThreadComm`]) and MPI behind the `mpi-support` feature.
//! All collectives reduce in fixed rank order, so identical inputs and
//! rank counts reproduce identical partitions bit for bit.
//!
//! ## Entry point
//! [`driver::partition_graph`] validates the settings everywhere, computes
//! the initial partition (SFC, flat or hierarchical k-means), runs
//! multilevel refinement, and returns the partition together with a
//! [`metrics::PartitionMetrics`] quality summary.

pub mod comm;
pub mod comm_tree;
pub mod dist;
pub mod driver;
pub mod error;
pub mod geometry;
pub mod kmeans;
pub mod metrics;
pub mod multilevel;
pub mod refine;
pub mod settings;
pub mod sfc;

/// The most-used types and entry points.
pub mod prelude {
    pub use crate::comm::{Communicator, NoComm, ThreadComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::comm::MpiComm;
    pub use crate::comm_tree::CommTree;
    pub use crate::dist::{BlockId, DistGraph, Distribution, GlobalId, Halo};
    pub use crate::driver::partition_graph;
    pub use crate::error::PartError;
    pub use crate::geometry::{BoundingBox, Points};
    pub use crate::metrics::PartitionMetrics;
    pub use crate::settings::{
        BalanceMethod, InitialPartition, SampleOrder, Settings, TieBreak,
    };
}
