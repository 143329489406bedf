//! Distributed data machinery: row distributions, the CSR graph, and the
//! neighbour halo.

pub mod distribution;
pub mod graph;
pub mod halo;

pub use distribution::{check_aligned, Distribution, GlobalId};
pub use graph::{
    redistribute_f64, redistribute_graph, redistribute_points, redistribute_usize, BlockId,
    DistGraph,
};
pub use halo::{neighbor_value, Halo};
