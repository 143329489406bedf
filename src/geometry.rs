//! Flat coordinate storage and bounding boxes.

use crate::comm::{collective, Communicator};
use crate::error::PartError;

/// Row-major coordinate storage for the locally owned points.
#[derive(Clone, Debug, Default)]
pub struct Points {
    dim: usize,
    data: Vec<f64>,
}

impl Points {
    pub fn new(dim: usize, data: Vec<f64>) -> Result<Self, PartError> {
        if dim == 0 || data.len() % dim != 0 {
            return Err(PartError::InconsistentInput(format!(
                "coordinate buffer of length {} does not split into {dim}-dimensional points",
                data.len()
            )));
        }
        Ok(Points { dim, data })
    }

    pub fn empty(dim: usize) -> Self {
        Points {
            dim,
            data: Vec::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.dim
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn point(&self, i: usize) -> &[f64] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    pub fn push(&mut self, p: &[f64]) {
        debug_assert_eq!(p.len(), self.dim);
        self.data.extend_from_slice(p);
    }

    pub fn raw(&self) -> &[f64] {
        &self.data
    }
}

/// Squared Euclidean distance between two points of equal dimension.
pub fn dist_sq(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Axis-aligned bounding box.
#[derive(Clone, Debug)]
pub struct BoundingBox {
    pub min: Vec<f64>,
    pub max: Vec<f64>,
}

impl BoundingBox {
    /// Box of the local point set; degenerate (min == max) for fewer than
    /// two distinct points.
    pub fn local(points: &Points) -> Self {
        let dim = points.dim();
        let mut min = vec![f64::INFINITY; dim];
        let mut max = vec![f64::NEG_INFINITY; dim];
        for i in 0..points.len() {
            for (d, &x) in points.point(i).iter().enumerate() {
                min[d] = min[d].min(x);
                max[d] = max[d].max(x);
            }
        }
        if points.is_empty() {
            min = vec![0.0; dim];
            max = vec![0.0; dim];
        }
        BoundingBox { min, max }
    }

    /// Global box over all ranks' points.
    pub fn global<C: Communicator>(comm: &C, points: &Points) -> Result<Self, PartError> {
        let mut local = BoundingBox::local(points);
        collective::min_f64(comm, &mut local.min)?;
        collective::max_f64(comm, &mut local.max)?;
        Ok(local)
    }

    pub fn dim(&self) -> usize {
        self.min.len()
    }

    /// Minimum squared distance from the box to a point; zero inside.
    pub fn dist_sq_to(&self, p: &[f64]) -> f64 {
        let mut sum = 0.0;
        for d in 0..self.dim() {
            let x = p[d].clamp(self.min[d], self.max[d]);
            sum += (p[d] - x) * (p[d] - x);
        }
        sum
    }

    pub fn diagonal(&self) -> f64 {
        self.min
            .iter()
            .zip(&self.max)
            .map(|(lo, hi)| (hi - lo) * (hi - lo))
            .sum::<f64>()
            .sqrt()
    }

    pub fn volume(&self) -> f64 {
        self.min
            .iter()
            .zip(&self.max)
            .map(|(lo, hi)| hi - lo)
            .product()
    }
}
