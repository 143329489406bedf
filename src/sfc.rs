//! Hilbert space-filling-curve indexing.
//!
//! Provides the SFC capability the partitioner consumes: a monotone real
//! index in `[0, 1)` per point, its inverse, and the curve-order
//! redistribution that gives every rank a contiguous curve segment.
//!
//! The bit-level encoding follows the transpose form of the Hilbert curve
//! (Skilling): convert cell coordinates to the transposed Hilbert
//! representation, then interleave bits into a single integer.

use crate::comm::{collective, wire, Communicator};
use crate::dist::{BlockId, Distribution, GlobalId};
use crate::error::PartError;
use crate::geometry::{BoundingBox, Points};

/// Supported dimensions. The curve is defined for any d, the partitioner
/// constrains itself to the geometric cases it is used for.
pub const SUPPORTED_DIMS: std::ops::RangeInclusive<usize> = 2..=3;

fn bits_per_axis(resolution: u32, dim: usize) -> u32 {
    // keep the interleaved index inside 63 bits
    resolution.min(62 / dim as u32).max(1)
}

/// Check that the dimension is one the indexer supports.
pub fn check_dim(dim: usize) -> Result<(), PartError> {
    if !SUPPORTED_DIMS.contains(&dim) {
        return Err(PartError::InvalidConfiguration(format!(
            "SFC indexing supports 2 or 3 dimensions, got {dim}"
        )));
    }
    Ok(())
}

// Skilling's in-place conversions between axis coordinates and the
// transposed Hilbert representation, b bits per axis.

fn axes_to_transpose(x: &mut [u32], b: u32) {
    let n = x.len();
    let m = 1u32 << (b - 1);
    // inverse undo
    let mut q = m;
    while q > 1 {
        let p = q - 1;
        for i in 0..n {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q >>= 1;
    }
    // Gray encode
    for i in 1..n {
        x[i] ^= x[i - 1];
    }
    let mut t = 0;
    let mut q = m;
    while q > 1 {
        if x[n - 1] & q != 0 {
            t ^= q - 1;
        }
        q >>= 1;
    }
    for xi in x.iter_mut() {
        *xi ^= t;
    }
}

fn transpose_to_axes(x: &mut [u32], b: u32) {
    let n = x.len();
    let cap = 2u32 << (b - 1);
    // Gray decode by H ^ (H/2)
    let mut t = x[n - 1] >> 1;
    for i in (1..n).rev() {
        x[i] ^= x[i - 1];
    }
    x[0] ^= t;
    // undo excess work
    let mut q = 2u32;
    while q != cap {
        let p = q - 1;
        for i in (0..n).rev() {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q <<= 1;
    }
}

fn interleave(x: &[u32], b: u32) -> u64 {
    let mut h = 0u64;
    for q in (0..b).rev() {
        for &xi in x {
            h = (h << 1) | ((xi >> q) & 1) as u64;
        }
    }
    h
}

fn deinterleave(h: u64, b: u32, dim: usize) -> Vec<u32> {
    let mut x = vec![0u32; dim];
    let mut pos = b as usize * dim;
    for q in (0..b).rev() {
        for xi in x.iter_mut() {
            pos -= 1;
            *xi |= (((h >> pos) & 1) as u32) << q;
        }
    }
    x
}

fn cell_of(p: &[f64], bbox: &BoundingBox, b: u32) -> Vec<u32> {
    let cells = 1u64 << b;
    p.iter()
        .enumerate()
        .map(|(d, &v)| {
            let extent = bbox.max[d] - bbox.min[d];
            if extent <= 0.0 {
                return 0;
            }
            let unit = ((v - bbox.min[d]) / extent).clamp(0.0, 1.0);
            ((unit * cells as f64) as u64).min(cells - 1) as u32
        })
        .collect()
}

/// Hilbert index of one point in `[0, 1)`, stable within `resolution` bits
/// per axis.
pub fn hilbert_index(p: &[f64], bbox: &BoundingBox, resolution: u32) -> Result<f64, PartError> {
    check_dim(p.len())?;
    let b = bits_per_axis(resolution, p.len());
    let mut cell = cell_of(p, bbox, b);
    axes_to_transpose(&mut cell, b);
    let h = interleave(&cell, b);
    let total_bits = b as usize * p.len();
    Ok(h as f64 / (1u64 << total_bits) as f64)
}

/// Bulk Hilbert indices for a local point set.
pub fn hilbert_indices(
    points: &Points,
    bbox: &BoundingBox,
    resolution: u32,
) -> Result<Vec<f64>, PartError> {
    check_dim(points.dim())?;
    (0..points.len())
        .map(|i| hilbert_index(points.point(i), bbox, resolution))
        .collect()
}

/// Inverse mapping: curve position in `[0, 1)` to a point in the unit cube
/// (cell centers), then scaled into `bbox`.
pub fn hilbert_point(
    index: f64,
    bbox: &BoundingBox,
    resolution: u32,
    dim: usize,
) -> Result<Vec<f64>, PartError> {
    check_dim(dim)?;
    let b = bits_per_axis(resolution, dim);
    let total_bits = b as usize * dim;
    let cells = 1u64 << b;
    let h = ((index.clamp(0.0, 1.0) * (1u64 << total_bits) as f64) as u64)
        .min((1u64 << total_bits) - 1);
    let mut x = deinterleave(h, b, dim);
    transpose_to_axes(&mut x, b);
    Ok(x.iter()
        .enumerate()
        .map(|(d, &c)| {
            let unit = (c as f64 + 0.5) / cells as f64;
            bbox.min[d] + unit * (bbox.max[d] - bbox.min[d])
        })
        .collect())
}

/// Compute the General distribution that assigns each rank a contiguous
/// segment of the curve, by splitter-based sample sort of the local
/// indices. Within a rank, ownership stays ordered by ascending global id.
pub fn sfc_distribution<C: Communicator>(
    comm: &C,
    dist: &Distribution,
    points: &Points,
    resolution: u32,
) -> Result<Distribution, PartError> {
    let p = comm.size();
    if p == 1 {
        return Ok(dist.clone());
    }
    let bbox = BoundingBox::global(comm, points)?;
    let indices = hilbert_indices(points, &bbox, resolution)?;

    // deterministic splitters from evenly spaced local samples
    let mut sorted = indices.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("finite indices"));
    let samples: Vec<f64> = if sorted.is_empty() {
        Vec::new()
    } else {
        (0..p)
            .map(|i| sorted[(i * sorted.len()) / p.max(1)])
            .collect()
    };
    let gathered = collective::all_gather_varlen(comm, wire::cast_slice(&samples))?;
    let mut all_samples: Vec<f64> = gathered
        .iter()
        .flat_map(|bytes| wire::pod_vec_from::<f64>(bytes))
        .collect();
    all_samples.sort_by(|a, b| a.partial_cmp(b).expect("finite indices"));
    let splitters: Vec<f64> = (1..p)
        .map(|i| all_samples[(i * all_samples.len()) / p])
        .collect();

    // route each owned id to its curve bucket
    let mut messages: Vec<Vec<u64>> = vec![Vec::new(); p];
    for local in 0..dist.local_size() {
        let bucket = splitters.partition_point(|&s| s <= indices[local]);
        messages[bucket].push(dist.global_of(local) as u64);
    }
    let byte_messages: Vec<Vec<u8>> = messages
        .iter()
        .map(|m| wire::cast_slice(m).to_vec())
        .collect();
    let incoming = collective::all_to_allv(comm, &byte_messages)?;

    let mut owned: Vec<GlobalId> = incoming
        .iter()
        .flat_map(|bytes| wire::pod_vec_from::<u64>(bytes))
        .map(|g| g as usize)
        .collect();
    owned.sort_unstable();
    Distribution::general(comm, owned, dist.global_size())
}

/// Partition along the curve: walk the local points in curve order and cut
/// the weighted prefix into `k` equal shares. Assumes ranks already own
/// contiguous curve segments in rank order (after [`sfc_distribution`]).
pub fn sfc_partition<C: Communicator>(
    comm: &C,
    points: &Points,
    weight: &[f64],
    k: usize,
    resolution: u32,
) -> Result<Vec<BlockId>, PartError> {
    let bbox = BoundingBox::global(comm, points)?;
    let indices = hilbert_indices(points, &bbox, resolution)?;
    let mut order: Vec<usize> = (0..points.len()).collect();
    order.sort_by(|&a, &b| {
        indices[a]
            .partial_cmp(&indices[b])
            .expect("finite indices")
            .then(a.cmp(&b))
    });

    let local_total: f64 = weight.iter().sum();
    let (offset, total) = scan_f64(comm, local_total.to_bits())?;

    let mut part = vec![0; points.len()];
    let mut prefix = offset;
    for &i in &order {
        let mid = prefix + weight[i] / 2.0;
        let block = ((mid / total) * k as f64) as usize;
        part[i] = block.min(k - 1);
        prefix += weight[i];
    }
    Ok(part)
}

fn scan_f64<C: Communicator>(comm: &C, local_bits: u64) -> Result<(f64, f64), PartError> {
    let parts = collective::all_gather_varlen(comm, &local_bits.to_le_bytes())?;
    let values: Vec<f64> = parts
        .iter()
        .map(|b| f64::from_bits(u64::from_le_bytes(b.as_slice().try_into().expect("8 bytes"))))
        .collect();
    let offset = values[..comm.rank()].iter().sum();
    let total = values.iter().sum();
    Ok((offset, total))
}

/// Debug check: ranks hold non-overlapping, ascending curve segments.
pub fn is_curve_consistent<C: Communicator>(
    comm: &C,
    points: &Points,
    resolution: u32,
) -> Result<bool, PartError> {
    let bbox = BoundingBox::global(comm, points)?;
    let indices = hilbert_indices(points, &bbox, resolution)?;
    let lo = indices.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = indices.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let encoded = [lo.to_bits(), hi.to_bits()];
    let parts = collective::all_gather_varlen(comm, wire::cast_slice(&encoded))?;
    let ranges: Vec<(f64, f64)> = parts
        .iter()
        .map(|b| {
            let words = wire::pod_vec_from::<u64>(b);
            (f64::from_bits(words[0]), f64::from_bits(words[1]))
        })
        .collect();
    let mut consistent = true;
    for w in ranges.windows(2) {
        // empty ranks have inverted infinite ranges and are skipped
        if w[0].1.is_finite() && w[1].0.is_finite() && w[0].1 > w[1].0 {
            consistent = false;
        }
    }
    Ok(consistent)
}
