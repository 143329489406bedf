//! Center seeding for balanced k-means.

use crate::comm::{collective, wire, Communicator};
use crate::dist::{BlockId, Distribution};
use crate::error::PartError;
use crate::geometry::{BoundingBox, Points};
use crate::settings::Settings;
use crate::sfc;

/// One center per new block, grouped by the old block it subdivides:
/// `centers[b][j]` is the j-th center inside old block b.
pub type CenterGroups = Vec<Vec<Vec<f64>>>;

/// Seed centers by space-filling-curve order, independently inside every
/// old block.
///
/// For old block b of global size `n_b` that splits into `k_b` children,
/// the wanted curve positions are `i * (n_b / k_b) + (n_b / k_b) / 2`. A
/// per-block prefix sum over ranks (gathered on rank 0 and broadcast)
/// locates the owner of each position; owners emit the coordinates and a
/// global sum assembles the replicated center set.
pub fn centers_from_sfc<C: Communicator>(
    comm: &C,
    points: &Points,
    dist: &Distribution,
    partition: &[BlockId],
    groups: &[usize],
    settings: &Settings,
) -> Result<CenterGroups, PartError> {
    let local_n = points.len();
    let dim = points.dim();
    let num_old_blocks = groups.len();
    let p = comm.size();

    let bbox = BoundingBox::global(comm, points)?;
    let indices = sfc::hilbert_indices(points, &bbox, settings.sfc_resolution)?;
    let mut sfc_order: Vec<usize> = (0..local_n).collect();
    sfc_order.sort_by(|&a, &b| {
        indices[a]
            .partial_cmp(&indices[b])
            .expect("finite indices")
            .then(a.cmp(&b))
    });

    // local block sizes -> concatenated per-block prefix sums over ranks:
    // [0, .., n_b] for every old block, each subarray of length p + 1
    let mut local_sizes = vec![0u64; num_old_blocks];
    for &b in partition {
        local_sizes[b] += 1;
    }
    let gathered = collective::gather_varlen(comm, 0, wire::cast_slice(&local_sizes))?;
    let mut prefix = vec![0u64; (p + 1) * num_old_blocks];
    if let Some(parts) = gathered {
        let per_rank: Vec<Vec<u64>> = parts
            .iter()
            .map(|bytes| wire::pod_vec_from::<u64>(bytes))
            .collect();
        for b in 0..num_old_blocks {
            let base = b * (p + 1);
            for r in 0..p {
                prefix[base + r + 1] = prefix[base + r] + per_rank[r][b];
            }
        }
    }
    collective::broadcast(comm, 0, &mut prefix)?;

    let global_block_size = |b: usize| prefix[b * (p + 1) + p] as usize;

    // wanted within-block curve positions of the new centers
    let mut wanted: Vec<Vec<usize>> = Vec::with_capacity(num_old_blocks);
    for (b, &k_b) in groups.iter().enumerate() {
        let n_b = global_block_size(b);
        let spacing = n_b / k_b.max(1);
        wanted.push((0..k_b).map(|i| i * spacing + spacing / 2).collect());
    }

    // each rank fills in the centers whose curve position it owns
    let mut centers: CenterGroups = groups
        .iter()
        .map(|&k_b| vec![vec![0.0; dim]; k_b])
        .collect();
    let rank = dist.rank();
    for b in 0..num_old_blocks {
        let base = b * (p + 1);
        let range_start = prefix[base + rank] as usize;
        let range_end = prefix[base + rank + 1] as usize;
        for (j, &position) in wanted[b].iter().enumerate() {
            if position < range_start || position >= range_end {
                continue;
            }
            // walk the SFC-ordered local points of block b; the first one
            // sits at within-block position range_start
            let mut counter = range_start;
            for &i in &sfc_order {
                if partition[i] != b {
                    continue;
                }
                if counter == position {
                    centers[b][j].copy_from_slice(points.point(i));
                    break;
                }
                counter += 1;
            }
        }
    }

    // assemble by global sum; exactly one rank contributed each center
    for group in centers.iter_mut() {
        let mut flat: Vec<f64> = group.iter().flatten().copied().collect();
        collective::sum_f64(comm, &mut flat)?;
        for (j, center) in group.iter_mut().enumerate() {
            center.copy_from_slice(&flat[j * dim..(j + 1) * dim]);
        }
    }
    Ok(centers)
}

/// Flat (single old block) SFC seeding of `k` centers.
pub fn centers_from_sfc_flat<C: Communicator>(
    comm: &C,
    points: &Points,
    dist: &Distribution,
    k: usize,
    settings: &Settings,
) -> Result<Vec<Vec<f64>>, PartError> {
    let partition = vec![0; points.len()];
    let mut groups = centers_from_sfc(comm, points, dist, &partition, &[k], settings)?;
    Ok(groups.swap_remove(0))
}

/// Place `k` centers at curve positions `(2i + 1) / (2k)` mapped back to
/// space through the Hilbert inverse; needs no point data at all.
pub fn centers_from_sfc_only(
    bbox: &BoundingBox,
    k: usize,
    resolution: u32,
) -> Result<Vec<Vec<f64>>, PartError> {
    let offset = 1.0 / (2.0 * k as f64);
    (0..k)
        .map(|i| sfc::hilbert_point(i as f64 / k as f64 + offset, bbox, resolution, bbox.dim()))
        .collect()
}

/// One center per rank: the weighted centroid of its local points. Used to
/// seed repartitioning when the partition equals the distribution.
pub fn local_mass_centers<C: Communicator>(
    comm: &C,
    points: &Points,
    weight: &[f64],
) -> Result<Vec<Vec<f64>>, PartError> {
    let dim = points.dim();
    let mut acc = vec![0.0; dim + 1];
    for i in 0..points.len() {
        for (d, &x) in points.point(i).iter().enumerate() {
            acc[d] += weight[i] * x;
        }
        acc[dim] += weight[i];
    }
    let parts = collective::all_gather_varlen(comm, wire::cast_slice(&acc))?;
    Ok(parts
        .iter()
        .map(|bytes| {
            let sums = wire::pod_vec_from::<f64>(bytes);
            let total = sums[dim];
            if total > 0.0 {
                sums[..dim].iter().map(|&s| s / total).collect()
            } else {
                vec![0.0; dim]
            }
        })
        .collect())
}

/// Weighted centroids of an existing partition over a sampled index range.
/// Blocks without sampled weight return `None`; callers keep the previous
/// center position in that case.
pub fn centers_of_partition<C: Communicator>(
    comm: &C,
    points: &Points,
    partition: &[BlockId],
    k: usize,
    sample: &[usize],
    weight: &[f64],
) -> Result<Vec<Option<Vec<f64>>>, PartError> {
    let dim = points.dim();
    // per block: dim coordinate sums then the weight sum
    let mut acc = vec![0.0; k * (dim + 1)];
    for &i in sample {
        let b = partition[i];
        let w = weight[i];
        let base = b * (dim + 1);
        for (d, &x) in points.point(i).iter().enumerate() {
            acc[base + d] += w * x;
        }
        acc[base + dim] += w;
    }
    collective::sum_f64(comm, &mut acc)?;
    Ok((0..k)
        .map(|b| {
            let base = b * (dim + 1);
            let total = acc[base + dim];
            (total > 0.0).then(|| acc[base..base + dim].iter().map(|&s| s / total).collect())
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::NoComm;

    fn line_points(n: usize) -> (Points, Distribution) {
        let mut data = Vec::new();
        for i in 0..n {
            data.push(i as f64);
            data.push(0.0);
        }
        (
            Points::new(2, data).unwrap(),
            Distribution::block(0, 1, n),
        )
    }

    #[test]
    fn flat_seeding_spreads_centers() {
        let comm = NoComm;
        let (points, dist) = line_points(16);
        let settings = Settings::default();
        let centers = centers_from_sfc_flat(&comm, &points, &dist, 4, &settings).unwrap();
        assert_eq!(centers.len(), 4);
        let mut xs: Vec<f64> = centers.iter().map(|c| c[0]).collect();
        xs.sort_by(|a, b| a.partial_cmp(b).unwrap());
        // positions i*4 + 2 along the line
        assert_eq!(xs, vec![2.0, 6.0, 10.0, 14.0]);
    }

    #[test]
    fn grouped_seeding_respects_blocks() {
        let comm = NoComm;
        let (points, dist) = line_points(8);
        // two old blocks: left half and right half
        let partition = vec![0, 0, 0, 0, 1, 1, 1, 1];
        let settings = Settings::default();
        let centers =
            centers_from_sfc(&comm, &points, &dist, &partition, &[2, 2], &settings).unwrap();
        assert!(centers[0].iter().all(|c| c[0] < 4.0));
        assert!(centers[1].iter().all(|c| c[0] >= 4.0));
    }

    #[test]
    fn pure_sfc_centers_stay_in_box() {
        let bbox = BoundingBox {
            min: vec![-1.0, 2.0],
            max: vec![1.0, 4.0],
        };
        let centers = centers_from_sfc_only(&bbox, 7, 12).unwrap();
        assert_eq!(centers.len(), 7);
        for c in centers {
            assert!(c[0] >= -1.0 && c[0] <= 1.0);
            assert!(c[1] >= 2.0 && c[1] <= 4.0);
        }
    }

    #[test]
    fn partition_centroids() {
        let comm = NoComm;
        let (points, _) = line_points(4);
        let partition = vec![0, 0, 1, 1];
        let sample: Vec<usize> = (0..4).collect();
        let weight = vec![1.0; 4];
        let centers =
            centers_of_partition(&comm, &points, &partition, 3, &sample, &weight).unwrap();
        assert_eq!(centers[0].as_deref(), Some(&[0.5, 0.0][..]));
        assert_eq!(centers[1].as_deref(), Some(&[2.5, 0.0][..]));
        assert!(centers[2].is_none());
    }
}
