//! Property-based partition invariants on randomly generated point sets.

use proptest::prelude::*;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use geopart::prelude::*;

fn random_points(seed: u64, n: usize, dim: usize) -> Points {
    let mut rng = SmallRng::seed_from_u64(seed);
    let data: Vec<f64> = (0..n * dim).map(|_| rng.gen_range(0.0..100.0)).collect();
    Points::new(dim, data).expect("generated coordinates")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Block weights always sum to the total weight, block ids stay dense
    /// in [0, k), and the partition covers every point.
    #[test]
    fn kmeans_partition_invariants(
        seed in 0u64..1000,
        n in 40usize..160,
        k in 2usize..6,
    ) {
        let comm = NoComm;
        let points = random_points(seed, n, 2);
        let dist = Distribution::block(0, 1, n);
        let mut rng = SmallRng::seed_from_u64(seed ^ 0xabcd);
        let weights = vec![(0..n).map(|_| rng.gen_range(1.0..4.0)).collect::<Vec<f64>>()];
        let total: f64 = weights[0].iter().sum();
        let targets = vec![vec![total / k as f64; k]];
        let settings = Settings {
            num_blocks: k,
            min_sampling_nodes: -1,
            ..Settings::default()
        };

        let mut metrics = PartitionMetrics::default();
        let result = geopart::kmeans::compute_partition_seeded(
            &comm, &points, &dist, &weights, &targets, &settings, &mut metrics,
        ).unwrap();

        prop_assert_eq!(result.partition.len(), n);
        prop_assert!(result.partition.iter().all(|&b| b < k));

        let sums = geopart::metrics::block_weights(&comm, &result.partition, &weights, k).unwrap();
        let reassembled: f64 = sums[0].iter().sum();
        prop_assert!((reassembled - total).abs() < 1e-6 * total.max(1.0));
    }

    /// The curve index stays in [0, 1) and its inverse lands within one
    /// cell of the original point.
    #[test]
    fn hilbert_round_trip(
        seed in 0u64..1000,
        dim in 2usize..4,
    ) {
        let points = random_points(seed, 32, dim);
        let comm = NoComm;
        let bbox = BoundingBox::global(&comm, &points).unwrap();
        for i in 0..points.len() {
            let h = geopart::sfc::hilbert_index(points.point(i), &bbox, 16).unwrap();
            prop_assert!((0.0..1.0).contains(&h));
            let back = geopart::sfc::hilbert_point(h, &bbox, 16, dim).unwrap();
            for d in 0..dim {
                let cell = (bbox.max[d] - bbox.min[d]) / (1u64 << 16) as f64;
                prop_assert!(
                    (back[d] - points.point(i)[d]).abs() <= cell * 2.0,
                    "dim {} diverged: {} vs {}", d, back[d], points.point(i)[d]
                );
            }
        }
    }

    /// Fuzzy memberships are a probability distribution over the closest
    /// centers.
    #[test]
    fn memberships_are_distributions(
        seed in 0u64..1000,
        n in 20usize..60,
        k in 2usize..5,
    ) {
        let comm = NoComm;
        let points = random_points(seed, n, 2);
        let weights = vec![vec![1.0; n]];
        let mut rng = SmallRng::seed_from_u64(seed ^ 0x1234);
        let partition: Vec<BlockId> = (0..n).map(|_| rng.gen_range(0..k)).collect();
        let fuzzy = geopart::kmeans::rebalance::fuzzify(
            &comm, &points, &partition, k, &weights, 6,
        ).unwrap();
        let memberships = geopart::kmeans::rebalance::memberships(&fuzzy);
        for m in &memberships {
            let sum: f64 = m.iter().sum();
            prop_assert!((sum - 1.0).abs() < 1e-9);
            prop_assert!(m.iter().all(|&x| x >= 0.0));
        }
    }
}
