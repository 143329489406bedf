//! Shared fixtures: structured test graphs and a thread-per-rank harness.
#![allow(dead_code)] // each test binary uses its own subset

use geopart::prelude::*;

/// Build the local slice of an `side x side` grid graph (4-neighbourhood,
/// unit edge weights) under a block distribution.
pub fn grid_graph(rank: usize, size: usize, side: usize) -> (DistGraph, Points) {
    let n = side * side;
    let dist = Distribution::block(rank, size, n);
    let mut ia = vec![0];
    let mut ja = Vec::new();
    let mut coords = Vec::new();
    for local in 0..dist.local_size() {
        let v = dist.global_of(local);
        let (i, j) = (v / side, v % side);
        if i > 0 {
            ja.push(v - side);
        }
        if j > 0 {
            ja.push(v - 1);
        }
        if j + 1 < side {
            ja.push(v + 1);
        }
        if i + 1 < side {
            ja.push(v + side);
        }
        ia.push(ja.len());
        coords.push(j as f64);
        coords.push(i as f64);
    }
    let vals = vec![1.0; ja.len()];
    let graph = DistGraph::new(dist, ia, ja, vals).expect("grid graph is consistent");
    let points = Points::new(2, coords).expect("grid coordinates");
    (graph, points)
}

/// Two disconnected `side x side` grids, the second shifted far away on the
/// x axis. Serial only.
pub fn two_squares(side: usize) -> (DistGraph, Points) {
    let per = side * side;
    let n = 2 * per;
    let dist = Distribution::block(0, 1, n);
    let mut ia = vec![0];
    let mut ja = Vec::new();
    let mut coords = Vec::new();
    for v in 0..n {
        let (component, w) = (v / per, v % per);
        let base = component * per;
        let (i, j) = (w / side, w % side);
        if i > 0 {
            ja.push(base + w - side);
        }
        if j > 0 {
            ja.push(base + w - 1);
        }
        if j + 1 < side {
            ja.push(base + w + 1);
        }
        if i + 1 < side {
            ja.push(base + w + side);
        }
        ia.push(ja.len());
        coords.push(j as f64 / (side - 1) as f64 + component as f64 * 10.0);
        coords.push(i as f64 / (side - 1) as f64);
    }
    let vals = vec![1.0; ja.len()];
    let graph = DistGraph::new(dist, ia, ja, vals).expect("two squares are consistent");
    let points = Points::new(2, coords).expect("square coordinates");
    (graph, points)
}

/// Serial `side^3` lattice graph (6-neighbourhood, unit edge weights).
pub fn lattice_3d(side: usize) -> (DistGraph, Points) {
    let n = side * side * side;
    let dist = Distribution::block(0, 1, n);
    let index = |x: usize, y: usize, z: usize| (x * side + y) * side + z;
    let mut ia = vec![0];
    let mut ja = Vec::new();
    let mut coords = Vec::new();
    for x in 0..side {
        for y in 0..side {
            for z in 0..side {
                if x > 0 {
                    ja.push(index(x - 1, y, z));
                }
                if y > 0 {
                    ja.push(index(x, y - 1, z));
                }
                if z > 0 {
                    ja.push(index(x, y, z - 1));
                }
                if z + 1 < side {
                    ja.push(index(x, y, z + 1));
                }
                if y + 1 < side {
                    ja.push(index(x, y + 1, z));
                }
                if x + 1 < side {
                    ja.push(index(x + 1, y, z));
                }
                ia.push(ja.len());
                coords.push(x as f64);
                coords.push(y as f64);
                coords.push(z as f64);
            }
        }
    }
    let vals = vec![1.0; ja.len()];
    let graph = DistGraph::new(dist, ia, ja, vals).expect("lattice is consistent");
    let points = Points::new(3, coords).expect("lattice coordinates");
    (graph, points)
}

/// Run one closure per rank on a fresh thread group and collect the
/// results in rank order.
pub fn on_ranks<T, F>(size: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(ThreadComm) -> T + Send + Sync + Clone + 'static,
{
    let comms = ThreadComm::group(size);
    let handles: Vec<_> = comms
        .into_iter()
        .map(|comm| {
            let f = f.clone();
            std::thread::spawn(move || f(comm))
        })
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().expect("rank thread panicked"))
        .collect()
}

/// Block sizes of a partition.
pub fn block_counts(partition: &[BlockId], k: usize) -> Vec<usize> {
    let mut counts = vec![0; k];
    for &b in partition {
        counts[b] += 1;
    }
    counts
}
