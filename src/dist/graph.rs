//! Row-block-distributed CSR adjacency.

use crate::comm::{collective, wire, Communicator};
use crate::dist::distribution::{Distribution, GlobalId};
use crate::error::PartError;
use crate::geometry::Points;

/// Block label assigned by a partition.
pub type BlockId = usize;

/// Distributed graph: locally owned CSR rows whose column indices are
/// global. The column dimension is logically non-distributed so that
/// neighbour lookups can always be expressed in global ids.
#[derive(Clone, Debug)]
pub struct DistGraph {
    pub dist: Distribution,
    ia: Vec<usize>,
    ja: Vec<GlobalId>,
    vals: Vec<f64>,
}

impl DistGraph {
    /// Wrap local CSR storage. `ia` must have `local_size + 1` entries and
    /// `ja`/`vals` must agree with its final offset.
    pub fn new(
        dist: Distribution,
        ia: Vec<usize>,
        ja: Vec<GlobalId>,
        vals: Vec<f64>,
    ) -> Result<Self, PartError> {
        if ia.len() != dist.local_size() + 1 {
            return Err(PartError::WrongDistribution {
                context: "graph rows",
                left: ia.len().saturating_sub(1),
                right: dist.local_size(),
            });
        }
        if *ia.last().expect("ia non-empty") != ja.len() || ja.len() != vals.len() {
            return Err(PartError::InconsistentInput(format!(
                "CSR offsets end at {} but {} columns / {} values are stored",
                ia.last().expect("ia non-empty"),
                ja.len(),
                vals.len()
            )));
        }
        let graph = DistGraph {
            dist,
            ia,
            ja,
            vals,
        };
        graph.validate()?;
        Ok(graph)
    }

    /// A graph with no edges, for point-set-only partitioning paths.
    pub fn edgeless(dist: Distribution) -> Self {
        let n = dist.local_size();
        DistGraph {
            dist,
            ia: vec![0; n + 1],
            ja: Vec::new(),
            vals: Vec::new(),
        }
    }

    pub fn local_n(&self) -> usize {
        self.ia.len() - 1
    }

    pub fn global_n(&self) -> usize {
        self.dist.global_size()
    }

    pub fn degree(&self, local: usize) -> usize {
        self.ia[local + 1] - self.ia[local]
    }

    /// Columns and values of a local row.
    pub fn row(&self, local: usize) -> (&[GlobalId], &[f64]) {
        let range = self.ia[local]..self.ia[local + 1];
        (&self.ja[range.clone()], &self.vals[range])
    }

    pub fn local_edge_count(&self) -> usize {
        self.ja.len()
    }

    /// Structural validation: columns in range, no self-loops, no duplicate
    /// entries within a row.
    pub fn validate(&self) -> Result<(), PartError> {
        let n = self.global_n();
        for local in 0..self.local_n() {
            let g = self.dist.global_of(local);
            let (cols, _) = self.row(local);
            // rows are not required to be sorted; check duplicates on a copy
            let mut sorted = cols.to_vec();
            sorted.sort_unstable();
            if sorted.windows(2).any(|w| w[0] == w[1]) {
                return Err(PartError::InconsistentInput(format!(
                    "duplicate edge in row {g}"
                )));
            }
            for &c in cols {
                if c == g {
                    return Err(PartError::InconsistentInput(format!("self-loop at {g}")));
                }
                if c >= n {
                    return Err(PartError::InconsistentInput(format!(
                        "column {c} out of range in row {g} (global size {n})"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Ascending list of global column ids referenced by local rows but not
    /// owned here. Set semantics.
    pub fn non_local_neighbors(&self) -> Vec<GlobalId> {
        let mut out: Vec<GlobalId> = self
            .ja
            .iter()
            .copied()
            .filter(|&c| !self.dist.is_local(c))
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    pub fn max_local_degree(&self) -> usize {
        (0..self.local_n()).map(|i| self.degree(i)).max().unwrap_or(0)
    }

    /// Global maximum degree.
    pub fn max_degree<C: Communicator>(&self, comm: &C) -> Result<usize, PartError> {
        let mut buf = [self.max_local_degree() as u64];
        collective::max_u64(comm, &mut buf)?;
        Ok(buf[0] as usize)
    }
}

/// Move graph rows to a new distribution of the same global index set.
pub fn redistribute_graph<C: Communicator>(
    comm: &C,
    graph: &DistGraph,
    new_dist: &Distribution,
) -> Result<DistGraph, PartError> {
    // row records: [gid, degree, cols..., value bits...] as u64 words
    let p = comm.size();
    let mut messages: Vec<Vec<u64>> = vec![Vec::new(); p];
    for local in 0..graph.local_n() {
        let g = graph.dist.global_of(local);
        let dest = new_dist.owner_of(g);
        let (cols, vals) = graph.row(local);
        let msg = &mut messages[dest];
        msg.push(g as u64);
        msg.push(cols.len() as u64);
        msg.extend(cols.iter().map(|&c| c as u64));
        msg.extend(vals.iter().map(|v| v.to_bits()));
    }
    let byte_messages: Vec<Vec<u8>> = messages
        .iter()
        .map(|m| wire::cast_slice(m).to_vec())
        .collect();
    let incoming = collective::all_to_allv(comm, &byte_messages)?;

    let local_n = new_dist.local_size();
    let mut rows: Vec<Option<(Vec<GlobalId>, Vec<f64>)>> = vec![None; local_n];
    for part in &incoming {
        let words = wire::pod_vec_from::<u64>(part);
        let mut at = 0;
        while at < words.len() {
            let g = words[at] as usize;
            let deg = words[at + 1] as usize;
            at += 2;
            let cols: Vec<GlobalId> = words[at..at + deg].iter().map(|&c| c as usize).collect();
            at += deg;
            let vals: Vec<f64> = words[at..at + deg]
                .iter()
                .map(|&b| f64::from_bits(b))
                .collect();
            at += deg;
            let local = new_dist.local_of(g).ok_or_else(|| {
                PartError::collective(comm, "redistribute_graph", format!("row {g} misrouted"))
            })?;
            rows[local] = Some((cols, vals));
        }
    }

    let mut ia = Vec::with_capacity(local_n + 1);
    let mut ja = Vec::new();
    let mut vals = Vec::new();
    ia.push(0);
    for (local, row) in rows.into_iter().enumerate() {
        let (cols, values) = row.ok_or_else(|| {
            PartError::collective(
                comm,
                "redistribute_graph",
                format!("row {} never arrived", new_dist.global_of(local)),
            )
        })?;
        ja.extend(cols);
        vals.extend(values);
        ia.push(ja.len());
    }
    DistGraph::new(new_dist.clone(), ia, ja, vals)
}

/// Move fixed-stride f64 payloads (coordinates, one weight vector) to a new
/// distribution.
pub fn redistribute_f64<C: Communicator>(
    comm: &C,
    old_dist: &Distribution,
    new_dist: &Distribution,
    values: &[f64],
    stride: usize,
) -> Result<Vec<f64>, PartError> {
    let p = comm.size();
    let mut messages: Vec<Vec<u64>> = vec![Vec::new(); p];
    for local in 0..old_dist.local_size() {
        let g = old_dist.global_of(local);
        let dest = new_dist.owner_of(g);
        let msg = &mut messages[dest];
        msg.push(g as u64);
        msg.extend(
            values[local * stride..(local + 1) * stride]
                .iter()
                .map(|v| v.to_bits()),
        );
    }
    let byte_messages: Vec<Vec<u8>> = messages
        .iter()
        .map(|m| wire::cast_slice(m).to_vec())
        .collect();
    let incoming = collective::all_to_allv(comm, &byte_messages)?;

    let mut out = vec![0.0; new_dist.local_size() * stride];
    for part in &incoming {
        let words = wire::pod_vec_from::<u64>(part);
        for record in words.chunks_exact(1 + stride) {
            let g = record[0] as usize;
            let local = new_dist.local_of(g).ok_or_else(|| {
                PartError::collective(comm, "redistribute_f64", format!("value {g} misrouted"))
            })?;
            for (d, &bits) in record[1..].iter().enumerate() {
                out[local * stride + d] = f64::from_bits(bits);
            }
        }
    }
    Ok(out)
}

/// Move a usize payload (a partition vector) to a new distribution.
pub fn redistribute_usize<C: Communicator>(
    comm: &C,
    old_dist: &Distribution,
    new_dist: &Distribution,
    values: &[usize],
) -> Result<Vec<usize>, PartError> {
    let p = comm.size();
    let mut messages: Vec<Vec<u64>> = vec![Vec::new(); p];
    for local in 0..old_dist.local_size() {
        let g = old_dist.global_of(local);
        let dest = new_dist.owner_of(g);
        messages[dest].push(g as u64);
        messages[dest].push(values[local] as u64);
    }
    let byte_messages: Vec<Vec<u8>> = messages
        .iter()
        .map(|m| wire::cast_slice(m).to_vec())
        .collect();
    let incoming = collective::all_to_allv(comm, &byte_messages)?;

    let mut out = vec![0usize; new_dist.local_size()];
    for part in &incoming {
        let words = wire::pod_vec_from::<u64>(part);
        for record in words.chunks_exact(2) {
            let g = record[0] as usize;
            let local = new_dist.local_of(g).ok_or_else(|| {
                PartError::collective(comm, "redistribute_usize", format!("value {g} misrouted"))
            })?;
            out[local] = record[1] as usize;
        }
    }
    Ok(out)
}

/// Redistribute coordinates as a [`Points`] payload.
pub fn redistribute_points<C: Communicator>(
    comm: &C,
    old_dist: &Distribution,
    new_dist: &Distribution,
    points: &Points,
) -> Result<Points, PartError> {
    let data = redistribute_f64(comm, old_dist, new_dist, points.raw(), points.dim())?;
    Points::new(points.dim(), data)
}
