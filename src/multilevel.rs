//! Multi-level scheme: heavy-edge-matching coarsening, projection, and the
//! coarsen-refine-uncoarsen schedule around local refinement.

use hashbrown::HashMap;
use tracing::{debug, info};

use crate::comm::{collective, wire, Communicator};
use crate::dist::{BlockId, DistGraph, Distribution, GlobalId, Halo};
use crate::error::PartError;
use crate::geometry::Points;
use crate::metrics::PartitionMetrics;
use crate::settings::Settings;

/// One level of the hierarchy: the graph with its aligned payloads.
#[derive(Clone, Debug)]
pub struct Level {
    pub graph: DistGraph,
    pub points: Points,
    pub weights: Vec<Vec<f64>>,
    pub partition: Vec<BlockId>,
}

/// A finished coarsening step: the coarser level plus the projection map
/// from the finer level's local vertices to coarse global ids.
pub struct Coarsening {
    pub coarse: Level,
    pub fine_to_coarse: Vec<GlobalId>,
}

fn mix(gid: GlobalId, round: usize) -> u64 {
    // splitmix64 over the id and round; drives the propose/accept parity
    let mut z = (gid as u64) ^ ((round as u64 + 1).wrapping_mul(0x9e37_79b9_7f4a_7c15));
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Distributed heavy-edge matching restricted to same-block endpoints.
///
/// Rounds of a propose/accept protocol: locally owned pairs match greedily
/// in ascending id order; for a cross-rank edge the parity of a per-round
/// hash decides proposer and acceptor, the owner grants each target to the
/// lowest proposing id, and accepted proposals are confirmed by a reply.
/// Returns the matching partner per local vertex (self-partnered when
/// unmatched) and the number of matched pairs globally.
fn heavy_edge_matching<C: Communicator>(
    comm: &C,
    graph: &DistGraph,
    halo: &Halo,
    part: &[BlockId],
) -> Result<(Vec<GlobalId>, u64), PartError> {
    const ROUNDS: usize = 4;
    let local_n = graph.local_n();
    let p = comm.size();
    let halo_part = halo.update_usize(comm, part)?;

    let mut matched = vec![false; local_n];
    let mut partner: Vec<GlobalId> = (0..local_n).map(|l| graph.dist.global_of(l)).collect();
    let mut total_pairs = 0u64;

    for round in 0..ROUNDS {
        let matched_flags: Vec<u64> = matched.iter().map(|&m| m as u64).collect();
        let halo_matched = halo.update(comm, &matched_flags)?;

        let mut proposals: Vec<Vec<u64>> = vec![Vec::new(); p];
        let mut proposed = vec![false; local_n];
        let mut new_pairs = 0u64;

        for u in 0..local_n {
            if matched[u] || proposed[u] {
                continue;
            }
            let u_gid = graph.dist.global_of(u);
            // heaviest unmatched neighbour in the same block, ties to the
            // lower id
            let (cols, vals) = graph.row(u);
            let mut best: Option<(f64, GlobalId)> = None;
            for (&v_gid, &w) in cols.iter().zip(vals) {
                let (v_matched, v_block) = match graph.dist.local_of(v_gid) {
                    Some(v) => (matched[v] || proposed[v], part[v]),
                    None => {
                        let slot = halo.slot(v_gid).ok_or_else(|| {
                            PartError::InconsistentInput(format!(
                                "neighbour {v_gid} has no halo slot"
                            ))
                        })?;
                        (halo_matched[slot] != 0, halo_part[slot])
                    }
                };
                if v_matched || v_block != part[u] {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((bw, bg)) => w > bw || (w == bw && v_gid < bg),
                };
                if better {
                    best = Some((w, v_gid));
                }
            }
            let Some((_, v_gid)) = best else { continue };

            if let Some(v) = graph.dist.local_of(v_gid) {
                // both ends owned here: match greedily
                matched[u] = true;
                matched[v] = true;
                partner[u] = v_gid;
                partner[v] = u_gid;
                new_pairs += 1;
            } else if mix(u_gid, round) & 1 == 0 && mix(v_gid, round) & 1 == 1 {
                // proposer/acceptor split keeps the protocol cycle-free
                let owner = graph.dist.owner_of(v_gid);
                proposals[owner].push(v_gid as u64);
                proposals[owner].push(u_gid as u64);
                proposed[u] = true;
            }
        }

        // owners grant each target to the lowest proposing id
        let byte_messages: Vec<Vec<u8>> = proposals
            .iter()
            .map(|m| wire::cast_slice(m).to_vec())
            .collect();
        let incoming = collective::all_to_allv(comm, &byte_messages)?;
        let mut offers: Vec<(GlobalId, GlobalId)> = Vec::new();
        for bytes in &incoming {
            for pair in wire::pod_vec_from::<u64>(bytes).chunks_exact(2) {
                offers.push((pair[0] as usize, pair[1] as usize));
            }
        }
        offers.sort_unstable();
        let mut grants: Vec<Vec<u64>> = vec![Vec::new(); p];
        for &(v_gid, u_gid) in &offers {
            let v = graph.dist.local_of(v_gid).ok_or_else(|| {
                PartError::collective(comm, "matching", format!("misrouted proposal to {v_gid}"))
            })?;
            if matched[v] || proposed[v] {
                continue;
            }
            matched[v] = true;
            partner[v] = u_gid;
            new_pairs += 1;
            let proposer_owner = graph.dist.owner_of(u_gid);
            grants[proposer_owner].push(u_gid as u64);
            grants[proposer_owner].push(v_gid as u64);
        }
        let byte_grants: Vec<Vec<u8>> = grants
            .iter()
            .map(|m| wire::cast_slice(m).to_vec())
            .collect();
        let accepted = collective::all_to_allv(comm, &byte_grants)?;
        for bytes in &accepted {
            for pair in wire::pod_vec_from::<u64>(bytes).chunks_exact(2) {
                let u = graph.dist.local_of(pair[0] as usize).ok_or_else(|| {
                    PartError::collective(comm, "matching", "misrouted grant".to_string())
                })?;
                matched[u] = true;
                partner[u] = pair[1] as usize;
            }
        }
        // a rejected proposer stays unmatched and retries next round

        let mut round_pairs = [new_pairs];
        collective::sum_u64(comm, &mut round_pairs)?;
        total_pairs += round_pairs[0];
        debug!(round, pairs = round_pairs[0], "matching round");
        if round_pairs[0] == 0 {
            break;
        }
    }

    Ok((partner, total_pairs))
}

/// Contract one level: matched pairs become super-vertices owned by the
/// lower endpoint's rank, coarse ids are assigned by a prefix scan, and
/// edges, weights, centroids and the partition are shipped to the coarse
/// owners.
pub fn coarsen_once<C: Communicator>(
    comm: &C,
    level: &Level,
    settings: &Settings,
) -> Result<Option<Coarsening>, PartError> {
    let graph = &level.graph;
    let local_n = graph.local_n();
    let global_n = graph.global_n();
    let dim = level.points.dim();
    let num_weights = level.weights.len();
    let p = comm.size();

    let halo = Halo::build(comm, graph)?;
    let (partner, pairs) = heavy_edge_matching(comm, graph, &halo, &level.partition)?;
    if (pairs as f64) < settings.min_match_fraction * global_n as f64 / 2.0 {
        debug!(pairs, global_n, "matching stalled; stopping coarsening");
        return Ok(None);
    }

    // representatives: unmatched vertices and the lower endpoint of a pair
    let mut is_rep = vec![false; local_n];
    let mut local_reps = 0u64;
    for u in 0..local_n {
        let u_gid = graph.dist.global_of(u);
        if partner[u] == u_gid || u_gid < partner[u] {
            is_rep[u] = true;
            local_reps += 1;
        }
    }
    let (offset, coarse_n) = collective::exclusive_scan(comm, local_reps)?;

    // coarse id per local fine vertex; non-representatives with a remote
    // representative learn theirs by message
    const UNASSIGNED: GlobalId = usize::MAX;
    let mut fine_to_coarse = vec![UNASSIGNED; local_n];
    let mut next = offset as usize;
    for u in 0..local_n {
        if is_rep[u] {
            fine_to_coarse[u] = next;
            next += 1;
        }
    }
    let mut notify: Vec<Vec<u64>> = vec![Vec::new(); p];
    for u in 0..local_n {
        if !is_rep[u] {
            continue;
        }
        let u_gid = graph.dist.global_of(u);
        if partner[u] == u_gid {
            continue;
        }
        match graph.dist.local_of(partner[u]) {
            Some(v) => fine_to_coarse[v] = fine_to_coarse[u],
            None => {
                let owner = graph.dist.owner_of(partner[u]);
                notify[owner].push(partner[u] as u64);
                notify[owner].push(fine_to_coarse[u] as u64);
            }
        }
    }
    let byte_notify: Vec<Vec<u8>> = notify.iter().map(|m| wire::cast_slice(m).to_vec()).collect();
    for bytes in &collective::all_to_allv(comm, &byte_notify)? {
        for pair in wire::pod_vec_from::<u64>(bytes).chunks_exact(2) {
            let v = graph.dist.local_of(pair[0] as usize).ok_or_else(|| {
                PartError::collective(comm, "coarsen", "misrouted coarse id".to_string())
            })?;
            fine_to_coarse[v] = pair[1] as usize;
        }
    }
    debug_assert!(fine_to_coarse.iter().all(|&c| c != UNASSIGNED));

    // coarse distribution: representatives stay on their rank
    let counts = collective::all_gather_varlen(comm, &local_reps.to_le_bytes())?;
    let mut bounds = Vec::with_capacity(p + 1);
    bounds.push(0usize);
    for bytes in &counts {
        let c = u64::from_le_bytes(bytes.as_slice().try_into().expect("8-byte count"));
        bounds.push(bounds.last().expect("non-empty") + c as usize);
    }
    debug_assert_eq!(*bounds.last().expect("non-empty"), coarse_n as usize);
    let coarse_dist = Distribution::from_bounds(comm.rank(), bounds);

    // vertex payloads to the coarse owner: weights, weighted coordinates,
    // the centroid mass and the block
    let halo_coarse = halo.update_usize(comm, &fine_to_coarse)?;
    let mut vertex_msgs: Vec<Vec<u64>> = vec![Vec::new(); p];
    let mut edge_msgs: Vec<Vec<u64>> = vec![Vec::new(); p];
    for u in 0..local_n {
        let cu = fine_to_coarse[u];
        let dest = coarse_dist.owner_of(cu);
        let msg = &mut vertex_msgs[dest];
        msg.push(cu as u64);
        for weights in &level.weights {
            msg.push(weights[u].to_bits());
        }
        let mass = level.weights[0][u].max(1e-12);
        for &x in level.points.point(u) {
            msg.push((mass * x).to_bits());
        }
        msg.push(mass.to_bits());
        msg.push(level.partition[u] as u64);

        // aggregate this row's edges by coarse endpoints
        let (cols, vals) = graph.row(u);
        let mut row_acc: HashMap<GlobalId, f64> = HashMap::new();
        for (&v_gid, &w) in cols.iter().zip(vals) {
            let cv = match graph.dist.local_of(v_gid) {
                Some(v) => fine_to_coarse[v],
                None => {
                    let slot = halo.slot(v_gid).ok_or_else(|| {
                        PartError::InconsistentInput(format!(
                            "neighbour {v_gid} has no halo slot"
                        ))
                    })?;
                    halo_coarse[slot]
                }
            };
            if cv != cu {
                *row_acc.entry(cv).or_insert(0.0) += w;
            }
        }
        // fixed emission order keeps downstream float sums reproducible
        let mut row_edges: Vec<(GlobalId, f64)> = row_acc.into_iter().collect();
        row_edges.sort_unstable_by_key(|&(cv, _)| cv);
        let edges = &mut edge_msgs[dest];
        for (cv, w) in row_edges {
            edges.push(cu as u64);
            edges.push(cv as u64);
            edges.push(w.to_bits());
        }
    }

    let incoming_vertices = collective::all_to_allv(
        comm,
        &vertex_msgs
            .iter()
            .map(|m| wire::cast_slice(m).to_vec())
            .collect::<Vec<_>>(),
    )?;
    let incoming_edges = collective::all_to_allv(
        comm,
        &edge_msgs
            .iter()
            .map(|m| wire::cast_slice(m).to_vec())
            .collect::<Vec<_>>(),
    )?;

    let coarse_local = coarse_dist.local_size();
    let mut weights = vec![vec![0.0; coarse_local]; num_weights];
    let mut centroid = vec![0.0; coarse_local * dim];
    let mut mass = vec![0.0; coarse_local];
    let mut partition = vec![0usize; coarse_local];
    let record_len = 1 + num_weights + dim + 2;
    for bytes in &incoming_vertices {
        let words = wire::pod_vec_from::<u64>(bytes);
        for record in words.chunks_exact(record_len) {
            let cu = record[0] as usize;
            let local = coarse_dist.local_of(cu).ok_or_else(|| {
                PartError::collective(comm, "coarsen", "misrouted vertex".to_string())
            })?;
            for w in 0..num_weights {
                weights[w][local] += f64::from_bits(record[1 + w]);
            }
            for d in 0..dim {
                centroid[local * dim + d] += f64::from_bits(record[1 + num_weights + d]);
            }
            mass[local] += f64::from_bits(record[1 + num_weights + dim]);
            partition[local] = record[2 + num_weights + dim] as usize;
        }
    }
    for local in 0..coarse_local {
        for d in 0..dim {
            centroid[local * dim + d] /= mass[local].max(1e-12);
        }
    }

    let mut adjacency: Vec<HashMap<GlobalId, f64>> = vec![HashMap::new(); coarse_local];
    for bytes in &incoming_edges {
        let words = wire::pod_vec_from::<u64>(bytes);
        for record in words.chunks_exact(3) {
            let cu = record[0] as usize;
            let local = coarse_dist.local_of(cu).ok_or_else(|| {
                PartError::collective(comm, "coarsen", "misrouted edge".to_string())
            })?;
            *adjacency[local].entry(record[1] as usize).or_insert(0.0) +=
                f64::from_bits(record[2]);
        }
    }
    let mut ia = Vec::with_capacity(coarse_local + 1);
    let mut ja = Vec::new();
    let mut vals = Vec::new();
    ia.push(0);
    for row in adjacency {
        let mut cols: Vec<(GlobalId, f64)> = row.into_iter().collect();
        cols.sort_unstable_by_key(|&(c, _)| c);
        for (c, w) in cols {
            ja.push(c);
            vals.push(w);
        }
        ia.push(ja.len());
    }
    let coarse_graph = DistGraph::new(coarse_dist, ia, ja, vals)?;

    info!(
        fine = global_n,
        coarse = coarse_n,
        pairs,
        "coarsened level"
    );
    Ok(Some(Coarsening {
        coarse: Level {
            graph: coarse_graph,
            points: Points::new(dim, centroid)?,
            weights,
            partition,
        },
        fine_to_coarse,
    }))
}

/// Fetch `values[local_of(id)]` from the owner of every requested id.
pub fn fetch_usize<C: Communicator>(
    comm: &C,
    dist: &Distribution,
    values: &[usize],
    ids: &[GlobalId],
) -> Result<Vec<usize>, PartError> {
    let p = comm.size();
    let mut requests: Vec<Vec<u64>> = vec![Vec::new(); p];
    let mut origin: Vec<(usize, usize)> = Vec::with_capacity(ids.len()); // (peer, index within peer msg)
    for &id in ids {
        let owner = dist.owner_of(id);
        origin.push((owner, requests[owner].len()));
        requests[owner].push(id as u64);
    }
    let incoming = collective::all_to_allv(
        comm,
        &requests
            .iter()
            .map(|m| wire::cast_slice(m).to_vec())
            .collect::<Vec<_>>(),
    )?;
    let mut replies: Vec<Vec<u64>> = vec![Vec::new(); p];
    for (peer, bytes) in incoming.iter().enumerate() {
        for &id in &wire::pod_vec_from::<u64>(bytes) {
            let local = dist.local_of(id as usize).ok_or_else(|| {
                PartError::collective(comm, "fetch", format!("id {id} not owned here"))
            })?;
            replies[peer].push(values[local] as u64);
        }
    }
    let answered = collective::all_to_allv(
        comm,
        &replies
            .iter()
            .map(|m| wire::cast_slice(m).to_vec())
            .collect::<Vec<_>>(),
    )?;
    let answered: Vec<Vec<u64>> = answered
        .iter()
        .map(|bytes| wire::pod_vec_from::<u64>(bytes))
        .collect();
    Ok(origin
        .into_iter()
        .map(|(peer, idx)| answered[peer][idx] as usize)
        .collect())
}

/// Project a coarse partition to the finer level: every fine vertex takes
/// its coarse vertex's block.
pub fn project_up<C: Communicator>(
    comm: &C,
    coarse: &Level,
    fine_to_coarse: &[GlobalId],
) -> Result<Vec<BlockId>, PartError> {
    fetch_usize(
        comm,
        &coarse.graph.dist,
        &coarse.partition,
        fine_to_coarse,
    )
}

/// Coarsen while profitable, refine from the coarsest level back up, and
/// return the refined partition of the input level.
pub fn multilevel_refine<C: Communicator>(
    comm: &C,
    level: &mut Level,
    targets: &[Vec<f64>],
    settings: &Settings,
    metrics: &mut PartitionMetrics,
) -> Result<(), PartError> {
    let mut stack: Vec<(Level, Vec<GlobalId>)> = Vec::new();
    let mut current = level.clone();

    for _ in 0..settings.multi_level_rounds {
        if current.graph.global_n() <= settings.coarsening_stop_size {
            break;
        }
        match coarsen_once(comm, &current, settings)? {
            Some(Coarsening {
                coarse,
                fine_to_coarse,
            }) => {
                stack.push((current, fine_to_coarse));
                current = coarse;
            }
            None => break,
        }
    }

    crate::refine::refine_level(comm, &mut current, targets, settings, metrics)?;
    while let Some((mut finer, fine_to_coarse)) = stack.pop() {
        finer.partition = project_up(comm, &current, &fine_to_coarse)?;
        crate::refine::refine_level(comm, &mut finer, targets, settings, metrics)?;
        current = finer;
    }
    *level = current;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::NoComm;

    /// Ring of n vertices with unit edge weights.
    fn ring(n: usize) -> Level {
        let dist = Distribution::block(0, 1, n);
        let mut ia = vec![0];
        let mut ja = Vec::new();
        for i in 0..n {
            ja.push((i + n - 1) % n);
            ja.push((i + 1) % n);
            ia.push(ja.len());
        }
        let vals = vec![1.0; ja.len()];
        let graph = DistGraph::new(dist, ia, ja, vals).unwrap();
        let mut coords = Vec::new();
        for i in 0..n {
            let angle = 2.0 * std::f64::consts::PI * i as f64 / n as f64;
            coords.push(angle.cos());
            coords.push(angle.sin());
        }
        Level {
            graph,
            points: Points::new(2, coords).unwrap(),
            weights: vec![vec![1.0; n]],
            partition: vec![0; n],
        }
    }

    #[test]
    fn matching_pairs_are_symmetric() {
        let comm = NoComm;
        let level = ring(8);
        let halo = Halo::build(&comm, &level.graph).unwrap();
        let (partner, pairs) =
            heavy_edge_matching(&comm, &level.graph, &halo, &level.partition).unwrap();
        assert!(pairs > 0);
        for u in 0..8 {
            let v = partner[u];
            assert_eq!(partner[v], u, "partner of {v} must point back to {u}");
        }
    }

    #[test]
    fn matching_respects_blocks() {
        let comm = NoComm;
        let mut level = ring(8);
        level.partition = vec![0, 0, 0, 0, 1, 1, 1, 1];
        let halo = Halo::build(&comm, &level.graph).unwrap();
        let (partner, _) =
            heavy_edge_matching(&comm, &level.graph, &halo, &level.partition).unwrap();
        for u in 0..8 {
            assert_eq!(level.partition[u], level.partition[partner[u]]);
        }
    }

    #[test]
    fn coarsening_halves_a_ring() {
        let comm = NoComm;
        let level = ring(16);
        let settings = Settings::default();
        let result = coarsen_once(&comm, &level, &settings).unwrap().unwrap();
        let coarse_n = result.coarse.graph.global_n();
        assert!(coarse_n < 16);
        // total vertex weight is conserved
        let total: f64 = result.coarse.weights[0].iter().sum();
        assert_eq!(total, 16.0);
        // projection maps every fine vertex to a valid coarse vertex
        for &c in &result.fine_to_coarse {
            assert!(c < coarse_n);
        }
    }

    #[test]
    fn projection_propagates_blocks() {
        let comm = NoComm;
        let level = ring(16);
        let settings = Settings::default();
        let mut result = coarsen_once(&comm, &level, &settings).unwrap().unwrap();
        for (i, b) in result.coarse.partition.iter_mut().enumerate() {
            *b = i % 2;
        }
        let fine = project_up(&comm, &result.coarse, &result.fine_to_coarse).unwrap();
        for u in 0..16 {
            assert_eq!(fine[u], result.coarse.partition[result.fine_to_coarse[u]]);
        }
    }
}
