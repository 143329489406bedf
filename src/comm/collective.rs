//! Blocking collective operations over a [`Communicator`].
//!
//! All collectives are deterministic for a fixed rank count: reductions fan
//! in to rank 0 in ascending rank order and the result is broadcast back, so
//! floating-point folds are bitwise reproducible across reruns. Every rank
//! of the group must call the same collectives in the same order.

use crate::comm::communicator::{Communicator, Wait};
use crate::comm::wire;
use crate::error::PartError;

const TAG_REDUCE: u16 = 0x10;
const TAG_BCAST: u16 = 0x11;
const TAG_GATHER_SIZE: u16 = 0x12;
const TAG_GATHER_DATA: u16 = 0x13;
const TAG_SHIFT: u16 = 0x14;
const TAG_SWAP: u16 = 0x15;
const TAG_A2A_SIZE: u16 = 0x16;
const TAG_A2A_DATA: u16 = 0x17;

fn recv_exact<C: Communicator>(
    comm: &C,
    peer: usize,
    tag: u16,
    len: usize,
    op: &'static str,
) -> Result<Vec<u8>, PartError> {
    let msg = comm
        .irecv(peer, tag, len)
        .wait()
        .ok_or_else(|| PartError::collective(comm, op, format!("no message from rank {peer}")))?;
    if msg.len() != len {
        return Err(PartError::collective(
            comm,
            op,
            format!("rank {peer} sent {} bytes, expected {len}", msg.len()),
        ));
    }
    Ok(msg)
}

/// Element-wise all-reduce of a Pod buffer with a caller-supplied fold.
pub fn all_reduce<C, T, F>(comm: &C, buf: &mut [T], fold: F) -> Result<(), PartError>
where
    C: Communicator,
    T: bytemuck::Pod,
    F: Fn(&mut T, &T),
{
    let p = comm.size();
    if p == 1 {
        return Ok(());
    }
    let bytes = buf.len() * std::mem::size_of::<T>();
    if comm.rank() == 0 {
        for peer in 1..p {
            let msg = recv_exact(comm, peer, TAG_REDUCE, bytes, "all_reduce")?;
            let incoming = wire::pod_vec_from::<T>(&msg);
            for (acc, x) in buf.iter_mut().zip(incoming.iter()) {
                fold(acc, x);
            }
        }
        for peer in 1..p {
            comm.isend(peer, TAG_BCAST, wire::cast_slice(buf));
        }
    } else {
        comm.isend(0, TAG_REDUCE, wire::cast_slice(buf));
        let msg = recv_exact(comm, 0, TAG_BCAST, bytes, "all_reduce")?;
        buf.copy_from_slice(&wire::pod_vec_from::<T>(&msg));
    }
    Ok(())
}

/// Global element-wise sum.
pub fn sum_f64<C: Communicator>(comm: &C, buf: &mut [f64]) -> Result<(), PartError> {
    all_reduce(comm, buf, |a, b| *a += *b)
}

/// Global element-wise sum of counters.
pub fn sum_u64<C: Communicator>(comm: &C, buf: &mut [u64]) -> Result<(), PartError> {
    all_reduce(comm, buf, |a, b| *a += *b)
}

/// Global element-wise maximum.
pub fn max_f64<C: Communicator>(comm: &C, buf: &mut [f64]) -> Result<(), PartError> {
    all_reduce(comm, buf, |a, b| {
        if *b > *a {
            *a = *b;
        }
    })
}

/// Global element-wise minimum.
pub fn min_f64<C: Communicator>(comm: &C, buf: &mut [f64]) -> Result<(), PartError> {
    all_reduce(comm, buf, |a, b| {
        if *b < *a {
            *a = *b;
        }
    })
}

/// Global maximum of counters.
pub fn max_u64<C: Communicator>(comm: &C, buf: &mut [u64]) -> Result<(), PartError> {
    all_reduce(comm, buf, |a, b| {
        if *b > *a {
            *a = *b;
        }
    })
}

/// Global minimum of counters.
pub fn min_u64<C: Communicator>(comm: &C, buf: &mut [u64]) -> Result<(), PartError> {
    all_reduce(comm, buf, |a, b| {
        if *b < *a {
            *a = *b;
        }
    })
}

/// Logical AND across ranks: true iff `flag` is true everywhere.
pub fn all_true<C: Communicator>(comm: &C, flag: bool) -> Result<bool, PartError> {
    let mut buf = [if flag { 1u8 } else { 0 }];
    all_reduce(comm, &mut buf, |a, b| *a &= *b)?;
    Ok(buf[0] != 0)
}

/// Logical OR across ranks.
pub fn any_true<C: Communicator>(comm: &C, flag: bool) -> Result<bool, PartError> {
    let mut buf = [if flag { 1u8 } else { 0 }];
    all_reduce(comm, &mut buf, |a, b| *a |= *b)?;
    Ok(buf[0] != 0)
}

/// Broadcast a fixed-length Pod buffer from `root`.
pub fn broadcast<C, T>(comm: &C, root: usize, buf: &mut [T]) -> Result<(), PartError>
where
    C: Communicator,
    T: bytemuck::Pod,
{
    let p = comm.size();
    if p == 1 {
        return Ok(());
    }
    let bytes = buf.len() * std::mem::size_of::<T>();
    if comm.rank() == root {
        for peer in (0..p).filter(|&r| r != root) {
            comm.isend(peer, TAG_BCAST, wire::cast_slice(buf));
        }
    } else {
        let msg = recv_exact(comm, root, TAG_BCAST, bytes, "broadcast")?;
        buf.copy_from_slice(&wire::pod_vec_from::<T>(&msg));
    }
    Ok(())
}

/// Gather variable-length payloads on `root`; returns one entry per rank
/// there and `None` elsewhere.
pub fn gather_varlen<C: Communicator>(
    comm: &C,
    root: usize,
    bytes: &[u8],
) -> Result<Option<Vec<Vec<u8>>>, PartError> {
    let p = comm.size();
    if p == 1 {
        return Ok(Some(vec![bytes.to_vec()]));
    }
    if comm.rank() == root {
        let mut parts = vec![Vec::new(); p];
        parts[root] = bytes.to_vec();
        for peer in (0..p).filter(|&r| r != root) {
            let size_msg = recv_exact(comm, peer, TAG_GATHER_SIZE, 8, "gather")?;
            let len = u64::from_le_bytes(size_msg.try_into().expect("8-byte size")) as usize;
            parts[peer] = recv_exact(comm, peer, TAG_GATHER_DATA, len, "gather")?;
        }
        Ok(Some(parts))
    } else {
        comm.isend(root, TAG_GATHER_SIZE, &(bytes.len() as u64).to_le_bytes());
        comm.isend(root, TAG_GATHER_DATA, bytes);
        Ok(None)
    }
}

/// All-gather of variable-length payloads: every rank receives one entry per
/// rank, in rank order.
pub fn all_gather_varlen<C: Communicator>(
    comm: &C,
    bytes: &[u8],
) -> Result<Vec<Vec<u8>>, PartError> {
    let p = comm.size();
    let gathered = gather_varlen(comm, 0, bytes)?;
    if p == 1 {
        return Ok(gathered.expect("root holds the gather"));
    }
    // root flattens with a length prefix per rank, then broadcasts once
    let mut lens = vec![0u64; p];
    let mut flat = Vec::new();
    if let Some(parts) = &gathered {
        for (r, part) in parts.iter().enumerate() {
            lens[r] = part.len() as u64;
        }
        for part in parts {
            flat.extend_from_slice(part);
        }
    }
    broadcast(comm, 0, &mut lens)?;
    let total: usize = lens.iter().map(|&l| l as usize).sum();
    flat.resize(total, 0);
    broadcast(comm, 0, &mut flat)?;
    let mut out = Vec::with_capacity(p);
    let mut offset = 0;
    for &len in &lens {
        let len = len as usize;
        out.push(flat[offset..offset + len].to_vec());
        offset += len;
    }
    Ok(out)
}

/// Exclusive prefix scan of a local count; returns `(offset, total)`.
pub fn exclusive_scan<C: Communicator>(comm: &C, local: u64) -> Result<(u64, u64), PartError> {
    let counts = all_gather_varlen(comm, &local.to_le_bytes())?;
    let per_rank: Vec<u64> = counts
        .iter()
        .map(|b| u64::from_le_bytes(b.as_slice().try_into().expect("8-byte count")))
        .collect();
    let offset = per_rank[..comm.rank()].iter().sum();
    let total = per_rank.iter().sum();
    Ok((offset, total))
}

/// Ring shift: send `bytes` to rank `(r + 1) % p`, receive from
/// `(r + p - 1) % p`. With one rank this is the identity.
pub fn ring_shift<C: Communicator>(comm: &C, bytes: &[u8]) -> Result<Vec<u8>, PartError> {
    let p = comm.size();
    if p == 1 {
        return Ok(bytes.to_vec());
    }
    let r = comm.rank();
    let next = (r + 1) % p;
    let prev = (r + p - 1) % p;
    comm.isend(next, TAG_SHIFT, &(bytes.len() as u64).to_le_bytes());
    comm.isend(next, TAG_SHIFT, bytes);
    let size_msg = recv_exact(comm, prev, TAG_SHIFT, 8, "ring_shift")?;
    let len = u64::from_le_bytes(size_msg.try_into().expect("8-byte size")) as usize;
    recv_exact(comm, prev, TAG_SHIFT, len, "ring_shift")
}

/// Pairwise swap: send `bytes` to `peer` and receive its payload.
pub fn swap_with<C: Communicator>(
    comm: &C,
    peer: usize,
    bytes: &[u8],
) -> Result<Vec<u8>, PartError> {
    if peer == comm.rank() {
        return Ok(bytes.to_vec());
    }
    comm.isend(peer, TAG_SWAP, &(bytes.len() as u64).to_le_bytes());
    comm.isend(peer, TAG_SWAP, bytes);
    let size_msg = recv_exact(comm, peer, TAG_SWAP, 8, "swap_with")?;
    let len = u64::from_le_bytes(size_msg.try_into().expect("8-byte size")) as usize;
    recv_exact(comm, peer, TAG_SWAP, len, "swap_with")
}

/// All-to-all of variable-length payloads. `messages[q]` is shipped to rank
/// q; the result holds one payload per source rank.
pub fn all_to_allv<C: Communicator>(
    comm: &C,
    messages: &[Vec<u8>],
) -> Result<Vec<Vec<u8>>, PartError> {
    let p = comm.size();
    let r = comm.rank();
    assert_eq!(messages.len(), p, "one message per destination rank");
    if p == 1 {
        return Ok(vec![messages[0].clone()]);
    }
    // size phase
    for peer in (0..p).filter(|&q| q != r) {
        comm.isend(
            peer,
            TAG_A2A_SIZE,
            &(messages[peer].len() as u64).to_le_bytes(),
        );
    }
    let mut incoming_len = vec![0usize; p];
    for peer in (0..p).filter(|&q| q != r) {
        let size_msg = recv_exact(comm, peer, TAG_A2A_SIZE, 8, "all_to_allv")?;
        incoming_len[peer] = u64::from_le_bytes(size_msg.try_into().expect("8-byte size")) as usize;
    }
    // data phase
    for peer in (0..p).filter(|&q| q != r) {
        comm.isend(peer, TAG_A2A_DATA, &messages[peer]);
    }
    let mut out = vec![Vec::new(); p];
    out[r] = messages[r].clone();
    for peer in (0..p).filter(|&q| q != r) {
        out[peer] = recv_exact(comm, peer, TAG_A2A_DATA, incoming_len[peer], "all_to_allv")?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::communicator::{NoComm, ThreadComm};

    fn on_ranks<F>(p: usize, f: F)
    where
        F: Fn(ThreadComm) + Send + Sync + Clone + 'static,
    {
        let comms = ThreadComm::group(p);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|c| {
                let f = f.clone();
                std::thread::spawn(move || f(c))
            })
            .collect();
        for h in handles {
            h.join().expect("rank thread panicked");
        }
    }

    #[test]
    fn serial_shortcuts() {
        let comm = NoComm;
        let mut xs = [1.0, 2.0];
        sum_f64(&comm, &mut xs).unwrap();
        assert_eq!(xs, [1.0, 2.0]);
        assert!(all_true(&comm, true).unwrap());
        assert_eq!(ring_shift(&comm, b"x").unwrap(), b"x");
    }

    #[test]
    fn sum_across_four_ranks() {
        on_ranks(4, |comm| {
            let mut xs = [comm.rank() as f64, 1.0];
            sum_f64(&comm, &mut xs).unwrap();
            assert_eq!(xs, [6.0, 4.0]);
        });
    }

    #[test]
    fn and_or_reductions() {
        on_ranks(3, |comm| {
            assert!(!all_true(&comm, comm.rank() != 1).unwrap());
            assert!(any_true(&comm, comm.rank() == 1).unwrap());
        });
    }

    #[test]
    fn all_gather_rank_payloads() {
        on_ranks(3, |comm| {
            let payload = vec![comm.rank() as u8; comm.rank() + 1];
            let parts = all_gather_varlen(&comm, &payload).unwrap();
            assert_eq!(parts.len(), 3);
            for (r, part) in parts.iter().enumerate() {
                assert_eq!(part, &vec![r as u8; r + 1]);
            }
        });
    }

    #[test]
    fn scan_offsets() {
        on_ranks(3, |comm| {
            let (offset, total) = exclusive_scan(&comm, (comm.rank() + 1) as u64).unwrap();
            let expected = [0, 1, 3][comm.rank()];
            assert_eq!(offset, expected);
            assert_eq!(total, 6);
        });
    }

    #[test]
    fn ring_shift_rotates() {
        on_ranks(3, |comm| {
            let got = ring_shift(&comm, &[comm.rank() as u8]).unwrap();
            assert_eq!(got, vec![((comm.rank() + 2) % 3) as u8]);
        });
    }

    #[test]
    fn all_to_all_routes() {
        on_ranks(3, |comm| {
            let msgs: Vec<Vec<u8>> = (0..3)
                .map(|q| vec![comm.rank() as u8, q as u8])
                .collect();
            let got = all_to_allv(&comm, &msgs).unwrap();
            for (src, payload) in got.iter().enumerate() {
                assert_eq!(payload, &vec![src as u8, comm.rank() as u8]);
            }
        });
    }
}
