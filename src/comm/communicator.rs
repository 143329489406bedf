//! Process-group abstraction for rank-to-rank message passing.
//!
//! Every collective in the crate takes an explicit `&C: Communicator`
//! handle; there is no ambient communicator state. The trait is minimal by
//! design: non-blocking point-to-point sends/receives plus rank metadata.
//! Collective operations are built on top in [`crate::comm::collective`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

/// Anything that can be waited on.
pub trait Wait {
    /// Block until completion; returns the received bytes (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

/// Non-blocking communication interface for a fixed process group.
pub trait Communicator: Send + Sync {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    /// Post a buffered send of `buf` to `peer` under `tag`.
    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;

    /// Post a receive from `peer` under `tag`. `max_len` bounds the message
    /// size; backends may truncate to it.
    fn irecv(&self, peer: usize, tag: u16, max_len: usize) -> Self::RecvHandle;

    /// Rank of this process in `0..size`.
    fn rank(&self) -> usize;

    /// Total number of ranks.
    fn size(&self) -> usize;

    /// Synchronization barrier across the group.
    fn barrier(&self);
}

/// Serial single-rank group for in-process use and unit tests.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _max_len: usize) {}

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn barrier(&self) {}
}

// --- ThreadComm: one rank per thread, mailbox-based ---

type Key = (usize, usize, u16); // (src, dst, tag)
type Slot = Arc<(Mutex<VecDeque<Vec<u8>>>, Condvar)>;

struct BarrierState {
    arrived: usize,
    epoch: usize,
}

/// Shared state of one thread group. Each group owns its mailboxes, so
/// concurrently running groups (e.g. parallel tests) cannot cross-talk.
struct GroupState {
    size: usize,
    mailboxes: Mutex<HashMap<Key, Slot>>,
    barrier: (Mutex<BarrierState>, Condvar),
}

impl GroupState {
    fn slot(&self, key: Key) -> Slot {
        let mut map = self.mailboxes.lock().expect("mailbox map poisoned");
        map.entry(key)
            .or_insert_with(|| Arc::new((Mutex::new(VecDeque::new()), Condvar::new())))
            .clone()
    }
}

/// In-process communicator: the group's ranks run on threads and exchange
/// owned byte buffers through per-(src, dst, tag) FIFO queues. Message
/// order between a fixed pair and tag is preserved, which the collectives
/// rely on.
#[derive(Clone)]
pub struct ThreadComm {
    rank: usize,
    group: Arc<GroupState>,
}

impl ThreadComm {
    /// Create a connected group of `size` ranks.
    pub fn group(size: usize) -> Vec<ThreadComm> {
        assert!(size > 0, "a process group needs at least one rank");
        let state = Arc::new(GroupState {
            size,
            mailboxes: Mutex::new(HashMap::new()),
            barrier: (
                Mutex::new(BarrierState {
                    arrived: 0,
                    epoch: 0,
                }),
                Condvar::new(),
            ),
        });
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                group: Arc::clone(&state),
            })
            .collect()
    }
}

impl std::fmt::Debug for ThreadComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadComm")
            .field("rank", &self.rank)
            .field("size", &self.group.size)
            .finish()
    }
}

pub struct ThreadSendHandle;

impl Wait for ThreadSendHandle {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

pub struct ThreadRecvHandle {
    slot: Slot,
    max_len: usize,
}

impl Wait for ThreadRecvHandle {
    fn wait(self) -> Option<Vec<u8>> {
        let (queue, cv) = &*self.slot;
        let mut q = queue.lock().expect("mailbox poisoned");
        while q.is_empty() {
            q = cv.wait(q).expect("mailbox condvar poisoned");
        }
        let mut msg = q.pop_front().expect("queue non-empty");
        msg.truncate(self.max_len.min(msg.len()));
        Some(msg)
    }
}

impl Communicator for ThreadComm {
    type SendHandle = ThreadSendHandle;
    type RecvHandle = ThreadRecvHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        debug_assert!(peer < self.group.size);
        let slot = self.group.slot((self.rank, peer, tag));
        {
            let (queue, cv) = &*slot;
            queue
                .lock()
                .expect("mailbox poisoned")
                .push_back(buf.to_vec());
            cv.notify_all();
        }
        ThreadSendHandle
    }

    fn irecv(&self, peer: usize, tag: u16, max_len: usize) -> Self::RecvHandle {
        debug_assert!(peer < self.group.size);
        ThreadRecvHandle {
            slot: self.group.slot((peer, self.rank, tag)),
            max_len,
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.group.size
    }

    fn barrier(&self) {
        let (lock, cv) = &self.group.barrier;
        let mut b = lock.lock().expect("barrier poisoned");
        let epoch = b.epoch;
        b.arrived += 1;
        if b.arrived == self.group.size {
            b.arrived = 0;
            b.epoch += 1;
            cv.notify_all();
        } else {
            while b.epoch == epoch {
                b = cv.wait(b).expect("barrier condvar poisoned");
            }
        }
    }
}

// --- MPI backend ---

#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::{Communicator, Wait};
    use mpi::collective::CommunicatorCollectives;
    use mpi::environment::Universe;
    use mpi::point_to_point::{Destination, Source};
    use mpi::topology::{Communicator as _, SimpleCommunicator};

    /// One MPI process per rank.
    pub struct MpiComm {
        _universe: Universe,
        world: SimpleCommunicator,
        rank: usize,
        size: usize,
    }

    unsafe impl Send for MpiComm {}
    unsafe impl Sync for MpiComm {}

    impl Default for MpiComm {
        fn default() -> Self {
            let universe = mpi::initialize().expect("MPI initialization failed");
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Self {
                _universe: universe,
                world,
                rank,
                size,
            }
        }
    }

    pub struct MpiSendHandle;

    impl Wait for MpiSendHandle {
        fn wait(self) -> Option<Vec<u8>> {
            None
        }
    }

    pub struct MpiRecvHandle {
        world: SimpleCommunicator,
        peer: usize,
        tag: u16,
        max_len: usize,
    }

    impl Wait for MpiRecvHandle {
        fn wait(self) -> Option<Vec<u8>> {
            let (msg, _status) = self
                .world
                .process_at_rank(self.peer as i32)
                .receive_vec_with_tag::<u8>(self.tag as i32);
            let mut msg = msg;
            msg.truncate(self.max_len.min(msg.len()));
            Some(msg)
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
            self.world
                .process_at_rank(peer as i32)
                .buffered_send_with_tag(buf, tag as i32);
            MpiSendHandle
        }

        fn irecv(&self, peer: usize, tag: u16, max_len: usize) -> Self::RecvHandle {
            MpiRecvHandle {
                world: self.world.duplicate(),
                peer,
                tag,
                max_len,
            }
        }

        fn rank(&self) -> usize {
            self.rank
        }
        fn size(&self) -> usize {
            self.size
        }
        fn barrier(&self) {
            self.world.barrier();
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_pong() {
        let comms = ThreadComm::group(2);
        let mut comms = comms.into_iter();
        let c0 = comms.next().unwrap();
        let c1 = comms.next().unwrap();
        let t = std::thread::spawn(move || {
            let msg = c1.irecv(0, 7, 16).wait().unwrap();
            c1.isend(0, 7, &msg);
        });
        c0.isend(1, 7, b"hello");
        let back = c0.irecv(1, 7, 16).wait().unwrap();
        t.join().unwrap();
        assert_eq!(back, b"hello");
    }

    #[test]
    fn fifo_order_per_pair() {
        let comms = ThreadComm::group(2);
        let c0 = comms[0].clone();
        let c1 = comms[1].clone();
        c0.isend(1, 3, b"first");
        c0.isend(1, 3, b"second");
        assert_eq!(c1.irecv(0, 3, 16).wait().unwrap(), b"first");
        assert_eq!(c1.irecv(0, 3, 16).wait().unwrap(), b"second");
    }

    #[test]
    fn groups_are_isolated() {
        let a = ThreadComm::group(2);
        let b = ThreadComm::group(2);
        a[0].isend(1, 1, b"a");
        b[0].isend(1, 1, b"b");
        assert_eq!(a[1].irecv(0, 1, 4).wait().unwrap(), b"a");
        assert_eq!(b[1].irecv(0, 1, 4).wait().unwrap(), b"b");
    }
}
