//! Message-passing abstraction for intra-process (threads) and
//! inter-process (MPI) transports.
//!
//! Wire conventions for the protocols built on top:
//! - All integers are LE fixed width (u32 counts, u64 ids and lengths).
//! - Receivers may truncate to their posted buffer length; protocols that
//!   need exact lengths exchange sizes first.
//! - Collectives (`all_gather`, `barrier`) must be entered by every rank
//!   of the communicator; per-(src, dst, tag) FIFO ordering keeps
//!   consecutive collectives matched without generation counters.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Barrier, Condvar, Mutex};

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

/// Non-blocking communication interface (minimal by design).
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    /// Rank of this process (0..size-1).
    fn rank(&self) -> usize;
    /// Total number of ranks.
    fn size(&self) -> usize;

    /// Synchronization barrier (default: no-op for single-rank comms).
    fn barrier(&self) {}

    /// Gathers every rank's byte buffer on every rank; the result is
    /// indexed by rank and includes the local contribution.
    ///
    /// Collective. The default implementation runs a two-phase
    /// (length, payload) point-to-point exchange on reserved tags; a
    /// transport failure mid-collective is fatal.
    fn all_gather(&self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let size = self.size();
        let me = self.rank();
        let mut result: Vec<Vec<u8>> = vec![Vec::new(); size];
        result[me] = bytes.to_vec();
        if size == 1 {
            return result;
        }

        let peers = || (0..size).filter(|&p| p != me);

        // length phase
        let mut scratch = [0u8; 8];
        let mut len_recvs = Vec::with_capacity(size - 1);
        for peer in peers() {
            len_recvs.push((peer, self.irecv(peer, tags::ALL_GATHER_LEN, &mut scratch)));
        }
        let own_len = (bytes.len() as u64).to_le_bytes();
        let mut len_sends = Vec::with_capacity(size - 1);
        for peer in peers() {
            len_sends.push(self.isend(peer, tags::ALL_GATHER_LEN, &own_len));
        }
        let mut lens = vec![0usize; size];
        for (peer, handle) in len_recvs {
            let data = match handle.wait() {
                Some(d) if d.len() == 8 => d,
                other => crate::invariant_violation!(
                    "all_gather length message from rank {peer} missing or malformed: {other:?}"
                ),
            };
            lens[peer] = u64::from_le_bytes(data.try_into().expect("checked length")) as usize;
        }

        // payload phase
        let mut data_recvs = Vec::with_capacity(size - 1);
        for peer in peers() {
            let mut buf = vec![0u8; lens[peer]];
            data_recvs.push((peer, self.irecv(peer, tags::ALL_GATHER_DATA, &mut buf)));
        }
        let mut data_sends = Vec::with_capacity(size - 1);
        for peer in peers() {
            data_sends.push(self.isend(peer, tags::ALL_GATHER_DATA, bytes));
        }
        for (peer, handle) in data_recvs {
            match handle.wait() {
                Some(data) if data.len() == lens[peer] => result[peer] = data,
                other => crate::invariant_violation!(
                    "all_gather payload from rank {peer} missing or truncated: expected {} bytes, got {:?}",
                    lens[peer],
                    other.as_ref().map(|d| d.len())
                ),
            }
        }

        for send in len_sends {
            let _ = send.wait();
        }
        for send in data_sends {
            let _ = send.wait();
        }
        result
    }
}

/// Reserved tags of the built-in protocols.
pub mod tags {
    use super::CommTag;

    /// All-gather length phase.
    pub const ALL_GATHER_LEN: u16 = 0x0010;
    /// All-gather payload phase.
    pub const ALL_GATHER_DATA: u16 = 0x0011;
    /// Neighbor-data (ghost) transfers.
    pub const NEIGHBOR_BASE: CommTag = CommTag::new(0x1000);
    /// Payloads of unrefined cells travelling to the parent's owner.
    pub const UNREFINE_BASE: CommTag = CommTag::new(0x4000);
    /// Cell payloads migrating during load balancing.
    pub const MIGRATE_BASE: CommTag = CommTag::new(0x8000);
    /// Per-cell tags may use this many values above their base.
    pub const BLOCK_SPAN: u16 = 0x3000;
}

/// Tag newtype for safer tag arithmetic.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct CommTag(u16);

impl CommTag {
    #[inline]
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Safely offset the tag by `dx`, wrapping on overflow.
    #[inline]
    pub const fn offset(self, dx: u16) -> Self {
        Self(self.0.wrapping_add(dx))
    }
}

impl From<u16> for CommTag {
    #[inline]
    fn from(x: u16) -> Self {
        CommTag::new(x)
    }
}

/// Compile-time no-op comm for single-rank use and pure serial tests.
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

    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }
}

// --- ThreadComm: one rank per thread within a process ---

type Key = (usize, usize, u16); // (src, dst, tag)

#[derive(Default)]
struct Slot {
    q: VecDeque<Vec<u8>>,
}

#[derive(Default)]
struct Mailbox {
    map: Mutex<HashMap<Key, Arc<(Mutex<Slot>, Condvar)>>>,
}

impl Mailbox {
    fn entry(&self, key: Key) -> Arc<(Mutex<Slot>, Condvar)> {
        let mut map = self.map.lock().expect("mailbox poisoned");
        map.entry(key)
            .or_insert_with(|| Arc::new((Mutex::new(Slot::default()), Condvar::new())))
            .clone()
    }
}

pub struct LocalSendHandle;

impl Wait for LocalSendHandle {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

pub struct LocalRecvHandle {
    cell: Arc<(Mutex<Slot>, Condvar)>,
    want_len: usize,
}

impl Wait for LocalRecvHandle {
    fn wait(self) -> Option<Vec<u8>> {
        let (lock, cv) = &*self.cell;
        let mut slot = lock.lock().expect("slot poisoned");
        while slot.q.is_empty() {
            slot = cv.wait(slot).expect("condvar poisoned");
        }
        let mut msg = slot.q.pop_front().expect("queue non-empty");
        msg.truncate(self.want_len.min(msg.len()));
        Some(msg)
    }
}

/// In-process communicator: each rank runs on its own thread, messages
/// pass through a mailbox shared by the world.
///
/// Distinct worlds (from separate [`ThreadComm::world`] calls) are fully
/// isolated, so multi-rank tests can run concurrently in one process.
#[derive(Clone)]
pub struct ThreadComm {
    rank: usize,
    size: usize,
    mailbox: Arc<Mailbox>,
    world_barrier: Arc<Barrier>,
}

impl ThreadComm {
    /// Creates a world of `size` connected ranks; hand one element to each
    /// thread.
    pub fn world(size: usize) -> Vec<ThreadComm> {
        let mailbox = Arc::new(Mailbox::default());
        let barrier = Arc::new(Barrier::new(size));
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                size,
                mailbox: Arc::clone(&mailbox),
                world_barrier: Arc::clone(&barrier),
            })
            .collect()
    }
}

impl std::fmt::Debug for ThreadComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl Communicator for ThreadComm {
    type SendHandle = LocalSendHandle;
    type RecvHandle = LocalRecvHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        let entry = self.mailbox.entry((self.rank, peer, tag));
        let (lock, cv) = &*entry;
        {
            let mut slot = lock.lock().expect("slot poisoned");
            slot.q.push_back(buf.to_vec());
        }
        cv.notify_all();
        LocalSendHandle
    }

    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle {
        LocalRecvHandle {
            cell: self.mailbox.entry((peer, self.rank, tag)),
            want_len: buf.len(),
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) {
        self.world_barrier.wait();
    }
}

// --- MPI backend ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use core::ptr::NonNull;
    use mpi::collective::CommunicatorCollectives;
    use mpi::environment::Universe;
    use mpi::point_to_point::{Destination, Source};
    use mpi::topology::{Communicator as _, SimpleCommunicator};

    pub struct MpiComm {
        _universe: Universe,
        pub world: SimpleCommunicator,
        rank: usize,
        size: usize,
    }

    unsafe impl Send for MpiComm {}
    unsafe impl Sync for MpiComm {}

    impl Default for MpiComm {
        fn default() -> Self {
            let universe = mpi::initialize().expect("MPI already initialized");
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

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
            use mpi::request::StaticScope;
            let boxed = buf.to_vec().into_boxed_slice();
            let raw: *mut [u8] = Box::into_raw(boxed);
            let slice: &[u8] = unsafe { &*raw };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, slice, tag as i32);
            MpiSendHandle {
                req: Some(req),
                buf: Some(unsafe { NonNull::new_unchecked(raw) }),
            }
        }

        fn irecv(&self, peer: usize, tag: u16, template: &mut [u8]) -> Self::RecvHandle {
            use mpi::request::StaticScope;
            let len = template.len();
            let boxed = vec![0u8; len].into_boxed_slice();
            let raw: *mut [u8] = Box::into_raw(boxed);
            let slice_mut: &mut [u8] = unsafe { &mut *raw };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_receive_into_with_tag(StaticScope, slice_mut, tag as i32);
            MpiRecvHandle {
                req: Some(req),
                buf: Some(unsafe { NonNull::new_unchecked(raw) }),
                len,
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

    pub struct MpiSendHandle {
        req: Option<mpi::request::Request<'static, [u8], mpi::request::StaticScope>>,
        buf: Option<NonNull<[u8]>>,
    }

    impl Wait for MpiSendHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(req) = self.req.take() {
                let _ = req.wait();
            }
            if let Some(ptr) = self.buf.take() {
                unsafe {
                    drop(Box::from_raw(ptr.as_ptr()));
                }
            }
            None
        }
    }

    impl Drop for MpiSendHandle {
        fn drop(&mut self) {
            if let Some(req) = self.req.take() {
                let _ = req.test();
                #[cfg(debug_assertions)]
                eprintln!("[MpiSendHandle::drop] send not explicitly waited");
            }
            if let Some(ptr) = self.buf.take() {
                unsafe {
                    drop(Box::from_raw(ptr.as_ptr()));
                }
            }
        }
    }

    pub struct MpiRecvHandle {
        req: Option<mpi::request::Request<'static, [u8], mpi::request::StaticScope>>,
        buf: Option<NonNull<[u8]>>,
        len: usize,
    }

    impl Wait for MpiRecvHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(req) = self.req.take() {
                let _ = req.wait();
            }
            let ptr = self.buf.take().expect("receive buffer missing");
            let boxed: Box<[u8]> = unsafe { Box::from_raw(ptr.as_ptr()) };
            let mut v = Vec::from(boxed);
            v.truncate(self.len);
            Some(v)
        }
    }

    impl Drop for MpiRecvHandle {
        fn drop(&mut self) {
            if let Some(req) = self.req.take() {
                let _ = req.test();
                #[cfg(debug_assertions)]
                eprintln!("[MpiRecvHandle::drop] recv not explicitly waited");
            }
            if let Some(ptr) = self.buf.take() {
                unsafe {
                    drop(Box::from_raw(ptr.as_ptr()));
                }
            }
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_round_trip() {
        let world = ThreadComm::world(2);
        let msg = b"hello";
        let _s = world[0].isend(1, 7, msg);

        let mut buf = [0u8; 5];
        let h = world[1].irecv(0, 7, &mut buf);
        assert_eq!(h.wait().unwrap(), msg);
    }

    #[test]
    fn thread_fifo_order() {
        let world = ThreadComm::world(2);
        for i in 0..10u8 {
            let _ = world[0].isend(1, 8, &[i]);
        }
        let mut out = Vec::new();
        for _ in 0..10 {
            let mut b = [0u8; 1];
            let h = world[1].irecv(0, 8, &mut b);
            out.push(h.wait().unwrap()[0]);
        }
        assert_eq!(out, (0u8..10u8).collect::<Vec<_>>());
    }

    #[test]
    fn truncation_to_posted_length() {
        let world = ThreadComm::world(2);
        let _ = world[0].isend(1, 9, &[1, 2, 3, 4, 5, 6]);
        let mut b = [0u8; 4];
        let h = world[1].irecv(0, 9, &mut b);
        assert_eq!(h.wait().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn worlds_are_isolated() {
        let a = ThreadComm::world(2);
        let b = ThreadComm::world(2);
        let _ = a[0].isend(1, 5, &[1]);
        let _ = b[0].isend(1, 5, &[2]);
        let mut buf = [0u8; 1];
        let h = b[1].irecv(0, 5, &mut buf);
        assert_eq!(h.wait().unwrap(), vec![2]);
    }

    #[test]
    fn no_comm_all_gather_is_own_buffer() {
        let comm = NoComm;
        let gathered = comm.all_gather(&[1, 2, 3]);
        assert_eq!(gathered, vec![vec![1, 2, 3]]);
    }

    #[test]
    fn all_gather_collects_every_rank() {
        let mut world = ThreadComm::world(3);
        let mut handles = Vec::new();
        while let Some(comm) = world.pop() {
            handles.push(std::thread::spawn(move || {
                let rank = comm.rank();
                let own = vec![rank as u8; rank + 1];
                comm.all_gather(&own)
            }));
        }
        for handle in handles {
            let gathered = handle.join().unwrap();
            assert_eq!(gathered, vec![vec![0u8; 1], vec![1u8; 2], vec![2u8; 3]]);
        }
    }

    #[test]
    fn repeated_all_gathers_stay_matched() {
        let mut world = ThreadComm::world(2);
        let mut handles = Vec::new();
        while let Some(comm) = world.pop() {
            handles.push(std::thread::spawn(move || {
                let rank = comm.rank();
                (0..4u8)
                    .map(|round| comm.all_gather(&[rank as u8, round]))
                    .collect::<Vec<_>>()
            }));
        }
        for handle in handles {
            for (round, gathered) in handle.join().unwrap().into_iter().enumerate() {
                assert_eq!(gathered[0], vec![0, round as u8]);
                assert_eq!(gathered[1], vec![1, round as u8]);
            }
        }
    }
}
