//! Remote Memory Transport (C3): peer-to-peer connection management
//! providing one-sided remote read/write, two-sided send/recv with a
//! 32-bit immediate, pre-registered per-peer scratch regions, liveness
//! tracking, and completion polling (§4.3).
//!
//! Two implementations share the [`RemoteMemoryTransport`] trait:
//! [`tcp::TcpTransport`], a real socket-backed transport that preserves the
//! RDMA contract's operation set and completion-polling discipline over
//! `std::net::TcpStream`, and [`loopback::LoopbackTransport`], a
//! same-process, sockets-free stand-in used by `ec-engine`'s tests.

mod region;
mod state;
mod wire;

pub mod loopback;
pub mod tcp;

pub use region::{LocalMemoryRegion, ScratchRegion};
pub use state::ConnState;
pub use wire::SP_REMOTE_MR_RECV;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is not reachable")]
    PeerDead(u32),

    #[error("unknown peer id {0}")]
    UnknownPeer(u32),

    #[error("transport has been shut down")]
    ShutDown,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("connection setup failed: {0}")]
    Setup(String),

    #[error("peer {0} has no free task-id slot; too many outstanding writes")]
    TaskIdsExhausted(u32),
}

/// Outcome of a completion-queue entry (§4.3 "poll_send/poll_recv").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    Error,
}

/// A drained work completion. `tag` carries whatever correlator the
/// operation that produced it was posted with: the `task_id` for
/// `post_read`, the node id (or [`SP_REMOTE_MR_RECV`]) immediate for a
/// `post_recv`, or the peer id for a plain `post_write`/`post_send` ack.
#[derive(Debug, Clone, Copy)]
pub struct WorkCompletion {
    pub peer: u32,
    pub tag: u32,
    pub status: CompletionStatus,
}

/// The transport's public contract (§4.3). Implemented by [`tcp::TcpTransport`]
/// and [`loopback::LoopbackTransport`].
pub trait RemoteMemoryTransport: Send + Sync {
    /// Two-sided send-with-immediate of `len` bytes staged in `send_region(peer)`.
    fn post_send(&self, peer: u32, len: usize, immediate: u32) -> Result<(), TransportError>;

    /// Repost a receive buffer for `peer`; `tag` classifies the completion
    /// the caller expects (zero, or a well-known reserved value).
    fn post_recv(&self, peer: u32, len: usize, tag: u32) -> Result<(), TransportError>;

    /// One-sided remote write of `len` bytes staged in `write_region(peer)`
    /// into the peer's local region at `remote_offset`. `imm`, if present,
    /// appears as the peer's next recv completion.
    fn post_write(
        &self,
        peer: u32,
        remote_offset: u64,
        len: usize,
        imm: Option<u32>,
    ) -> Result<(), TransportError>;

    /// One-sided remote read of `len` bytes from `remote_offset` in the
    /// peer's local region, landing in `read_region(peer)`. `task_id` is
    /// echoed back in the send-CQ completion.
    fn post_read(&self, peer: u32, remote_offset: u64, len: usize, task_id: u32) -> Result<(), TransportError>;

    /// Drain up to `max` send-CQ completions. Non-blocking-on-empty.
    fn poll_send(&self, max: usize) -> Vec<WorkCompletion>;

    /// Drain up to `max` recv-CQ completions. Non-blocking-on-empty.
    fn poll_recv(&self, max: usize) -> Vec<WorkCompletion>;

    fn send_region(&self, peer: u32) -> &ScratchRegion;
    fn recv_region(&self, peer: u32) -> &ScratchRegion;
    fn write_region(&self, peer: u32) -> &ScratchRegion;
    fn read_region(&self, peer: u32) -> &ScratchRegion;

    fn is_alive(&self, peer: u32) -> bool;
    fn local_id(&self) -> u32;
    fn peer_ids(&self) -> Vec<u32>;

    /// Cooperative shutdown: flips the shutdown flag so blocked polls and
    /// listener accepts unblock (§5.1).
    fn shutdown(&self);
}

/// Lets `ec-engine` hold whatever shared-ownership wrapper a concrete
/// transport's constructor returns (`Arc<tcp::TcpTransport>`) without the
/// engine needing to know it isn't `Self`.
impl<X: RemoteMemoryTransport + ?Sized> RemoteMemoryTransport for std::sync::Arc<X> {
    fn post_send(&self, peer: u32, len: usize, immediate: u32) -> Result<(), TransportError> {
        (**self).post_send(peer, len, immediate)
    }

    fn post_recv(&self, peer: u32, len: usize, tag: u32) -> Result<(), TransportError> {
        (**self).post_recv(peer, len, tag)
    }

    fn post_write(&self, peer: u32, remote_offset: u64, len: usize, imm: Option<u32>) -> Result<(), TransportError> {
        (**self).post_write(peer, remote_offset, len, imm)
    }

    fn post_read(&self, peer: u32, remote_offset: u64, len: usize, task_id: u32) -> Result<(), TransportError> {
        (**self).post_read(peer, remote_offset, len, task_id)
    }

    fn poll_send(&self, max: usize) -> Vec<WorkCompletion> {
        (**self).poll_send(max)
    }

    fn poll_recv(&self, max: usize) -> Vec<WorkCompletion> {
        (**self).poll_recv(max)
    }

    fn send_region(&self, peer: u32) -> &ScratchRegion {
        (**self).send_region(peer)
    }

    fn recv_region(&self, peer: u32) -> &ScratchRegion {
        (**self).recv_region(peer)
    }

    fn write_region(&self, peer: u32) -> &ScratchRegion {
        (**self).write_region(peer)
    }

    fn read_region(&self, peer: u32) -> &ScratchRegion {
        (**self).read_region(peer)
    }

    fn is_alive(&self, peer: u32) -> bool {
        (**self).is_alive(peer)
    }

    fn local_id(&self) -> u32 {
        (**self).local_id()
    }

    fn peer_ids(&self) -> Vec<u32> {
        (**self).peer_ids()
    }

    fn shutdown(&self) {
        (**self).shutdown()
    }
}
