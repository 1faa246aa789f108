//! A same-process [`RemoteMemoryTransport`] with no sockets, used by
//! `ec-engine`'s tests to exercise degraded-read/degraded-write paths
//! deterministically. Landing a one-sided write/read is a direct call into
//! the target node's [`LocalMemoryRegion`] instead of a wire round-trip;
//! every other part of the contract (per-peer scratch regions, completion
//! tagging, liveness) behaves exactly like [`crate::tcp::TcpTransport`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use ec_degraded::DegradationState;
use tracing::trace;

use crate::region::{LocalMemoryRegion, ScratchRegion};
use crate::{CompletionStatus, RemoteMemoryTransport, TransportError, WorkCompletion, SP_REMOTE_MR_RECV};

struct PeerLink {
    send: ScratchRegion,
    recv: ScratchRegion,
    write: ScratchRegion,
    read: ScratchRegion,
    alive: AtomicBool,
}

impl PeerLink {
    fn new(scratch_bytes: usize) -> Self {
        Self {
            send: ScratchRegion::new(scratch_bytes),
            recv: ScratchRegion::new(scratch_bytes),
            write: ScratchRegion::new(scratch_bytes),
            read: ScratchRegion::new(scratch_bytes),
            alive: AtomicBool::new(true),
        }
    }
}

struct Cq {
    tx: Sender<WorkCompletion>,
    rx: Mutex<Receiver<WorkCompletion>>,
}

impl Cq {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self { tx, rx: Mutex::new(rx) }
    }

    fn push(&self, completion: WorkCompletion) {
        let _ = self.tx.send(completion);
    }

    fn drain(&self, max: usize) -> Vec<WorkCompletion> {
        let rx = self.rx.lock().expect("cq mutex poisoned");
        let mut out = Vec::with_capacity(max.min(8));
        while out.len() < max {
            match rx.try_recv() {
                Ok(completion) => out.push(completion),
                Err(_) => break,
            }
        }
        out
    }
}

struct NetworkInner {
    local_ids: Vec<u32>,
    regions: Vec<Arc<dyn LocalMemoryRegion>>,
    /// `links[a][b]` is node `a`'s connection record to peer `b`, for `a != b`.
    links: Vec<Vec<Option<PeerLink>>>,
    send_cq: Vec<Cq>,
    recv_cq: Vec<Cq>,
    degraded: Vec<Arc<DegradationState>>,
    shutdown: AtomicBool,
}

/// Shared fabric for a same-process cluster of `LoopbackTransport` handles,
/// one per node id in `local_ids`.
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

const DEFAULT_SCRATCH_BYTES: usize = 1 << 16;

impl LoopbackNetwork {
    /// Build a fully-connected loopback fabric: `regions[i]` is node `i`'s
    /// local PM-backed region, every node starts reachable to every other.
    pub fn new(regions: Vec<Arc<dyn LocalMemoryRegion>>) -> Self {
        Self::with_scratch_bytes(regions, DEFAULT_SCRATCH_BYTES)
    }

    pub fn with_scratch_bytes(regions: Vec<Arc<dyn LocalMemoryRegion>>, scratch_bytes: usize) -> Self {
        let n = regions.len();
        let local_ids: Vec<u32> = (0..n as u32).collect();
        let mut links = Vec::with_capacity(n);
        for a in 0..n {
            let mut row = Vec::with_capacity(n);
            for b in 0..n {
                row.push(if a == b { None } else { Some(PeerLink::new(scratch_bytes)) });
            }
            links.push(row);
        }
        let send_cq = (0..n).map(|_| Cq::new()).collect();
        let recv_cq = (0..n).map(|_| Cq::new()).collect();
        let degraded = (0..n).map(|_| Arc::new(DegradationState::new())).collect();
        Self {
            inner: Arc::new(NetworkInner {
                local_ids,
                regions,
                links,
                send_cq,
                recv_cq,
                degraded,
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    pub fn transport_for(&self, id: u32) -> LoopbackTransport {
        LoopbackTransport {
            inner: self.inner.clone(),
            id,
        }
    }

    /// Test hook: flip a peer's reachability as observed by every other
    /// node in the fabric (a disconnect is visible cluster-wide), and
    /// notify each survivor's [`DegradationState`] on the transition to
    /// dead.
    pub fn set_alive(&self, node: u32, alive: bool) {
        for (a, row) in self.inner.links.iter().enumerate() {
            if a as u32 == node {
                continue;
            }
            if let Some(link) = &row[node as usize] {
                let was_alive = link.alive.swap(alive, Ordering::AcqRel);
                if was_alive && !alive {
                    self.inner.degraded[a].observe_disconnect();
                } else if !was_alive && alive {
                    self.inner.degraded[a].observe_reconnect();
                }
            }
        }
    }

    pub fn degradation_state(&self, observer: u32) -> Arc<DegradationState> {
        self.inner.degraded[observer as usize].clone()
    }
}

/// A handle to one node's view of a [`LoopbackNetwork`].
#[derive(Clone)]
pub struct LoopbackTransport {
    inner: Arc<NetworkInner>,
    id: u32,
}

impl LoopbackTransport {
    fn link(&self, peer: u32) -> Result<&PeerLink, TransportError> {
        self.inner
            .links
            .get(self.id as usize)
            .and_then(|row| row.get(peer as usize))
            .and_then(|slot| slot.as_ref())
            .ok_or(TransportError::UnknownPeer(peer))
    }

    fn check_alive(&self, peer: u32) -> Result<(), TransportError> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(TransportError::ShutDown);
        }
        if !self.link(peer)?.alive.load(Ordering::Acquire) {
            return Err(TransportError::PeerDead(peer));
        }
        Ok(())
    }
}

impl RemoteMemoryTransport for LoopbackTransport {
    fn post_send(&self, peer: u32, len: usize, immediate: u32) -> Result<(), TransportError> {
        self.check_alive(peer)?;
        let payload = self.link(peer)?.send.snapshot(len);
        // land in the peer's recv region addressed by *this* node's id
        let peer_link = self
            .inner
            .links
            .get(peer as usize)
            .and_then(|row| row.get(self.id as usize))
            .and_then(|slot| slot.as_ref())
            .ok_or(TransportError::UnknownPeer(peer))?;
        peer_link.recv.land(&payload);
        self.inner.recv_cq[peer as usize].push(WorkCompletion {
            peer: self.id,
            tag: immediate,
            status: CompletionStatus::Success,
        });
        trace!(target: "transport", from = self.id, to = peer, len, immediate, "loopback post_send");
        Ok(())
    }

    fn post_recv(&self, peer: u32, _len: usize, _tag: u32) -> Result<(), TransportError> {
        // Landing happens synchronously inside post_send in the loopback
        // model; post_recv only validates that the peer slot exists.
        self.link(peer)?;
        Ok(())
    }

    fn post_write(
        &self,
        peer: u32,
        remote_offset: u64,
        len: usize,
        imm: Option<u32>,
    ) -> Result<(), TransportError> {
        self.check_alive(peer)?;
        let payload = self.link(peer)?.write.snapshot(len);
        self.inner.regions[peer as usize].write_at(remote_offset, &payload);
        if let Some(imm) = imm {
            self.inner.recv_cq[peer as usize].push(WorkCompletion {
                peer: self.id,
                tag: imm,
                status: CompletionStatus::Success,
            });
        }
        self.inner.send_cq[self.id as usize].push(WorkCompletion {
            peer,
            tag: peer,
            status: CompletionStatus::Success,
        });
        trace!(target: "transport", from = self.id, to = peer, remote_offset, len, "loopback post_write");
        Ok(())
    }

    fn post_read(&self, peer: u32, remote_offset: u64, len: usize, task_id: u32) -> Result<(), TransportError> {
        self.check_alive(peer)?;
        let data = self.inner.regions[peer as usize].read_at(remote_offset, len);
        self.link(peer)?.read.land(&data);
        self.inner.send_cq[self.id as usize].push(WorkCompletion {
            peer,
            tag: task_id,
            status: CompletionStatus::Success,
        });
        trace!(target: "transport", from = self.id, to = peer, remote_offset, len, task_id, "loopback post_read");
        Ok(())
    }

    fn poll_send(&self, max: usize) -> Vec<WorkCompletion> {
        self.inner.send_cq[self.id as usize].drain(max)
    }

    fn poll_recv(&self, max: usize) -> Vec<WorkCompletion> {
        self.inner.recv_cq[self.id as usize].drain(max)
    }

    fn send_region(&self, peer: u32) -> &ScratchRegion {
        &self.link(peer).expect("unknown peer").send
    }

    fn recv_region(&self, peer: u32) -> &ScratchRegion {
        &self.link(peer).expect("unknown peer").recv
    }

    fn write_region(&self, peer: u32) -> &ScratchRegion {
        &self.link(peer).expect("unknown peer").write
    }

    fn read_region(&self, peer: u32) -> &ScratchRegion {
        &self.link(peer).expect("unknown peer").read
    }

    fn is_alive(&self, peer: u32) -> bool {
        self.link(peer).map(|l| l.alive.load(Ordering::Acquire)).unwrap_or(false)
    }

    fn local_id(&self) -> u32 {
        self.id
    }

    fn peer_ids(&self) -> Vec<u32> {
        self.inner.local_ids.iter().copied().filter(|&id| id != self.id).collect()
    }

    fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
    }
}

/// Recognize the reserved MR-refresh immediate, matching the TCP
/// transport's inline handling of the same value (§4.3).
pub fn is_mr_refresh(tag: u32) -> bool {
    tag == SP_REMOTE_MR_RECV
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct VecRegion(StdMutex<Vec<u8>>);

    impl VecRegion {
        fn new(size: usize) -> Arc<dyn LocalMemoryRegion> {
            Arc::new(Self(StdMutex::new(vec![0u8; size])))
        }
    }

    impl LocalMemoryRegion for VecRegion {
        fn write_at(&self, offset: u64, data: &[u8]) {
            let mut buf = self.0.lock().unwrap();
            let start = offset as usize;
            buf[start..start + data.len()].copy_from_slice(data);
        }

        fn read_at(&self, offset: u64, len: usize) -> Vec<u8> {
            let buf = self.0.lock().unwrap();
            buf[offset as usize..offset as usize + len].to_vec()
        }
    }

    #[test]
    fn post_write_then_post_read_round_trips() {
        let net = LoopbackNetwork::new(vec![VecRegion::new(4096), VecRegion::new(4096), VecRegion::new(4096)]);
        let t0 = net.transport_for(0);
        let t1 = net.transport_for(1);

        t0.write_region(1).stage(&[0xAB; 8]);
        t0.post_write(1, 0, 8, None).unwrap();
        let sc = t0.poll_send(1);
        assert_eq!(sc.len(), 1);

        t1.post_read(0, 0, 8, 0).unwrap();
        // wrong direction on purpose won't happen in the engine; verify
        // direct read from node 0's own region via node 1 reading node 0.
        let completions = t1.poll_send(1);
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].tag, 0);
    }

    #[test]
    fn set_alive_false_is_observed_by_every_peer() {
        let net = LoopbackNetwork::new(vec![VecRegion::new(256), VecRegion::new(256), VecRegion::new(256)]);
        let t0 = net.transport_for(0);
        let t1 = net.transport_for(1);
        assert!(t0.is_alive(1));
        net.set_alive(1, false);
        assert!(!t0.is_alive(1));
        assert_eq!(net.degradation_state(0).dead_peer_count(), 1);
        let _ = t1; // peer 1's own transport isn't meaningfully "alive to itself"
    }

    #[test]
    fn post_send_delivers_immediate_to_recv_cq() {
        let net = LoopbackNetwork::new(vec![VecRegion::new(64), VecRegion::new(64)]);
        let t0 = net.transport_for(0);
        let t1 = net.transport_for(1);
        t0.send_region(1).stage(&[1, 2, 3]);
        t0.post_send(1, 3, 99).unwrap();
        let completions = t1.poll_recv(1);
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].tag, 99);
        assert_eq!(t1.recv_region(0).snapshot(3), vec![1, 2, 3]);
    }
}
