//! End-to-end smoke test for the real TCP state machine: three nodes on
//! localhost bring up a fully-connected cluster, one node posts a one-sided
//! write into another's local region and polls the completion, and a third
//! node posts a one-sided read back from it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ec_degraded::DegradationState;
use ec_transport::tcp::{PeerAddr, TcpTransport};
use ec_transport::{LocalMemoryRegion, RemoteMemoryTransport};

struct VecRegion(Mutex<Vec<u8>>);

impl VecRegion {
    fn new(size: usize) -> Arc<dyn LocalMemoryRegion> {
        Arc::new(Self(Mutex::new(vec![0u8; size])))
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

static NEXT_PORT: AtomicU16 = AtomicU16::new(19800);

fn reserve_ports(n: u16) -> Vec<u16> {
    let base = NEXT_PORT.fetch_add(n, AtomicOrdering::Relaxed);
    (0..n).map(|i| base + i).collect()
}

fn poll_until<F: Fn() -> bool>(pred: F, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    pred()
}

#[test]
fn three_node_tcp_cluster_brings_up_and_moves_a_fragment() {
    let ports = reserve_ports(3);
    let addrs: Vec<SocketAddr> = ports
        .iter()
        .map(|p| format!("127.0.0.1:{p}").parse().unwrap())
        .collect();

    let regions: Vec<Arc<dyn LocalMemoryRegion>> = (0..3).map(|_| VecRegion::new(4096)).collect();
    let degraded: Vec<Arc<DegradationState>> = (0..3).map(|_| Arc::new(DegradationState::new())).collect();

    let mut handles = Vec::new();
    for id in 0..3u32 {
        let listen_addr = addrs[id as usize];
        let peer_addrs: Vec<PeerAddr> = (0..3u32)
            .filter(|&other| other != id)
            .map(|other| PeerAddr { id: other, addr: addrs[other as usize] })
            .collect();
        let region = regions[id as usize].clone();
        let degraded = degraded[id as usize].clone();
        handles.push(thread::spawn(move || {
            TcpTransport::bind(id, listen_addr, peer_addrs, region, degraded).expect("bind")
        }));
    }

    let transports: Vec<Arc<TcpTransport>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    for t in &transports {
        for peer in t.peer_ids() {
            assert!(t.is_alive(peer), "node {} should see peer {peer} as alive", t.local_id());
        }
    }

    // node 0 writes a fragment into node 1's local region.
    let payload = vec![0x5Au8; 128];
    transports[0].write_region(1).stage(&payload);
    transports[0].post_write(1, 256, payload.len(), None).unwrap();

    assert!(poll_until(|| !transports[0].poll_send(1).is_empty(), Duration::from_secs(2)));

    // node 2 reads that same fragment back from node 1.
    transports[2].post_read(1, 256, payload.len(), 7).unwrap();
    assert!(poll_until(|| !transports[2].poll_send(1).is_empty(), Duration::from_secs(2)));
    assert_eq!(transports[2].read_region(1).snapshot(payload.len()), payload);

    // More writes than the req_id bitmap has bits: each one only succeeds
    // if the previous write's completion freed its slot back (C8).
    for i in 0..40u8 {
        transports[0].write_region(1).stage(&[i; 4]);
        transports[0].post_write(1, 512, 4, None).unwrap();
        assert!(poll_until(|| !transports[0].poll_send(1).is_empty(), Duration::from_secs(2)));
    }

    for t in &transports {
        t.shutdown();
    }
}
