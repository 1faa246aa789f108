//! End-to-end scenarios S1-S5 from spec.md §8, run against
//! `LoopbackTransport` for determinism: K=2, P=1, N=3, cluster_size=3,
//! BLOCK_BYTES=4096, FRAGMENT_BYTES=2048.

use std::sync::Arc;

use ec_cluster::ClusterDirectory;
use ec_engine::{Engine, PoolRegion};
use ec_pool::BlockPool;
use ec_transport::loopback::LoopbackNetwork;
use ec_transport::LocalMemoryRegion;
use ec_types::{EcalError, Geometry, Page};

const CLUSTER_CONF: &str = "0 n0 127.0.0.1:1 127.0.0.1:2\n1 n1 127.0.0.1:3 127.0.0.1:4\n2 n2 127.0.0.1:5 127.0.0.1:6\n";

struct Cluster {
    net: LoopbackNetwork,
    engines: Vec<Engine<ec_transport::loopback::LoopbackTransport>>,
}

fn build_cluster() -> Cluster {
    let pools: Vec<Arc<BlockPool>> = (0..3).map(|_| Arc::new(BlockPool::anonymous(16, 2048).unwrap())).collect();
    let regions: Vec<Arc<dyn LocalMemoryRegion>> = pools
        .iter()
        .map(|p| Arc::new(PoolRegion::new(p.clone())) as Arc<dyn LocalMemoryRegion>)
        .collect();
    let net = LoopbackNetwork::new(regions);

    let engines = (0..3u32)
        .map(|id| {
            let directory = ClusterDirectory::parse(CLUSTER_CONF, id).unwrap();
            let geometry = Geometry::new(2, 1, 4096, 3).unwrap();
            let transport = net.transport_for(id);
            let degraded = net.degradation_state(id);
            Engine::new(geometry, directory, pools[id as usize].clone(), transport, degraded)
        })
        .collect();

    Cluster { net, engines }
}

fn payload_of(byte: u8) -> Box<[u8]> {
    vec![byte; 4096].into_boxed_slice()
}

fn payload_modulo() -> Box<[u8]> {
    (0..4096u32).map(|i| (i % 256) as u8).collect::<Vec<u8>>().into_boxed_slice()
}

#[test]
fn s1_single_page_round_trip() {
    let cluster = build_cluster();
    let page = Page::with_payload(0, payload_modulo());
    cluster.engines[0].write_block(&page).unwrap();

    let mut out = Page::zeroed(0, 4096);
    cluster.engines[1].read_block(0, &mut out).unwrap();
    assert_eq!(out.payload, page.payload);
}

#[test]
fn s2_parity_only_reconstruction() {
    let cluster = build_cluster();
    let page = Page::with_payload(0, payload_modulo());
    cluster.engines[0].write_block(&page).unwrap();

    cluster.net.set_alive(0, false);
    let mut out = Page::zeroed(0, 4096);
    cluster.engines[1].read_block(0, &mut out).unwrap();
    assert_eq!(out.payload, page.payload);

    cluster.net.set_alive(0, true);
}

#[test]
fn s3_full_overwrite() {
    let cluster = build_cluster();

    let first = Page::with_payload(0, payload_of(0xAA));
    cluster.engines[0].write_block(&first).unwrap();
    let mut out = Page::zeroed(0, 4096);
    cluster.engines[0].read_block(0, &mut out).unwrap();
    assert_eq!(out.payload, first.payload);

    let second = Page::with_payload(0, payload_of(0x55));
    cluster.engines[0].write_block(&second).unwrap();
    cluster.engines[0].read_block(0, &mut out).unwrap();
    assert_eq!(out.payload, second.payload);
}

#[test]
fn s4_degraded_write_records_to_log_and_decodes_on_read() {
    let cluster = build_cluster();
    cluster.net.set_alive(1, false);

    let page = Page::with_payload(5, payload_modulo());
    cluster.engines[0].write_block(&page).unwrap();

    let log = cluster.net.degradation_state(0).write_log_snapshot();
    assert!(log.contains(&5), "expected row 5 in write log, got {log:?}");

    let mut out = Page::zeroed(5, 4096);
    cluster.engines[2].read_block(5, &mut out).unwrap();
    assert_eq!(out.payload, page.payload);

    cluster.net.set_alive(1, true);
}

#[test]
fn s5_below_threshold_write_is_refused() {
    let cluster = build_cluster();
    cluster.net.set_alive(1, false);
    cluster.net.set_alive(2, false);

    let page = Page::with_payload(10, payload_of(0x11));
    let err = cluster.engines[0].write_block(&page).unwrap_err();
    match err {
        ec_engine::EngineError::Ecal(EcalError::BelowThreshold { reached, needed }) => {
            assert_eq!(reached, 1);
            assert_eq!(needed, 2);
        }
        other => panic!("expected BelowThreshold, got {other:?}"),
    }
}
