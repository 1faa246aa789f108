//! Adapter exposing `ec_pool::BlockPool` as the local-region trait
//! `ec-transport` needs to land one-sided writes/reads it receives from
//! peers, without making `ec-transport` depend on `ec-pool` directly (§9
//! "Raw pointer / PM region aliasing": the engine is the sole local writer
//! for rows placed on this node; remote peers write other rows through this
//! adapter).

use std::sync::Arc;

use ec_pool::BlockPool;
use ec_transport::LocalMemoryRegion;

pub struct PoolRegion(Arc<BlockPool>);

impl PoolRegion {
    pub fn new(pool: Arc<BlockPool>) -> Self {
        Self(pool)
    }
}

impl LocalMemoryRegion for PoolRegion {
    fn write_at(&self, offset: u64, data: &[u8]) {
        let row = offset / self.0.slot_bytes() as u64;
        self.0
            .write_at(row, data)
            .expect("peer wrote to a row outside this node's mapped pool capacity");
    }

    fn read_at(&self, offset: u64, len: usize) -> Vec<u8> {
        let row = offset / self.0.slot_bytes() as u64;
        let slot = self.0.at(row).expect("peer read a row outside this node's mapped pool capacity");
        slot[..len].to_vec()
    }
}
