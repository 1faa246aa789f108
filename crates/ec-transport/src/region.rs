//! Per-peer scratch regions (§3 "Per-peer connection record") and the local
//! PM-backed region abstraction that lets the transport land one-sided
//! writes/reads without owning the block pool itself.

use std::sync::Mutex;

/// A pre-registered, single-slot staging buffer. Each peer owns four of
/// these (send, recv, write, read); the engine's strict issue/poll pairing
/// guarantees at most one outstanding op touches a given region at a time
/// (§5 "Shared resources"), so the mutex here is uncontended in the
/// common path and exists to make the single-slot contract memory-safe
/// rather than to arbitrate real contention.
pub struct ScratchRegion {
    buf: Mutex<Box<[u8]>>,
}

impl ScratchRegion {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Mutex::new(vec![0u8; capacity].into_boxed_slice()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.lock().expect("scratch region mutex poisoned").len()
    }

    /// Stage `data` into the region ahead of a `post_write`/`post_send`.
    /// Panics if `data` is longer than the region's capacity; that is a
    /// caller bug, not a runtime condition (§7 "Invariant violation").
    pub fn stage(&self, data: &[u8]) {
        let mut buf = self.buf.lock().expect("scratch region mutex poisoned");
        assert!(
            data.len() <= buf.len(),
            "staged payload ({} bytes) exceeds scratch region capacity ({})",
            data.len(),
            buf.len()
        );
        buf[..data.len()].copy_from_slice(data);
    }

    /// Snapshot the first `len` bytes currently staged in the region (used
    /// to read a just-completed `post_read`/`post_recv` landing, or to pull
    /// what's queued for send).
    pub fn snapshot(&self, len: usize) -> Vec<u8> {
        let buf = self.buf.lock().expect("scratch region mutex poisoned");
        buf[..len].to_vec()
    }

    /// Land bytes written into this region by a remote peer's one-sided
    /// operation or the transport's reader thread.
    pub fn land(&self, data: &[u8]) {
        self.stage(data);
    }
}

/// Abstraction over the node's local PM-backed region, so the transport can
/// service a peer's one-sided write/read without depending on `ec-pool`
/// directly. `ec-engine` supplies the concrete adapter over
/// `ec_pool::BlockPool` (the transport crate stays free of a direct
/// dependency on the pool crate; see DESIGN.md).
pub trait LocalMemoryRegion: Send + Sync {
    fn write_at(&self, offset: u64, data: &[u8]);
    fn read_at(&self, offset: u64, len: usize) -> Vec<u8>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_then_snapshot_round_trips() {
        let region = ScratchRegion::new(16);
        region.stage(&[1, 2, 3, 4]);
        assert_eq!(region.snapshot(4), vec![1, 2, 3, 4]);
    }

    #[test]
    #[should_panic]
    fn stage_panics_on_oversized_payload() {
        let region = ScratchRegion::new(2);
        region.stage(&[1, 2, 3]);
    }
}
