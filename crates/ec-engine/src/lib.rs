//! ECAL Engine (C6): the top-level read/write API. Composes the block pool,
//! cluster directory, placement function, transport, and codec: fragments a
//! page, dispatches fragment I/O across peers, runs the codec's encode on
//! write and decode on read, and handles degraded peers transparently
//! (§4.6).

mod error;
mod pool_region;

pub use error::EngineError;
pub use pool_region::PoolRegion;

use std::sync::Arc;

use ec_cluster::{node_for_fragment, placement, ClusterDirectory, DataPosition};
use ec_codec::Codec;
use ec_degraded::DegradationState;
use ec_pool::BlockPool;
use ec_rpc::MetadataFallback;
use ec_transport::{CompletionStatus, RemoteMemoryTransport};
use ec_types::{EcalError, Geometry, Page};
use tracing::{debug, warn};

/// Composes the block pool, cluster directory, placement function,
/// transport, and codec into the public read/write contract (§4.6).
/// Generic over the transport implementation so the same engine code runs
/// against `ec_transport::tcp::TcpTransport` in production and
/// `ec_transport::loopback::LoopbackTransport` in tests.
pub struct Engine<T: RemoteMemoryTransport> {
    geometry: Geometry,
    directory: ClusterDirectory,
    pool: Arc<BlockPool>,
    transport: T,
    codec: Codec,
    degraded: Arc<DegradationState>,
    fallback: Option<Arc<dyn MetadataFallback>>,
}

impl<T: RemoteMemoryTransport> Engine<T> {
    pub fn new(
        geometry: Geometry,
        directory: ClusterDirectory,
        pool: Arc<BlockPool>,
        transport: T,
        degraded: Arc<DegradationState>,
    ) -> Self {
        let codec = Codec::new(geometry.k(), geometry.p(), geometry.fragment_bytes());
        Self {
            geometry,
            directory,
            pool,
            transport,
            codec,
            degraded,
            fallback: None,
        }
    }

    /// Attach the degraded-read RPC fallback (§4.6 SUPPLEMENT). No
    /// implementation ships in this crate; constructing one means talking
    /// to the out-of-scope metadata plane.
    pub fn with_fallback(mut self, fallback: Arc<dyn MetadataFallback>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    fn self_id(&self) -> u32 {
        self.directory.my_id()
    }

    fn cluster_size(&self) -> usize {
        self.directory.cluster_size()
    }

    /// Read the page at `idx` into `page`, reconstructing via the codec
    /// when fewer than K of the stripe's peers are directly reachable
    /// (§4.6 `read_block`).
    pub fn read_block(&self, idx: u64, page: &mut Page) -> Result<(), EngineError> {
        let k = self.geometry.k();
        let n = self.geometry.n();
        let fragment_bytes = self.geometry.fragment_bytes();
        let cluster_size = self.cluster_size();

        page.index = idx;
        page.payload.iter_mut().for_each(|b| *b = 0);

        let pos = placement(idx, &self.geometry);
        let self_id = self.self_id();

        let mut present_ids: Vec<usize> = Vec::with_capacity(k);
        let mut err_ids: Vec<usize> = Vec::new();
        for j in 0..n {
            let node = node_for_fragment(pos, j, cluster_size);
            let reachable = node == self_id || self.transport.is_alive(node);
            if reachable && present_ids.len() < k {
                present_ids.push(j);
            } else if !reachable && j < k {
                err_ids.push(j);
            }
        }

        let mut fragments: Vec<Option<Vec<u8>>> = vec![None; n];
        let mut remote_tasks: Vec<(u32, usize)> = Vec::new();

        for &frag_id in &present_ids {
            let node = node_for_fragment(pos, frag_id, cluster_size);
            if node == self_id {
                let slot = self.pool.at(pos.row)?;
                fragments[frag_id] = Some(slot.to_vec());
            } else {
                let task_id = remote_tasks.len() as u32;
                self.transport.post_read(node, self.pool.offset_of(pos.row), fragment_bytes, task_id)?;
                remote_tasks.push((node, frag_id));
            }
        }

        let mut collected = 0usize;
        while collected < remote_tasks.len() {
            let wcs = self.transport.poll_send(remote_tasks.len() - collected);
            for wc in wcs {
                if !matches!(wc.status, CompletionStatus::Success) {
                    return Err(EcalError::Reconstruction(format!(
                        "read completion failed for peer {}",
                        wc.peer
                    ))
                    .into());
                }
                let (node, frag_id) = remote_tasks[wc.tag as usize];
                debug_assert_eq!(node, wc.peer, "completion tag/peer mismatch");
                let data = self.transport.read_region(node).snapshot(fragment_bytes);
                fragments[frag_id] = Some(data);
                collected += 1;
            }
        }

        if present_ids.len() < k {
            self.try_fallback_fill(&mut present_ids, &mut fragments, pos, &err_ids)?;
        }

        if present_ids.len() < k {
            return Err(EcalError::Reconstruction(format!(
                "only {} of {k} required fragments reachable for row {}",
                present_ids.len(),
                pos.row
            ))
            .into());
        }

        if !err_ids.is_empty() {
            self.codec.decode(&present_ids, &mut fragments)?;
        }

        for frag_id in 0..k {
            let fragment = fragments[frag_id]
                .as_ref()
                .ok_or_else(|| EcalError::Invariant(format!("fragment {frag_id} missing after decode")))?;
            let start = frag_id * fragment_bytes;
            page.payload[start..start + fragment_bytes].copy_from_slice(fragment);
        }

        debug!(target: "ecal", idx, row = pos.row, reconstructed = !err_ids.is_empty(), "read_block complete");
        Ok(())
    }

    fn try_fallback_fill(
        &self,
        present_ids: &mut Vec<usize>,
        fragments: &mut [Option<Vec<u8>>],
        pos: DataPosition,
        err_ids: &[usize],
    ) -> Result<(), EngineError> {
        let Some(fallback) = &self.fallback else { return Ok(()) };
        let fragment_bytes = self.geometry.fragment_bytes();
        let cluster_size = self.cluster_size();
        for &frag_id in err_ids {
            if present_ids.len() == self.geometry.k() {
                break;
            }
            if present_ids.contains(&frag_id) {
                continue;
            }
            let node = node_for_fragment(pos, frag_id, cluster_size);
            match fallback.fetch_fragment(node, pos.row, fragment_bytes) {
                Ok(data) => {
                    fragments[frag_id] = Some(data);
                    present_ids.push(frag_id);
                    warn!(target: "ecal", row = pos.row, frag_id, "recovered fragment via metadata fallback");
                }
                Err(e) => {
                    warn!(target: "ecal", row = pos.row, frag_id, error = %e, "metadata fallback failed");
                }
            }
        }
        Ok(())
    }

    /// Erasure-code `page` and commit its stripe across the N target peers
    /// (§4.6 `write_block`). Succeeds as long as at least K of the N peers
    /// receive the fragment; below that threshold the write is refused.
    pub fn write_block(&self, page: &Page) -> Result<(), EngineError> {
        let k = self.geometry.k();
        let p = self.geometry.p();
        let n = self.geometry.n();
        let fragment_bytes = self.geometry.fragment_bytes();
        let cluster_size = self.cluster_size();
        let self_id = self.self_id();

        let data_refs: Vec<&[u8]> = (0..k)
            .map(|j| &page.payload[j * fragment_bytes..(j + 1) * fragment_bytes])
            .collect();
        let parity = self.codec.encode_parity(&data_refs)?;

        let pos = placement(page.index, &self.geometry);
        let mut reached = 0usize;

        for j in 0..n {
            let node = node_for_fragment(pos, j, cluster_size);
            let fragment: &[u8] = if j < k { data_refs[j] } else { &parity[j - k] };

            if node == self_id {
                self.pool.write_at(pos.row, fragment)?;
                reached += 1;
                continue;
            }

            if self.transport.is_alive(node) {
                self.transport.write_region(node).stage(fragment);
                self.transport.post_write(node, self.pool.offset_of(pos.row), fragment_bytes, None)?;
                self.await_one_send_completion(node)?;
                reached += 1;
            } else if self.degraded.is_degraded() {
                self.degraded.record_write(pos.row)?;
            }
        }

        if reached < k {
            return Err(EcalError::BelowThreshold { reached, needed: k }.into());
        }

        debug!(target: "ecal", idx = page.index, row = pos.row, reached, n, p, "write_block complete");
        Ok(())
    }

    fn await_one_send_completion(&self, expected_peer: u32) -> Result<(), EngineError> {
        loop {
            let wcs = self.transport.poll_send(1);
            if let Some(wc) = wcs.into_iter().next() {
                if !matches!(wc.status, CompletionStatus::Success) {
                    return Err(EcalError::Transport(format!("write completion failed for peer {}", wc.peer)).into());
                }
                debug_assert_eq!(wc.peer, expected_peer, "write completion arrived for the wrong peer");
                return Ok(());
            }
        }
    }
}
