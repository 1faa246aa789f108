//! Shared data model for the erasure-coded storage core: block/page/stripe
//! geometry, node roles, memory-region descriptors, and the workspace-wide
//! error taxonomy. Nothing in this crate talks to the network or to disk;
//! it is the vocabulary every other `ec-*` crate shares.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default logical page size in bytes (`BLOCK_BYTES`). Pages are what
/// callers read and write; a page is split into `K` data fragments of
/// `block_bytes / k` bytes each plus `P` parity fragments of the same size.
pub const DEFAULT_BLOCK_BYTES: usize = 4096;

/// Upper bound on nodes describable by one cluster-config file (§6: ids are
/// drawn from `[0, 32)`).
pub const MAX_NODES: usize = 32;

/// Default cap on the in-memory write log kept while the cluster is
/// degraded (§3 "Cluster-degradation record").
pub const DEFAULT_WRITE_LOG_CAP: usize = 50_000;

/// Boot-time erasure-coding geometry: how many data fragments (`k`), how
/// many parity fragments (`p`), the logical page size, and the cluster size
/// the placement function tiles stripes across.
///
/// The source parametrizes `K`/`P` differently across its `ECAL`/
/// `ECAL_repl`/`ECAL_none` variants; rather than bake one choice into the
/// type system via const generics, geometry is validated once at startup
/// and threaded through every component by value (it is `Copy`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    k: usize,
    p: usize,
    block_bytes: usize,
    cluster_size: usize,
}

impl Geometry {
    /// Validate and construct a geometry. Enforces `K ≥ 1, P ≥ 1,
    /// N = K + P ≤ cluster_size`, and that `cluster_size` tiles cleanly
    /// into rows of `N` nodes (`cluster_size % N == 0`), per §4.5.
    pub fn new(k: usize, p: usize, block_bytes: usize, cluster_size: usize) -> Result<Self, EcalError> {
        if k == 0 || p == 0 {
            return Err(EcalError::Config("K and P must both be >= 1".into()));
        }
        let n = k + p;
        if n > cluster_size {
            return Err(EcalError::Config(format!(
                "N={n} (K={k}+P={p}) exceeds cluster_size={cluster_size}"
            )));
        }
        if cluster_size % n != 0 {
            return Err(EcalError::Config(format!(
                "cluster_size={cluster_size} is not a multiple of N={n}; stripes must tile the cluster cleanly"
            )));
        }
        if block_bytes % k != 0 {
            return Err(EcalError::Config(format!(
                "block_bytes={block_bytes} is not a multiple of K={k}"
            )));
        }
        Ok(Self {
            k,
            p,
            block_bytes,
            cluster_size,
        })
    }

    pub const fn k(&self) -> usize {
        self.k
    }

    pub const fn p(&self) -> usize {
        self.p
    }

    pub const fn n(&self) -> usize {
        self.k + self.p
    }

    pub const fn block_bytes(&self) -> usize {
        self.block_bytes
    }

    pub const fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    /// Bytes per fragment: `BLOCK_BYTES / K`.
    pub const fn fragment_bytes(&self) -> usize {
        self.block_bytes / self.k
    }

    /// Number of stripes (rows) per row-group: `cluster_size / N`.
    pub const fn pages_per_row(&self) -> usize {
        self.cluster_size / self.n()
    }
}

/// A logical unit of user data: an index plus `block_bytes` of payload.
/// Pages are what callers read and write; fragments (plain `Box<[u8]>`,
/// `fragment_bytes` long) are what the transport moves.
#[derive(Clone)]
pub struct Page {
    pub index: u64,
    pub payload: Box<[u8]>,
}

impl Page {
    pub fn zeroed(index: u64, block_bytes: usize) -> Self {
        Self {
            index,
            payload: vec![0u8; block_bytes].into_boxed_slice(),
        }
    }

    pub fn with_payload(index: u64, payload: Box<[u8]>) -> Self {
        Self { index, payload }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("index", &self.index)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Role a cluster node plays, assigned by position/convention in the
/// cluster config file unless an explicit role column overrides it (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    DirectoryMetaServer,
    FileMetaServer,
    DataServer,
    Client,
}

impl NodeRole {
    /// Position/convention default from §6: node 0 is the directory
    /// metadata server, node 1 the file metadata server, everything else a
    /// data server.
    pub fn by_convention(id: u32) -> Self {
        match id {
            0 => NodeRole::DirectoryMetaServer,
            1 => NodeRole::FileMetaServer,
            _ => NodeRole::DataServer,
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeRole::DirectoryMetaServer => "dms",
            NodeRole::FileMetaServer => "fms",
            NodeRole::DataServer => "ds",
            NodeRole::Client => "client",
        };
        f.write_str(s)
    }
}

/// Memory region descriptor exchanged at connection setup: the remote base
/// address plus access key required to address a peer's PM via one-sided
/// operations (§6, the 40-byte MR record).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryRegionDescriptor {
    pub base_addr: u64,
    pub rkey: u32,
}

/// Workspace-wide error taxonomy (§7). Library crates return their own
/// narrower error where it helps callers pattern-match (e.g. `ec_codec::CodecError`),
/// and those convert into this type at the `ec-engine` boundary.
#[derive(Debug, thiserror::Error)]
pub enum EcalError {
    /// Missing/malformed cluster file, bad geometry, MR registration
    /// failure. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Completion with non-success status, failed connection setup,
    /// disconnect. Non-fatal: the affected peer is marked dead.
    #[error("transport error: {0}")]
    Transport(String),

    /// Fewer than K peers reachable for a stripe, or a non-invertible
    /// decode matrix (should be unreachable by construction).
    #[error("reconstruction error: {0}")]
    Reconstruction(String),

    /// Write-log capacity exceeded; writes are refused until drained.
    #[error("write log capacity exceeded, refusing further degraded writes")]
    WriteLogFull,

    /// A write reached fewer than K of the N peers.
    #[error("write below replication threshold: only {reached} of {needed} peers received the fragment")]
    BelowThreshold { reached: usize, needed: usize },

    /// Debug-assert-guarded bug class: double free, fragment size
    /// mismatch, etc. Never expected in a correct build.
    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_accepts_spec_example() {
        let g = Geometry::new(2, 1, 4096, 3).unwrap();
        assert_eq!(g.n(), 3);
        assert_eq!(g.fragment_bytes(), 2048);
        assert_eq!(g.pages_per_row(), 1);
    }

    #[test]
    fn geometry_rejects_non_tiling_cluster_size() {
        let err = Geometry::new(2, 1, 4096, 4).unwrap_err();
        assert!(matches!(err, EcalError::Config(_)));
    }

    #[test]
    fn geometry_rejects_n_exceeding_cluster_size() {
        let err = Geometry::new(4, 4, 4096, 6).unwrap_err();
        assert!(matches!(err, EcalError::Config(_)));
    }

    #[test]
    fn role_by_convention_matches_spec() {
        assert_eq!(NodeRole::by_convention(0), NodeRole::DirectoryMetaServer);
        assert_eq!(NodeRole::by_convention(1), NodeRole::FileMetaServer);
        assert_eq!(NodeRole::by_convention(2), NodeRole::DataServer);
    }
}
