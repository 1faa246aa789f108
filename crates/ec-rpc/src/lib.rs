//! Two-sided RPC wire envelope (§6): plain data only, no dispatch logic.
//!
//! These types exist because the engine's degraded-read path may fall back
//! to a metadata-plane RPC when fewer than K peers are directly reachable
//! (§4.6 SUPPLEMENT). The metadata plane itself (key/value store, path
//! resolution, directory entries) is an external collaborator out of scope
//! for this crate; only the contract it is reached through lives here.

use ec_types::EcalError;

/// RPC operation codes. Only `MEMREAD`/`MEMWRITE` are consumed by the core's
/// degraded-path fallback; the rest are exported so a future metadata-plane
/// client can share the enum without redefining it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RpcType {
    Connect = 0,
    Disconnect = 1,
    Test = 2,
    Open = 3,
    Access = 4,
    Create = 5,
    Read = 6,
    Write = 7,
    Remove = 8,
    FileStat = 9,
    DirStat = 10,
    Mkdir = 11,
    Rmdir = 12,
    OpenDir = 13,
    ReadDir = 14,
    MemRead = 15,
    MemWrite = 16,
}

/// A one-sided block-write request carried over the two-sided RPC channel:
/// `FRAGMENT_BYTES` is a const generic so a single deployment's geometry
/// picks the concrete size (`MemRequest<2048>` for the K=2,P=1 worked
/// example in §8) while the record itself stays a fixed-layout POD type.
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct MemRequest<const FRAGMENT_BYTES: usize> {
    pub addr: u64,
    pub data: [u8; FRAGMENT_BYTES],
}

/// The corresponding block-read reply payload.
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct MemResponse<const FRAGMENT_BYTES: usize> {
    pub data: [u8; FRAGMENT_BYTES],
}

#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct PureValueRequest {
    pub value: i64,
}

#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct PureValueResponse {
    pub value: i64,
}

#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct ValueWithPathRequest {
    pub value: i64,
    pub len: i32,
    pub path: [u8; 256],
}

#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct RawResponse {
    pub len: i32,
    pub raw: [u8; 4090],
}

/// The degraded-read fallback seam (§4.6 SUPPLEMENT): when reconstruction
/// has exhausted the reachable peers for a stripe, `ec-engine` calls this as
/// a last resort before surfacing a reconstruction error. No implementation
/// ships here: constructing one means talking to the out-of-scope metadata plane, but
/// the seam is unit-testable with a stub.
pub trait MetadataFallback: Send + Sync {
    fn fetch_fragment(&self, node: u32, row: u64, fragment_bytes: usize) -> Result<Vec<u8>, EcalError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::{bytes_of, Zeroable};

    #[test]
    fn mem_request_is_plain_old_data_of_expected_size() {
        let req: MemRequest<2048> = MemRequest {
            addr: 42,
            data: [0xAB; 2048],
        };
        let bytes = bytes_of(&req);
        assert_eq!(bytes.len(), std::mem::size_of::<u64>() + 2048);
        assert_eq!(bytes[std::mem::size_of::<u64>()], 0xAB);
    }

    #[test]
    fn mem_response_zeroable_default_is_all_zero() {
        let resp: MemResponse<16> = MemResponse::zeroed();
        assert_eq!(resp.data, [0u8; 16]);
    }
}
