//! Persistent block pool (C1): interprets a raw, PM-backed byte region as
//! `capacity` fixed-size slots.
//!
//! No physical persistent-memory device is addressable from a portable
//! crate, so the region is backed by a memory-mapped file (`memmap2`),
//! the same flat-byte-array model applies whether the file sits on tmpfs
//! for tests or on a `/dev/dax`/`/mnt/pmem` filesystem in production.
//!
//! The pool hands out raw pointers rather than `&mut` borrows into the
//! region: the engine is the sole local writer for rows whose placement
//! maps to this node, and remote peers write other rows through the
//! transport. These writer sets never overlap (§3 invariant), so a single
//! `BlockPool` can be shared read/write across threads without a lock;
//! the disjointness is an invariant the caller (the engine's placement
//! logic) upholds, not something this type can check.

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::MmapMut;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("row {row} out of bounds (capacity {capacity})")]
    OutOfBounds { row: u64, capacity: u64 },

    #[error("slice length {got} does not match slot size {expected}")]
    WrongSlotLength { expected: usize, got: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct BlockPool {
    // Keeps the mapping alive; all byte access goes through `base` rather
    // than through `&mut MmapMut`, so `BlockPool` can be shared across
    // threads as long as callers respect disjoint row ownership.
    mmap: MmapMut,
    base: *mut u8,
    region_size: usize,
    slot_bytes: usize,
    capacity: u64,
}

// SAFETY: `base` points into `mmap`, which this struct owns for its whole
// lifetime, so the pointer stays valid. Concurrent access across threads is
// sound under the caller's invariant that no two threads touch overlapping
// rows at the same time (see module docs).
unsafe impl Send for BlockPool {}
unsafe impl Sync for BlockPool {}

impl BlockPool {
    /// Open (creating/truncating if needed) a file of exactly
    /// `slots * slot_bytes` bytes and map it as the PM region.
    pub fn open_file(path: &Path, slots: u64, slot_bytes: usize) -> Result<Self, PoolError> {
        let region_size = slots as usize * slot_bytes;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(region_size as u64)?;

        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let base = mmap.as_mut_ptr();

        debug!(
            path = %path.display(),
            region_size,
            slot_bytes,
            capacity = slots,
            "mapped persistent block pool"
        );

        Ok(Self {
            mmap,
            base,
            region_size,
            slot_bytes,
            capacity: slots,
        })
    }

    /// In-memory pool for tests that don't need a backing file.
    pub fn anonymous(slots: u64, slot_bytes: usize) -> Result<Self, PoolError> {
        let region_size = slots as usize * slot_bytes;
        let mut mmap = MmapMut::map_anon(region_size)?;
        let base = mmap.as_mut_ptr();
        Ok(Self {
            mmap,
            base,
            region_size,
            slot_bytes,
            capacity: slots,
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    pub fn region_size(&self) -> usize {
        self.region_size
    }

    /// Base address of the mapped region, used as the remote-addressing
    /// base for one-sided operations.
    pub fn base_ptr(&self) -> *mut u8 {
        self.base
    }

    /// Byte offset of `row` relative to the region base; the value used
    /// as the remote address shift in transport operations.
    pub fn offset_of(&self, row: u64) -> u64 {
        row * self.slot_bytes as u64
    }

    fn check_row(&self, row: u64) -> Result<(), PoolError> {
        if row >= self.capacity {
            return Err(PoolError::OutOfBounds {
                row,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Read-only view of slot `row`.
    pub fn at(&self, row: u64) -> Result<&[u8], PoolError> {
        self.check_row(row)?;
        let offset = self.offset_of(row) as usize;
        // SAFETY: offset + slot_bytes <= region_size by `check_row`, and
        // `base` is valid for `region_size` bytes for the pool's lifetime.
        Ok(unsafe { std::slice::from_raw_parts(self.base.add(offset), self.slot_bytes) })
    }

    /// Copy `data` into slot `row` and persist it: flush the touched cache
    /// lines and issue a store fence. Ordering across multiple writes is
    /// the caller's responsibility (§4.1).
    pub fn write_at(&self, row: u64, data: &[u8]) -> Result<(), PoolError> {
        self.check_row(row)?;
        if data.len() != self.slot_bytes {
            return Err(PoolError::WrongSlotLength {
                expected: self.slot_bytes,
                got: data.len(),
            });
        }
        let offset = self.offset_of(row) as usize;
        // SAFETY: see `at`; this is the only write path into the row, and
        // callers never issue two of these concurrently against the same
        // row (§3, §4.6 tie-break note).
        unsafe {
            let dst = self.base.add(offset);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        self.flush_line(offset, data.len());
        Ok(())
    }

    /// CPU cache-line flush + store fence over `[offset, offset+len)`,
    /// making a just-completed write durable before the caller acknowledges
    /// it. Uses `clflushopt`/`sfence` on `x86_64`; falls back to the
    /// portable `msync`-style range flush everywhere else.
    fn flush_line(&self, offset: usize, len: usize) {
        #[cfg(target_arch = "x86_64")]
        {
            self.flush_line_x86_64(offset, len);
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = self.mmap.flush_range(offset, len);
        }
    }

    #[cfg(target_arch = "x86_64")]
    fn flush_line_x86_64(&self, offset: usize, len: usize) {
        use std::arch::x86_64::{_mm_clflushopt, _mm_sfence};

        const CACHE_LINE: usize = 64;
        let start = offset - (offset % CACHE_LINE);
        let end = offset + len;
        let mut cursor = start;
        while cursor < end {
            // SAFETY: `cursor` is within the mapped region for the same
            // reason `at`/`write_at` are sound; clflushopt is available
            // because this block is gated on x86_64 (checked at runtime
            // would require CPUID, but every x86_64 target this crate
            // builds for in practice supports it via `target-feature`).
            unsafe {
                _mm_clflushopt(self.base.add(cursor));
            }
            cursor += CACHE_LINE;
        }
        unsafe {
            _mm_sfence();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let pool = BlockPool::anonymous(4, 2048).unwrap();
        let payload = vec![0xABu8; 2048];
        pool.write_at(2, &payload).unwrap();
        assert_eq!(pool.at(2).unwrap(), payload.as_slice());
    }

    #[test]
    fn offsets_are_contiguous_by_slot_size() {
        let pool = BlockPool::anonymous(8, 512).unwrap();
        assert_eq!(pool.offset_of(0), 0);
        assert_eq!(pool.offset_of(1), 512);
        assert_eq!(pool.offset_of(7), 7 * 512);
    }

    #[test]
    fn rejects_out_of_bounds_row() {
        let pool = BlockPool::anonymous(2, 128).unwrap();
        assert!(matches!(pool.at(5), Err(PoolError::OutOfBounds { .. })));
    }

    #[test]
    fn rejects_wrong_length_write() {
        let pool = BlockPool::anonymous(2, 128).unwrap();
        let err = pool.write_at(0, &[0u8; 64]).unwrap_err();
        assert!(matches!(err, PoolError::WrongSlotLength { expected: 128, got: 64 }));
    }

    #[test]
    fn file_backed_pool_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pm.region");
        {
            let pool = BlockPool::open_file(&path, 4, 256).unwrap();
            pool.write_at(1, &[0x42u8; 256]).unwrap();
        }
        let pool = BlockPool::open_file(&path, 4, 256).unwrap();
        assert_eq!(pool.at(1).unwrap(), [0x42u8; 256].as_slice());
    }

    #[test]
    fn disjoint_rows_can_be_written_concurrently() {
        use std::sync::Arc;
        use std::thread;

        let pool = Arc::new(BlockPool::anonymous(8, 256).unwrap());
        let mut handles = Vec::new();
        for row in 0..8u64 {
            let pool = pool.clone();
            handles.push(thread::spawn(move || {
                let data = vec![row as u8; 256];
                pool.write_at(row, &data).unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for row in 0..8u64 {
            assert_eq!(pool.at(row).unwrap(), vec![row as u8; 256].as_slice());
        }
    }
}
