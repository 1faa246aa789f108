//! Fixed-width atomic bitmap ticket dispenser.
//!
//! Used to correlate outstanding remote-memory operations (or RPC calls)
//! with a small, fixed array of completion slots. `alloc_bit` hands out the
//! lowest free index; `free_bit` returns it. No blocking: callers that find
//! every bit taken get `None` and must back off.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

use tracing::warn;

/// Backing storage for a bitmap of `BITS` bits. Implemented for the widths
/// that have a native atomic integer: 8, 16, 32, 64.
pub trait BitmapStorage: Default {
    type Word: Copy;

    fn from_word(word: Self::Word) -> Self;
    fn load(&self) -> Self::Word;
    fn compare_exchange(&self, current: Self::Word, new: Self::Word) -> Result<(), Self::Word>;
    fn all_ones() -> Self::Word;
    fn lowest_set_bit(word: Self::Word) -> Option<u32>;
    fn clear_bit(word: Self::Word, bit: u32) -> Self::Word;
    fn set_bit(word: Self::Word, bit: u32) -> Self::Word;
    fn is_bit_set(word: Self::Word, bit: u32) -> bool;
}

macro_rules! impl_bitmap_storage {
    ($storage:ident, $atomic:ty, $word:ty, $bits:expr) => {
        #[derive(Default)]
        pub struct $storage($atomic);

        impl BitmapStorage for $storage {
            type Word = $word;

            fn from_word(word: Self::Word) -> Self {
                Self(<$atomic>::new(word))
            }

            fn load(&self) -> Self::Word {
                self.0.load(Ordering::Acquire)
            }

            fn compare_exchange(&self, current: Self::Word, new: Self::Word) -> Result<(), Self::Word> {
                self.0
                    .compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire)
                    .map(|_| ())
            }

            fn all_ones() -> Self::Word {
                <$word>::MAX
            }

            fn lowest_set_bit(word: Self::Word) -> Option<u32> {
                if word == 0 {
                    None
                } else {
                    Some(word.trailing_zeros())
                }
            }

            fn clear_bit(word: Self::Word, bit: u32) -> Self::Word {
                word & !(1 as $word).wrapping_shl(bit)
            }

            fn set_bit(word: Self::Word, bit: u32) -> Self::Word {
                word | (1 as $word).wrapping_shl(bit)
            }

            fn is_bit_set(word: Self::Word, bit: u32) -> bool {
                word & (1 as $word).wrapping_shl(bit) != 0
            }
        }

        impl $storage {
            const BITS: u32 = $bits;
        }
    };
}

impl_bitmap_storage!(Storage8, AtomicU8, u8, 8);
impl_bitmap_storage!(Storage16, AtomicU16, u16, 16);
impl_bitmap_storage!(Storage32, AtomicU32, u32, 32);
impl_bitmap_storage!(Storage64, AtomicU64, u64, 64);

/// A lock-free ticket dispenser: bit set means free, bit clear means taken.
/// `alloc_bit` clears the lowest set bit and returns its index; `free_bit`
/// sets it back. All bits start free.
pub struct Bitmap<S: BitmapStorage> {
    bits: S,
}

impl<S: BitmapStorage> Default for Bitmap<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: BitmapStorage> Bitmap<S> {
    pub fn new() -> Self {
        // every bit starts free (set): a plain store, not a CAS, since
        // there is no prior state to race with at construction time.
        Self {
            bits: S::from_word(S::all_ones()),
        }
    }

    /// Find the lowest free bit, claim it, and return its index. Returns
    /// `None` if every bit is currently allocated.
    pub fn alloc_bit(&self) -> Option<u32> {
        loop {
            let origin = self.bits.load();
            let idx = S::lowest_set_bit(origin)?;
            let next = S::clear_bit(origin, idx);
            match self.bits.compare_exchange(origin, next) {
                Ok(()) => return Some(idx),
                Err(_) => continue,
            }
        }
    }

    /// Release a previously allocated bit. Idempotent: re-freeing an
    /// already-free bit is allowed in release builds, but flagged with a
    /// `debug_assert!` so a double-free is caught in debug/test builds,
    /// matching the source's diagnosed-in-debug contract.
    pub fn free_bit(&self, idx: u32) {
        loop {
            let origin = self.bits.load();
            if cfg!(debug_assertions) && S::is_bit_set(origin, idx) {
                warn!(bit = idx, "free_bit called on an already-free bit");
            }
            debug_assert!(
                !S::is_bit_set(origin, idx),
                "double free of index allocator bit {idx}"
            );
            let next = S::set_bit(origin, idx);
            match self.bits.compare_exchange(origin, next) {
                Ok(()) => return,
                Err(_) => continue,
            }
        }
    }
}

/// 32-bit index allocator: the width used by the remote memory transport
/// for per-peer outstanding-operation task ids (immediate-data is 32 bits
/// wide end to end, see `ec-transport`).
pub type Bitmap32 = Bitmap<Storage32>;
/// 64-bit variant, for a larger RPC client slot table if ever needed.
pub type Bitmap64 = Bitmap<Storage64>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn default_matches_new_all_bits_free() {
        let bm: Bitmap<Storage8> = Bitmap::default();
        assert_eq!(bm.alloc_bit(), Some(0));
        assert_eq!(bm.alloc_bit(), Some(1));
    }

    #[test]
    fn allocates_lowest_free_bit_first() {
        let bm = Bitmap32::new();
        assert_eq!(bm.alloc_bit(), Some(0));
        assert_eq!(bm.alloc_bit(), Some(1));
        bm.free_bit(0);
        assert_eq!(bm.alloc_bit(), Some(0));
    }

    #[test]
    fn exhausts_and_reports_none() {
        let bm: Bitmap<Storage8> = Bitmap::new();
        let mut got = Vec::new();
        while let Some(bit) = bm.alloc_bit() {
            got.push(bit);
        }
        assert_eq!(got, (0..8).collect::<Vec<_>>());
        assert_eq!(bm.alloc_bit(), None);
    }

    #[test]
    fn free_then_realloc_round_trips() {
        let bm: Bitmap<Storage8> = Bitmap::new();
        let a = bm.alloc_bit().unwrap();
        let b = bm.alloc_bit().unwrap();
        bm.free_bit(a);
        bm.free_bit(b);
        let mut seen = vec![bm.alloc_bit().unwrap(), bm.alloc_bit().unwrap()];
        seen.sort();
        assert_eq!(seen, vec![0, 1]);
    }

    #[test]
    fn concurrent_allocators_never_collide() {
        let bm = Arc::new(Bitmap32::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let bm = bm.clone();
            handles.push(thread::spawn(move || {
                let mut taken = Vec::new();
                for _ in 0..4 {
                    if let Some(bit) = bm.alloc_bit() {
                        taken.push(bit);
                    }
                }
                taken
            }));
        }
        let mut all = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }
        all.sort();
        let before_dedup = all.len();
        all.dedup();
        assert_eq!(before_dedup, all.len(), "alloc_bit returned the same index twice");
        assert_eq!(all, (0..32).collect::<Vec<_>>());
    }
}
