//! Fixed-width bloom filters encoding transactional read and write sets.
//!
//! Every byte address touched by a transaction sets one bit; two filters
//! conflict iff some block has a non-zero intersection. Bits are only ever
//! set during a transaction's lifetime and cleared between transactions, so
//! a recorded address can never be missed by a later intersection check
//! (false positives are allowed, false negatives are not).
//!
//! Two variants share the layout and hash: the software filter uses atomic
//! words because committing peers intersect against it concurrently; the
//! hardware filter uses plain words because a hardware transaction's
//! isolation makes atomics unnecessary (and locked operations can abort the
//! transaction).

use core::fmt::{self, Debug, Formatter};
use core::mem;
use core::sync::atomic::{
    AtomicU64,
    Ordering::{Acquire, Relaxed, Release},
};

/// Filter width in bits.
pub const FILTER_BITS: usize = 1024;

/// Filter width in 64-bit blocks.
pub const FILTER_BLOCKS: usize = (FILTER_BITS + 63) / 64;

/// A point-in-time image of a filter, used for checkpoint save/restore.
pub type FilterImage = [u64; FILTER_BLOCKS];

// A constant which is odd, not very regular, and needs no other special
// mathematical properties.
const MIX_CONST: u64 = 0xdead_beef_dead_beef;

// Mix all four inputs so that h0 is a hash of them all. This is the
// finalization of the short variant of Jenkins' SpookyHash, which is all
// that is needed for inputs of pointer size.
#[inline]
fn short_end(mut h0: u64, mut h1: u64, mut h2: u64, mut h3: u64) -> u64 {
    macro_rules! round {
        ($a:ident, $b:ident, $rot:expr) => {
            $a ^= $b;
            $b = $b.rotate_left($rot);
            $a = $a.wrapping_add($b);
        };
    }
    round!(h3, h2, 15);
    round!(h0, h3, 52);
    round!(h1, h0, 26);
    round!(h2, h1, 51);
    round!(h3, h2, 28);
    round!(h0, h3, 9);
    round!(h1, h0, 47);
    round!(h2, h1, 54);
    round!(h3, h2, 32);
    round!(h0, h3, 25);
    round!(h1, h0, 63);
    let _ = h1;
    h0
}

#[inline]
fn hash_address(addr: usize) -> u64 {
    let a = 0u64;
    let b = 0u64;
    let c = MIX_CONST.wrapping_add(addr as u64);
    let d = MIX_CONST.wrapping_add((mem::size_of::<usize>() as u64) << 56);
    short_end(a, b, c, d)
}

// Builds the block image for a byte range; shared by both variants.
#[inline]
fn image_of_range(addr: usize, len: usize) -> FilterImage {
    let mut image = [0u64; FILTER_BLOCKS];
    for byte in addr..addr + len {
        let bit = (hash_address(byte) % FILTER_BITS as u64) as usize;
        image[bit / 64] |= 1u64 << (bit % 64);
    }
    image
}

/// Software read/write-set filter. Peers intersect against it while the
/// owner keeps adding addresses.
pub struct Bloom {
    blocks: [AtomicU64; FILTER_BLOCKS],
}

impl Bloom {
    #[inline]
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Bloom {
            blocks: [ZERO; FILTER_BLOCKS],
        }
    }

    /// Records `len` byte addresses starting at `addr`.
    #[inline]
    pub fn add(&self, addr: usize, len: usize) {
        let image = image_of_range(addr, len);
        for (block, bits) in self.blocks.iter().zip(image.iter()) {
            if *bits != 0 {
                let _ = block.fetch_or(*bits, Release);
            }
        }
    }

    /// True if some address may be in both filters.
    #[inline]
    pub fn intersects(&self, other: &Bloom) -> bool {
        self.blocks
            .iter()
            .zip(other.blocks.iter())
            .any(|(a, b)| a.load(Acquire) & b.load(Acquire) != 0)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(|block| block.load(Acquire) == 0)
    }

    #[inline]
    pub fn clear(&self) {
        for block in &self.blocks {
            block.store(0, Relaxed);
        }
    }

    #[inline]
    pub fn snapshot(&self) -> FilterImage {
        let mut image = [0u64; FILTER_BLOCKS];
        for (bits, block) in image.iter_mut().zip(self.blocks.iter()) {
            *bits = block.load(Relaxed);
        }
        image
    }

    #[inline]
    pub fn copy_from(&self, image: &FilterImage) {
        for (block, bits) in self.blocks.iter().zip(image.iter()) {
            block.store(*bits, Release);
        }
    }
}

impl Debug for Bloom {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Bloom")
            .field("empty", &self.is_empty())
            .finish()
    }
}

/// Hardware write-set filter. Owned and mutated inside a hardware
/// transaction; intersected against software filters only after the
/// hardware commit.
pub struct HwBloom {
    blocks: FilterImage,
}

impl HwBloom {
    #[inline]
    pub const fn new() -> Self {
        HwBloom {
            blocks: [0; FILTER_BLOCKS],
        }
    }

    #[inline]
    pub fn add(&mut self, addr: usize, len: usize) {
        let image = image_of_range(addr, len);
        for (block, bits) in self.blocks.iter_mut().zip(image.iter()) {
            *block |= *bits;
        }
    }

    /// Intersection against a peer's software filter.
    #[inline]
    pub fn intersects(&self, other: &Bloom) -> bool {
        self.blocks
            .iter()
            .zip(other.blocks.iter())
            .any(|(a, b)| a & b.load(Acquire) != 0)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(|block| *block == 0)
    }

    #[inline]
    pub fn clear(&mut self) {
        self.blocks = [0; FILTER_BLOCKS];
    }
}

impl Debug for HwBloom {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("HwBloom")
            .field("empty", &self.is_empty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_address_always_intersects() {
        let a = Bloom::new();
        let b = Bloom::new();
        let addr = 0x7fff_0000_1000usize;
        a.add(addr, 4);
        b.add(addr, 1);
        assert!(a.intersects(&b), "shared byte must intersect");
        assert!(b.intersects(&a));
    }

    #[test]
    fn empty_filter_never_intersects() {
        let a = Bloom::new();
        let b = Bloom::new();
        a.add(0x1000, 64);
        assert!(!a.intersects(&b));
        assert!(!b.intersects(&a));
        assert!(b.is_empty());
        assert!(!a.is_empty());
    }

    #[test]
    fn intersection_is_monotone_until_clear() {
        let a = Bloom::new();
        let b = Bloom::new();
        b.add(0x2000, 8);
        assert!(!a.intersects(&b));
        a.add(0x2000, 8);
        assert!(a.intersects(&b));
        a.add(0x9000, 8);
        assert!(a.intersects(&b), "adding addresses must never clear bits");
        a.clear();
        assert!(!a.intersects(&b));
        assert!(a.is_empty());
    }

    #[test]
    fn snapshot_round_trips() {
        let a = Bloom::new();
        a.add(0x4000, 16);
        let image = a.snapshot();
        a.add(0x5000, 16);
        a.copy_from(&image);
        let b = Bloom::new();
        b.add(0x4000, 16);
        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn hw_filter_matches_sw_hashing() {
        let mut hw = HwBloom::new();
        let sw = Bloom::new();
        hw.add(0x6000, 32);
        sw.add(0x6000, 1);
        assert!(hw.intersects(&sw));
        hw.clear();
        assert!(hw.is_empty());
        assert!(!hw.intersects(&sw));
    }
}
