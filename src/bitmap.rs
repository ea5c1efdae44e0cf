//! A plain owned bit array.
//!
//! One bit per tracked unit, 1 meaning used. Backs the frame pool and the
//! per-device swap slot maps.

use alloc::vec;
use alloc::vec::Vec;

#[derive(Clone, Debug)]
pub struct Bitmap {
    words: Vec<u32>,
    len: u32,
}

impl Bitmap {
    /// A bitmap of `len` clear bits.
    pub fn new(len: u32) -> Bitmap {
        Bitmap {
            words: vec![0; len.div_ceil(32) as usize],
            len,
        }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: u32) -> bool {
        assert!(index < self.len);
        self.words[(index / 32) as usize] & (1 << (index % 32)) != 0
    }

    pub fn set(&mut self, index: u32) {
        assert!(index < self.len);
        self.words[(index / 32) as usize] |= 1 << (index % 32);
    }

    pub fn clear(&mut self, index: u32) {
        assert!(index < self.len);
        self.words[(index / 32) as usize] &= !(1 << (index % 32));
    }

    /// First clear bit at or after `from`, scanning to the end.
    pub fn find_clear_from(&self, from: u32) -> Option<u32> {
        let mut index = from;
        while index < self.len {
            let word = self.words[(index / 32) as usize];
            if word == u32::MAX {
                // Skip to the next word boundary.
                index = (index / 32 + 1) * 32;
                continue;
            }
            if word & (1 << (index % 32)) == 0 {
                return Some(index);
            }
            index += 1;
        }
        None
    }

    pub fn find_clear(&self) -> Option<u32> {
        self.find_clear_from(0)
    }

    /// Number of set bits.
    pub fn count_set(&self) -> u32 {
        let full = self.words.iter().map(|w| w.count_ones()).sum::<u32>();
        // Bits past `len` in the last word are never set, so no mask needed.
        full
    }
}
