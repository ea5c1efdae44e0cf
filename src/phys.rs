//! Physical memory: the managed zone and the frame pool.
//!
//! [`PhysMemory`] owns the zone's backing bytes and is the only way any
//! subsystem touches frame contents; everything above it works in
//! zone-relative [`PhysAddr`] offsets. On hardware the zone is the
//! linear-mapped region handed over at boot; here it is owned storage so
//! the whole core runs under the host test harness.
//!
//! [`FramePool`] is the frame allocator: one bit per 4 KiB frame, first-fit
//! scan, frames below the reserved low boundary pre-marked in use.

use alloc::vec;
use alloc::vec::Vec;

use crate::addr::{PhysAddr, PAGE_SIZE};
use crate::bitmap::Bitmap;
use crate::error::MemError;

/// The zone of physical memory the core manages.
pub struct PhysMemory {
    bytes: Vec<u8>,
}

impl PhysMemory {
    /// A zero-filled zone of `frames` 4 KiB frames.
    pub fn new(frames: u32) -> PhysMemory {
        PhysMemory {
            bytes: vec![0; (frames * PAGE_SIZE) as usize],
        }
    }

    pub fn len(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn frames(&self) -> u32 {
        self.len() / PAGE_SIZE
    }

    fn check_range(&self, addr: PhysAddr, len: u32) -> Result<(usize, usize), MemError> {
        let start = addr.as_raw() as usize;
        let end = start
            .checked_add(len as usize)
            .ok_or(MemError::InvalidArgument)?;
        if end > self.bytes.len() {
            return Err(MemError::InvalidArgument);
        }
        Ok((start, end))
    }

    pub fn bytes(&self, addr: PhysAddr, len: u32) -> Result<&[u8], MemError> {
        let (start, end) = self.check_range(addr, len)?;
        Ok(&self.bytes[start..end])
    }

    pub fn bytes_mut(&mut self, addr: PhysAddr, len: u32) -> Result<&mut [u8], MemError> {
        let (start, end) = self.check_range(addr, len)?;
        Ok(&mut self.bytes[start..end])
    }

    pub fn read_u32(&self, addr: PhysAddr) -> Result<u32, MemError> {
        let b = self.bytes(addr, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn write_u32(&mut self, addr: PhysAddr, value: u32) -> Result<(), MemError> {
        self.bytes_mut(addr, 4)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn fill(&mut self, addr: PhysAddr, len: u32, value: u8) -> Result<(), MemError> {
        self.bytes_mut(addr, len)?.fill(value);
        Ok(())
    }

    /// Copy one whole frame to another.
    pub fn copy_frame(&mut self, from: PhysAddr, to: PhysAddr) -> Result<(), MemError> {
        self.check_range(from, PAGE_SIZE)?;
        self.check_range(to, PAGE_SIZE)?;
        if from == to {
            return Ok(());
        }
        let src = from.as_raw() as usize;
        let dst = to.as_raw() as usize;
        self.bytes
            .copy_within(src..src + PAGE_SIZE as usize, dst);
        Ok(())
    }
}

/// The physical frame allocator.
pub struct FramePool {
    bitmap: Bitmap,
    frames_total: u32,
    frames_used: u32,
    reserved_low: u32,
}

impl FramePool {
    /// A pool over `frames_total` frames with the first `reserved_low`
    /// frames pre-marked in use (BIOS regions, kernel image, the zone
    /// bookkeeping itself).
    pub fn new(frames_total: u32, reserved_low: u32) -> FramePool {
        assert!(reserved_low <= frames_total);
        let mut bitmap = Bitmap::new(frames_total);
        for i in 0..reserved_low {
            bitmap.set(i);
        }
        FramePool {
            bitmap,
            frames_total,
            frames_used: reserved_low,
            reserved_low,
        }
    }

    /// First-fit scan for a free frame. `None` on exhaustion; the caller
    /// is responsible for triggering reclaim.
    pub fn alloc_frame(&mut self) -> Option<PhysAddr> {
        let index = self.bitmap.find_clear()?;
        self.bitmap.set(index);
        self.frames_used += 1;
        Some(PhysAddr::from_frame_index(index))
    }

    /// Return a frame. Freeing a frame that is already free is a caller
    /// bug; it is tolerated silently, matching the boot-time behavior the
    /// rest of the kernel expects.
    pub fn free_frame(&mut self, addr: PhysAddr) {
        debug_assert!(addr.is_frame_aligned());
        let index = addr.frame_index();
        if index >= self.frames_total || index < self.reserved_low {
            return;
        }
        debug_assert!(self.bitmap.get(index), "double free of frame {index}");
        if self.bitmap.get(index) {
            self.bitmap.clear(index);
            self.frames_used -= 1;
        }
    }

    /// Claim a specific contiguous run of frames, used at init to carve
    /// the buddy zone out of the pool. Fails without side effects if any
    /// frame in the run is taken.
    pub fn reserve_range(&mut self, first_index: u32, count: u32) -> Result<(), MemError> {
        let end = first_index
            .checked_add(count)
            .ok_or(MemError::InvalidArgument)?;
        if end > self.frames_total {
            return Err(MemError::InvalidArgument);
        }
        for i in first_index..end {
            if self.bitmap.get(i) {
                return Err(MemError::InvalidArgument);
            }
        }
        for i in first_index..end {
            self.bitmap.set(i);
        }
        self.frames_used += count;
        Ok(())
    }

    /// First frame index of a free run of `count` frames, if one exists.
    pub fn find_free_run(&self, count: u32) -> Option<u32> {
        let mut start = self.bitmap.find_clear()?;
        loop {
            let mut ok = true;
            for i in start..start.checked_add(count)? {
                if i >= self.frames_total {
                    return None;
                }
                if self.bitmap.get(i) {
                    start = self.bitmap.find_clear_from(i + 1)?;
                    ok = false;
                    break;
                }
            }
            if ok {
                return Some(start);
            }
        }
    }

    pub fn frames_total(&self) -> u32 {
        self.frames_total
    }

    pub fn frames_used(&self) -> u32 {
        self.frames_used
    }

    pub fn frames_free(&self) -> u32 {
        self.frames_total - self.frames_used
    }

    pub fn is_used(&self, addr: PhysAddr) -> bool {
        let index = addr.frame_index();
        index < self.frames_total && self.bitmap.get(index)
    }

    /// Used-bit population count; equal to [`Self::frames_used`] at all
    /// times.
    pub fn popcount(&self) -> u32 {
        self.bitmap.count_set()
    }

    /// Usage as a 0..=100 percentage.
    pub fn usage_percent(&self) -> u32 {
        if self.frames_total == 0 {
            return 0;
        }
        self.frames_used * 100 / self.frames_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_read_write() {
        let mut mem = PhysMemory::new(4);
        let addr = PhysAddr::from_frame_index(2);
        mem.fill(addr, PAGE_SIZE, 0xaa).unwrap();
        assert!(mem.bytes(addr, PAGE_SIZE).unwrap().iter().all(|&b| b == 0xaa));
        mem.write_u32(addr, 0xdead_beef).unwrap();
        assert_eq!(mem.read_u32(addr).unwrap(), 0xdead_beef);
    }

    #[test]
    fn zone_rejects_out_of_range() {
        let mem = PhysMemory::new(1);
        assert_eq!(
            mem.bytes(PhysAddr::from_raw(PAGE_SIZE - 2), 4).unwrap_err(),
            MemError::InvalidArgument
        );
    }

    #[test]
    fn copy_frame_copies_contents() {
        let mut mem = PhysMemory::new(3);
        let a = PhysAddr::from_frame_index(0);
        let b = PhysAddr::from_frame_index(2);
        mem.fill(a, PAGE_SIZE, 0x55).unwrap();
        mem.copy_frame(a, b).unwrap();
        assert!(mem.bytes(b, PAGE_SIZE).unwrap().iter().all(|&x| x == 0x55));
    }

    #[test]
    fn reserved_low_frames_not_handed_out() {
        let mut pool = FramePool::new(16, 4);
        assert_eq!(pool.frames_used(), 4);
        let frame = pool.alloc_frame().unwrap();
        assert_eq!(frame.frame_index(), 4);
    }

    #[test]
    fn alloc_free_round_trip() {
        let mut pool = FramePool::new(8, 1);
        let before = pool.frames_used();
        let f = pool.alloc_frame().unwrap();
        assert_eq!(pool.frames_used(), before + 1);
        pool.free_frame(f);
        assert_eq!(pool.frames_used(), before);
        assert_eq!(pool.frames_used(), pool.popcount());
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut pool = FramePool::new(4, 1);
        assert!(pool.alloc_frame().is_some());
        assert!(pool.alloc_frame().is_some());
        assert!(pool.alloc_frame().is_some());
        assert_eq!(pool.alloc_frame(), None);
    }

    #[test]
    fn reserve_range_is_all_or_nothing() {
        let mut pool = FramePool::new(16, 0);
        let f = pool.alloc_frame().unwrap();
        assert_eq!(f.frame_index(), 0);
        assert!(pool.reserve_range(0, 4).is_err());
        assert_eq!(pool.frames_used(), 1);
        pool.reserve_range(4, 4).unwrap();
        assert_eq!(pool.frames_used(), 5);
    }

    #[test]
    fn find_free_run_skips_used() {
        let mut pool = FramePool::new(16, 0);
        pool.reserve_range(1, 1).unwrap();
        assert_eq!(pool.find_free_run(1), Some(0));
        assert_eq!(pool.find_free_run(4), Some(2));
        assert_eq!(pool.find_free_run(16), None);
    }

    use proptest::prelude::*;

    proptest! {
        // The pool hands out every free frame exactly once, then fails.
        #[test]
        fn pool_uses_all_available_frames(total in 1u32..64, reserved_ratio in 0u32..100) {
            let reserved = total * reserved_ratio / 100;
            let mut pool = FramePool::new(total, reserved);
            let mut seen = std::collections::BTreeSet::new();
            for _ in 0..(total - reserved) {
                let frame = pool.alloc_frame().unwrap();
                prop_assert!(seen.insert(frame));
                prop_assert!(frame.frame_index() >= reserved);
            }
            prop_assert_eq!(pool.alloc_frame(), None);
            prop_assert_eq!(pool.frames_used(), pool.popcount());
        }

        // frames_used tracks the popcount across arbitrary alloc/free mixes.
        #[test]
        fn used_equals_popcount(ops in prop::collection::vec(any::<bool>(), 0..100)) {
            let mut pool = FramePool::new(32, 2);
            let mut live: Vec<PhysAddr> = Vec::new();
            for alloc in ops {
                if alloc {
                    if let Some(f) = pool.alloc_frame() {
                        live.push(f);
                    }
                } else if let Some(f) = live.pop() {
                    pool.free_frame(f);
                }
                prop_assert_eq!(pool.frames_used(), pool.popcount());
            }
        }
    }
}
