//! Power-of-two buddy allocator over a contiguous zone of frames.
//!
//! The zone is carved out of the frame pool at init and managed in
//! zone-relative frame indices: a block's buddy at order `k` is
//! `index ^ (1 << k)`, never an absolute address. Block metadata is kept
//! out-of-band in a map keyed by start index, so splitting and coalescing
//! never write into the managed memory itself.

use alloc::collections::{BTreeMap, BTreeSet};

use crate::addr::{PhysAddr, PAGE_SIZE};
use crate::error::MemError;

/// Highest supported order: blocks of `2^MAX_ORDER` frames.
pub const MAX_ORDER: u8 = 11;

const ORDERS: usize = MAX_ORDER as usize + 1;

#[derive(Clone, Copy, Debug)]
struct BlockMeta {
    order: u8,
    allocated: bool,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BuddyStats {
    pub allocs: u64,
    pub frees: u64,
    pub splits: u64,
    pub coalesces: u64,
    pub failed: u64,
}

pub struct BuddyAllocator {
    zone_base: PhysAddr,
    zone_frames: u32,
    free_lists: [BTreeSet<u32>; ORDERS],
    blocks: BTreeMap<u32, BlockMeta>,
    allocated_frames: u32,
    stats: BuddyStats,
}

impl BuddyAllocator {
    /// Manage `zone_frames` frames starting at `zone_base`. The zone is
    /// seeded with the largest aligned blocks that tile it.
    pub fn new(zone_base: PhysAddr, zone_frames: u32) -> BuddyAllocator {
        assert!(zone_base.is_frame_aligned());
        let mut buddy = BuddyAllocator {
            zone_base,
            zone_frames,
            free_lists: core::array::from_fn(|_| BTreeSet::new()),
            blocks: BTreeMap::new(),
            allocated_frames: 0,
            stats: BuddyStats::default(),
        };

        let mut index = 0;
        while index < zone_frames {
            let mut order = MAX_ORDER;
            loop {
                let size = 1u32 << order;
                if index % size == 0 && index + size <= zone_frames {
                    break;
                }
                order -= 1;
            }
            buddy.blocks.insert(
                index,
                BlockMeta {
                    order,
                    allocated: false,
                },
            );
            buddy.free_lists[order as usize].insert(index);
            index += 1 << order;
        }
        buddy
    }

    pub const fn block_bytes(order: u8) -> u32 {
        (1 << order) * PAGE_SIZE
    }

    /// Smallest order whose block holds `size` bytes.
    pub fn order_for(size: u32) -> Option<u8> {
        if size == 0 {
            return None;
        }
        (0..=MAX_ORDER).find(|&k| Self::block_bytes(k) >= size)
    }

    /// Allocate the smallest block that fits `size` bytes. `None` for a
    /// zero size, an oversized request or exhaustion.
    pub fn alloc(&mut self, size: u32) -> Option<PhysAddr> {
        let order = match Self::order_for(size) {
            Some(order) => order,
            None => {
                self.stats.failed += 1;
                return None;
            }
        };
        self.alloc_order(order)
    }

    /// Allocate a block of exactly `2^order` frames, page-aligned.
    pub fn alloc_order(&mut self, order: u8) -> Option<PhysAddr> {
        if order > MAX_ORDER {
            self.stats.failed += 1;
            return None;
        }

        let mut have = None;
        for k in order..=MAX_ORDER {
            if let Some(&index) = self.free_lists[k as usize].first() {
                have = Some((k, index));
                break;
            }
        }
        let (mut k, index) = match have {
            Some(found) => found,
            None => {
                self.stats.failed += 1;
                return None;
            }
        };
        self.free_lists[k as usize].remove(&index);

        // Split down to the requested order, pushing each upper half back.
        while k > order {
            k -= 1;
            let upper = index + (1u32 << k);
            self.blocks.insert(
                upper,
                BlockMeta {
                    order: k,
                    allocated: false,
                },
            );
            self.free_lists[k as usize].insert(upper);
            self.stats.splits += 1;
        }

        self.blocks.insert(
            index,
            BlockMeta {
                order,
                allocated: true,
            },
        );
        self.allocated_frames += 1 << order;
        self.stats.allocs += 1;
        Some(self.index_to_addr(index))
    }

    /// Free a block previously returned by `alloc`/`alloc_order`. A
    /// pointer that is not a live block start is a corruption pattern:
    /// logged, and the operation is a no-op.
    pub fn free(&mut self, addr: PhysAddr) -> Result<(), MemError> {
        let mut index = match self.addr_to_index(addr) {
            Some(index) => index,
            None => {
                log::error!("buddy: free of out-of-zone address {addr:?}");
                return Err(MemError::Corruption);
            }
        };

        let meta = match self.blocks.get(&index) {
            Some(meta) => *meta,
            None => {
                log::error!("buddy: free of non-block address {addr:?}");
                return Err(MemError::Corruption);
            }
        };
        if !meta.allocated {
            log::error!("buddy: double free of block at {addr:?}");
            return Err(MemError::Corruption);
        }

        self.allocated_frames -= 1 << meta.order;
        self.stats.frees += 1;
        self.blocks.remove(&index);

        // Coalesce upward while the buddy is a free block of equal order.
        let mut order = meta.order;
        while order < MAX_ORDER {
            let buddy = index ^ (1u32 << order);
            let mergeable = matches!(
                self.blocks.get(&buddy),
                Some(b) if !b.allocated && b.order == order
            );
            if !mergeable {
                break;
            }
            self.blocks.remove(&buddy);
            self.free_lists[order as usize].remove(&buddy);
            index = index.min(buddy);
            order += 1;
            self.stats.coalesces += 1;
        }

        self.blocks.insert(
            index,
            BlockMeta {
                order,
                allocated: false,
            },
        );
        self.free_lists[order as usize].insert(index);
        Ok(())
    }

    /// Byte size of the live block starting at `addr`, if any.
    pub fn allocated_size(&self, addr: PhysAddr) -> Option<u32> {
        let index = self.addr_to_index(addr)?;
        let meta = self.blocks.get(&index)?;
        if !meta.allocated {
            return None;
        }
        Some(Self::block_bytes(meta.order))
    }

    pub fn owns(&self, addr: PhysAddr) -> bool {
        addr >= self.zone_base
            && addr.as_raw() < self.zone_base.as_raw() + self.zone_frames * PAGE_SIZE
    }

    pub fn zone_base(&self) -> PhysAddr {
        self.zone_base
    }

    pub fn zone_frames(&self) -> u32 {
        self.zone_frames
    }

    pub fn allocated_frames(&self) -> u32 {
        self.allocated_frames
    }

    pub fn stats(&self) -> BuddyStats {
        self.stats
    }

    /// Free-list sizes per order, for diagnostics and tests.
    pub fn free_counts(&self) -> [u32; ORDERS] {
        core::array::from_fn(|k| self.free_lists[k].len() as u32)
    }

    fn index_to_addr(&self, index: u32) -> PhysAddr {
        PhysAddr::from_raw(self.zone_base.as_raw() + index * PAGE_SIZE)
    }

    fn addr_to_index(&self, addr: PhysAddr) -> Option<u32> {
        if !self.owns(addr) || !addr.is_frame_aligned() {
            return None;
        }
        Some((addr.as_raw() - self.zone_base.as_raw()) / PAGE_SIZE)
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        // Every free block's buddy is allocated, of smaller order, or
        // outside the zone.
        for (&index, meta) in &self.blocks {
            if meta.allocated {
                continue;
            }
            assert!(self.free_lists[meta.order as usize].contains(&index));
            if meta.order == MAX_ORDER {
                continue;
            }
            let buddy = index ^ (1u32 << meta.order);
            if let Some(b) = self.blocks.get(&buddy) {
                assert!(
                    b.allocated || b.order < meta.order,
                    "free buddies left uncoalesced at index {index}"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(frames: u32) -> BuddyAllocator {
        BuddyAllocator::new(PhysAddr::from_frame_index(16), frames)
    }

    #[test]
    fn zero_and_oversized_return_none() {
        let mut buddy = zone(64);
        let baseline = buddy.free_counts();
        assert_eq!(buddy.alloc(0), None);
        assert_eq!(buddy.alloc(BuddyAllocator::block_bytes(MAX_ORDER) + 1), None);
        assert_eq!(buddy.free_counts(), baseline);
    }

    #[test]
    fn split_and_coalesce_round_trip() {
        let mut buddy = zone(1 << MAX_ORDER);
        let before = buddy.free_counts();
        assert_eq!(before[MAX_ORDER as usize], 1);

        let a = buddy.alloc(PAGE_SIZE).unwrap();
        let b = buddy.alloc(PAGE_SIZE).unwrap();
        assert_ne!(a, b);
        buddy.check_invariants();

        buddy.free(a).unwrap();
        buddy.free(b).unwrap();
        buddy.check_invariants();
        assert_eq!(buddy.free_counts(), before);
        assert_eq!(buddy.allocated_frames(), 0);
    }

    #[test]
    fn double_free_is_detected() {
        let mut buddy = zone(64);
        let a = buddy.alloc(PAGE_SIZE).unwrap();
        buddy.free(a).unwrap();
        assert_eq!(buddy.free(a), Err(MemError::Corruption));
        buddy.check_invariants();
    }

    #[test]
    fn free_of_interior_pointer_is_rejected() {
        let mut buddy = zone(64);
        let a = buddy.alloc(PAGE_SIZE * 4).unwrap();
        let interior = PhysAddr::from_raw(a.as_raw() + PAGE_SIZE);
        assert_eq!(buddy.free(interior), Err(MemError::Corruption));
        buddy.free(a).unwrap();
    }

    #[test]
    fn fragmented_zone_fails_large_alloc_without_false_split() {
        // Alternating free/used order-0 blocks leave no room for order 6.
        let mut buddy = zone(1 << MAX_ORDER);
        let mut held = Vec::new();
        for _ in 0..(1 << MAX_ORDER) {
            held.push(buddy.alloc(PAGE_SIZE).unwrap());
        }
        // Free every other frame.
        let mut freed = Vec::new();
        for (i, addr) in held.iter().enumerate() {
            if i % 2 == 0 {
                buddy.free(*addr).unwrap();
                freed.push(*addr);
            }
        }
        let splits_before = buddy.stats().splits;
        assert_eq!(buddy.alloc_order(6), None);
        assert_eq!(buddy.stats().splits, splits_before);
        buddy.check_invariants();

        // Freeing the rest coalesces back to a single top-order block.
        for (i, addr) in held.iter().enumerate() {
            if i % 2 != 0 {
                buddy.free(*addr).unwrap();
            }
        }
        buddy.check_invariants();
        let counts = buddy.free_counts();
        assert_eq!(counts[MAX_ORDER as usize], 1);
        assert_eq!(counts[..MAX_ORDER as usize].iter().sum::<u32>(), 0);
    }

    #[test]
    fn allocated_size_reports_block_bytes() {
        let mut buddy = zone(64);
        let a = buddy.alloc(PAGE_SIZE + 1).unwrap();
        assert_eq!(buddy.allocated_size(a), Some(PAGE_SIZE * 2));
        buddy.free(a).unwrap();
        assert_eq!(buddy.allocated_size(a), None);
    }

    #[test]
    fn unaligned_zone_is_tiled_without_escaping() {
        // 96 frames: seeded as 64 + 32, no block crosses the zone end.
        let buddy = zone(96);
        let counts = buddy.free_counts();
        assert_eq!(counts[6], 1);
        assert_eq!(counts[5], 1);
        assert_eq!(counts.iter().sum::<u32>(), 2);
    }

    use proptest::prelude::*;

    proptest! {
        // Arbitrary alloc/free interleavings keep the free lists and the
        // buddy invariant intact, and a full drain restores the zone.
        #[test]
        fn random_traffic_preserves_invariants(
            ops in prop::collection::vec((any::<bool>(), 0u32..66000), 1..120)
        ) {
            let mut buddy = zone(256);
            let baseline = buddy.free_counts();
            let mut live = Vec::new();
            for (is_alloc, size) in ops {
                if is_alloc {
                    if let Some(addr) = buddy.alloc(size) {
                        live.push(addr);
                    }
                } else if !live.is_empty() {
                    let addr = live.swap_remove(size as usize % live.len());
                    buddy.free(addr).unwrap();
                }
                buddy.check_invariants();
            }
            for addr in live {
                buddy.free(addr).unwrap();
            }
            buddy.check_invariants();
            prop_assert_eq!(buddy.free_counts(), baseline);
            prop_assert_eq!(buddy.allocated_frames(), 0);
        }
    }
}
