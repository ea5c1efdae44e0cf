//! Virtual-memory manager: address spaces and two-level page tables.
//!
//! Tables live in arenas and are linked by ids; an address space's
//! top-level array holds leaf-table handles plus a shared marker for the
//! kernel slots every space aliases. The translation-cache flush is an
//! explicit counted effect so callers (and tests) can observe the ordering
//! the fault paths promise.

use alloc::boxed::Box;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::addr::{PhysAddr, VirtAddr};
use crate::arena::{Arena, Id};
use crate::error::MemError;
use crate::paging::{Pte, PteFlags, SwapRef, KERNEL_TOP_SLOTS};
use crate::phys::FramePool;

pub type SpaceId = Id<AddressSpace>;
type LeafId = Id<LeafTable>;

const TOP_SLOTS: usize = 1024;
const LEAF_SLOTS: usize = 1024;

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct VmFlags: u32 {
        const READ       = 1 << 0;
        const WRITE      = 1 << 1;
        const EXEC       = 1 << 2;
        const SHARED     = 1 << 3;
        const GROWS_DOWN = 1 << 4;
    }
}

/// A mapped region of a user address space, half-open `[start, end)`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VmArea {
    pub start: VirtAddr,
    pub end: VirtAddr,
    pub flags: VmFlags,
}

pub struct LeafTable {
    ptes: Box<[Pte; LEAF_SLOTS]>,
    backing_frame: PhysAddr,
}

#[derive(Clone, Copy, Debug)]
struct TopEntry {
    leaf: LeafId,
    /// Kernel slots alias the kernel space's leaves and are never freed
    /// with the space.
    kernel_shared: bool,
}

pub struct AddressSpace {
    top: Box<[Option<TopEntry>; TOP_SLOTS]>,
    root_frame: PhysAddr,
    tlb_flushes: u64,
    areas: Vec<VmArea>,
}

pub struct Vmm {
    spaces: Arena<AddressSpace>,
    leaves: Arena<LeafTable>,
    kernel_space: SpaceId,
    current: SpaceId,
}

impl Vmm {
    /// Build the kernel address space. Its kernel-range slots are what
    /// every later space shares.
    pub fn new(frames: &mut FramePool) -> Result<Vmm, MemError> {
        let mut spaces = Arena::new();
        let root_frame = frames.alloc_frame().ok_or(MemError::OutOfMemory)?;
        let kernel_space = spaces.insert(AddressSpace {
            top: Box::new([None; TOP_SLOTS]),
            root_frame,
            tlb_flushes: 0,
            areas: Vec::new(),
        });
        Ok(Vmm {
            spaces,
            leaves: Arena::new(),
            kernel_space,
            current: kernel_space,
        })
    }

    pub fn kernel_space(&self) -> SpaceId {
        self.kernel_space
    }

    pub fn current(&self) -> SpaceId {
        self.current
    }

    /// Make `space` the active one (the CR3 reload in the reference
    /// machine).
    pub fn switch(&mut self, space: SpaceId) -> Result<(), MemError> {
        if !self.spaces.contains(space) {
            return Err(MemError::NotPresent);
        }
        self.current = space;
        Ok(())
    }

    pub fn create_address_space(&mut self, frames: &mut FramePool) -> Result<SpaceId, MemError> {
        let root_frame = frames.alloc_frame().ok_or(MemError::OutOfMemory)?;
        let mut top = Box::new([None; TOP_SLOTS]);

        // Reflect the kernel range by sharing the kernel space's leaves.
        let kernel_top = &self.spaces.get(self.kernel_space).expect("kernel space").top;
        for slot in 0..KERNEL_TOP_SLOTS {
            top[slot] = kernel_top[slot].map(|entry| TopEntry {
                leaf: entry.leaf,
                kernel_shared: true,
            });
        }

        Ok(self.spaces.insert(AddressSpace {
            top,
            root_frame,
            tlb_flushes: 0,
            areas: Vec::new(),
        }))
    }

    /// Tear a space down: every private present frame goes back to the
    /// pool, then the leaf tables, then the root. Kernel-shared slots are
    /// left alone. COW-managed frames must already have been released by
    /// the copy-on-write cleanup.
    pub fn destroy_address_space(
        &mut self,
        frames: &mut FramePool,
        space: SpaceId,
    ) -> Result<(), MemError> {
        if space == self.kernel_space {
            return Err(MemError::InvalidArgument);
        }
        let record = self.spaces.remove(space).ok_or(MemError::NotPresent)?;
        if self.current == space {
            self.current = self.kernel_space;
        }

        for entry in record.top.iter().flatten() {
            if entry.kernel_shared {
                continue;
            }
            let leaf = self
                .leaves
                .remove(entry.leaf)
                .expect("space held a dead leaf handle");
            for pte in leaf.ptes.iter() {
                if pte.is_present() {
                    frames.free_frame(pte.frame());
                }
            }
            frames.free_frame(leaf.backing_frame);
        }
        frames.free_frame(record.root_frame);
        Ok(())
    }

    /// Install `vaddr -> paddr`. The leaf table is allocated on the fly
    /// when the top-level slot is empty. An existing mapping is replaced;
    /// its frame is not freed here.
    pub fn map(
        &mut self,
        frames: &mut FramePool,
        space: SpaceId,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        flags: PteFlags,
    ) -> Result<(), MemError> {
        if !vaddr.is_page_aligned() || !paddr.is_frame_aligned() {
            return Err(MemError::InvalidArgument);
        }
        let leaf = self.ensure_leaf(frames, space, vaddr)?;
        let table = self.leaves.get_mut(leaf).expect("fresh leaf");
        table.ptes[vaddr.leaf_index()] = Pte::present(paddr, flags);
        Ok(())
    }

    /// Clear the entry and return the frame to the pool. For COW-shared
    /// frames the caller routes through the copy-on-write manager instead.
    pub fn unmap(
        &mut self,
        frames: &mut FramePool,
        space: SpaceId,
        vaddr: VirtAddr,
    ) -> Result<(), MemError> {
        let old = self
            .take_pte(space, vaddr)?
            .ok_or(MemError::NotPresent)?;
        if old.is_present() {
            frames.free_frame(old.frame());
        }
        self.flush_tlb(space);
        Ok(())
    }

    /// Clear the entry without touching the frame; returns the old entry.
    pub fn take_pte(&mut self, space: SpaceId, vaddr: VirtAddr) -> Result<Option<Pte>, MemError> {
        let record = self.spaces.get(space).ok_or(MemError::NotPresent)?;
        let entry = match record.top[vaddr.top_index()] {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let table = self.leaves.get_mut(entry.leaf).expect("live leaf");
        let pte = table.ptes[vaddr.leaf_index()];
        if pte.is_empty() {
            return Ok(None);
        }
        table.ptes[vaddr.leaf_index()] = Pte::EMPTY;
        Ok(Some(pte))
    }

    /// Two-level lookup; zero/None for anything not present.
    pub fn translate(&self, space: SpaceId, vaddr: VirtAddr) -> Option<PhysAddr> {
        let pte = self.pte(space, vaddr)?;
        if !pte.is_present() {
            return None;
        }
        PhysAddr::from_raw(pte.frame().as_raw() + vaddr.page_offset()).into()
    }

    pub fn pte(&self, space: SpaceId, vaddr: VirtAddr) -> Option<Pte> {
        let record = self.spaces.get(space)?;
        let entry = record.top[vaddr.top_index()]?;
        let table = self.leaves.get(entry.leaf).expect("live leaf");
        let pte = table.ptes[vaddr.leaf_index()];
        (!pte.is_empty()).then_some(pte)
    }

    /// Rewrite an existing page's entry (COW write-protect, swap encode).
    /// Fails if the leaf was never allocated.
    pub fn set_pte(&mut self, space: SpaceId, vaddr: VirtAddr, pte: Pte) -> Result<(), MemError> {
        let record = self.spaces.get(space).ok_or(MemError::NotPresent)?;
        let entry = record.top[vaddr.top_index()].ok_or(MemError::NotPresent)?;
        let table = self.leaves.get_mut(entry.leaf).expect("live leaf");
        table.ptes[vaddr.leaf_index()] = pte;
        Ok(())
    }

    /// Leaf-and-slot update helper for fault paths: apply `edit` to the
    /// present entry at `vaddr`.
    pub fn update_pte(
        &mut self,
        space: SpaceId,
        vaddr: VirtAddr,
        edit: impl FnOnce(&mut Pte),
    ) -> Result<Pte, MemError> {
        let record = self.spaces.get(space).ok_or(MemError::NotPresent)?;
        let entry = record.top[vaddr.top_index()].ok_or(MemError::NotPresent)?;
        let table = self.leaves.get_mut(entry.leaf).expect("live leaf");
        let pte = &mut table.ptes[vaddr.leaf_index()];
        if pte.is_empty() {
            return Err(MemError::NotPresent);
        }
        edit(pte);
        Ok(*pte)
    }

    /// Count a translation-cache flush for `space`.
    pub fn flush_tlb(&mut self, space: SpaceId) {
        if let Some(record) = self.spaces.get_mut(space) {
            record.tlb_flushes += 1;
        }
    }

    pub fn tlb_flushes(&self, space: SpaceId) -> u64 {
        self.spaces.get(space).map_or(0, |s| s.tlb_flushes)
    }

    pub fn space_count(&self) -> usize {
        self.spaces.len()
    }

    pub fn contains(&self, space: SpaceId) -> bool {
        self.spaces.contains(space)
    }

    /// Present user-range mappings of a space, for fork and cleanup
    /// walks.
    pub fn user_mappings(&self, space: SpaceId) -> Vec<(VirtAddr, Pte)> {
        let mut out = Vec::new();
        let record = match self.spaces.get(space) {
            Some(record) => record,
            None => return out,
        };
        for (slot, entry) in record.top.iter().enumerate().skip(KERNEL_TOP_SLOTS) {
            let entry = match entry {
                Some(entry) if !entry.kernel_shared => entry,
                _ => continue,
            };
            let table = self.leaves.get(entry.leaf).expect("live leaf");
            for (index, pte) in table.ptes.iter().enumerate() {
                if pte.is_present() {
                    let vaddr =
                        VirtAddr::from_raw(((slot as u32) << 22) | ((index as u32) << 12));
                    out.push((vaddr, *pte));
                }
            }
        }
        out
    }

    /// Swap references still encoded in a space's tables.
    pub fn swap_refs(&self, space: SpaceId) -> Vec<(VirtAddr, SwapRef)> {
        let mut out = Vec::new();
        let record = match self.spaces.get(space) {
            Some(record) => record,
            None => return out,
        };
        for (slot, entry) in record.top.iter().enumerate() {
            let entry = match entry {
                Some(entry) if !entry.kernel_shared => entry,
                _ => continue,
            };
            let table = self.leaves.get(entry.leaf).expect("live leaf");
            for (index, pte) in table.ptes.iter().enumerate() {
                if let Some(swap) = pte.swap_ref() {
                    let vaddr =
                        VirtAddr::from_raw(((slot as u32) << 22) | ((index as u32) << 12));
                    out.push((vaddr, swap));
                }
            }
        }
        out
    }

    // VM areas: sorted, non-overlapping bookkeeping for the mmap/fork
    // collaborators.

    pub fn add_area(
        &mut self,
        space: SpaceId,
        start: VirtAddr,
        end: VirtAddr,
        flags: VmFlags,
    ) -> Result<(), MemError> {
        if start >= end || !start.is_page_aligned() || !end.is_page_aligned() {
            return Err(MemError::InvalidArgument);
        }
        let record = self.spaces.get_mut(space).ok_or(MemError::NotPresent)?;
        let pos = record.areas.partition_point(|a| a.start < start);
        let overlaps_prev = pos > 0 && record.areas[pos - 1].end > start;
        let overlaps_next = pos < record.areas.len() && record.areas[pos].start < end;
        if overlaps_prev || overlaps_next {
            return Err(MemError::InvalidArgument);
        }
        record.areas.insert(pos, VmArea { start, end, flags });
        Ok(())
    }

    pub fn remove_area(&mut self, space: SpaceId, start: VirtAddr) -> Result<VmArea, MemError> {
        let record = self.spaces.get_mut(space).ok_or(MemError::NotPresent)?;
        let pos = record
            .areas
            .iter()
            .position(|a| a.start == start)
            .ok_or(MemError::NotPresent)?;
        Ok(record.areas.remove(pos))
    }

    pub fn find_area(&self, space: SpaceId, vaddr: VirtAddr) -> Option<VmArea> {
        let record = self.spaces.get(space)?;
        let pos = record.areas.partition_point(|a| a.start <= vaddr);
        let area = record.areas.get(pos.checked_sub(1)?)?;
        (vaddr < area.end).then_some(*area)
    }

    pub fn areas(&self, space: SpaceId) -> &[VmArea] {
        self.spaces
            .get(space)
            .map_or(&[][..], |record| &record.areas)
    }

    /// Get (or lazily build) the leaf covering `vaddr`. A new leaf in the
    /// kernel range is installed shared into every live space.
    fn ensure_leaf(
        &mut self,
        frames: &mut FramePool,
        space: SpaceId,
        vaddr: VirtAddr,
    ) -> Result<LeafId, MemError> {
        let slot = vaddr.top_index();
        let kernel_range = slot < KERNEL_TOP_SLOTS;
        let home = if kernel_range { self.kernel_space } else { space };

        let record = self.spaces.get(home).ok_or(MemError::NotPresent)?;
        if let Some(entry) = record.top[slot] {
            return Ok(entry.leaf);
        }

        let backing_frame = frames.alloc_frame().ok_or(MemError::OutOfMemory)?;
        let leaf = self.leaves.insert(LeafTable {
            ptes: Box::new([Pte::EMPTY; LEAF_SLOTS]),
            backing_frame,
        });

        if kernel_range {
            // Kernel leaves appear in every space, marked shared so no
            // space ever frees them with itself.
            for id in self.spaces.ids() {
                let record = self.spaces.get_mut(id).expect("live space");
                record.top[slot] = Some(TopEntry {
                    leaf,
                    kernel_shared: true,
                });
            }
        } else {
            let record = self.spaces.get_mut(space).ok_or(MemError::NotPresent)?;
            record.top[slot] = Some(TopEntry {
                leaf,
                kernel_shared: false,
            });
        }
        Ok(leaf)
    }
}
