//! Copy-on-write sharing of physical frames across address spaces.
//!
//! A descriptor keyed by frame carries the share count; fork write-protects
//! both sides and bumps it, a write fault breaks the sharing for exactly
//! one side. The ordering is strict: increments happen before the child
//! mapping becomes visible, decrements after the owner's mapping is gone.

use alloc::collections::BTreeMap;

use crate::addr::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::error::MemError;
use crate::paging::{Pte, PteFlags};
use crate::phys::{FramePool, PhysMemory};
use crate::vmm::{SpaceId, Vmm};

const COW_MAGIC: u32 = 0x0c0b_abe1;
const MAX_COW_REFS: u32 = 65536;

struct CowDescriptor {
    ref_count: u32,
    magic: u32,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CowStats {
    pub forked_pages: u64,
    pub breaks: u64,
    pub write_enables: u64,
}

/// Outcome of a write-fault delegation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultResult {
    /// Mapping fixed up; the faulting task retries the access.
    Handled,
    /// Not a COW situation; the caller continues its dispatch.
    Unhandled,
}

pub struct CowManager {
    descriptors: BTreeMap<u32, CowDescriptor>,
    stats: CowStats,
}

impl CowManager {
    pub fn new() -> CowManager {
        CowManager {
            descriptors: BTreeMap::new(),
            stats: CowStats::default(),
        }
    }

    /// Share the parent's present user pages in `[start, end)` into the
    /// child, read-only on both sides. The parent's translation cache is
    /// flushed once at the end.
    pub fn fork_range(
        &mut self,
        vmm: &mut Vmm,
        frames: &mut FramePool,
        child: SpaceId,
        parent: SpaceId,
        start: VirtAddr,
        end: VirtAddr,
    ) -> Result<(), MemError> {
        if start > end || !start.is_page_aligned() {
            return Err(MemError::InvalidArgument);
        }

        let mut vaddr = start;
        while vaddr < end {
            let pte = vmm.pte(parent, vaddr);
            if let Some(pte) = pte {
                if pte.is_present() {
                    let frame = pte.frame();

                    // Write-protect the parent before anything is shared.
                    vmm.update_pte(parent, vaddr, |p| {
                        p.remove_flags(PteFlags::WRITABLE);
                    })?;

                    // Count the child's reference before its mapping
                    // exists.
                    self.retain(frame);

                    let child_flags = pte.flags() & !PteFlags::WRITABLE;
                    vmm.map(frames, child, vaddr, frame, child_flags)?;
                    self.stats.forked_pages += 1;
                }
            }
            vaddr = match vaddr.offset_by(PAGE_SIZE) {
                Some(next) => next,
                None => break,
            };
        }

        vmm.flush_tlb(parent);
        Ok(())
    }

    /// Handle a write fault on a present read-only page at `vaddr`.
    pub fn handle_write_fault(
        &mut self,
        vmm: &mut Vmm,
        frames: &mut FramePool,
        mem: &mut PhysMemory,
        space: SpaceId,
        vaddr: VirtAddr,
    ) -> Result<FaultResult, MemError> {
        let page = vaddr.page_base();
        let pte = match vmm.pte(space, page) {
            Some(pte) if pte.is_present() => pte,
            _ => return Ok(FaultResult::Unhandled),
        };
        if pte.flags().contains(PteFlags::WRITABLE) {
            return Ok(FaultResult::Unhandled);
        }
        let frame = pte.frame();

        let ref_count = self.ref_count(frame);
        if ref_count <= 1 {
            // Sole owner (or a plain read-only mapping): write access can
            // simply be re-enabled. The descriptor, if any, is retired
            // without touching the frame.
            vmm.update_pte(space, page, |p| {
                p.insert_flags(PteFlags::WRITABLE);
            })?;
            self.descriptors.remove(&frame.as_raw());
            vmm.flush_tlb(space);
            self.stats.write_enables += 1;
            return Ok(FaultResult::Handled);
        }

        // Shared: copy into a private frame and drop our reference to the
        // old one.
        let fresh = frames.alloc_frame().ok_or(MemError::OutOfMemory)?;
        mem.copy_frame(frame, fresh)?;

        let flags = pte.flags() | PteFlags::WRITABLE;
        let mut new_pte = Pte::present(fresh, flags);
        new_pte.remove_flags(PteFlags::ACCESSED | PteFlags::DIRTY);
        vmm.set_pte(space, page, new_pte)?;
        self.release(frames, frame);
        vmm.flush_tlb(space);
        self.stats.breaks += 1;
        Ok(FaultResult::Handled)
    }

    /// Drop every reference a dying space holds: shared frames are
    /// released through their descriptors, private frames go straight
    /// back to the pool. The space's user mappings are cleared.
    pub fn cleanup_space(
        &mut self,
        vmm: &mut Vmm,
        frames: &mut FramePool,
        space: SpaceId,
    ) -> Result<(), MemError> {
        for (vaddr, pte) in vmm.user_mappings(space) {
            let frame = pte.frame();
            vmm.take_pte(space, vaddr)?;
            if self.descriptors.contains_key(&frame.as_raw()) {
                self.release(frames, frame);
            } else {
                frames.free_frame(frame);
            }
        }
        vmm.flush_tlb(space);
        Ok(())
    }

    /// Is `frame` tracked by a descriptor?
    pub fn is_shared(&self, frame: PhysAddr) -> bool {
        self.descriptors.contains_key(&frame.as_raw())
    }

    pub fn ref_count(&self, frame: PhysAddr) -> u32 {
        self.descriptors
            .get(&frame.as_raw())
            .map_or(0, |d| d.ref_count)
    }

    /// Add a reference to `frame`, creating the descriptor (one reference
    /// for the current owner) on first sight.
    pub fn retain(&mut self, frame: PhysAddr) {
        let descriptor = self
            .descriptors
            .entry(frame.as_raw())
            .or_insert(CowDescriptor {
                ref_count: 1,
                magic: COW_MAGIC,
            });
        if descriptor.ref_count < MAX_COW_REFS {
            descriptor.ref_count += 1;
        }
    }

    /// Drop a reference; the frame is freed when the last one goes.
    pub fn release(&mut self, frames: &mut FramePool, frame: PhysAddr) {
        let Some(descriptor) = self.descriptors.get_mut(&frame.as_raw()) else {
            return;
        };
        if descriptor.magic != COW_MAGIC {
            log::error!("cow: descriptor for {frame:?} has bad magic");
            return;
        }
        descriptor.ref_count = descriptor.ref_count.saturating_sub(1);
        if descriptor.ref_count == 0 {
            self.descriptors.remove(&frame.as_raw());
            frames.free_frame(frame);
        }
    }

    /// Track a frame with a single owner (used when a page is first made
    /// shareable).
    pub fn track(&mut self, frame: PhysAddr) {
        self.descriptors
            .entry(frame.as_raw())
            .or_insert(CowDescriptor {
                ref_count: 1,
                magic: COW_MAGIC,
            });
    }

    pub fn descriptor_count(&self) -> usize {
        self.descriptors.len()
    }

    pub fn total_refs(&self) -> u64 {
        self.descriptors.values().map(|d| d.ref_count as u64).sum()
    }

    /// Count corrupt descriptors (bad magic or a zero reference count).
    pub fn validate(&self) -> u32 {
        let mut errors = 0;
        for (frame, descriptor) in &self.descriptors {
            if descriptor.magic != COW_MAGIC {
                log::error!("cow: bad magic on descriptor for frame {frame:#x}");
                errors += 1;
            }
            if descriptor.ref_count == 0 || descriptor.ref_count > MAX_COW_REFS {
                log::error!("cow: bad ref count on descriptor for frame {frame:#x}");
                errors += 1;
            }
        }
        errors
    }

    pub fn stats(&self) -> CowStats {
        self.stats
    }
}

impl Default for CowManager {
    fn default() -> Self {
        CowManager::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::USER_START;

    struct Fixture {
        mem: PhysMemory,
        frames: FramePool,
        vmm: Vmm,
        cow: CowManager,
    }

    fn fixture() -> Fixture {
        let mut frames = FramePool::new(128, 4);
        let vmm = Vmm::new(&mut frames).unwrap();
        Fixture {
            mem: PhysMemory::new(128),
            frames,
            vmm,
            cow: CowManager::new(),
        }
    }

    fn upage(n: u32) -> VirtAddr {
        VirtAddr::from_raw(USER_START + n * PAGE_SIZE)
    }

    impl Fixture {
        fn map_user_page(&mut self, space: SpaceId, n: u32, fill: u8) -> PhysAddr {
            let frame = self.frames.alloc_frame().unwrap();
            self.mem.fill(frame, PAGE_SIZE, fill).unwrap();
            self.vmm
                .map(
                    &mut self.frames,
                    space,
                    upage(n),
                    frame,
                    PteFlags::WRITABLE | PteFlags::USER,
                )
                .unwrap();
            frame
        }
    }

    #[test]
    fn fork_shares_read_only() {
        let mut f = fixture();
        let parent = f.vmm.create_address_space(&mut f.frames).unwrap();
        let child = f.vmm.create_address_space(&mut f.frames).unwrap();
        let frame = f.map_user_page(parent, 0, 0xaa);

        let flushes = f.vmm.tlb_flushes(parent);
        f.cow
            .fork_range(&mut f.vmm, &mut f.frames, child, parent, upage(0), upage(1))
            .unwrap();
        assert_eq!(f.vmm.tlb_flushes(parent), flushes + 1);

        // Both sides alias the frame, read-only.
        assert_eq!(f.vmm.translate(parent, upage(0)), Some(frame));
        assert_eq!(f.vmm.translate(child, upage(0)), Some(frame));
        for space in [parent, child] {
            let pte = f.vmm.pte(space, upage(0)).unwrap();
            assert!(!pte.flags().contains(PteFlags::WRITABLE));
        }
        assert_eq!(f.cow.ref_count(frame), 2);

        // The shared page reads the parent's pattern through the child.
        let paddr = f.vmm.translate(child, upage(0)).unwrap();
        assert!(f
            .mem
            .bytes(paddr, PAGE_SIZE)
            .unwrap()
            .iter()
            .all(|&b| b == 0xaa));
    }

    #[test]
    fn write_fault_breaks_sharing() {
        let mut f = fixture();
        let parent = f.vmm.create_address_space(&mut f.frames).unwrap();
        let child = f.vmm.create_address_space(&mut f.frames).unwrap();
        let frame = f.map_user_page(parent, 0, 0xaa);
        f.cow
            .fork_range(&mut f.vmm, &mut f.frames, child, parent, upage(0), upage(1))
            .unwrap();

        // Parent writes: gets a private copy.
        let result = f
            .cow
            .handle_write_fault(&mut f.vmm, &mut f.frames, &mut f.mem, parent, upage(0))
            .unwrap();
        assert_eq!(result, FaultResult::Handled);

        let parent_frame = f.vmm.pte(parent, upage(0)).unwrap().frame();
        let child_frame = f.vmm.pte(child, upage(0)).unwrap().frame();
        assert_ne!(parent_frame, child_frame);
        assert_eq!(child_frame, frame);
        assert!(f
            .vmm
            .pte(parent, upage(0))
            .unwrap()
            .flags()
            .contains(PteFlags::WRITABLE));

        // The copy carries the original contents; simulate the retried
        // write.
        assert!(f
            .mem
            .bytes(parent_frame, PAGE_SIZE)
            .unwrap()
            .iter()
            .all(|&b| b == 0xaa));
        f.mem.fill(parent_frame, PAGE_SIZE, 0x55).unwrap();
        assert!(f
            .mem
            .bytes(child_frame, PAGE_SIZE)
            .unwrap()
            .iter()
            .all(|&b| b == 0xaa));

        // One reference left on the old frame.
        assert_eq!(f.cow.ref_count(frame), 1);
    }

    #[test]
    fn last_reference_write_fault_skips_copy() {
        let mut f = fixture();
        let parent = f.vmm.create_address_space(&mut f.frames).unwrap();
        let child = f.vmm.create_address_space(&mut f.frames).unwrap();
        let frame = f.map_user_page(parent, 0, 0x11);
        f.cow
            .fork_range(&mut f.vmm, &mut f.frames, child, parent, upage(0), upage(1))
            .unwrap();

        // Child breaks first (copies), leaving the parent sole owner.
        f.cow
            .handle_write_fault(&mut f.vmm, &mut f.frames, &mut f.mem, child, upage(0))
            .unwrap();
        assert_eq!(f.cow.ref_count(frame), 1);

        let used = f.frames.frames_used();
        let result = f
            .cow
            .handle_write_fault(&mut f.vmm, &mut f.frames, &mut f.mem, parent, upage(0))
            .unwrap();
        assert_eq!(result, FaultResult::Handled);
        // No copy: same frame, now writable, descriptor gone.
        assert_eq!(f.frames.frames_used(), used);
        assert_eq!(f.vmm.pte(parent, upage(0)).unwrap().frame(), frame);
        assert!(!f.cow.is_shared(frame));
    }

    #[test]
    fn write_fault_on_writable_page_is_unhandled() {
        let mut f = fixture();
        let parent = f.vmm.create_address_space(&mut f.frames).unwrap();
        f.map_user_page(parent, 0, 0);
        let result = f
            .cow
            .handle_write_fault(&mut f.vmm, &mut f.frames, &mut f.mem, parent, upage(0))
            .unwrap();
        assert_eq!(result, FaultResult::Unhandled);
    }

    #[test]
    fn cleanup_space_releases_references() {
        let mut f = fixture();
        let parent = f.vmm.create_address_space(&mut f.frames).unwrap();
        let child = f.vmm.create_address_space(&mut f.frames).unwrap();
        let shared = f.map_user_page(parent, 0, 0);
        let _private = f.map_user_page(parent, 1, 0);
        f.cow
            .fork_range(&mut f.vmm, &mut f.frames, child, parent, upage(0), upage(1))
            .unwrap();
        assert_eq!(f.cow.ref_count(shared), 2);

        f.cow
            .cleanup_space(&mut f.vmm, &mut f.frames, parent)
            .unwrap();
        // Shared frame survives under the child's reference; the private
        // one went back to the pool.
        assert_eq!(f.cow.ref_count(shared), 1);
        assert!(f.frames.is_used(shared));
        assert_eq!(f.vmm.user_mappings(parent).len(), 0);

        f.cow
            .cleanup_space(&mut f.vmm, &mut f.frames, child)
            .unwrap();
        assert!(!f.cow.is_shared(shared));
        assert!(!f.frames.is_used(shared));
    }

    #[test]
    fn refcount_equals_mapping_count() {
        // Invariant: a frame's descriptor count matches the number of
        // (space, vaddr) pairs translating to it.
        let mut f = fixture();
        let parent = f.vmm.create_address_space(&mut f.frames).unwrap();
        let frame = f.map_user_page(parent, 0, 0);

        let mut children = Vec::new();
        for _ in 0..3 {
            let child = f.vmm.create_address_space(&mut f.frames).unwrap();
            f.cow
                .fork_range(&mut f.vmm, &mut f.frames, child, parent, upage(0), upage(1))
                .unwrap();
            children.push(child);
        }

        let mut mappings = 0;
        for space in children.iter().copied().chain([parent]) {
            if f.vmm.translate(space, upage(0)) == Some(frame) {
                mappings += 1;
            }
        }
        assert_eq!(f.cow.ref_count(frame), mappings);
        assert_eq!(f.cow.validate(), 0);
    }

    #[test]
    fn mass_descriptor_teardown_restores_pool() {
        let mut frames = FramePool::new(10_050, 4);
        let mut cow = CowManager::new();
        let used_before = frames.frames_used();

        let mut tracked = Vec::new();
        for _ in 0..10_000 {
            let frame = frames.alloc_frame().unwrap();
            cow.track(frame);
            tracked.push(frame);
        }
        assert_eq!(cow.descriptor_count(), 10_000);

        for frame in tracked {
            cow.release(&mut frames, frame);
        }
        assert_eq!(cow.descriptor_count(), 0);
        assert_eq!(frames.frames_used(), used_before);
    }
}
