//! The memory core: every subsystem owned by one aggregate.
//!
//! Construction wires the layers bottom-up (frames, then the buddy zone
//! and the allocators over it, then the VMM, then the sharing and
//! eviction machinery); teardown is the reverse, which field order gives
//! for free. Cross-subsystem flows (fault dispatch, reclaim-and-retry,
//! fork, space teardown) live here, so no subsystem ever reaches
//! sideways into another.

use alloc::boxed::Box;

use bitflags::bitflags;
use spin::Mutex;

use crate::addr::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::buddy::BuddyAllocator;
use crate::cow::{CowManager, FaultResult};
use crate::error::{FatalFault, MemError};
use crate::kalloc::{AllocFlags, Policy, SystemMode, UnifiedAllocator};
use crate::paging::{in_kernel_heap, in_user_range, PteFlags};
use crate::phys::{FramePool, PhysMemory};
use crate::replace::{Algorithm, PageFlags, Replacer, ALGORITHM_COUNT};
use crate::stats::MemoryStats;
use crate::swap::{PressureLevel, SwapBacking, SwapManager};
use crate::vmm::{SpaceId, Vmm};

bitflags! {
    /// Page-fault error code bits, as delivered by the trap handler.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct FaultCode: u32 {
        /// Fault on a present page (protection), not a missing one.
        const PRESENT = 1 << 0;
        const WRITE   = 1 << 1;
        const USER    = 1 << 2;
    }
}

/// What the trap handler should do after a fault.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultOutcome {
    /// Fixed up; the faulting task retries the access.
    Handled,
    /// Escalate: the scheduler terminates the task (or halts in kernel
    /// context).
    Fatal(FatalFault),
}

#[derive(Clone, Copy, Debug)]
pub struct CoreConfig {
    pub total_frames: u32,
    /// Low frames pre-marked in use (BIOS, kernel image, bookkeeping).
    pub reserved_low_frames: u32,
    /// Contiguous frames carved out for the buddy zone.
    pub buddy_frames: u32,
    pub mode: SystemMode,
    pub algorithm: Algorithm,
    /// Let pressure transitions re-pick the replacement algorithm.
    pub auto_tune: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            total_frames: 2048,
            reserved_low_frames: 16,
            buddy_frames: 1024,
            mode: SystemMode::Desktop,
            algorithm: Algorithm::Lru,
            auto_tune: true,
        }
    }
}

pub struct MemoryCore {
    config: CoreConfig,
    mem: PhysMemory,
    frames: FramePool,
    unified: UnifiedAllocator,
    vmm: Vmm,
    cow: CowManager,
    replace: Replacer,
    swap: SwapManager,
    alloc_failed: bool,
    last_pressure: PressureLevel,
}

impl MemoryCore {
    pub fn new(config: CoreConfig) -> Result<MemoryCore, MemError> {
        if config.buddy_frames == 0
            || config.reserved_low_frames + config.buddy_frames > config.total_frames
        {
            return Err(MemError::InvalidArgument);
        }
        let mem = PhysMemory::new(config.total_frames);
        let mut frames = FramePool::new(config.total_frames, config.reserved_low_frames);

        let zone_start = frames
            .find_free_run(config.buddy_frames)
            .ok_or(MemError::OutOfMemory)?;
        frames.reserve_range(zone_start, config.buddy_frames)?;
        let buddy = BuddyAllocator::new(
            PhysAddr::from_frame_index(zone_start),
            config.buddy_frames,
        );

        let unified = UnifiedAllocator::new(config.mode, buddy);
        let vmm = Vmm::new(&mut frames)?;
        let replace = Replacer::new(config.algorithm);

        log::info!(
            "core: {} frames, buddy zone {} frames at index {zone_start}, mode {:?}",
            config.total_frames,
            config.buddy_frames,
            config.mode
        );

        Ok(MemoryCore {
            config,
            mem,
            frames,
            unified,
            vmm,
            cow: CowManager::new(),
            replace,
            swap: SwapManager::new(),
            alloc_failed: false,
            last_pressure: PressureLevel::None,
        })
    }

    // --- Kernel allocator façade ---

    /// Allocate through the unified policy engine. On failure (and
    /// without `ATOMIC`) a reclaim pass runs and the allocation retries
    /// exactly once.
    pub fn alloc(&mut self, size: u32, flags: AllocFlags) -> Option<PhysAddr> {
        if size == 0 {
            return None;
        }
        if let Some(addr) = self.unified.alloc(&mut self.mem, size, flags) {
            self.alloc_failed = false;
            return Some(addr);
        }
        self.alloc_failed = true;
        if flags.contains(AllocFlags::ATOMIC) {
            return None;
        }

        let target = UnifiedAllocator::reclaim_target(size);
        self.reclaim(target);
        let retry = self.unified.alloc(&mut self.mem, size, flags);
        if retry.is_some() {
            self.alloc_failed = false;
        }
        self.maybe_auto_tune();
        retry
    }

    pub fn free(&mut self, addr: PhysAddr) -> Result<(), MemError> {
        self.unified.free(&mut self.mem, addr)
    }

    pub fn realloc(
        &mut self,
        addr: Option<PhysAddr>,
        new_size: u32,
        flags: AllocFlags,
    ) -> Option<PhysAddr> {
        self.unified.realloc(&mut self.mem, addr, new_size, flags)
    }

    pub fn calloc(&mut self, count: u32, size: u32, flags: AllocFlags) -> Option<PhysAddr> {
        let total = count.checked_mul(size)?;
        self.alloc(total, flags | AllocFlags::ZERO)
    }

    pub fn alloc_pages(&mut self, order: u8) -> Option<PhysAddr> {
        if let Some(addr) = self.unified.alloc_pages(order) {
            return Some(addr);
        }
        self.alloc_failed = true;
        self.reclaim(1u32 << order.min(10));
        let retry = self.unified.alloc_pages(order);
        if retry.is_some() {
            self.alloc_failed = false;
        }
        retry
    }

    pub fn set_mode(&mut self, mode: SystemMode) {
        self.unified.set_mode(mode);
    }

    pub fn set_policy(&mut self, policy: Policy) {
        self.unified.set_policy(policy);
    }

    // --- VM façade ---

    pub fn create_address_space(&mut self) -> Result<SpaceId, MemError> {
        self.vmm.create_address_space(&mut self.frames)
    }

    /// Tear down a space: swap slots released, shared frames
    /// dereferenced, resident-set entries dropped, then the tables
    /// themselves.
    pub fn destroy_address_space(&mut self, space: SpaceId) -> Result<(), MemError> {
        for (_, swap) in self.vmm.swap_refs(space) {
            self.swap.release_slot(swap);
        }
        self.cow
            .cleanup_space(&mut self.vmm, &mut self.frames, space)?;
        self.replace.remove_owned(space);
        self.vmm.destroy_address_space(&mut self.frames, space)
    }

    pub fn map(
        &mut self,
        space: SpaceId,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        flags: PteFlags,
    ) -> Result<(), MemError> {
        self.vmm.map(&mut self.frames, space, vaddr, paddr, flags)?;
        if in_user_range(vaddr) && flags.contains(PteFlags::USER) {
            self.replace
                .add_page(vaddr.page_base(), paddr, PageFlags::empty(), space);
        }
        Ok(())
    }

    pub fn unmap(&mut self, space: SpaceId, vaddr: VirtAddr) -> Result<(), MemError> {
        let page = vaddr.page_base();
        let pte = self.vmm.pte(space, page).ok_or(MemError::NotPresent)?;

        if let Some(swap) = pte.swap_ref() {
            self.vmm.take_pte(space, page)?;
            self.swap.release_slot(swap);
            return Ok(());
        }
        if !pte.is_present() {
            return Err(MemError::NotPresent);
        }

        self.replace.remove_page(page);
        let frame = pte.frame();
        if self.cow.is_shared(frame) {
            // Shared frame: the reference count decides its fate.
            self.vmm.take_pte(space, page)?;
            self.cow.release(&mut self.frames, frame);
            self.vmm.flush_tlb(space);
        } else {
            self.vmm.unmap(&mut self.frames, space, page)?;
        }
        Ok(())
    }

    pub fn translate(&self, space: SpaceId, vaddr: VirtAddr) -> Option<PhysAddr> {
        self.vmm.translate(space, vaddr)
    }

    pub fn switch(&mut self, space: SpaceId) -> Result<(), MemError> {
        self.vmm.switch(space)
    }

    pub fn kernel_space(&self) -> SpaceId {
        self.vmm.kernel_space()
    }

    pub fn current_space(&self) -> SpaceId {
        self.vmm.current()
    }

    /// Record a resident-page access on behalf of the VMM's callers.
    pub fn note_access(&mut self, vaddr: VirtAddr) {
        self.replace.note_access(vaddr.page_base());
    }

    pub fn mark_dirty(&mut self, vaddr: VirtAddr) {
        self.replace.mark_dirty(vaddr.page_base());
    }

    pub fn lock_page(&mut self, vaddr: VirtAddr) {
        self.replace.lock_page(vaddr.page_base());
    }

    pub fn unlock_page(&mut self, vaddr: VirtAddr) {
        self.replace.unlock_page(vaddr.page_base());
    }

    // --- Fault entry ---

    /// Dispatch a page fault on the current address space. Order: COW
    /// write on a protected user page, lazy kernel heap, swapped-out
    /// page, fatal.
    pub fn handle_fault(&mut self, vaddr: VirtAddr, error: FaultCode) -> FaultOutcome {
        let page = vaddr.page_base();
        let space = self.vmm.current();
        let fatal = || {
            FaultOutcome::Fatal(FatalFault {
                vaddr,
                error_code: error.bits(),
            })
        };

        // 1. Write on a present read-only user page: copy-on-write.
        if in_user_range(page) && error.contains(FaultCode::WRITE) {
            match self
                .cow
                .handle_write_fault(&mut self.vmm, &mut self.frames, &mut self.mem, space, page)
            {
                Ok(FaultResult::Handled) => {
                    // The page is private and writable again: it rejoins
                    // the eviction pool.
                    if let Some(pte) = self.vmm.pte(space, page) {
                        if pte.is_present() {
                            self.replace
                                .add_page(page, pte.frame(), PageFlags::empty(), space);
                            self.replace.note_access(page);
                            self.replace.mark_dirty(page);
                        }
                    }
                    return FaultOutcome::Handled;
                }
                Ok(FaultResult::Unhandled) => {}
                Err(e) => {
                    log::error!("fault: copy-on-write break at {vaddr:?} failed: {e}");
                    return fatal();
                }
            }
        }

        // 2. Lazy kernel-heap growth on a not-present fault.
        if in_kernel_heap(page) && !error.contains(FaultCode::PRESENT) {
            let frame = match self.frame_with_reclaim() {
                Some(frame) => frame,
                None => {
                    log::error!("fault: out of memory growing kernel heap at {vaddr:?}");
                    return fatal();
                }
            };
            if let Err(e) =
                self.vmm
                    .map(&mut self.frames, space, page, frame, PteFlags::WRITABLE)
            {
                log::error!("fault: kernel heap map at {vaddr:?} failed: {e}");
                self.frames.free_frame(frame);
                return fatal();
            }
            self.vmm.flush_tlb(space);
            return FaultOutcome::Handled;
        }

        // 3. A swap reference brings the page back in.
        if let Some(swap) = self.vmm.pte(space, page).and_then(|p| p.swap_ref()) {
            let mut result = self.swap.swap_in(
                &mut self.vmm,
                &mut self.frames,
                &mut self.mem,
                &mut self.replace,
                space,
                page,
                swap,
            );
            if result == Err(MemError::OutOfMemory) {
                self.reclaim(1);
                result = self.swap.swap_in(
                    &mut self.vmm,
                    &mut self.frames,
                    &mut self.mem,
                    &mut self.replace,
                    space,
                    page,
                    swap,
                );
            }
            return match result {
                Ok(()) => {
                    self.replace.note_access(page);
                    self.maybe_auto_tune();
                    FaultOutcome::Handled
                }
                Err(e) => {
                    // The swap entry is still intact; escalate and let
                    // the scheduler decide.
                    log::error!("fault: swap-in at {vaddr:?} failed: {e}");
                    fatal()
                }
            };
        }

        log::error!(
            "fault: unhandled at {vaddr:?}, error {:#x}",
            error.bits()
        );
        fatal()
    }

    // --- Fork hook ---

    /// Share `[start, end)` of the parent into the child copy-on-write.
    /// Shared pages leave the eviction pool until a write re-privatizes
    /// them.
    pub fn cow_fork(
        &mut self,
        child: SpaceId,
        parent: SpaceId,
        start: VirtAddr,
        end: VirtAddr,
    ) -> Result<(), MemError> {
        self.cow
            .fork_range(&mut self.vmm, &mut self.frames, child, parent, start, end)?;

        // Shared pages leave the eviction pool until a write
        // re-privatizes them.
        let mut vaddr = start.page_base();
        while vaddr < end {
            self.replace.remove_page(vaddr);
            vaddr = match vaddr.offset_by(PAGE_SIZE) {
                Some(next) => next,
                None => break,
            };
        }

        // The child inherits the parent's area bookkeeping over the
        // forked range.
        let inherited: alloc::vec::Vec<crate::vmm::VmArea> = self
            .vmm
            .areas(parent)
            .iter()
            .copied()
            .filter(|a| a.start >= start && a.end <= end)
            .collect();
        for area in inherited {
            self.vmm.add_area(child, area.start, area.end, area.flags)?;
        }
        Ok(())
    }

    // --- Pressure hook ---

    pub fn pressure(&self) -> PressureLevel {
        self.swap.pressure(&self.frames, self.alloc_failed)
    }

    /// Swap out up to `target` victims; returns how many went.
    pub fn reclaim(&mut self, target: u32) -> u32 {
        let reclaimed = self.swap.reclaim(
            &mut self.vmm,
            &mut self.frames,
            &self.mem,
            &mut self.replace,
            target,
        );
        self.maybe_auto_tune();
        reclaimed
    }

    // --- Swap admin hook ---

    pub fn swap_on(
        &mut self,
        path: &str,
        priority: u32,
        backing: Box<dyn SwapBacking>,
    ) -> Result<u8, MemError> {
        self.swap.swap_on(path, priority, backing)
    }

    pub fn swap_off(&mut self, path: &str) -> Result<(), MemError> {
        self.swap.swap_off(path)
    }

    // --- Replacement admin ---

    pub fn set_algorithm(&mut self, algorithm: Algorithm) {
        self.replace.set_algorithm(algorithm);
    }

    pub fn algorithm(&self) -> Algorithm {
        self.replace.algorithm()
    }

    // --- Statistics and introspection ---

    pub fn stats(&self) -> MemoryStats {
        let algorithms = [
            Algorithm::Lru,
            Algorithm::Fifo,
            Algorithm::Clock,
            Algorithm::LruEnhanced,
        ];
        let mut replace = [Default::default(); ALGORITHM_COUNT];
        for (slot, algorithm) in replace.iter_mut().zip(algorithms) {
            *slot = self.replace.stats(algorithm);
        }
        MemoryStats {
            frames_total: self.frames.frames_total(),
            frames_used: self.frames.frames_used(),
            frames_free: self.frames.frames_free(),
            cow_pages: self.cow.descriptor_count() as u64,
            cow_refs: self.cow.total_refs(),
            pressure: self.pressure(),
            alloc: self.unified.stats(),
            swap: self.swap.stats(),
            replace,
        }
    }

    /// Count of corrupt COW descriptors plus stack-frame canary damage.
    pub fn validate(&self) -> u32 {
        let mut errors = self.cow.validate();
        if self
            .unified
            .stack
            .check_integrity(&self.mem)
            .is_err()
        {
            errors += 1;
        }
        errors
    }

    pub fn mem(&self) -> &PhysMemory {
        &self.mem
    }

    pub fn mem_mut(&mut self) -> &mut PhysMemory {
        &mut self.mem
    }

    pub fn frames(&self) -> &FramePool {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut FramePool {
        &mut self.frames
    }

    pub fn vmm(&self) -> &Vmm {
        &self.vmm
    }

    pub fn vmm_mut(&mut self) -> &mut Vmm {
        &mut self.vmm
    }

    fn frame_with_reclaim(&mut self) -> Option<PhysAddr> {
        if let Some(frame) = self.frames.alloc_frame() {
            return Some(frame);
        }
        self.alloc_failed = true;
        self.reclaim(1);
        let retry = self.frames.alloc_frame();
        if retry.is_some() {
            self.alloc_failed = false;
        }
        retry
    }

    /// On a pressure transition, re-pick the replacement algorithm from
    /// the tuning table (when enabled).
    fn maybe_auto_tune(&mut self) {
        let level = self.swap.pressure(&self.frames, self.alloc_failed);
        if level == self.last_pressure {
            return;
        }
        self.last_pressure = level;
        if self.config.auto_tune {
            let algorithm = Replacer::algorithm_for_pressure(self.frames.usage_percent());
            if algorithm != self.replace.algorithm() {
                log::info!(
                    "core: pressure {level:?}, switching replacement to {algorithm:?}"
                );
                self.replace.set_algorithm(algorithm);
            }
        }
    }
}

/// The shared handle other kernel subsystems hold. Single-processor
/// kernel: contention on this lock is a bug, so a failed try is a panic
/// rather than a spin.
pub struct LockedCore(Mutex<MemoryCore>);

impl LockedCore {
    pub fn new(core: MemoryCore) -> LockedCore {
        LockedCore(Mutex::new(core))
    }

    pub fn get(&self) -> spin::MutexGuard<'_, MemoryCore> {
        self.0.try_lock().expect("memory core lock is held")
    }
}
