//! Unified kernel allocator façade.
//!
//! Classifies each request by size, flags and system mode, then dispatches
//! to the buddy, the mode's object allocator, or the stack arena. Every
//! backing region is registered here, so `free` can route a bare pointer
//! back to its owner without the caller saying where it came from.

use bitflags::bitflags;
use num_derive::{FromPrimitive, ToPrimitive};

use crate::addr::{pages_for, PhysAddr};
use crate::buddy::{BuddyAllocator, BuddyStats, MAX_ORDER};
use crate::cache::{CacheStats, RegionOwner, RegionRegistry};
use crate::error::MemError;
use crate::phys::PhysMemory;
use crate::slab::SlabAllocator;
use crate::slob::SlobAllocator;
use crate::slub::{SlubAllocator, SlubStats};
use crate::stack::StackAllocator;

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct AllocFlags: u32 {
        /// Kernel context; the default.
        const KERNEL = 1 << 0;
        /// User-context accounting hint.
        const USER   = 1 << 1;
        /// Must be physically contiguous: forces the buddy.
        const DMA    = 1 << 2;
        /// No reclaim allowed on failure.
        const ATOMIC = 1 << 3;
        /// Zero the returned region.
        const ZERO   = 1 << 4;
        /// Scoped lifetime: prefer the stack arena when policy allows.
        const TEMP   = 1 << 5;
        const SCOPED = 1 << 6;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Policy: u32 {
        /// Let TEMP/SCOPED requests use the stack arena.
        const STACK_FOR_TEMP = 1 << 0;
    }
}

impl Default for Policy {
    fn default() -> Self {
        Policy::STACK_FOR_TEMP
    }
}

/// The system-wide allocator policy, selected at init and switchable.
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive, ToPrimitive)]
pub enum SystemMode {
    Embedded = 0,
    Desktop = 1,
    Server = 2,
    Realtime = 3,
}

/// Request size classes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SizeClass {
    Tiny,
    Small,
    Medium,
    Large,
    Huge,
}

impl SizeClass {
    pub fn of(size: u32) -> SizeClass {
        match size {
            0..=63 => SizeClass::Tiny,
            64..=511 => SizeClass::Small,
            512..=4095 => SizeClass::Medium,
            4096..=65535 => SizeClass::Large,
            _ => SizeClass::Huge,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct UnifiedStats {
    pub active_allocations: u64,
    pub stack_allocs: u64,
    pub fallback_allocs: u64,
    pub failed_allocs: u64,
    pub slab: CacheStats,
    pub slob: CacheStats,
    pub slub: SlubStats,
    pub buddy: BuddyStats,
}

pub struct UnifiedAllocator {
    mode: SystemMode,
    policy: Policy,
    pub(crate) buddy: BuddyAllocator,
    pub(crate) slab: SlabAllocator,
    pub(crate) slob: SlobAllocator,
    pub(crate) slub: SlubAllocator,
    pub(crate) stack: StackAllocator,
    registry: RegionRegistry,
    active_allocations: u64,
    stack_allocs: u64,
    fallback_allocs: u64,
    failed_allocs: u64,
}

impl UnifiedAllocator {
    /// Wrap a buddy zone. The object allocators start empty and grow from
    /// the buddy on demand.
    pub fn new(mode: SystemMode, buddy: BuddyAllocator) -> UnifiedAllocator {
        UnifiedAllocator {
            mode,
            policy: Policy::default(),
            buddy,
            slab: SlabAllocator::new(),
            slob: SlobAllocator::new(),
            slub: SlubAllocator::new(1),
            stack: StackAllocator::new(),
            registry: RegionRegistry::new(),
            active_allocations: 0,
            stack_allocs: 0,
            fallback_allocs: 0,
            failed_allocs: 0,
        }
    }

    pub fn mode(&self) -> SystemMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: SystemMode) {
        self.mode = mode;
    }

    pub fn set_policy(&mut self, policy: Policy) {
        self.policy = policy;
    }

    pub fn buddy_mut(&mut self) -> &mut BuddyAllocator {
        &mut self.buddy
    }

    pub fn buddy(&self) -> &BuddyAllocator {
        &self.buddy
    }

    pub fn stack_mut(&mut self) -> &mut StackAllocator {
        &mut self.stack
    }

    /// Allocate `size` bytes. Flag overrides run first (DMA to the buddy,
    /// TEMP/SCOPED to the stack), then the mode policy picks the object
    /// allocator for sub-page sizes; large requests go to the buddy. On
    /// primary failure the buddy is tried once; reclaim-and-retry is the
    /// aggregate's job.
    pub fn alloc(
        &mut self,
        mem: &mut PhysMemory,
        size: u32,
        flags: AllocFlags,
    ) -> Option<PhysAddr> {
        if size == 0 {
            return None;
        }

        let addr = self.dispatch(mem, size, flags);
        let addr = match addr {
            Some(addr) => addr,
            None => {
                self.failed_allocs += 1;
                return None;
            }
        };

        if flags.contains(AllocFlags::ZERO) {
            mem.fill(addr, size, 0).ok()?;
        }
        Some(addr)
    }

    fn dispatch(&mut self, mem: &mut PhysMemory, size: u32, flags: AllocFlags) -> Option<PhysAddr> {
        if flags.contains(AllocFlags::DMA) {
            return self.buddy_alloc_counted(size);
        }
        if flags.intersects(AllocFlags::TEMP | AllocFlags::SCOPED)
            && self.policy.contains(Policy::STACK_FOR_TEMP)
        {
            if let Some(addr) =
                self.stack
                    .alloc(mem, &mut self.buddy, &mut self.registry, size, 8)
            {
                self.stack_allocs += 1;
                return Some(addr);
            }
            // Stack exhausted; fall through to the normal path.
        }

        match SizeClass::of(size) {
            SizeClass::Tiny | SizeClass::Small | SizeClass::Medium => {
                if let Some(addr) = self.object_alloc(mem, size) {
                    self.active_allocations += 1;
                    return Some(addr);
                }
                // Fall back to the buddy exactly once.
                let addr = self.buddy_alloc_counted(size)?;
                self.fallback_allocs += 1;
                Some(addr)
            }
            SizeClass::Large | SizeClass::Huge => self.buddy_alloc_counted(size),
        }
    }

    fn buddy_alloc_counted(&mut self, size: u32) -> Option<PhysAddr> {
        let addr = self.buddy.alloc(size)?;
        self.active_allocations += 1;
        Some(addr)
    }

    fn object_alloc(&mut self, mem: &mut PhysMemory, size: u32) -> Option<PhysAddr> {
        match self.mode {
            SystemMode::Embedded => {
                self.slob
                    .alloc_sized(mem, &mut self.buddy, &mut self.registry, size)
            }
            SystemMode::Desktop | SystemMode::Realtime => {
                self.slab
                    .alloc_sized(mem, &mut self.buddy, &mut self.registry, size)
            }
            SystemMode::Server => {
                self.slub
                    .alloc_sized(mem, &mut self.buddy, &mut self.registry, size, 0)
            }
        }
    }

    /// Free a pointer previously returned by [`Self::alloc`]. The owning
    /// allocator is found through the region registry; unregistered
    /// pointers are forwarded to the buddy.
    pub fn free(&mut self, mem: &mut PhysMemory, addr: PhysAddr) -> Result<(), MemError> {
        match self.registry.lookup(addr) {
            Some(RegionOwner::Slab(cache)) => {
                self.slab.cache_free(mem, cache, addr)?;
            }
            Some(RegionOwner::Slub(cache)) => {
                self.slub.cache_free(mem, cache, 0, addr)?;
            }
            Some(RegionOwner::Slob) => {
                self.slob
                    .free(mem, &mut self.buddy, &mut self.registry, addr)?;
            }
            Some(RegionOwner::Stack) => {
                // Stack lifetimes end at checkpoint restore, never by
                // pointer. Tolerated as a no-op.
                log::debug!("kalloc: free of stack allocation {addr:?} ignored");
                return Ok(());
            }
            None => {
                self.buddy.free(addr)?;
            }
        }
        self.active_allocations = self.active_allocations.saturating_sub(1);
        Ok(())
    }

    /// Bytes usable at `addr`, as allocated.
    pub fn usable_size(&self, mem: &PhysMemory, addr: PhysAddr) -> Option<u32> {
        match self.registry.lookup(addr) {
            Some(RegionOwner::Slab(cache)) => self.slab.obj_size(cache),
            Some(RegionOwner::Slub(cache)) => self.slub.obj_size(cache),
            Some(RegionOwner::Slob) => {
                let header = PhysAddr::from_raw(addr.as_raw().checked_sub(4)?);
                mem.read_u32(header).ok()?.checked_sub(8)
            }
            Some(RegionOwner::Stack) => None,
            None => self.buddy.allocated_size(addr),
        }
    }

    pub fn realloc(
        &mut self,
        mem: &mut PhysMemory,
        addr: Option<PhysAddr>,
        new_size: u32,
        flags: AllocFlags,
    ) -> Option<PhysAddr> {
        let addr = match addr {
            Some(addr) => addr,
            None => return self.alloc(mem, new_size, flags),
        };
        if new_size == 0 {
            let _ = self.free(mem, addr);
            return None;
        }

        let old_size = self.usable_size(mem, addr)?;
        if new_size <= old_size {
            return Some(addr);
        }

        let new_addr = self.alloc(mem, new_size, flags)?;
        let copy = old_size.min(new_size);
        // Move the payload through a bounce buffer; source and
        // destination regions may belong to different allocators.
        let data: alloc::vec::Vec<u8> = mem.bytes(addr, copy).ok()?.to_vec();
        mem.bytes_mut(new_addr, copy).ok()?.copy_from_slice(&data);
        if self.free(mem, addr).is_err() {
            log::error!("kalloc: realloc source {addr:?} was not a live allocation");
        }
        Some(new_addr)
    }

    pub fn calloc(
        &mut self,
        mem: &mut PhysMemory,
        count: u32,
        size: u32,
        flags: AllocFlags,
    ) -> Option<PhysAddr> {
        let total = count.checked_mul(size)?;
        self.alloc(mem, total, flags | AllocFlags::ZERO)
    }

    /// Allocate `2^order` contiguous pages from the buddy.
    pub fn alloc_pages(&mut self, order: u8) -> Option<PhysAddr> {
        if order > MAX_ORDER {
            self.failed_allocs += 1;
            return None;
        }
        let addr = self.buddy.alloc_order(order);
        match addr {
            Some(addr) => {
                self.active_allocations += 1;
                Some(addr)
            }
            None => {
                self.failed_allocs += 1;
                None
            }
        }
    }

    /// Pages a reclaim pass should target after `size` failed to
    /// allocate.
    pub fn reclaim_target(size: u32) -> u32 {
        pages_for(size).max(1)
    }

    pub fn stats(&self) -> UnifiedStats {
        UnifiedStats {
            active_allocations: self.active_allocations,
            stack_allocs: self.stack_allocs,
            fallback_allocs: self.fallback_allocs,
            failed_allocs: self.failed_allocs,
            slab: self.slab.total_stats(),
            slob: self.slob.stats(),
            slub: self.slub.total_stats(),
            buddy: self.buddy.stats(),
        }
    }

    /// The region registry backing `free`'s owner routing.
    pub fn registry(&self) -> &RegionRegistry {
        &self.registry
    }
}
