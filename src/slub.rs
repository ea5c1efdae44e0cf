//! SLUB object allocator: per-CPU batches in front of per-cache slabs.
//!
//! The server-mode allocator. The hot path never touches a shared
//! structure: each logical CPU owns a bounded batch array and a fallback
//! free list, refilled by stealing from the cache's partial slabs. The
//! single-CPU build keeps the per-CPU array shape (only index 0 is used)
//! so the behavior is identical on either configuration.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use arrayvec::ArrayVec;

use crate::addr::PhysAddr;
use crate::buddy::{BuddyAllocator, MAX_ORDER};
use crate::cache::{
    self, CacheId, ObjectCtor, RegionOwner, RegionRegistry,
};
use crate::error::MemError;
use crate::phys::PhysMemory;

/// Objects held in a per-CPU batch; also the refill steal limit.
pub const BATCH_SIZE: usize = 16;

const MIN_OBJS_PER_SLAB: u32 = 8;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SlubStats {
    pub allocs: u64,
    pub frees: u64,
    pub corruptions: u64,
    pub batch_refills: u64,
    pub slab_grows: u64,
}

/// One CPU's private cache of free objects.
struct PerCpu {
    batch: ArrayVec<PhysAddr, BATCH_SIZE>,
    fallback_head: Option<PhysAddr>,
    fallback_len: u32,
}

impl PerCpu {
    fn new() -> PerCpu {
        PerCpu {
            batch: ArrayVec::new(),
            fallback_head: None,
            fallback_len: 0,
        }
    }
}

struct Slab {
    region: PhysAddr,
    free_head: Option<PhysAddr>,
    free_objs: u32,
}

struct SlubCache {
    #[allow(dead_code)]
    name: String,
    obj_size: u32,
    slot_size: u32,
    objs_per_slab: u32,
    slab_order: u8,
    ctor: Option<ObjectCtor>,
    dtor: Option<ObjectCtor>,
    slabs: Vec<Slab>,
    /// Slabs with at least one un-stolen object.
    partial: Vec<usize>,
    by_region: BTreeMap<u32, usize>,
    percpu: Vec<PerCpu>,
    stats: SlubStats,
}

pub struct SlubAllocator {
    caches: Vec<Option<SlubCache>>,
    size_classes: [Option<CacheId>; cache::SIZE_CLASSES.len()],
    cpus: usize,
}

impl SlubAllocator {
    /// `cpus` is the number of logical processors; pass 1 on a single-CPU
    /// configuration.
    pub fn new(cpus: usize) -> SlubAllocator {
        assert!(cpus >= 1);
        SlubAllocator {
            caches: Vec::new(),
            size_classes: [None; cache::SIZE_CLASSES.len()],
            cpus,
        }
    }

    pub fn cache_create(
        &mut self,
        name: &str,
        obj_size: u32,
        align: u32,
        ctor: Option<ObjectCtor>,
        dtor: Option<ObjectCtor>,
    ) -> Result<CacheId, MemError> {
        if obj_size == 0 {
            return Err(MemError::InvalidArgument);
        }
        let slot_size = cache::slot_size(obj_size, align);
        let mut slab_order = 0;
        while slab_order < MAX_ORDER
            && BuddyAllocator::block_bytes(slab_order) / slot_size < MIN_OBJS_PER_SLAB
        {
            slab_order += 1;
        }
        let objs_per_slab = BuddyAllocator::block_bytes(slab_order) / slot_size;
        if objs_per_slab == 0 {
            return Err(MemError::InvalidArgument);
        }

        let id = CacheId(self.caches.len() as u32);
        self.caches.push(Some(SlubCache {
            name: String::from(name),
            obj_size,
            slot_size,
            objs_per_slab,
            slab_order,
            ctor,
            dtor,
            slabs: Vec::new(),
            partial: Vec::new(),
            by_region: BTreeMap::new(),
            percpu: (0..self.cpus).map(|_| PerCpu::new()).collect(),
            stats: SlubStats::default(),
        }));
        Ok(id)
    }

    pub fn cache_alloc(
        &mut self,
        mem: &mut PhysMemory,
        buddy: &mut BuddyAllocator,
        registry: &mut RegionRegistry,
        id: CacheId,
        cpu: usize,
    ) -> Option<PhysAddr> {
        let cache = self.cache_mut(id)?;
        debug_assert!(cpu < cache.percpu.len());

        let slot = match cache.percpu[cpu].batch.pop() {
            Some(slot) => slot,
            None => {
                // Drain the fallback list before going to shared state.
                if let Some(head) = cache.percpu[cpu].fallback_head {
                    let next = cache::read_next(mem, head).ok()?;
                    cache.percpu[cpu].fallback_head = next;
                    cache.percpu[cpu].fallback_len -= 1;
                    head
                } else {
                    Self::refill_batch(cache, mem, buddy, registry, id, cpu)?;
                    cache.percpu[cpu].batch.pop()?
                }
            }
        };

        cache::stamp_allocated(mem, slot).ok()?;
        cache.stats.allocs += 1;
        Some(cache::payload_of(slot))
    }

    pub fn cache_free(
        &mut self,
        mem: &mut PhysMemory,
        id: CacheId,
        cpu: usize,
        payload: PhysAddr,
    ) -> Result<(), MemError> {
        let cache = self.cache_mut(id).ok_or(MemError::InvalidArgument)?;
        if Self::slab_containing(cache, payload).is_none() {
            log::error!("slub: free of {payload:?} outside cache regions");
            cache.stats.corruptions += 1;
            return Err(MemError::Corruption);
        }
        let slot = match cache::check_allocated(mem, payload) {
            Ok(slot) => slot,
            Err(e) => {
                cache.stats.corruptions += 1;
                return Err(e);
            }
        };

        cache::write_free(mem, slot, None)?;
        let percpu = &mut cache.percpu[cpu];
        if let Err(full) = percpu.batch.try_push(slot) {
            // Batch is at capacity: overflow onto the fallback list.
            let slot = full.element();
            cache::write_free(mem, slot, percpu.fallback_head)?;
            percpu.fallback_head = Some(slot);
            percpu.fallback_len += 1;
        }
        cache.stats.frees += 1;
        Ok(())
    }

    pub fn cache_destroy(
        &mut self,
        mem: &mut PhysMemory,
        buddy: &mut BuddyAllocator,
        registry: &mut RegionRegistry,
        id: CacheId,
    ) -> Result<(), MemError> {
        let cache = self
            .caches
            .get_mut(id.0 as usize)
            .and_then(Option::take)
            .ok_or(MemError::InvalidArgument)?;

        let cached: u32 = cache
            .percpu
            .iter()
            .map(|p| p.batch.len() as u32 + p.fallback_len)
            .sum();
        let parked: u32 = cache.slabs.iter().map(|s| s.free_objs).sum();
        let live = cache.objs_per_slab * cache.slabs.len() as u32 - cached - parked;
        if live != 0 {
            log::warn!("slub: destroying cache {} with {live} live objects", cache.name);
        }

        for slab in &cache.slabs {
            if let Some(dtor) = cache.dtor {
                for i in 0..cache.objs_per_slab {
                    let slot = PhysAddr::from_raw(slab.region.as_raw() + i * cache.slot_size);
                    dtor(mem.bytes_mut(cache::payload_of(slot), cache.obj_size)?);
                }
            }
            registry.unregister(slab.region);
            buddy.free(slab.region)?;
        }
        for class in self.size_classes.iter_mut() {
            if *class == Some(id) {
                *class = None;
            }
        }
        Ok(())
    }

    pub fn alloc_sized(
        &mut self,
        mem: &mut PhysMemory,
        buddy: &mut BuddyAllocator,
        registry: &mut RegionRegistry,
        size: u32,
        cpu: usize,
    ) -> Option<PhysAddr> {
        let class = cache::size_class_index(size)?;
        let id = match self.size_classes[class] {
            Some(id) => id,
            None => {
                let id = self
                    .cache_create(Self::class_name(class), cache::SIZE_CLASSES[class], 8, None, None)
                    .ok()?;
                self.size_classes[class] = Some(id);
                id
            }
        };
        self.cache_alloc(mem, buddy, registry, id, cpu)
    }

    pub fn obj_size(&self, id: CacheId) -> Option<u32> {
        self.cache(id).map(|c| c.obj_size)
    }

    pub fn stats(&self, id: CacheId) -> Option<SlubStats> {
        self.cache(id).map(|c| c.stats)
    }

    pub fn total_stats(&self) -> SlubStats {
        let mut total = SlubStats::default();
        for cache in self.caches.iter().flatten() {
            total.allocs += cache.stats.allocs;
            total.frees += cache.stats.frees;
            total.corruptions += cache.stats.corruptions;
            total.batch_refills += cache.stats.batch_refills;
            total.slab_grows += cache.stats.slab_grows;
        }
        total
    }

    /// Batch length for a CPU, exposed so tests can observe the
    /// batch/fallback structure.
    pub fn batch_len(&self, id: CacheId, cpu: usize) -> Option<usize> {
        self.cache(id).map(|c| c.percpu[cpu].batch.len())
    }

    pub fn fallback_len(&self, id: CacheId, cpu: usize) -> Option<u32> {
        self.cache(id).map(|c| c.percpu[cpu].fallback_len)
    }

    fn class_name(class: usize) -> &'static str {
        const NAMES: [&str; cache::SIZE_CLASSES.len()] = [
            "slub-16", "slub-32", "slub-64", "slub-96", "slub-128", "slub-192", "slub-256",
            "slub-512", "slub-1024", "slub-2048", "slub-4096", "slub-8192",
        ];
        NAMES[class]
    }

    fn cache(&self, id: CacheId) -> Option<&SlubCache> {
        self.caches.get(id.0 as usize)?.as_ref()
    }

    fn cache_mut(&mut self, id: CacheId) -> Option<&mut SlubCache> {
        self.caches.get_mut(id.0 as usize)?.as_mut()
    }

    fn slab_containing(cache: &SlubCache, payload: PhysAddr) -> Option<usize> {
        let (&start, &index) = cache.by_region.range(..=payload.as_raw()).next_back()?;
        let len = BuddyAllocator::block_bytes(cache.slab_order);
        if payload.as_raw() < start + len {
            Some(index)
        } else {
            None
        }
    }

    /// Steal up to [`BATCH_SIZE`] objects from partial slabs into the
    /// CPU's batch, growing a fresh slab if every slab is exhausted.
    fn refill_batch(
        cache: &mut SlubCache,
        mem: &mut PhysMemory,
        buddy: &mut BuddyAllocator,
        registry: &mut RegionRegistry,
        id: CacheId,
        cpu: usize,
    ) -> Option<()> {
        if cache.partial.is_empty() {
            let region = buddy.alloc_order(cache.slab_order)?;
            let len = BuddyAllocator::block_bytes(cache.slab_order);
            let (count, head) = cache::carve_region(
                mem,
                region,
                len,
                cache.slot_size,
                cache.obj_size,
                cache.ctor,
            )
            .ok()?;
            let index = cache.slabs.len();
            cache.slabs.push(Slab {
                region,
                free_head: head,
                free_objs: count,
            });
            cache.by_region.insert(region.as_raw(), index);
            cache.partial.push(index);
            registry.register(region, len, RegionOwner::Slub(id));
            cache.stats.slab_grows += 1;
        }

        let mut stolen = 0;
        while stolen < BATCH_SIZE {
            let &slab_index = match cache.partial.last() {
                Some(index) => index,
                None => break,
            };
            let slab = &mut cache.slabs[slab_index];
            match slab.free_head {
                Some(slot) => {
                    slab.free_head = cache::read_next(mem, slot).ok()?;
                    slab.free_objs -= 1;
                    cache.percpu[cpu].batch.push(slot);
                    stolen += 1;
                }
                None => {
                    cache.partial.pop();
                }
            }
            if cache.slabs[slab_index].free_objs == 0 {
                if cache.partial.last() == Some(&slab_index) {
                    cache.partial.pop();
                }
            }
        }

        if stolen == 0 {
            return None;
        }
        cache.stats.batch_refills += 1;
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        mem: PhysMemory,
        buddy: BuddyAllocator,
        registry: RegionRegistry,
        slub: SlubAllocator,
    }

    fn fixture() -> Fixture {
        Fixture {
            mem: PhysMemory::new(256),
            buddy: BuddyAllocator::new(PhysAddr::zero(), 256),
            registry: RegionRegistry::new(),
            slub: SlubAllocator::new(1),
        }
    }

    #[test]
    fn alloc_refills_batch_from_slab() {
        let mut f = fixture();
        let id = f.slub.cache_create("req", 64, 8, None, None).unwrap();
        let a = f
            .slub
            .cache_alloc(&mut f.mem, &mut f.buddy, &mut f.registry, id, 0)
            .unwrap();
        // The first allocation pulled a whole batch and used one slot.
        assert_eq!(f.slub.batch_len(id, 0), Some(BATCH_SIZE - 1));
        assert_eq!(f.slub.stats(id).unwrap().batch_refills, 1);
        assert_eq!(f.slub.stats(id).unwrap().slab_grows, 1);
        f.slub.cache_free(&mut f.mem, id, 0, a).unwrap();
        assert_eq!(f.slub.batch_len(id, 0), Some(BATCH_SIZE));
    }

    #[test]
    fn batch_overflow_spills_to_fallback() {
        let mut f = fixture();
        let id = f.slub.cache_create("spill", 32, 8, None, None).unwrap();
        let mut objs = Vec::new();
        for _ in 0..(BATCH_SIZE * 2) {
            objs.push(
                f.slub
                    .cache_alloc(&mut f.mem, &mut f.buddy, &mut f.registry, id, 0)
                    .unwrap(),
            );
        }
        // Drained two batches; batch is now empty. Freeing everything
        // fills the batch then spills the rest.
        for obj in &objs {
            f.slub.cache_free(&mut f.mem, id, 0, *obj).unwrap();
        }
        assert_eq!(f.slub.batch_len(id, 0), Some(BATCH_SIZE));
        assert_eq!(f.slub.fallback_len(id, 0), Some(BATCH_SIZE as u32));

        // Allocation drains the batch before touching the fallback list.
        for _ in 0..=BATCH_SIZE {
            assert!(f
                .slub
                .cache_alloc(&mut f.mem, &mut f.buddy, &mut f.registry, id, 0)
                .is_some());
        }
        assert_eq!(f.slub.fallback_len(id, 0), Some(BATCH_SIZE as u32 - 1));
    }

    #[test]
    fn double_free_is_caught() {
        let mut f = fixture();
        let id = f.slub.cache_create("dbl", 64, 8, None, None).unwrap();
        let a = f
            .slub
            .cache_alloc(&mut f.mem, &mut f.buddy, &mut f.registry, id, 0)
            .unwrap();
        f.slub.cache_free(&mut f.mem, id, 0, a).unwrap();
        assert_eq!(f.slub.cache_free(&mut f.mem, id, 0, a), Err(MemError::Corruption));
        assert_eq!(f.slub.stats(id).unwrap().corruptions, 1);
    }

    #[test]
    fn per_cpu_batches_are_independent() {
        let mut f = Fixture {
            mem: PhysMemory::new(256),
            buddy: BuddyAllocator::new(PhysAddr::zero(), 256),
            registry: RegionRegistry::new(),
            slub: SlubAllocator::new(2),
        };
        let id = f.slub.cache_create("smp", 64, 8, None, None).unwrap();
        let a = f
            .slub
            .cache_alloc(&mut f.mem, &mut f.buddy, &mut f.registry, id, 0)
            .unwrap();
        let _b = f
            .slub
            .cache_alloc(&mut f.mem, &mut f.buddy, &mut f.registry, id, 1)
            .unwrap();
        assert_eq!(f.slub.batch_len(id, 0), Some(BATCH_SIZE - 1));
        assert_eq!(f.slub.batch_len(id, 1), Some(BATCH_SIZE - 1));

        // An object allocated on CPU 0 may be freed on CPU 1.
        f.slub.cache_free(&mut f.mem, id, 1, a).unwrap();
        assert_eq!(f.slub.batch_len(id, 1), Some(BATCH_SIZE));
    }

    #[test]
    fn destroy_returns_regions() {
        let mut f = fixture();
        let baseline = f.buddy.allocated_frames();
        let id = f.slub.cache_create("gone", 128, 8, None, None).unwrap();
        let a = f
            .slub
            .cache_alloc(&mut f.mem, &mut f.buddy, &mut f.registry, id, 0)
            .unwrap();
        f.slub.cache_free(&mut f.mem, id, 0, a).unwrap();
        f.slub
            .cache_destroy(&mut f.mem, &mut f.buddy, &mut f.registry, id)
            .unwrap();
        assert_eq!(f.buddy.allocated_frames(), baseline);
        assert!(f.registry.is_empty());
    }
}
