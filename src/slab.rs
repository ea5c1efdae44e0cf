//! SLAB object allocator: per-cache full/partial/empty slab lists.
//!
//! Each slab is one buddy block carved into fixed-size slots with an
//! intrusive free list. Allocation prefers a partial slab, falls back to an
//! empty one, and grows from the buddy only when neither exists. Slabs
//! migrate between the three lists as their free count crosses the edges.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use crate::addr::PhysAddr;
use crate::buddy::{BuddyAllocator, MAX_ORDER};
use crate::cache::{
    self, CacheId, CacheStats, ObjectCtor, RegionOwner, RegionRegistry,
};
use crate::error::MemError;
use crate::phys::PhysMemory;

/// Aim for at least this many objects per slab when picking the block
/// order.
const MIN_OBJS_PER_SLAB: u32 = 8;

struct Slab {
    region: PhysAddr,
    free_objs: u32,
    free_head: Option<PhysAddr>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SlabList {
    Full,
    Partial,
    Empty,
}

struct SlabCache {
    name: String,
    obj_size: u32,
    slot_size: u32,
    objs_per_slab: u32,
    slab_order: u8,
    ctor: Option<ObjectCtor>,
    dtor: Option<ObjectCtor>,
    slabs: Vec<Slab>,
    full: Vec<usize>,
    partial: Vec<usize>,
    empty: Vec<usize>,
    /// Region start -> slab index, for routing frees.
    by_region: BTreeMap<u32, usize>,
    stats: CacheStats,
}

impl SlabCache {
    fn list_of(&self, slab_index: usize) -> SlabList {
        let slab = &self.slabs[slab_index];
        if slab.free_objs == 0 {
            SlabList::Full
        } else if slab.free_objs == self.objs_per_slab {
            SlabList::Empty
        } else {
            SlabList::Partial
        }
    }

    fn list_mut(&mut self, which: SlabList) -> &mut Vec<usize> {
        match which {
            SlabList::Full => &mut self.full,
            SlabList::Partial => &mut self.partial,
            SlabList::Empty => &mut self.empty,
        }
    }

    fn move_between(&mut self, slab_index: usize, from: SlabList, to: SlabList) {
        if from == to {
            return;
        }
        let list = self.list_mut(from);
        let pos = list
            .iter()
            .position(|&i| i == slab_index)
            .expect("slab missing from its list");
        list.swap_remove(pos);
        self.list_mut(to).push(slab_index);
    }

    fn in_use(&self) -> u32 {
        self.slabs
            .iter()
            .map(|s| self.objs_per_slab - s.free_objs)
            .sum()
    }
}

pub struct SlabAllocator {
    caches: Vec<Option<SlabCache>>,
    size_classes: [Option<CacheId>; cache::SIZE_CLASSES.len()],
}

impl SlabAllocator {
    pub fn new() -> SlabAllocator {
        SlabAllocator {
            caches: Vec::new(),
            size_classes: [None; cache::SIZE_CLASSES.len()],
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

        // Pick the smallest block order that fits a reasonable object
        // count; large objects settle for fewer.
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
        self.caches.push(Some(SlabCache {
            name: String::from(name),
            obj_size,
            slot_size,
            objs_per_slab,
            slab_order,
            ctor,
            dtor,
            slabs: Vec::new(),
            full: Vec::new(),
            partial: Vec::new(),
            empty: Vec::new(),
            by_region: BTreeMap::new(),
            stats: CacheStats::default(),
        }));
        Ok(id)
    }

    pub fn cache_alloc(
        &mut self,
        mem: &mut PhysMemory,
        buddy: &mut BuddyAllocator,
        registry: &mut RegionRegistry,
        id: CacheId,
    ) -> Option<PhysAddr> {
        let cache = self.cache_mut(id)?;

        let slab_index = if let Some(&index) = cache.partial.last() {
            index
        } else if let Some(index) = cache.empty.pop() {
            cache.partial.push(index);
            index
        } else {
            Self::grow(cache, mem, buddy, registry, id)?
        };

        let cache = self.cache_mut(id)?;
        let slab = &mut cache.slabs[slab_index];
        let slot = slab.free_head?;
        slab.free_head = cache::read_next(mem, slot).ok()?;
        slab.free_objs -= 1;
        cache::stamp_allocated(mem, slot).ok()?;

        if cache.list_of(slab_index) == SlabList::Full {
            cache.move_between(slab_index, SlabList::Partial, SlabList::Full);
        }
        cache.stats.allocs += 1;
        Some(cache::payload_of(slot))
    }

    pub fn cache_free(
        &mut self,
        mem: &mut PhysMemory,
        id: CacheId,
        payload: PhysAddr,
    ) -> Result<(), MemError> {
        let cache = self.cache_mut(id).ok_or(MemError::InvalidArgument)?;

        let slab_index = match Self::slab_containing(cache, payload) {
            Some(index) => index,
            None => {
                log::error!("slab: free of {payload:?} outside cache regions");
                cache.stats.corruptions += 1;
                return Err(MemError::Corruption);
            }
        };

        let slot = match cache::check_allocated(mem, payload) {
            Ok(slot) => slot,
            Err(e) => {
                cache.stats.corruptions += 1;
                return Err(e);
            }
        };

        let was = cache.list_of(slab_index);
        let objs_per_slab = cache.objs_per_slab;
        let slab = &mut cache.slabs[slab_index];
        cache::write_free(mem, slot, slab.free_head)?;
        slab.free_head = Some(slot);
        slab.free_objs += 1;
        debug_assert!(slab.free_objs <= objs_per_slab);

        let now = cache.list_of(slab_index);
        cache.move_between(slab_index, was, now);
        cache.stats.frees += 1;
        Ok(())
    }

    /// Tear a cache down, returning every slab to the buddy. Live objects
    /// are logged and reclaimed with the slab.
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

        let in_use = cache.in_use();
        if in_use != 0 {
            log::warn!(
                "slab: destroying cache {} with {in_use} live objects",
                cache.name
            );
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

    /// Allocate `size` bytes through the generic size-class caches.
    pub fn alloc_sized(
        &mut self,
        mem: &mut PhysMemory,
        buddy: &mut BuddyAllocator,
        registry: &mut RegionRegistry,
        size: u32,
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
        self.cache_alloc(mem, buddy, registry, id)
    }

    /// Object size of a live cache.
    pub fn obj_size(&self, id: CacheId) -> Option<u32> {
        self.cache(id).map(|c| c.obj_size)
    }

    pub fn stats(&self, id: CacheId) -> Option<CacheStats> {
        self.cache(id).map(|c| c.stats)
    }

    pub fn total_stats(&self) -> CacheStats {
        let mut total = CacheStats::default();
        for cache in self.caches.iter().flatten() {
            total.allocs += cache.stats.allocs;
            total.frees += cache.stats.frees;
            total.corruptions += cache.stats.corruptions;
        }
        total
    }

    fn class_name(class: usize) -> &'static str {
        const NAMES: [&str; cache::SIZE_CLASSES.len()] = [
            "size-16", "size-32", "size-64", "size-96", "size-128", "size-192", "size-256",
            "size-512", "size-1024", "size-2048", "size-4096", "size-8192",
        ];
        NAMES[class]
    }

    fn cache(&self, id: CacheId) -> Option<&SlabCache> {
        self.caches.get(id.0 as usize)?.as_ref()
    }

    fn cache_mut(&mut self, id: CacheId) -> Option<&mut SlabCache> {
        self.caches.get_mut(id.0 as usize)?.as_mut()
    }

    fn slab_containing(cache: &SlabCache, payload: PhysAddr) -> Option<usize> {
        let (&start, &index) = cache.by_region.range(..=payload.as_raw()).next_back()?;
        let len = BuddyAllocator::block_bytes(cache.slab_order);
        if payload.as_raw() < start + len {
            Some(index)
        } else {
            None
        }
    }

    fn grow(
        cache: &mut SlabCache,
        mem: &mut PhysMemory,
        buddy: &mut BuddyAllocator,
        registry: &mut RegionRegistry,
        id: CacheId,
    ) -> Option<usize> {
        let region = buddy.alloc_order(cache.slab_order)?;
        let len = BuddyAllocator::block_bytes(cache.slab_order);
        let (count, head) =
            cache::carve_region(mem, region, len, cache.slot_size, cache.obj_size, cache.ctor)
                .ok()?;
        debug_assert_eq!(count, cache.objs_per_slab);

        let index = cache.slabs.len();
        cache.slabs.push(Slab {
            region,
            free_objs: count,
            free_head: head,
        });
        cache.by_region.insert(region.as_raw(), index);
        cache.partial.push(index);
        registry.register(region, len, RegionOwner::Slab(id));
        Some(index)
    }

    #[cfg(test)]
    fn check_invariants(&self, id: CacheId) {
        let cache = self.cache(id).unwrap();
        for (index, slab) in cache.slabs.iter().enumerate() {
            let memberships = [
                cache.full.contains(&index),
                cache.partial.contains(&index),
                cache.empty.contains(&index),
            ];
            assert_eq!(
                memberships.iter().filter(|&&m| m).count(),
                1,
                "slab {index} must be in exactly one list"
            );
            let expected = cache.list_of(index);
            let actual = if memberships[0] {
                SlabList::Full
            } else if memberships[1] {
                SlabList::Partial
            } else {
                SlabList::Empty
            };
            assert_eq!(expected, actual, "slab {index} filed in the wrong list");
            assert!(slab.free_objs <= cache.objs_per_slab);
        }
    }
}

impl Default for SlabAllocator {
    fn default() -> Self {
        SlabAllocator::new()
    }
}
