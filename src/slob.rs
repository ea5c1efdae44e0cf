//! SLOB object allocator: a best-fit free list inside each page.
//!
//! The embedded / low-memory allocator. Every backing page keeps its free
//! blocks in an address-ordered list threaded through the blocks
//! themselves; allocation takes the best fit and splits, freeing coalesces
//! with both neighbours on the spot. Slower than SLAB, much denser.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use crate::addr::{align_up, PhysAddr, PAGE_SIZE};
use crate::buddy::BuddyAllocator;
use crate::cache::{CacheId, CacheStats, RegionOwner, RegionRegistry, ALLOC_MAGIC, FREE_MAGIC};
use crate::error::MemError;
use crate::phys::PhysMemory;

/// Free block: `{magic, size, next}`; allocated block: `{magic, size}` with
/// the payload following. Sizes include the header.
const HEADER: u32 = 8;
const MIN_BLOCK: u32 = 16;
const NO_NEXT: u32 = u32::MAX;

struct SlobPage {
    region: PhysAddr,
    free_head: Option<PhysAddr>,
    free_bytes: u32,
}

struct SlobCache {
    #[allow(dead_code)]
    name: String,
    obj_size: u32,
}

pub struct SlobAllocator {
    pages: Vec<SlobPage>,
    by_region: BTreeMap<u32, usize>,
    caches: Vec<Option<SlobCache>>,
    stats: CacheStats,
}

impl SlobAllocator {
    pub fn new() -> SlobAllocator {
        SlobAllocator {
            pages: Vec::new(),
            by_region: BTreeMap::new(),
            caches: Vec::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn cache_create(&mut self, name: &str, obj_size: u32) -> Result<CacheId, MemError> {
        if obj_size == 0 || Self::block_size_for(obj_size) > PAGE_SIZE {
            return Err(MemError::InvalidArgument);
        }
        let id = CacheId(self.caches.len() as u32);
        self.caches.push(Some(SlobCache {
            name: String::from(name),
            obj_size,
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
        let obj_size = self.caches.get(id.0 as usize)?.as_ref()?.obj_size;
        self.alloc_sized(mem, buddy, registry, obj_size)
    }

    pub fn cache_free(
        &mut self,
        mem: &mut PhysMemory,
        buddy: &mut BuddyAllocator,
        registry: &mut RegionRegistry,
        _id: CacheId,
        payload: PhysAddr,
    ) -> Result<(), MemError> {
        self.free(mem, buddy, registry, payload)
    }

    pub fn cache_destroy(&mut self, id: CacheId) -> Result<(), MemError> {
        self.caches
            .get_mut(id.0 as usize)
            .and_then(Option::take)
            .map(|_| ())
            .ok_or(MemError::InvalidArgument)
    }

    /// Best-fit allocation of `size` bytes across all pages.
    pub fn alloc_sized(
        &mut self,
        mem: &mut PhysMemory,
        buddy: &mut BuddyAllocator,
        registry: &mut RegionRegistry,
        size: u32,
    ) -> Option<PhysAddr> {
        if size == 0 {
            return None;
        }
        let needed = Self::block_size_for(size);
        if needed > PAGE_SIZE {
            return None;
        }

        let mut best: Option<(usize, PhysAddr, u32)> = None;
        for (page_index, page) in self.pages.iter().enumerate() {
            let mut cursor = page.free_head;
            while let Some(block) = cursor {
                let block_size = Self::read_size(mem, block).ok()?;
                if block_size >= needed
                    && best.map_or(true, |(_, _, b)| block_size < b)
                {
                    best = Some((page_index, block, block_size));
                }
                cursor = Self::read_next(mem, block).ok()?;
            }
        }

        let (page_index, block, block_size) = match best {
            Some(found) => found,
            None => {
                let page_index = self.grow(mem, buddy, registry)?;
                let block = self.pages[page_index].free_head?;
                (page_index, block, PAGE_SIZE)
            }
        };

        self.unlink(mem, page_index, block).ok()?;
        let page = &mut self.pages[page_index];
        page.free_bytes -= block_size;

        // Split off the tail if it still makes a usable block.
        let taken = if block_size - needed >= MIN_BLOCK {
            let remainder = PhysAddr::from_raw(block.as_raw() + needed);
            Self::write_free_block(mem, remainder, block_size - needed, None).ok()?;
            Self::insert_sorted(mem, page, remainder).ok()?;
            page.free_bytes += block_size - needed;
            needed
        } else {
            block_size
        };

        mem.write_u32(block, ALLOC_MAGIC).ok()?;
        mem.write_u32(PhysAddr::from_raw(block.as_raw() + 4), taken).ok()?;
        self.stats.allocs += 1;
        Some(PhysAddr::from_raw(block.as_raw() + HEADER))
    }

    pub fn free(
        &mut self,
        mem: &mut PhysMemory,
        buddy: &mut BuddyAllocator,
        registry: &mut RegionRegistry,
        payload: PhysAddr,
    ) -> Result<(), MemError> {
        let block = PhysAddr::from_raw(
            payload
                .as_raw()
                .checked_sub(HEADER)
                .ok_or(MemError::InvalidArgument)?,
        );
        let page_index = match self.page_containing(block) {
            Some(index) => index,
            None => {
                log::error!("slob: free of {payload:?} outside any page");
                self.stats.corruptions += 1;
                return Err(MemError::Corruption);
            }
        };
        let magic = mem.read_u32(block)?;
        if magic != ALLOC_MAGIC {
            log::error!("slob: bad magic {magic:#010x} freeing {payload:?}");
            self.stats.corruptions += 1;
            return Err(MemError::Corruption);
        }
        let size = Self::read_size(mem, block)?;

        let page = &mut self.pages[page_index];
        Self::write_free_block(mem, block, size, None)?;
        Self::insert_sorted(mem, page, block)?;
        page.free_bytes += size;
        Self::coalesce(mem, page)?;
        self.stats.frees += 1;

        // A fully drained page goes straight back to the buddy.
        if self.pages[page_index].free_bytes == PAGE_SIZE {
            let page = self.pages.swap_remove(page_index);
            self.by_region.remove(&page.region.as_raw());
            if let Some(moved) = self.pages.get(page_index) {
                self.by_region.insert(moved.region.as_raw(), page_index);
            }
            registry.unregister(page.region);
            buddy.free(page.region)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn pages(&self) -> usize {
        self.pages.len()
    }

    fn block_size_for(size: u32) -> u32 {
        align_up(size + HEADER, 8).max(MIN_BLOCK)
    }

    fn grow(
        &mut self,
        mem: &mut PhysMemory,
        buddy: &mut BuddyAllocator,
        registry: &mut RegionRegistry,
    ) -> Option<usize> {
        let region = buddy.alloc_order(0)?;
        Self::write_free_block(mem, region, PAGE_SIZE, None).ok()?;
        let index = self.pages.len();
        self.pages.push(SlobPage {
            region,
            free_head: Some(region),
            free_bytes: PAGE_SIZE,
        });
        self.by_region.insert(region.as_raw(), index);
        registry.register(region, PAGE_SIZE, RegionOwner::Slob);
        Some(index)
    }

    fn page_containing(&self, addr: PhysAddr) -> Option<usize> {
        let (&start, &index) = self.by_region.range(..=addr.as_raw()).next_back()?;
        if addr.as_raw() < start + PAGE_SIZE {
            Some(index)
        } else {
            None
        }
    }

    fn read_size(mem: &PhysMemory, block: PhysAddr) -> Result<u32, MemError> {
        mem.read_u32(PhysAddr::from_raw(block.as_raw() + 4))
    }

    fn read_next(mem: &PhysMemory, block: PhysAddr) -> Result<Option<PhysAddr>, MemError> {
        let raw = mem.read_u32(PhysAddr::from_raw(block.as_raw() + 8))?;
        Ok((raw != NO_NEXT).then(|| PhysAddr::from_raw(raw)))
    }

    fn write_next(
        mem: &mut PhysMemory,
        block: PhysAddr,
        next: Option<PhysAddr>,
    ) -> Result<(), MemError> {
        let raw = next.map_or(NO_NEXT, PhysAddr::as_raw);
        mem.write_u32(PhysAddr::from_raw(block.as_raw() + 8), raw)
    }

    fn write_free_block(
        mem: &mut PhysMemory,
        block: PhysAddr,
        size: u32,
        next: Option<PhysAddr>,
    ) -> Result<(), MemError> {
        mem.write_u32(block, FREE_MAGIC)?;
        mem.write_u32(PhysAddr::from_raw(block.as_raw() + 4), size)?;
        Self::write_next(mem, block, next)
    }

    fn unlink(
        &mut self,
        mem: &mut PhysMemory,
        page_index: usize,
        block: PhysAddr,
    ) -> Result<(), MemError> {
        let page = &mut self.pages[page_index];
        let mut prev: Option<PhysAddr> = None;
        let mut cursor = page.free_head;
        while let Some(current) = cursor {
            let next = Self::read_next(mem, current)?;
            if current == block {
                match prev {
                    Some(prev) => Self::write_next(mem, prev, next)?,
                    None => page.free_head = next,
                }
                return Ok(());
            }
            prev = Some(current);
            cursor = next;
        }
        Err(MemError::Corruption)
    }

    /// Insert a free block keeping the list address-ordered.
    fn insert_sorted(
        mem: &mut PhysMemory,
        page: &mut SlobPage,
        block: PhysAddr,
    ) -> Result<(), MemError> {
        let mut prev: Option<PhysAddr> = None;
        let mut cursor = page.free_head;
        while let Some(current) = cursor {
            if current > block {
                break;
            }
            prev = Some(current);
            cursor = Self::read_next(mem, current)?;
        }
        Self::write_next(mem, block, cursor)?;
        match prev {
            Some(prev) => Self::write_next(mem, prev, Some(block))?,
            None => page.free_head = Some(block),
        }
        Ok(())
    }

    /// Merge every pair of adjacent free blocks in the page.
    fn coalesce(mem: &mut PhysMemory, page: &mut SlobPage) -> Result<(), MemError> {
        let mut cursor = page.free_head;
        while let Some(current) = cursor {
            let size = Self::read_size(mem, current)?;
            let next = Self::read_next(mem, current)?;
            match next {
                Some(next_block)
                    if current.as_raw() + size == next_block.as_raw() =>
                {
                    let next_size = Self::read_size(mem, next_block)?;
                    let after = Self::read_next(mem, next_block)?;
                    Self::write_free_block(mem, current, size + next_size, after)?;
                    // Stay on `current`; it may now touch the block after.
                }
                _ => cursor = next,
            }
        }
        Ok(())
    }
}

impl Default for SlobAllocator {
    fn default() -> Self {
        SlobAllocator::new()
    }
}
