//! Machinery shared by the SLAB, SLOB and SLUB object allocators.
//!
//! Every object slot in a backing region carries an 8-byte in-zone header
//! `{magic, next_free}`. While the object sits on a free list the header
//! holds `FREE_MAGIC` and the link; the moment it is handed out the magic
//! becomes [`ALLOC_MAGIC`] and the caller receives a pointer just past the
//! header. `cache_free` checks the magic first, which is what catches
//! double frees and stray pointers.

use static_assertions::const_assert;

use crate::addr::{align_up, PhysAddr};
use crate::error::MemError;
use crate::phys::PhysMemory;

pub const ALLOC_MAGIC: u32 = 0xa110_ca7e;
pub const FREE_MAGIC: u32 = 0xf4ee_0b1e;

/// Bytes of in-zone header preceding each object payload.
pub const HEADER_BYTES: u32 = 8;

/// Link value meaning "end of free list".
const NO_NEXT: u32 = u32::MAX;

/// The generic size-class schedule. A raw `alloc(size)` lands in the
/// smallest class that fits.
pub const SIZE_CLASSES: [u32; 12] = [
    16, 32, 64, 96, 128, 192, 256, 512, 1024, 2048, 4096, 8192,
];

const_assert!(HEADER_BYTES <= SIZE_CLASSES[0]);

/// Index into [`SIZE_CLASSES`] for `size`, or `None` if it exceeds the
/// largest class.
pub fn size_class_index(size: u32) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&class| class >= size)
}

/// Optional constructor run on an object's payload when its slot is first
/// carved, and destructor run when the cache is destroyed.
pub type ObjectCtor = fn(&mut [u8]);

/// Handle to a cache within one object allocator.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct CacheId(pub u32);

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CacheStats {
    pub allocs: u64,
    pub frees: u64,
    pub corruptions: u64,
}

/// Slot size for an object of `obj_size` aligned to `align`: header plus
/// payload, rounded so consecutive slots keep the payload alignment.
pub fn slot_size(obj_size: u32, align: u32) -> u32 {
    let align = align.max(8);
    align_up(obj_size + HEADER_BYTES, align)
}

/// Payload address for a slot start.
pub fn payload_of(slot: PhysAddr) -> PhysAddr {
    PhysAddr::from_raw(slot.as_raw() + HEADER_BYTES)
}

/// Slot start for a payload address handed back by a caller.
pub fn slot_of(payload: PhysAddr) -> Option<PhysAddr> {
    payload
        .as_raw()
        .checked_sub(HEADER_BYTES)
        .map(PhysAddr::from_raw)
}

/// Write a free header at `slot`, linking to `next`.
pub fn write_free(
    mem: &mut PhysMemory,
    slot: PhysAddr,
    next: Option<PhysAddr>,
) -> Result<(), MemError> {
    mem.write_u32(slot, FREE_MAGIC)?;
    let link = next.map_or(NO_NEXT, PhysAddr::as_raw);
    mem.write_u32(PhysAddr::from_raw(slot.as_raw() + 4), link)
}

/// Follow a free slot's link.
pub fn read_next(mem: &PhysMemory, slot: PhysAddr) -> Result<Option<PhysAddr>, MemError> {
    let link = mem.read_u32(PhysAddr::from_raw(slot.as_raw() + 4))?;
    if link == NO_NEXT {
        Ok(None)
    } else {
        Ok(Some(PhysAddr::from_raw(link)))
    }
}

/// Stamp a slot as live before handing out its payload.
pub fn stamp_allocated(mem: &mut PhysMemory, slot: PhysAddr) -> Result<(), MemError> {
    mem.write_u32(slot, ALLOC_MAGIC)?;
    mem.write_u32(PhysAddr::from_raw(slot.as_raw() + 4), 0)
}

/// Verify that `payload` points at a live object. A mismatch is the
/// double-free / corruption pattern: logged, and the caller must abort the
/// free.
pub fn check_allocated(mem: &PhysMemory, payload: PhysAddr) -> Result<PhysAddr, MemError> {
    let slot = slot_of(payload).ok_or(MemError::InvalidArgument)?;
    let magic = mem.read_u32(slot)?;
    if magic != ALLOC_MAGIC {
        log::error!("cache: bad magic {magic:#010x} freeing {payload:?}");
        return Err(MemError::Corruption);
    }
    Ok(slot)
}

/// Carve `region_len` bytes at `region` into a free list of slots of
/// `slot_size` bytes, running `ctor` over each fresh payload. Returns the
/// slot count and the list head.
pub fn carve_region(
    mem: &mut PhysMemory,
    region: PhysAddr,
    region_len: u32,
    slot_size: u32,
    obj_size: u32,
    ctor: Option<ObjectCtor>,
) -> Result<(u32, Option<PhysAddr>), MemError> {
    let count = region_len / slot_size;
    let mut head = None;
    // Link back-to-front so the list pops in address order.
    for i in (0..count).rev() {
        let slot = PhysAddr::from_raw(region.as_raw() + i * slot_size);
        if let Some(ctor) = ctor {
            ctor(mem.bytes_mut(payload_of(slot), obj_size)?);
        }
        write_free(mem, slot, head)?;
        head = Some(slot);
    }
    Ok((count, head))
}

/// Which allocator a registered region belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegionOwner {
    Slab(CacheId),
    Slob,
    Slub(CacheId),
    Stack,
}

/// The façade's map from backing regions to their owning allocator.
/// Object allocators register every region they take from the buddy and
/// unregister it when they give it back; `free(p)` routes through here.
#[derive(Default)]
pub struct RegionRegistry {
    regions: alloc::collections::BTreeMap<u32, (u32, RegionOwner)>,
}

impl RegionRegistry {
    pub fn new() -> RegionRegistry {
        RegionRegistry::default()
    }

    pub fn register(&mut self, start: PhysAddr, len: u32, owner: RegionOwner) {
        self.regions.insert(start.as_raw(), (len, owner));
    }

    pub fn unregister(&mut self, start: PhysAddr) {
        self.regions.remove(&start.as_raw());
    }

    /// Owner of the region containing `addr`, if any.
    pub fn lookup(&self, addr: PhysAddr) -> Option<RegionOwner> {
        let (&start, &(len, owner)) = self.regions.range(..=addr.as_raw()).next_back()?;
        if addr.as_raw() < start + len {
            Some(owner)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
