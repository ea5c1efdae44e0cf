//! Page-table entry format and the virtual memory layout.
//!
//! Entries are the 32-bit x86 format: flag bits in the low word, a 20-bit
//! frame number on top. A cleared present bit with the swap marker set is
//! a swap reference; the handle is kept shifted above the marker so no
//! slot value can ever alias the present bit, and the all-zero handle
//! stays distinguishable from an empty entry.

use bitflags::bitflags;
use static_assertions::assert_eq_size;

use crate::addr::{PhysAddr, VirtAddr};

/// Kernel-owned virtual range, shared across every address space.
pub const KERNEL_SPACE_END: u32 = 0x4000_0000;
/// Lazily grown kernel heap.
pub const KERNEL_HEAP_START: u32 = 0x1000_0000;
pub const KERNEL_HEAP_END: u32 = 0x4000_0000;
/// User range; copy-on-write eligible.
pub const USER_START: u32 = 0x4000_0000;
pub const USER_END: u32 = 0xe000_0000;

/// Top-level slots covering the kernel range (shared by all spaces).
pub const KERNEL_TOP_SLOTS: usize = (KERNEL_SPACE_END >> 22) as usize;

pub const fn in_kernel_heap(vaddr: VirtAddr) -> bool {
    vaddr.as_raw() >= KERNEL_HEAP_START && vaddr.as_raw() < KERNEL_HEAP_END
}

pub const fn in_user_range(vaddr: VirtAddr) -> bool {
    vaddr.as_raw() >= USER_START && vaddr.as_raw() < USER_END
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct PteFlags: u32 {
        const PRESENT        = 1 << 0;
        const WRITABLE       = 1 << 1;
        const USER           = 1 << 2;
        const WRITE_THROUGH  = 1 << 3;
        const CACHE_DISABLED = 1 << 4;
        const ACCESSED       = 1 << 5;
        const DIRTY          = 1 << 6;
        const PAT            = 1 << 7;
        const GLOBAL         = 1 << 8;
    }
}

/// One page-table entry.
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct Pte(u32);

assert_eq_size!(Pte, u32);

const FLAG_MASK: u32 = 0xfff;
const FRAME_SHIFT: u32 = 12;
/// Bit 1 of a not-present entry marks it as a swap reference.
const SWAP_MARKER: u32 = 0b10;

impl Pte {
    pub const EMPTY: Pte = Pte(0);

    pub fn present(frame: PhysAddr, flags: PteFlags) -> Pte {
        debug_assert!(frame.is_frame_aligned());
        Pte((frame.frame_index() << FRAME_SHIFT) | (flags | PteFlags::PRESENT).bits())
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & FLAG_MASK)
    }

    pub fn set_flags(&mut self, flags: PteFlags) {
        self.0 = (self.0 & !FLAG_MASK) | flags.bits();
    }

    pub fn insert_flags(&mut self, flags: PteFlags) {
        self.0 |= flags.bits();
    }

    pub fn remove_flags(&mut self, flags: PteFlags) {
        self.0 &= !flags.bits();
    }

    /// Frame this entry maps; only meaningful when present.
    pub fn frame(self) -> PhysAddr {
        PhysAddr::from_frame_index(self.0 >> FRAME_SHIFT)
    }

    /// A not-present entry carrying a swap reference.
    pub fn swapped(swap: SwapRef) -> Pte {
        Pte((swap.encode() << 2) | SWAP_MARKER)
    }

    pub fn is_swap(self) -> bool {
        !self.is_present() && self.0 & SWAP_MARKER != 0
    }

    pub fn swap_ref(self) -> Option<SwapRef> {
        if !self.is_swap() {
            return None;
        }
        Some(SwapRef::decode(self.0 >> 2))
    }
}

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_present() {
            write!(f, "Pte({:?}, {:?})", self.frame(), self.flags())
        } else if self.is_swap() {
            write!(f, "Pte(swap {:?})", self.swap_ref())
        } else {
            write!(f, "Pte(empty)")
        }
    }
}

/// A swap location: `{device_index:8, slot_offset:24}` packed into a
/// 32-bit handle. Device indices stay below 64 so the handle survives
/// the page-table encoding shift.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SwapRef {
    pub device: u8,
    pub slot: u32,
}

pub const MAX_SWAP_DEVICES: usize = 16;
const SLOT_MASK: u32 = 0x00ff_ffff;

impl SwapRef {
    pub fn new(device: u8, slot: u32) -> SwapRef {
        debug_assert!((device as usize) < MAX_SWAP_DEVICES);
        debug_assert!(slot <= SLOT_MASK);
        SwapRef { device, slot }
    }

    pub fn encode(self) -> u32 {
        ((self.device as u32) << 24) | (self.slot & SLOT_MASK)
    }

    pub fn decode(handle: u32) -> SwapRef {
        SwapRef {
            device: (handle >> 24) as u8,
            slot: handle & SLOT_MASK,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_entry_round_trip() {
        let frame = PhysAddr::from_frame_index(0xbeef);
        let pte = Pte::present(frame, PteFlags::WRITABLE | PteFlags::USER);
        assert!(pte.is_present());
        assert!(!pte.is_swap());
        assert_eq!(pte.frame(), frame);
        assert!(pte.flags().contains(PteFlags::WRITABLE));
        assert!(pte.flags().contains(PteFlags::USER));
        assert!(!pte.flags().contains(PteFlags::DIRTY));
    }

    #[test]
    fn flag_edits_preserve_frame() {
        let frame = PhysAddr::from_frame_index(99);
        let mut pte = Pte::present(frame, PteFlags::WRITABLE);
        pte.remove_flags(PteFlags::WRITABLE);
        pte.insert_flags(PteFlags::ACCESSED | PteFlags::DIRTY);
        assert_eq!(pte.frame(), frame);
        assert!(!pte.flags().contains(PteFlags::WRITABLE));
        assert!(pte.flags().contains(PteFlags::DIRTY));
    }

    #[test]
    fn swap_encoding_never_sets_present() {
        for device in [0u8, 1, 7, 15] {
            for slot in [0u32, 1, 2, 0xff_ffff] {
                let pte = Pte::swapped(SwapRef::new(device, slot));
                assert!(!pte.is_present(), "device {device} slot {slot}");
                assert!(pte.is_swap());
                let r = pte.swap_ref().unwrap();
                assert_eq!(r.device, device);
                assert_eq!(r.slot, slot);
            }
        }
    }

    #[test]
    fn empty_entry_is_neither() {
        assert!(!Pte::EMPTY.is_present());
        assert!(!Pte::EMPTY.is_swap());
        assert_eq!(Pte::EMPTY.swap_ref(), None);
    }

    #[test]
    fn range_predicates() {
        assert!(in_kernel_heap(VirtAddr::from_raw(0x1000_0000)));
        assert!(in_kernel_heap(VirtAddr::from_raw(0x3fff_f000)));
        assert!(!in_kernel_heap(VirtAddr::from_raw(0x4000_0000)));
        assert!(in_user_range(VirtAddr::from_raw(0x4000_0000)));
        assert!(in_user_range(VirtAddr::from_raw(0xdfff_f000)));
        assert!(!in_user_range(VirtAddr::from_raw(0xe000_0000)));
    }
}
