//! Swap: devices, slot accounting, page-out and page-in.
//!
//! A device is a priority, a slot bitmap and a backing-store capability
//! set `{activate, deactivate, read_page, write_page}`. Swapped pages are
//! encoded into their not-present page-table entries; the fault path
//! hands the encoded reference back here to bring the page in.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use num_derive::{FromPrimitive, ToPrimitive};

use crate::addr::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::bitmap::Bitmap;
use crate::error::MemError;
use crate::paging::{Pte, PteFlags, SwapRef, MAX_SWAP_DEVICES};
use crate::phys::{FramePool, PhysMemory};
use crate::replace::Replacer;
use crate::vmm::{SpaceId, Vmm};

/// Memory pressure derived from frame usage.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, FromPrimitive, ToPrimitive)]
pub enum PressureLevel {
    None = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

/// What a backing store reports on activation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceGeometry {
    pub pages: u32,
    pub bad_pages: Vec<u32>,
}

/// The capability set a swap backing store provides. File- and
/// device-backed stores implement the same four entry points.
pub trait SwapBacking {
    fn activate(&mut self) -> Result<DeviceGeometry, MemError>;
    fn deactivate(&mut self) -> Result<(), MemError>;
    fn read_page(&mut self, slot: u32, buf: &mut [u8]) -> Result<(), MemError>;
    fn write_page(&mut self, slot: u32, buf: &[u8]) -> Result<(), MemError>;
}

pub const SWAP_SIGNATURE: &[u8; 10] = b"SWAPSPACE2";
pub const SWAP_VERSION: u32 = 1;

/// Signature, version, last page, bad-page count, then a fixed padding
/// region before the bad-page list.
const HEADER_PADDING: usize = 500;
const HEADER_FIXED: usize = 10 + 4 + 4 + 4 + HEADER_PADDING;

/// The persistent header at the front of a swap store.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SwapHeader {
    pub version: u32,
    pub last_page: u32,
    pub bad_pages: Vec<u32>,
}

impl SwapHeader {
    pub fn new(last_page: u32) -> SwapHeader {
        SwapHeader {
            version: SWAP_VERSION,
            last_page,
            bad_pages: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_FIXED + self.bad_pages.len() * 4];
        out[..10].copy_from_slice(SWAP_SIGNATURE);
        out[10..14].copy_from_slice(&self.version.to_le_bytes());
        out[14..18].copy_from_slice(&self.last_page.to_le_bytes());
        out[18..22].copy_from_slice(&(self.bad_pages.len() as u32).to_le_bytes());
        for (i, bad) in self.bad_pages.iter().enumerate() {
            let at = HEADER_FIXED + i * 4;
            out[at..at + 4].copy_from_slice(&bad.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<SwapHeader, MemError> {
        if bytes.len() < HEADER_FIXED || &bytes[..10] != SWAP_SIGNATURE {
            return Err(MemError::InvalidArgument);
        }
        let word = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        let version = word(10);
        let last_page = word(14);
        let nr_bad = word(18) as usize;
        if bytes.len() < HEADER_FIXED + nr_bad * 4 {
            return Err(MemError::InvalidArgument);
        }
        let mut bad_pages = Vec::with_capacity(nr_bad);
        for i in 0..nr_bad {
            let bad = word(HEADER_FIXED + i * 4);
            if bad >= last_page {
                return Err(MemError::InvalidArgument);
            }
            bad_pages.push(bad);
        }
        Ok(SwapHeader {
            version,
            last_page,
            bad_pages,
        })
    }
}

/// An in-memory backing store; the concrete store used by tests and by
/// ramdisk swap.
pub struct MemBacking {
    geometry: DeviceGeometry,
    data: Vec<u8>,
    active: bool,
}

impl MemBacking {
    pub fn new(pages: u32) -> MemBacking {
        MemBacking {
            geometry: DeviceGeometry {
                pages,
                bad_pages: Vec::new(),
            },
            data: Vec::new(),
            active: false,
        }
    }

    /// Geometry taken from a persistent header.
    pub fn from_header(header: &SwapHeader) -> MemBacking {
        MemBacking {
            geometry: DeviceGeometry {
                pages: header.last_page,
                bad_pages: header.bad_pages.clone(),
            },
            data: Vec::new(),
            active: false,
        }
    }

    fn check_slot(&self, slot: u32, active_needed: bool) -> Result<(), MemError> {
        if active_needed && !self.active {
            return Err(MemError::NotPresent);
        }
        if slot >= self.geometry.pages {
            return Err(MemError::InvalidArgument);
        }
        Ok(())
    }
}

impl SwapBacking for MemBacking {
    fn activate(&mut self) -> Result<DeviceGeometry, MemError> {
        self.data = vec![0; (self.geometry.pages as usize) * PAGE_SIZE as usize];
        self.active = true;
        Ok(self.geometry.clone())
    }

    fn deactivate(&mut self) -> Result<(), MemError> {
        self.data = Vec::new();
        self.active = false;
        Ok(())
    }

    fn read_page(&mut self, slot: u32, buf: &mut [u8]) -> Result<(), MemError> {
        self.check_slot(slot, true)?;
        let at = slot as usize * PAGE_SIZE as usize;
        buf.copy_from_slice(&self.data[at..at + PAGE_SIZE as usize]);
        Ok(())
    }

    fn write_page(&mut self, slot: u32, buf: &[u8]) -> Result<(), MemError> {
        self.check_slot(slot, true)?;
        let at = slot as usize * PAGE_SIZE as usize;
        self.data[at..at + PAGE_SIZE as usize].copy_from_slice(buf);
        Ok(())
    }
}

/// A file backing that has not been bound to a filesystem yet: activates
/// at the reference 65 536 slots but fails every transfer.
pub struct UnboundFileBacking;

impl SwapBacking for UnboundFileBacking {
    fn activate(&mut self) -> Result<DeviceGeometry, MemError> {
        Ok(DeviceGeometry {
            pages: 65536,
            bad_pages: Vec::new(),
        })
    }

    fn deactivate(&mut self) -> Result<(), MemError> {
        Ok(())
    }

    fn read_page(&mut self, _slot: u32, _buf: &mut [u8]) -> Result<(), MemError> {
        Err(MemError::NotPresent)
    }

    fn write_page(&mut self, _slot: u32, _buf: &[u8]) -> Result<(), MemError> {
        Err(MemError::NotPresent)
    }
}

struct SwapDevice {
    path: String,
    priority: u32,
    total_pages: u32,
    used_pages: u32,
    bad_pages: u32,
    bitmap: Bitmap,
    backing: Box<dyn SwapBacking>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SwapStats {
    pub swap_ins: u64,
    pub swap_outs: u64,
    pub reclaim_attempts: u64,
    pub total_pages: u32,
    pub used_pages: u32,
}

pub struct SwapManager {
    devices: Vec<Option<SwapDevice>>,
    swap_ins: u64,
    swap_outs: u64,
    reclaim_attempts: u64,
}

impl SwapManager {
    pub fn new() -> SwapManager {
        SwapManager {
            devices: Vec::new(),
            swap_ins: 0,
            swap_outs: 0,
            reclaim_attempts: 0,
        }
    }

    /// Activate a backing store as a swap device. Bad pages from the
    /// geometry are pre-marked in the slot bitmap and never allocated.
    pub fn swap_on(
        &mut self,
        path: &str,
        priority: u32,
        mut backing: Box<dyn SwapBacking>,
    ) -> Result<u8, MemError> {
        if self.device_index(path).is_some() {
            log::warn!("swap: device {path} already active");
            return Err(MemError::InvalidArgument);
        }
        let index = match self.devices.iter().position(Option::is_none) {
            Some(index) => index,
            None if self.devices.len() < MAX_SWAP_DEVICES => {
                self.devices.push(None);
                self.devices.len() - 1
            }
            None => return Err(MemError::InvalidArgument),
        };

        let geometry = backing.activate()?;
        let mut bitmap = Bitmap::new(geometry.pages);
        for &bad in &geometry.bad_pages {
            if bad < geometry.pages {
                bitmap.set(bad);
            }
        }
        let bad_pages = bitmap.count_set();

        self.devices[index] = Some(SwapDevice {
            path: String::from(path),
            priority,
            total_pages: geometry.pages,
            used_pages: 0,
            bad_pages,
            bitmap,
            backing,
        });
        log::info!(
            "swap: device {path} on, {} pages, priority {priority}",
            geometry.pages
        );
        Ok(index as u8)
    }

    /// Deactivate a device. Refused while any of its slots are live.
    pub fn swap_off(&mut self, path: &str) -> Result<(), MemError> {
        let index = self.device_index(path).ok_or(MemError::NotPresent)?;
        let device = self.devices[index].as_mut().expect("index from lookup");
        if device.used_pages > 0 {
            return Err(MemError::DeviceBusy);
        }
        device.backing.deactivate()?;
        self.devices[index] = None;
        log::info!("swap: device {path} off");
        Ok(())
    }

    /// Evict the page at `vaddr` of `space`. On success the page-table
    /// entry holds the swap reference and the frame is back in the pool;
    /// any failure rolls the slot allocation back and leaves the mapping
    /// untouched.
    pub fn swap_out(
        &mut self,
        vmm: &mut Vmm,
        frames: &mut FramePool,
        mem: &PhysMemory,
        replace: &mut Replacer,
        space: SpaceId,
        vaddr: VirtAddr,
    ) -> Result<SwapRef, MemError> {
        let page = vaddr.page_base();
        let swap = self.alloc_slot().ok_or(MemError::OutOfMemory)?;

        let paddr = match vmm.translate(space, page) {
            Some(paddr) => paddr,
            None => {
                self.free_slot(swap);
                return Err(MemError::NotPresent);
            }
        };

        let buf = mem.bytes(paddr, PAGE_SIZE)?;
        let device = self.device_mut(swap.device).expect("slot from alloc");
        if let Err(e) = device.backing.write_page(swap.slot, buf) {
            self.free_slot(swap);
            log::error!("swap: write of {page:?} failed: {e}");
            return Err(e);
        }

        vmm.set_pte(space, page, Pte::swapped(swap))?;
        frames.free_frame(paddr);
        replace.remove_page(page);
        vmm.flush_tlb(space);

        self.swap_outs += 1;
        Ok(swap)
    }

    /// Bring a swapped page back in on fault. On failure the swap entry
    /// stays intact so the next fault retries.
    pub fn swap_in(
        &mut self,
        vmm: &mut Vmm,
        frames: &mut FramePool,
        mem: &mut PhysMemory,
        replace: &mut Replacer,
        space: SpaceId,
        vaddr: VirtAddr,
        swap: SwapRef,
    ) -> Result<(), MemError> {
        let page = vaddr.page_base();
        {
            let device = self.device_mut(swap.device).ok_or(MemError::NotPresent)?;
            if swap.slot >= device.total_pages || !device.bitmap.get(swap.slot) {
                return Err(MemError::NotPresent);
            }
        }

        let frame = frames.alloc_frame().ok_or(MemError::OutOfMemory)?;
        let buf = mem.bytes_mut(frame, PAGE_SIZE)?;
        let device = self.device_mut(swap.device).expect("checked above");
        if let Err(e) = device.backing.read_page(swap.slot, buf) {
            frames.free_frame(frame);
            log::error!("swap: read of {page:?} failed: {e}");
            return Err(e);
        }

        vmm.map(
            frames,
            space,
            page,
            frame,
            PteFlags::WRITABLE | PteFlags::USER,
        )?;
        self.free_slot(swap);
        replace.add_page(page, frame, crate::replace::PageFlags::empty(), space);
        vmm.flush_tlb(space);

        self.swap_ins += 1;
        Ok(())
    }

    /// Swap out up to `target` victims chosen by the replacement manager.
    /// Stops at the first failure.
    pub fn reclaim(
        &mut self,
        vmm: &mut Vmm,
        frames: &mut FramePool,
        mem: &PhysMemory,
        replace: &mut Replacer,
        target: u32,
    ) -> u32 {
        self.reclaim_attempts += 1;
        let mut reclaimed = 0;
        while reclaimed < target {
            let victim = match replace.find_victim() {
                Some(victim) => victim,
                None => break,
            };
            match self.swap_out(vmm, frames, mem, replace, victim.owner, victim.vaddr) {
                Ok(_) => reclaimed += 1,
                Err(e) => {
                    log::warn!("swap: reclaim stopped at {:?}: {e}", victim.vaddr);
                    break;
                }
            }
        }
        log::info!("swap: reclaimed {reclaimed} pages (target {target})");
        reclaimed
    }

    /// Pressure from frame usage. `alloc_failed` is the sticky signal the
    /// façade raises when an allocation came back empty.
    pub fn pressure(&self, frames: &FramePool, alloc_failed: bool) -> PressureLevel {
        if alloc_failed || frames.frames_free() == 0 {
            return PressureLevel::Critical;
        }
        match frames.usage_percent() {
            0..=49 => PressureLevel::None,
            50..=79 => PressureLevel::Low,
            80..=89 => PressureLevel::Medium,
            90..=97 => PressureLevel::High,
            _ => PressureLevel::Critical,
        }
    }

    /// Release a slot without touching page tables; used when an address
    /// space dies with pages still swapped out.
    pub fn release_slot(&mut self, swap: SwapRef) {
        self.free_slot(swap);
    }

    pub fn device_count(&self) -> usize {
        self.devices.iter().flatten().count()
    }

    pub fn slot_in_use(&self, swap: SwapRef) -> bool {
        self.devices
            .get(swap.device as usize)
            .and_then(Option::as_ref)
            .is_some_and(|d| swap.slot < d.total_pages && d.bitmap.get(swap.slot))
    }

    pub fn stats(&self) -> SwapStats {
        let mut total_pages = 0;
        let mut used_pages = 0;
        for device in self.devices.iter().flatten() {
            total_pages += device.total_pages - device.bad_pages;
            used_pages += device.used_pages;
        }
        SwapStats {
            swap_ins: self.swap_ins,
            swap_outs: self.swap_outs,
            reclaim_attempts: self.reclaim_attempts,
            total_pages,
            used_pages,
        }
    }

    /// Per-device check: live slots equal the bitmap population minus the
    /// pre-marked bad pages.
    pub fn check_slot_accounting(&self) -> bool {
        self.devices
            .iter()
            .flatten()
            .all(|d| d.used_pages + d.bad_pages == d.bitmap.count_set())
    }

    fn device_index(&self, path: &str) -> Option<usize> {
        self.devices
            .iter()
            .position(|d| d.as_ref().is_some_and(|d| d.path == path))
    }

    fn device_mut(&mut self, index: u8) -> Option<&mut SwapDevice> {
        self.devices.get_mut(index as usize)?.as_mut()
    }

    /// Take a free slot from the highest-priority device that has one.
    fn alloc_slot(&mut self) -> Option<SwapRef> {
        let mut best: Option<(u32, usize)> = None;
        for (index, device) in self.devices.iter().enumerate() {
            let device = match device {
                Some(device) => device,
                None => continue,
            };
            if device.used_pages + device.bad_pages >= device.total_pages {
                continue;
            }
            if best.map_or(true, |(priority, _)| device.priority > priority) {
                best = Some((device.priority, index));
            }
        }
        let (_, index) = best?;
        let device = self.devices[index].as_mut().expect("picked above");
        let slot = device.bitmap.find_clear()?;
        device.bitmap.set(slot);
        device.used_pages += 1;
        Some(SwapRef::new(index as u8, slot))
    }

    fn free_slot(&mut self, swap: SwapRef) {
        if let Some(device) = self.device_mut(swap.device) {
            if swap.slot < device.total_pages && device.bitmap.get(swap.slot) {
                device.bitmap.clear(swap.slot);
                device.used_pages -= 1;
            }
        }
    }
}

impl Default for SwapManager {
    fn default() -> Self {
        SwapManager::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::{PteFlags, USER_START};
    use crate::replace::Algorithm;

    struct Fixture {
        mem: PhysMemory,
        frames: FramePool,
        vmm: Vmm,
        replace: Replacer,
        swap: SwapManager,
        space: SpaceId,
    }

    fn fixture() -> Fixture {
        let mut frames = FramePool::new(64, 4);
        let mut vmm = Vmm::new(&mut frames).unwrap();
        let space = vmm.create_address_space(&mut frames).unwrap();
        Fixture {
            mem: PhysMemory::new(64),
            frames,
            vmm,
            replace: Replacer::new(Algorithm::Lru),
            swap: SwapManager::new(),
            space,
        }
    }

    fn upage(n: u32) -> VirtAddr {
        VirtAddr::from_raw(USER_START + n * PAGE_SIZE)
    }

    impl Fixture {
        fn ram_device(&mut self, path: &str, priority: u32, pages: u32) -> u8 {
            self.swap
                .swap_on(path, priority, Box::new(MemBacking::new(pages)))
                .unwrap()
        }

        fn map_user_page(&mut self, n: u32, fill: u8) -> PhysAddr {
            let frame = self.frames.alloc_frame().unwrap();
            self.mem.fill(frame, PAGE_SIZE, fill).unwrap();
            self.vmm
                .map(
                    &mut self.frames,
                    self.space,
                    upage(n),
                    frame,
                    PteFlags::WRITABLE | PteFlags::USER,
                )
                .unwrap();
            self.replace.add_page(
                upage(n),
                frame,
                crate::replace::PageFlags::empty(),
                self.space,
            );
            frame
        }
    }

    #[test]
    fn header_round_trip() {
        let mut header = SwapHeader::new(4096);
        header.bad_pages = vec![7, 123, 4000];
        let bytes = header.encode();
        assert_eq!(&bytes[..10], SWAP_SIGNATURE);
        assert_eq!(bytes.len(), 522 + 12);
        assert_eq!(SwapHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn header_rejects_garbage() {
        assert_eq!(
            SwapHeader::decode(b"NOTSWAP"),
            Err(MemError::InvalidArgument)
        );
        let mut bytes = SwapHeader::new(16).encode();
        bytes[0] = b'X';
        assert_eq!(SwapHeader::decode(&bytes), Err(MemError::InvalidArgument));
        // A bad page past the end is invalid.
        let mut header = SwapHeader::new(16);
        header.bad_pages = vec![16];
        assert_eq!(
            SwapHeader::decode(&header.encode()),
            Err(MemError::InvalidArgument)
        );
    }

    #[test]
    fn swap_out_then_in_restores_contents() {
        let mut f = fixture();
        f.ram_device("/dev/swap0", 1, 128);
        let frame = f.map_user_page(0, 0xc3);
        let used_before = f.frames.frames_used();

        let swap = f
            .swap
            .swap_out(
                &mut f.vmm,
                &mut f.frames,
                &f.mem,
                &mut f.replace,
                f.space,
                upage(0),
            )
            .unwrap();

        // Frame freed, mapping replaced by the swap reference, page gone
        // from the resident set.
        assert_eq!(f.frames.frames_used(), used_before - 1);
        assert!(!f.frames.is_used(frame));
        let pte = f.vmm.pte(f.space, upage(0)).unwrap();
        assert_eq!(pte.swap_ref(), Some(swap));
        assert!(!f.replace.contains(upage(0)));
        assert_eq!(f.swap.stats().used_pages, 1);

        // Scribble over the old frame; the swap copy must win.
        f.mem.fill(frame, PAGE_SIZE, 0x00).unwrap();

        f.swap
            .swap_in(
                &mut f.vmm,
                &mut f.frames,
                &mut f.mem,
                &mut f.replace,
                f.space,
                upage(0),
                swap,
            )
            .unwrap();

        let paddr = f.vmm.translate(f.space, upage(0)).unwrap();
        assert!(f
            .mem
            .bytes(paddr, PAGE_SIZE)
            .unwrap()
            .iter()
            .all(|&b| b == 0xc3));
        assert!(f.replace.contains(upage(0)));
        assert_eq!(f.swap.stats().used_pages, 0);
        assert!(f.swap.check_slot_accounting());
    }

    #[test]
    fn swap_out_unmapped_rolls_back_slot() {
        let mut f = fixture();
        f.ram_device("/dev/swap0", 1, 128);
        let result = f.swap.swap_out(
            &mut f.vmm,
            &mut f.frames,
            &f.mem,
            &mut f.replace,
            f.space,
            upage(5),
        );
        assert_eq!(result, Err(MemError::NotPresent));
        assert_eq!(f.swap.stats().used_pages, 0);
        assert!(f.swap.check_slot_accounting());
    }

    #[test]
    fn failed_write_rolls_back_and_keeps_mapping() {
        let mut f = fixture();
        f.swap
            .swap_on("/swapfile", 1, Box::new(UnboundFileBacking))
            .unwrap();
        let frame = f.map_user_page(0, 0xaa);

        let result = f.swap.swap_out(
            &mut f.vmm,
            &mut f.frames,
            &f.mem,
            &mut f.replace,
            f.space,
            upage(0),
        );
        assert!(result.is_err());
        assert_eq!(f.vmm.translate(f.space, upage(0)), Some(frame));
        assert_eq!(f.swap.stats().used_pages, 0);
    }

    #[test]
    fn failed_read_leaves_entry_for_retry() {
        let mut f = fixture();
        f.ram_device("/dev/swap0", 1, 128);
        f.map_user_page(0, 0x42);
        let swap = f
            .swap
            .swap_out(
                &mut f.vmm,
                &mut f.frames,
                &f.mem,
                &mut f.replace,
                f.space,
                upage(0),
            )
            .unwrap();

        // Sabotage: deactivate the backing under the manager.
        let device = f.swap.devices[0].as_mut().unwrap();
        device.backing.deactivate().unwrap();

        let used = f.frames.frames_used();
        let result = f.swap.swap_in(
            &mut f.vmm,
            &mut f.frames,
            &mut f.mem,
            &mut f.replace,
            f.space,
            upage(0),
            swap,
        );
        assert!(result.is_err());
        // Frame rolled back, entry still encodes the reference.
        assert_eq!(f.frames.frames_used(), used);
        assert_eq!(f.vmm.pte(f.space, upage(0)).unwrap().swap_ref(), Some(swap));
    }

    #[test]
    fn swap_in_unknown_handle_is_not_present() {
        let mut f = fixture();
        f.ram_device("/dev/swap0", 1, 128);
        let bogus = SwapRef::new(0, 77);
        assert_eq!(
            f.swap.swap_in(
                &mut f.vmm,
                &mut f.frames,
                &mut f.mem,
                &mut f.replace,
                f.space,
                upage(0),
                bogus,
            ),
            Err(MemError::NotPresent)
        );
    }

    #[test]
    fn higher_priority_device_fills_first() {
        let mut f = fixture();
        let slow = f.ram_device("/dev/slow", 1, 128);
        let fast = f.ram_device("/dev/fast", 9, 128);
        f.map_user_page(0, 1);
        let swap = f
            .swap
            .swap_out(
                &mut f.vmm,
                &mut f.frames,
                &f.mem,
                &mut f.replace,
                f.space,
                upage(0),
            )
            .unwrap();
        assert_eq!(swap.device, fast);
        assert_ne!(swap.device, slow);
    }

    #[test]
    fn swap_off_refuses_busy_device() {
        let mut f = fixture();
        f.ram_device("/dev/swap0", 1, 128);
        f.map_user_page(0, 1);
        f.swap
            .swap_out(
                &mut f.vmm,
                &mut f.frames,
                &f.mem,
                &mut f.replace,
                f.space,
                upage(0),
            )
            .unwrap();

        assert_eq!(f.swap.swap_off("/dev/swap0"), Err(MemError::DeviceBusy));

        // Draining the device frees it for removal.
        let swap = f.vmm.pte(f.space, upage(0)).unwrap().swap_ref().unwrap();
        f.swap
            .swap_in(
                &mut f.vmm,
                &mut f.frames,
                &mut f.mem,
                &mut f.replace,
                f.space,
                upage(0),
                swap,
            )
            .unwrap();
        f.swap.swap_off("/dev/swap0").unwrap();
        assert_eq!(f.swap.device_count(), 0);
    }

    #[test]
    fn bad_pages_are_never_allocated() {
        let mut f = fixture();
        let mut header = SwapHeader::new(8);
        header.bad_pages = vec![0, 1, 2];
        f.swap
            .swap_on("/dev/swap0", 1, Box::new(MemBacking::from_header(&header)))
            .unwrap();

        for n in 0..5 {
            f.map_user_page(n, n as u8);
            let swap = f
                .swap
                .swap_out(
                    &mut f.vmm,
                    &mut f.frames,
                    &f.mem,
                    &mut f.replace,
                    f.space,
                    upage(n),
                )
                .unwrap();
            assert!(swap.slot >= 3, "slot {} is marked bad", swap.slot);
        }
        // Device is now full: 5 usable slots, 3 bad.
        f.map_user_page(6, 6);
        assert_eq!(
            f.swap.swap_out(
                &mut f.vmm,
                &mut f.frames,
                &f.mem,
                &mut f.replace,
                f.space,
                upage(6),
            ),
            Err(MemError::OutOfMemory)
        );
        assert!(f.swap.check_slot_accounting());
    }

    #[test]
    fn reclaim_swaps_out_victims() {
        let mut f = fixture();
        f.ram_device("/dev/swap0", 1, 128);
        for n in 0..10 {
            f.map_user_page(n, n as u8);
        }
        f.replace.lock_page(upage(9));

        let reclaimed = f.swap.reclaim(
            &mut f.vmm,
            &mut f.frames,
            &f.mem,
            &mut f.replace,
            4,
        );
        assert_eq!(reclaimed, 4);
        assert_eq!(f.replace.tracked_pages(), 6);
        assert_eq!(f.swap.stats().used_pages, 4);
        assert_eq!(f.swap.stats().reclaim_attempts, 1);
        // The locked page survived.
        assert!(f.replace.contains(upage(9)));
    }

    #[test]
    fn pressure_levels_follow_usage() {
        let mut frames = FramePool::new(100, 0);
        let swap = SwapManager::new();
        assert_eq!(swap.pressure(&frames, false), PressureLevel::None);

        let mut held = Vec::new();
        for _ in 0..85 {
            held.push(frames.alloc_frame().unwrap());
        }
        assert_eq!(swap.pressure(&frames, false), PressureLevel::Medium);
        for _ in 0..11 {
            held.push(frames.alloc_frame().unwrap());
        }
        assert_eq!(swap.pressure(&frames, false), PressureLevel::High);
        for _ in 0..3 {
            held.push(frames.alloc_frame().unwrap());
        }
        assert_eq!(swap.pressure(&frames, false), PressureLevel::Critical);

        // An allocation failure is critical regardless of usage.
        let fresh = FramePool::new(100, 0);
        assert_eq!(swap.pressure(&fresh, true), PressureLevel::Critical);
    }
}
