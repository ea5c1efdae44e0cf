//! Page-replacement: resident-page tracking and victim selection.
//!
//! All four algorithms run over one descriptor arena linked by ids: LRU
//! and FIFO treat the list head as most-recent/newest, Clock walks it as
//! a ring with a hand, Enhanced-LRU ignores the order and scores every
//! descriptor. Switching algorithms re-files the descriptors and keeps a
//! separate statistics row per algorithm.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use bitflags::bitflags;
use num_derive::{FromPrimitive, ToPrimitive};

use crate::addr::{PhysAddr, VirtAddr};
use crate::arena::{Arena, Id};
use crate::vmm::SpaceId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive, ToPrimitive)]
pub enum Algorithm {
    Lru = 0,
    Fifo = 1,
    Clock = 2,
    LruEnhanced = 3,
}

pub const ALGORITHM_COUNT: usize = 4;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct PageFlags: u32 {
        const ACCESSED = 1 << 0;
        const DIRTY    = 1 << 1;
        const SWAPPED  = 1 << 2;
        const LOCKED   = 1 << 3;
    }
}

pub struct PageDescriptor {
    pub vaddr: VirtAddr,
    pub paddr: PhysAddr,
    pub flags: PageFlags,
    pub access_count: u32,
    pub last_access_ticks: u64,
    pub create_ticks: u64,
    pub owner: SpaceId,
    prev: Option<PageId>,
    next: Option<PageId>,
    /// Insertion stamp; preserves recency order across algorithm
    /// switches.
    position: u64,
    ref_bit: bool,
}

pub type PageId = Id<PageDescriptor>;

/// Snapshot of the page picked for eviction. The descriptor stays
/// tracked until the eviction actually succeeds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Victim {
    pub vaddr: VirtAddr,
    pub paddr: PhysAddr,
    pub flags: PageFlags,
    pub owner: SpaceId,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReplaceStats {
    pub replacements: u64,
    pub hits: u64,
    pub misses: u64,
    pub dirty_writebacks: u64,
    pub switches: u64,
}

pub struct Replacer {
    algorithm: Algorithm,
    pages: Arena<PageDescriptor>,
    by_vaddr: BTreeMap<u32, PageId>,
    head: Option<PageId>,
    tail: Option<PageId>,
    clock_hand: Option<PageId>,
    ticks: u64,
    stats: [ReplaceStats; ALGORITHM_COUNT],
}

impl Replacer {
    pub fn new(algorithm: Algorithm) -> Replacer {
        Replacer {
            algorithm,
            pages: Arena::new(),
            by_vaddr: BTreeMap::new(),
            head: None,
            tail: None,
            clock_hand: None,
            ticks: 0,
            stats: [ReplaceStats::default(); ALGORITHM_COUNT],
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The auto-tuning table: which algorithm suits a usage percentage.
    pub fn algorithm_for_pressure(percent: u32) -> Algorithm {
        match percent {
            0..=49 => Algorithm::Lru,
            50..=79 => Algorithm::LruEnhanced,
            80..=94 => Algorithm::Clock,
            _ => Algorithm::Fifo,
        }
    }

    /// Start tracking a resident page. An existing descriptor for the
    /// same vaddr is replaced.
    pub fn add_page(&mut self, vaddr: VirtAddr, paddr: PhysAddr, flags: PageFlags, owner: SpaceId) {
        if self.by_vaddr.contains_key(&vaddr.as_raw()) {
            self.remove_page(vaddr);
        }
        self.ticks += 1;
        let now = self.ticks;
        let id = self.pages.insert(PageDescriptor {
            vaddr,
            paddr,
            flags,
            access_count: 1,
            last_access_ticks: now,
            create_ticks: now,
            owner,
            prev: None,
            next: None,
            position: now,
            ref_bit: false,
        });
        self.by_vaddr.insert(vaddr.as_raw(), id);
        self.push_head(id);
        if self.clock_hand.is_none() {
            self.clock_hand = Some(id);
        }
    }

    pub fn remove_page(&mut self, vaddr: VirtAddr) -> Option<Victim> {
        let id = self.by_vaddr.remove(&vaddr.as_raw())?;
        self.unlink(id);
        let d = self.pages.remove(id)?;
        Some(Victim {
            vaddr: d.vaddr,
            paddr: d.paddr,
            flags: d.flags,
            owner: d.owner,
        })
    }

    /// Record an access to a resident page. Must be observed before the
    /// next `find_victim`, which holds trivially on a single processor.
    pub fn note_access(&mut self, vaddr: VirtAddr) {
        self.ticks += 1;
        let now = self.ticks;
        let id = match self.by_vaddr.get(&vaddr.as_raw()) {
            Some(&id) => id,
            None => {
                self.stats_mut().misses += 1;
                return;
            }
        };
        self.stats_mut().hits += 1;

        let d = self.pages.get_mut(id).expect("tracked page");
        d.access_count += 1;
        d.last_access_ticks = now;
        d.flags.insert(PageFlags::ACCESSED);
        match self.algorithm {
            Algorithm::Lru | Algorithm::LruEnhanced => {
                let d = self.pages.get_mut(id).expect("tracked page");
                d.position = now;
                self.unlink(id);
                self.push_head(id);
            }
            Algorithm::Clock => {
                d.ref_bit = true;
            }
            Algorithm::Fifo => {}
        }
    }

    pub fn mark_dirty(&mut self, vaddr: VirtAddr) {
        if let Some(&id) = self.by_vaddr.get(&vaddr.as_raw()) {
            self.pages
                .get_mut(id)
                .expect("tracked page")
                .flags
                .insert(PageFlags::DIRTY);
        }
    }

    pub fn mark_clean(&mut self, vaddr: VirtAddr) {
        if let Some(&id) = self.by_vaddr.get(&vaddr.as_raw()) {
            self.pages
                .get_mut(id)
                .expect("tracked page")
                .flags
                .remove(PageFlags::DIRTY);
        }
    }

    pub fn lock_page(&mut self, vaddr: VirtAddr) {
        if let Some(&id) = self.by_vaddr.get(&vaddr.as_raw()) {
            self.pages
                .get_mut(id)
                .expect("tracked page")
                .flags
                .insert(PageFlags::LOCKED);
        }
    }

    pub fn unlock_page(&mut self, vaddr: VirtAddr) {
        if let Some(&id) = self.by_vaddr.get(&vaddr.as_raw()) {
            self.pages
                .get_mut(id)
                .expect("tracked page")
                .flags
                .remove(PageFlags::LOCKED);
        }
    }

    pub fn contains(&self, vaddr: VirtAddr) -> bool {
        self.by_vaddr.contains_key(&vaddr.as_raw())
    }

    /// Drop every descriptor owned by a dying address space.
    pub fn remove_owned(&mut self, owner: SpaceId) -> usize {
        let vaddrs: Vec<VirtAddr> = self
            .pages
            .iter()
            .filter(|(_, d)| d.owner == owner)
            .map(|(_, d)| d.vaddr)
            .collect();
        let count = vaddrs.len();
        for vaddr in vaddrs {
            self.remove_page(vaddr);
        }
        count
    }

    pub fn tracked_pages(&self) -> usize {
        self.pages.len()
    }

    /// Select the page the current algorithm would evict. The page stays
    /// tracked; the caller removes it once the eviction succeeds.
    pub fn find_victim(&mut self) -> Option<Victim> {
        let id = match self.algorithm {
            Algorithm::Lru | Algorithm::Fifo => self.tail_victim(),
            Algorithm::Clock => self.clock_victim(),
            Algorithm::LruEnhanced => self.scored_victim(),
        }?;
        let d = self.pages.get(id).expect("victim is tracked");
        let victim = Victim {
            vaddr: d.vaddr,
            paddr: d.paddr,
            flags: d.flags,
            owner: d.owner,
        };
        let stats = self.stats_mut();
        stats.replacements += 1;
        if victim.flags.contains(PageFlags::DIRTY) {
            stats.dirty_writebacks += 1;
        }
        Some(victim)
    }

    /// Re-file every descriptor under a new algorithm. Recency order is
    /// preserved via the position stamps; statistics keep accumulating in
    /// the new algorithm's row.
    pub fn set_algorithm(&mut self, algorithm: Algorithm) {
        if algorithm == self.algorithm {
            return;
        }
        self.algorithm = algorithm;
        self.stats_mut().switches += 1;

        let mut ids: Vec<PageId> = self.pages.iter().map(|(id, _)| id).collect();
        ids.sort_by_key(|&id| self.pages.get(id).expect("live page").position);

        self.head = None;
        self.tail = None;
        self.clock_hand = None;
        for id in &ids {
            let d = self.pages.get_mut(*id).expect("live page");
            d.prev = None;
            d.next = None;
            if algorithm == Algorithm::Clock {
                d.ref_bit = false;
            }
        }
        // Oldest first so the newest ends up at the head.
        for id in ids {
            self.push_head(id);
        }
        self.clock_hand = self.head;
    }

    pub fn stats(&self, algorithm: Algorithm) -> ReplaceStats {
        self.stats[algorithm as usize]
    }

    pub fn current_stats(&self) -> ReplaceStats {
        self.stats[self.algorithm as usize]
    }

    pub fn reset_stats(&mut self) {
        self.stats = [ReplaceStats::default(); ALGORITHM_COUNT];
    }

    /// Pages in list order from the head; each tracked page appears in
    /// exactly one structure, which this walk exposes for tests.
    pub fn list_order(&self) -> Vec<VirtAddr> {
        let mut out = Vec::new();
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let d = self.pages.get(id).expect("linked page");
            out.push(d.vaddr);
            cursor = d.next;
        }
        out
    }

    fn stats_mut(&mut self) -> &mut ReplaceStats {
        &mut self.stats[self.algorithm as usize]
    }

    fn tail_victim(&self) -> Option<PageId> {
        let mut cursor = self.tail;
        while let Some(id) = cursor {
            let d = self.pages.get(id).expect("linked page");
            if !d.flags.contains(PageFlags::LOCKED) {
                return Some(id);
            }
            cursor = d.prev;
        }
        None
    }

    fn clock_victim(&mut self) -> Option<PageId> {
        let n = self.pages.len();
        if n == 0 {
            return None;
        }
        let mut hand = self.clock_hand.or(self.head)?;
        // Two sweeps: the first may only clear reference bits.
        for _ in 0..(2 * n) {
            let d = self.pages.get_mut(hand).expect("linked page");
            if !d.flags.contains(PageFlags::LOCKED) {
                if d.ref_bit {
                    // Second chance.
                    d.ref_bit = false;
                } else {
                    self.clock_hand = Some(self.ring_next(hand));
                    return Some(hand);
                }
            }
            hand = self.ring_next(hand);
        }
        self.clock_hand = Some(hand);
        None
    }

    fn scored_victim(&self) -> Option<PageId> {
        let mut best: Option<(i64, PageId)> = None;
        for (id, d) in self.pages.iter() {
            if d.flags.contains(PageFlags::LOCKED) {
                continue;
            }
            let score = self.score(d);
            if best.map_or(true, |(s, _)| score < s) {
                best = Some((score, id));
            }
        }
        best.map(|(_, id)| id)
    }

    /// Lower scores evict first: old, rarely used, clean, unreferenced.
    fn score(&self, d: &PageDescriptor) -> i64 {
        let age = self.ticks.saturating_sub(d.last_access_ticks);
        let mut score = (age >> 10) as i64;
        score += 1000 / d.access_count.max(1) as i64;
        if d.flags.contains(PageFlags::DIRTY) {
            score += 500;
        }
        if d.flags.contains(PageFlags::ACCESSED) {
            score -= 100;
        }
        score
    }

    fn ring_next(&self, id: PageId) -> PageId {
        self.pages
            .get(id)
            .expect("linked page")
            .next
            .or(self.head)
            .expect("non-empty ring")
    }

    fn push_head(&mut self, id: PageId) {
        let old_head = self.head;
        {
            let d = self.pages.get_mut(id).expect("live page");
            d.prev = None;
            d.next = old_head;
        }
        if let Some(old) = old_head {
            self.pages.get_mut(old).expect("live page").prev = Some(id);
        }
        self.head = Some(id);
        if self.tail.is_none() {
            self.tail = Some(id);
        }
    }

    fn unlink(&mut self, id: PageId) {
        let (prev, next) = {
            let d = self.pages.get(id).expect("live page");
            (d.prev, d.next)
        };
        match prev {
            Some(p) => self.pages.get_mut(p).expect("live page").next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.pages.get_mut(n).expect("live page").prev = prev,
            None => self.tail = prev,
        }
        if self.clock_hand == Some(id) {
            self.clock_hand = next.or(self.head);
        }
        let d = self.pages.get_mut(id).expect("live page");
        d.prev = None;
        d.next = None;
    }
}
