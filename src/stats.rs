//! Read-only statistics snapshot assembled by the core.

use crate::kalloc::UnifiedStats;
use crate::replace::{ReplaceStats, ALGORITHM_COUNT};
use crate::swap::{PressureLevel, SwapStats};

/// Everything the `/proc`-style surface reports, gathered in one value.
/// Fields are plain data; taking a snapshot never perturbs the core.
#[derive(Clone, Copy, Debug)]
pub struct MemoryStats {
    pub frames_total: u32,
    pub frames_used: u32,
    pub frames_free: u32,
    pub cow_pages: u64,
    pub cow_refs: u64,
    pub pressure: PressureLevel,
    pub alloc: UnifiedStats,
    pub swap: SwapStats,
    /// Per-algorithm replacement statistics, indexed by `Algorithm`.
    pub replace: [ReplaceStats; ALGORITHM_COUNT],
}

impl MemoryStats {
    /// Hit rate of one algorithm as a 0..=100 percentage, if it ever ran.
    pub fn hit_rate(&self, algorithm: crate::replace::Algorithm) -> Option<u32> {
        let row = self.replace[algorithm as usize];
        let total = row.hits + row.misses;
        if total == 0 {
            return None;
        }
        Some((row.hits * 100 / total) as u32)
    }
}
