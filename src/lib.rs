//! Memory-management core for a small x86 teaching kernel.
//!
//! The crate owns physical frames, the kernel heap allocators, virtual
//! memory mappings, copy-on-write sharing, page replacement and swap. The
//! rest of the kernel (shell, filesystem, drivers, scheduler) consumes it
//! through [`MemoryCore`] and never reaches into the subsystems directly.
//!
//! Virtual memory map (32-bit, two-level paging):
//!   0x0000_0000 - 0x0fff_ffff: kernel image + linear-mapped low memory
//!   0x1000_0000 - 0x3fff_ffff: kernel heap (grown lazily on fault)
//!   0x4000_0000 - 0xdfff_ffff: user range (COW-eligible)
//!   0xe000_0000 - 0xffff_ffff: user stacks (managed by the scheduler)

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addr;
pub mod arena;
pub mod bitmap;
pub mod buddy;
pub mod cache;
pub mod cow;
pub mod error;
pub mod kalloc;
pub mod kcore;
pub mod paging;
pub mod phys;
pub mod replace;
pub mod slab;
pub mod slob;
pub mod slub;
pub mod stack;
pub mod stats;
pub mod swap;
pub mod vmm;

pub use addr::{PhysAddr, VirtAddr, PAGE_SIZE};
pub use error::MemError;
pub use kalloc::{AllocFlags, SystemMode};
pub use kcore::{CoreConfig, FaultCode, FaultOutcome, LockedCore, MemoryCore};
pub use paging::PteFlags;
pub use replace::Algorithm;
pub use stats::MemoryStats;
pub use swap::{MemBacking, PressureLevel, SwapBacking};
pub use vmm::SpaceId;
