//! Backing services for the transactional region.
//!
//! Two arenas live here. [`TwinArena`] hands out page-sized twin slots from
//! a shared mapping, so every cooperating process sees the same pre-image
//! bytes under the same slot id. [`EntryArena`] is the per-process pool of
//! page descriptors consumed by the dirty list.
//!
//! Both are injected into the region at construction; nothing in this crate
//! is a process-wide singleton, so multiple regions coexist.
mod entries;
mod twins;

pub use entries::{EntryArena, EntryIdx, PageEntry};
pub use twins::{TwinArena, TwinId};

/// One OS page. The region, the twin slots and the descriptors all work at
/// this granularity.
pub const PAGE_SIZE: usize = 4096;
