//! Shared arena of twin-page slots.
use core::num::NonZeroU16;
use core::sync::atomic::{AtomicU64, Ordering};
use std::io;

use memfile::{CreateOptions, MemFile};
use memmap2::MmapRaw;

use crate::PAGE_SIZE;

/// Handle to an allocated twin slot.
///
/// Slot 0 is reserved as "no twin", which is why the inner index is
/// non-zero. The id is meaningful to every process sharing the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TwinId(NonZeroU16);

impl TwinId {
    pub fn get(self) -> u16 {
        self.0.get()
    }

    /// Rehydrate an id previously published through a shared cell.
    pub fn from_raw(raw: u16) -> Option<TwinId> {
        NonZeroU16::new(raw).map(TwinId)
    }
}

/// A pool of page-sized snapshot slots in one shared mapping.
///
/// Layout: an allocation bitmap (one bit per slot, bit 0 burned for the
/// reserved id), a version word per slot, then the slot pages themselves,
/// page-aligned. All bookkeeping cells are atomics because the mapping is
/// aliased by every process that inherited the memfd.
pub struct TwinArena {
    map: MmapRaw,
    /// The slot pointers are derived from `map`; the memfd itself survives
    /// only as this open descriptor, shared across fork.
    #[allow(dead_code)]
    file: MemFile,
    layout: Layout,
}

#[derive(Clone, Copy)]
struct Layout {
    words: usize,
    versions_offset: usize,
    pages_offset: usize,
    slots: u16,
}

impl Layout {
    fn for_slots(slots: u16) -> Layout {
        // Bitmap covers slot ids 0..=slots; id 0 never leaves the arena.
        let bits = slots as usize + 1;
        let words = bits / 64 + usize::from(bits % 64 != 0);
        let versions_offset = words * 8;
        let bookkeeping = versions_offset + bits * 8;
        let pages_offset = bookkeeping.next_multiple_of(PAGE_SIZE);

        Layout {
            words,
            versions_offset,
            pages_offset,
            slots,
        }
    }

    fn total(&self) -> usize {
        self.pages_offset + (self.slots as usize + 1) * PAGE_SIZE
    }
}

impl TwinArena {
    /// Create an arena with `slots` usable twin slots.
    pub fn create(slots: u16) -> io::Result<TwinArena> {
        let layout = Layout::for_slots(slots);

        let file = CreateOptions::new().create("twin-arena")?;
        file.set_len(layout.total() as u64)?;

        let map = MmapRaw::map_raw(&file)?;
        let arena = TwinArena { map, file, layout };

        // Burn bit 0 so alloc never returns the reserved id.
        arena.word(0).fetch_or(1, Ordering::Release);
        Ok(arena)
    }

    pub fn slots(&self) -> u16 {
        self.layout.slots
    }

    fn word(&self, index: usize) -> &AtomicU64 {
        debug_assert!(index < self.layout.words);
        // Safety: in-bounds of the bitmap span, 8-aligned (mapping is page
        // aligned), and valid while `self.map` is held. Aliased across
        // processes, hence the atomic view.
        unsafe { &*(self.map.as_mut_ptr() as *const AtomicU64).add(index) }
    }

    fn version_cell(&self, id: TwinId) -> &AtomicU64 {
        // Safety: `id <= slots` by construction; same aliasing argument as
        // `word`.
        unsafe {
            &*(self.map.as_mut_ptr().add(self.layout.versions_offset) as *const AtomicU64)
                .add(id.get() as usize)
        }
    }

    /// Claim a free slot. Returns `None` when the arena is exhausted.
    pub fn alloc(&self) -> Option<TwinId> {
        for index in 0..self.layout.words {
            let word = self.word(index);
            let mut current = word.load(Ordering::Acquire);

            loop {
                let free = (!current).trailing_zeros();

                if free == 64 {
                    break;
                }

                let bit = index as u32 * 64 + free;

                if bit > self.layout.slots as u32 {
                    return None;
                }

                match word.compare_exchange_weak(
                    current,
                    current | 1 << free,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return TwinId::from_raw(bit as u16),
                    Err(seen) => current = seen,
                }
            }
        }

        None
    }

    /// Return a slot to the arena.
    pub fn free(&self, id: TwinId) {
        let index = id.get() as usize / 64;
        let bit = id.get() as usize % 64;

        self.version_cell(id).store(0, Ordering::Release);
        self.word(index).fetch_and(!(1 << bit), Ordering::AcqRel);
    }

    /// Address of the slot's page.
    pub fn page(&self, id: TwinId) -> *mut u8 {
        debug_assert!(id.get() <= self.layout.slots);
        // Safety: in-bounds; the page stays mapped while `self.map` lives.
        unsafe {
            self.map
                .as_mut_ptr()
                .add(self.layout.pages_offset + id.get() as usize * PAGE_SIZE)
        }
    }

    pub fn version(&self, id: TwinId) -> u64 {
        self.version_cell(id).load(Ordering::Acquire)
    }

    pub fn set_version(&self, id: TwinId, version: u64) {
        self.version_cell(id).store(version, Ordering::Release);
    }
}
