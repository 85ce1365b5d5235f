//! Shared ownership, sharing and version tables, plus the per-process
//! access states.
//!
//! The shared tables are flat arrays of atomic cells indexed by page
//! number, mapped from memfds so that forked processes alias the same
//! cells. The access states are deliberately process-local: each process
//! tracks its own view of a page, and a fork simply copies the current
//! snapshot.
use core::sync::atomic::{AtomicI32, AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::io;

use memfile::{CreateOptions, MemFile};
use memmap2::MmapRaw;

use twin_arena::TwinId;

/// Owner value of a page every process may read and write.
pub const SHARED_PAGE: i32 = i32::MAX;

/// Owner value of a page nobody has claimed yet.
pub const UNOWNED: i32 = 0;

/// This process's view of a page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PageAccess {
    /// Untouched in the current transaction.
    None = 0,
    /// Readable; a write escalates.
    Read = 1,
    /// Writable; the page is dirty or owned.
    ReadWrite = 4,
    /// Owned by some other process; any access must recall it first.
    Unused = 8,
}

/// Per-page sharing info: concurrent writer count and the twin slot.
///
/// Both halves are atomics because SIGUSR1 delivery may interleave with a
/// fault handler reading them.
#[repr(C)]
struct ShareCell {
    users: AtomicU16,
    twin: AtomicU16,
}

/// The shared page tables.
///
/// # Safety
///
/// The slice members borrow the mappings held alongside them; their
/// `'static` lifetime is a lie kept honest by never handing the references
/// out with unchanged lifetimes and by keeping the maps in the struct
/// until drop.
pub struct OwnerTable {
    owners: &'static [AtomicI32],
    share: &'static [ShareCell],
    versions: &'static [AtomicU64],
    #[allow(dead_code)]
    tables_map: MmapRaw,
    #[allow(dead_code)]
    versions_map: MmapRaw,
    #[allow(dead_code)]
    tables_file: MemFile,
    #[allow(dead_code)]
    versions_file: MemFile,
}

impl OwnerTable {
    /// Create the tables for `pages` pages.
    ///
    /// The version counters get their own backing file, sized to one u64
    /// per page; owner and sharing cells share a second one.
    pub(crate) fn create(pages: usize) -> io::Result<OwnerTable> {
        let tables_file = CreateOptions::new().create("twin-tables")?;
        tables_file.set_len((pages * (4 + 4)) as u64)?;

        let versions_file = CreateOptions::new().create("twin-versions")?;
        versions_file.set_len((pages * 8) as u64)?;

        let tables_map = MmapRaw::map_raw(&tables_file)?;
        let versions_map = MmapRaw::map_raw(&versions_file)?;

        // Safety: each slice stays in-bounds of its zero-initialized
        // mapping; the cells are full atomics, so the aliasing across
        // processes is the intended interior mutability. The maps are kept
        // in the struct, outliving every derived reference.
        let (owners, share, versions) = unsafe {
            let owners = &*core::ptr::slice_from_raw_parts(
                tables_map.as_mut_ptr() as *const AtomicI32,
                pages,
            );
            let share = &*core::ptr::slice_from_raw_parts(
                tables_map.as_mut_ptr().add(pages * 4) as *const ShareCell,
                pages,
            );
            let versions = &*core::ptr::slice_from_raw_parts(
                versions_map.as_mut_ptr() as *const AtomicU64,
                pages,
            );
            (owners, share, versions)
        };

        Ok(OwnerTable {
            owners,
            share,
            versions,
            tables_map,
            versions_map,
            tables_file,
            versions_file,
        })
    }

    pub(crate) fn pages(&self) -> usize {
        self.owners.len()
    }

    pub(crate) fn owner(&self, page_no: usize) -> i32 {
        self.owners[page_no].load(Ordering::Acquire)
    }

    pub(crate) fn set_owner(&self, page_no: usize, owner: i32) {
        self.owners[page_no].store(owner, Ordering::Release);
    }

    pub(crate) fn exchange_owner(&self, page_no: usize, owner: i32) -> i32 {
        self.owners[page_no].swap(owner, Ordering::AcqRel)
    }

    pub(crate) fn is_shared(&self, page_no: usize) -> bool {
        self.owner(page_no) == SHARED_PAGE
    }

    pub(crate) fn users(&self, page_no: usize) -> u16 {
        self.share[page_no].users.load(Ordering::Acquire)
    }

    pub(crate) fn add_user(&self, page_no: usize) {
        self.share[page_no].users.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn remove_user(&self, page_no: usize) {
        self.share[page_no].users.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn twin(&self, page_no: usize) -> Option<TwinId> {
        TwinId::from_raw(self.share[page_no].twin.load(Ordering::Acquire))
    }

    /// Publish a freshly filled twin slot. Fails when another process won
    /// the race; the caller returns its slot to the arena.
    pub(crate) fn install_twin(&self, page_no: usize, id: TwinId) -> Result<(), ()> {
        self.share[page_no]
            .twin
            .compare_exchange(0, id.get(), Ordering::AcqRel, Ordering::Acquire)
            .map(drop)
            .map_err(drop)
    }

    /// Detach the twin slot, if any.
    pub(crate) fn take_twin(&self, page_no: usize) -> Option<TwinId> {
        TwinId::from_raw(self.share[page_no].twin.swap(0, Ordering::AcqRel))
    }

    pub(crate) fn version(&self, page_no: usize) -> u64 {
        self.versions[page_no].load(Ordering::Acquire)
    }

    pub(crate) fn bump_version(&self, page_no: usize) {
        self.versions[page_no].fetch_add(1, Ordering::AcqRel);
    }
}

/// Per-process access states, one atomic byte per page.
///
/// Atomic because `commit_owned_page` runs from the SIGUSR1 handler and
/// must not tear against a fault handler mid-transition.
pub(crate) struct PageStates {
    states: Box<[AtomicU8]>,
}

impl PageStates {
    pub(crate) fn new(pages: usize) -> PageStates {
        let mut states = Vec::with_capacity(pages);
        states.resize_with(pages, || AtomicU8::new(PageAccess::None as u8));

        PageStates {
            states: states.into_boxed_slice(),
        }
    }

    pub(crate) fn get(&self, page_no: usize) -> PageAccess {
        match self.states[page_no].load(Ordering::Acquire) {
            0 => PageAccess::None,
            1 => PageAccess::Read,
            4 => PageAccess::ReadWrite,
            8 => PageAccess::Unused,
            raw => unreachable!("corrupt page access state {raw}"),
        }
    }

    pub(crate) fn set(&self, page_no: usize, access: PageAccess) {
        self.states[page_no].store(access as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tables_are_unowned() {
        let table = OwnerTable::create(4).unwrap();

        for page_no in 0..4 {
            assert_eq!(table.owner(page_no), UNOWNED);
            assert_eq!(table.users(page_no), 0);
            assert_eq!(table.twin(page_no), None);
            assert_eq!(table.version(page_no), 0);
        }
    }

    #[test]
    fn owner_exchange_and_versions() {
        let table = OwnerTable::create(2).unwrap();

        table.set_owner(0, 1234);
        assert_eq!(table.exchange_owner(0, SHARED_PAGE), 1234);
        assert!(table.is_shared(0));
        assert!(!table.is_shared(1));

        table.bump_version(1);
        table.bump_version(1);
        assert_eq!(table.version(1), 2);
        assert_eq!(table.version(0), 0);
    }

    #[test]
    fn twin_install_is_single_winner() {
        let table = OwnerTable::create(1).unwrap();
        let first = TwinId::from_raw(3).unwrap();
        let second = TwinId::from_raw(5).unwrap();

        assert!(table.install_twin(0, first).is_ok());
        assert!(table.install_twin(0, second).is_err());
        assert_eq!(table.twin(0), Some(first));

        assert_eq!(table.take_twin(0), Some(first));
        assert_eq!(table.take_twin(0), None);
    }

    #[test]
    fn states_round_trip() {
        let states = PageStates::new(3);
        assert_eq!(states.get(2), PageAccess::None);

        states.set(2, PageAccess::ReadWrite);
        assert_eq!(states.get(2), PageAccess::ReadWrite);

        states.set(2, PageAccess::Unused);
        assert_eq!(states.get(2), PageAccess::Unused);
    }
}
