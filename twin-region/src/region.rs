//! The region handle: construction, protection control and the fault
//! entry point.
use std::sync::Arc;

use twin_arena::{EntryArena, PageEntry, TwinArena};
use twin_log::{AccessEvent, AccessKind, EventSink};

use crate::map::RegionMap;
use crate::owners::{OwnerTable, PageAccess, PageStates, SHARED_PAGE, UNOWNED};
use crate::{sys, PAGE_SHIFT, PAGE_SIZE};

/// Blocks a process may claim wholesale before the registry overflows.
const OWNED_BLOCK_LIMIT: usize = PAGE_SIZE / 2;

/// Placement and size of a region.
#[derive(Clone, Copy, Debug)]
pub struct RegionConfig {
    /// Fixed start of the transient view; null designates a heap region
    /// placed by the kernel.
    pub start_addr: *mut u8,
    /// Bytes of pre-existing contents at `start_addr` to carry over.
    pub start_size: usize,
    /// Total capacity in bytes; must be a multiple of the page size.
    pub total_size: usize,
}

impl RegionConfig {
    /// A kernel-placed heap region.
    pub fn heap(total_size: usize) -> RegionConfig {
        RegionConfig {
            start_addr: core::ptr::null_mut(),
            start_size: 0,
            total_size,
        }
    }

    /// A region overlaying `start_size` initialized bytes at `start_addr`,
    /// typically the program's globals.
    pub fn fixed(start_addr: *mut u8, start_size: usize, total_size: usize) -> RegionConfig {
        RegionConfig {
            start_addr,
            start_size,
            total_size,
        }
    }
}

/// A range of memory kept persistent and consistent across cooperating
/// processes.
///
/// All accesses go through the transient view at [`Region::base`]. The
/// embedder routes SIGSEGV into [`Region::handle_access`] and SIGUSR1 into
/// [`Region::commit_owned_page`]; both handlers should be installed with
/// the other signal masked, since the commit path is atomic-and-mprotect
/// only and must not interleave with a half-taken fault.
pub struct Region {
    pub(crate) map: RegionMap,
    pub(crate) owners: OwnerTable,
    pub(crate) states: PageStates,
    pub(crate) twins: Arc<TwinArena>,
    pub(crate) entries: EntryArena,
    /// Pages dirtied in the current transaction, in first-write order.
    pub(crate) dirty: Vec<twin_arena::EntryIdx>,
    /// Wholesale-claimed `(start_page, end_page)` blocks.
    pub(crate) owned: Vec<(u32, u32)>,
    logger: Option<Arc<dyn EventSink + Send + Sync>>,
    pub(crate) copy_on_write: bool,
    pub(crate) is_heap: bool,
    pub(crate) trans: u64,
}

impl Region {
    /// Construct the region. The twin arena is shared with every sibling
    /// process; the descriptor arena bounds how many page writes a single
    /// transaction may accumulate.
    ///
    /// Any mapping failure aborts: the region cannot exist partially.
    pub fn new(config: RegionConfig, twins: Arc<TwinArena>, entries: EntryArena) -> Region {
        if config.total_size == 0 || config.total_size % PAGE_SIZE != 0 {
            eprintln!(
                "twin-region: region size {:#x} is not a positive multiple of the page size",
                config.total_size,
            );
            std::process::abort()
        }

        if config.start_size > config.total_size {
            eprintln!(
                "twin-region: this region ({}) is too small ({}).",
                config.total_size, config.start_size,
            );
            std::process::abort()
        }

        let map = RegionMap::create(config.start_addr, config.start_size, config.total_size);
        let pages = config.total_size / PAGE_SIZE;

        let owners = OwnerTable::create(pages).unwrap_or_else(|err| {
            eprintln!("twin-region: ownership tables for {pages} pages failed: {err}");
            std::process::abort()
        });

        let dirty = Vec::with_capacity(entries.capacity());

        Region {
            map,
            owners,
            states: PageStates::new(pages),
            twins,
            entries,
            dirty,
            owned: Vec::with_capacity(OWNED_BLOCK_LIMIT),
            logger: None,
            copy_on_write: false,
            is_heap: config.start_addr.is_null(),
            trans: 0,
        }
    }

    /// Bind the access-event sink and reset the dirty bookkeeping.
    pub fn initialize(&mut self, logger: Arc<dyn EventSink + Send + Sync>) {
        self.logger = Some(logger);
        self.dirty.clear();
        self.entries.cleanup();
    }

    /// Flip buffered mode. With `enabled`, the transient view becomes a
    /// private overlay and writes stay local until commit; without it,
    /// writes flow straight through to the backing store.
    ///
    /// Heap regions drop to no-access everywhere: pages below `end` (the
    /// allocation frontier) become shared, the rest stay claimable.
    /// Global regions stay readable so constructors observe initial
    /// values.
    pub fn set_copy_on_write(&mut self, end: *mut u8, enabled: bool) {
        let semantics = if enabled {
            libc::MAP_PRIVATE
        } else {
            libc::MAP_SHARED
        };

        let base = self.base();
        let pages = self.page_count();

        if self.is_heap {
            if (end as usize) < base as usize || end as usize > base as usize + self.size() {
                eprintln!(
                    "twin-region: allocation frontier {end:p} outside the region at {base:p}",
                );
                std::process::abort()
            }

            let allocated = (end as usize - base as usize) / PAGE_SIZE;
            self.map
                .set_protection(base, self.size(), libc::PROT_NONE, semantics);

            for page_no in 0..allocated {
                self.owners.set_owner(page_no, SHARED_PAGE);
                self.states.set(page_no, PageAccess::None);
            }

            // Unallocated pages can still be claimed wholesale.
            for page_no in allocated..pages {
                self.owners.set_owner(page_no, UNOWNED);
                self.states.set(page_no, PageAccess::Unused);
            }
        } else {
            self.map
                .set_protection(base, self.size(), libc::PROT_READ, semantics);

            for page_no in 0..pages {
                self.owners.set_owner(page_no, SHARED_PAGE);
                self.states.set(page_no, PageAccess::Read);
            }
        }

        self.owned.clear();
        self.trans = 0;
        self.copy_on_write = enabled;

        tracing::debug!(enabled, end = ?end, "copy-on-write switched");
    }

    /// Revert to an unprotected shared mapping; faults stop occurring and
    /// writes become immediately global.
    pub fn close_protection(&mut self) {
        self.map.set_protection(
            self.base(),
            self.size(),
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
        );
        self.copy_on_write = false;

        tracing::debug!("protection closed");
    }

    /// Shutdown: reopen the whole region read/write shared.
    pub fn finalize(&mut self) {
        if self.copy_on_write {
            self.map.set_protection(
                self.base(),
                self.size(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
            );
        }
    }

    /// Claim `[addr, addr + size)` for this process, pairing with a fresh
    /// allocator handout. Owned pages commit lazily at thread exit instead
    /// of at every barrier. Must precede any access to the range.
    pub fn set_owned_page(&mut self, addr: *mut u8, size: usize) {
        if !self.copy_on_write {
            return;
        }

        let pid = sys::pid();
        let start_page = (addr as usize - self.base() as usize) / PAGE_SIZE;
        let pages = size / PAGE_SIZE;

        // Safety: the caller hands us a page-aligned block inside the
        // region, fresh from the allocator.
        unsafe { sys::protect(addr, size, libc::PROT_NONE) };

        for page_no in start_page..start_page + pages {
            self.owners.set_owner(page_no, pid);
            self.states.set(page_no, PageAccess::None);
        }

        if self.owned.len() == OWNED_BLOCK_LIMIT {
            eprintln!("twin-region: owned-block registry exhausted");
            std::process::abort()
        }

        self.owned.push((start_page as u32, (start_page + pages) as u32));
    }

    /// Fault entry point; call from the SIGSEGV handler with the faulting
    /// address, the access direction and the faulting program counter.
    pub fn handle_access(&mut self, addr: *const u8, is_write: bool, pc: usize) {
        if !self.in_range(addr) {
            sys::die("twin-region: fault outside the region\n")
        }

        let page_no = (addr as usize - self.base() as usize) / PAGE_SIZE;

        if let Some(logger) = &self.logger {
            let kind = if is_write {
                AccessKind::Write
            } else {
                AccessKind::Read
            };
            logger.add(AccessEvent::new(
                kind,
                sys::pid(),
                pc as u64,
                (addr as usize >> PAGE_SHIFT) as u64,
            ));
        }

        if is_write {
            self.handle_write(page_no)
        } else {
            self.handle_read(page_no)
        }
    }

    fn handle_read(&mut self, page_no: usize) {
        match self.states.get(page_no) {
            // Another process holds the page; recall it first.
            PageAccess::Unused => self.notify_owner_to_commit(page_no),
            PageAccess::None => {}
            // Possible after an owned-page commit dropped the protection
            // without resetting the state; re-establishing read access is
            // all that is needed.
            PageAccess::Read | PageAccess::ReadWrite => {}
        }

        self.protect_read(page_no);
    }

    fn handle_write(&mut self, page_no: usize) {
        match self.states.get(page_no) {
            PageAccess::Unused => {
                self.notify_owner_to_commit(page_no);
                self.protect_read_write(page_no);
            }
            PageAccess::Read | PageAccess::None => self.protect_read_write(page_no),
            PageAccess::ReadWrite => {
                // Re-fault on a page dirtied earlier whose protection was
                // dropped by a sub-commit: flush the in-flight version,
                // then escalate again.
                self.commit_owned_page(page_no, false);
                self.protect_read_write(page_no);
            }
        }

        // Unbuffered mode writes straight through the shared mapping.
        if !self.copy_on_write {
            return;
        }

        // Writes to owned pages are committed in bulk at thread exit.
        if self.owners.owner(page_no) == sys::pid() {
            return;
        }

        self.owners.add_user(page_no);

        let entry = PageEntry {
            page_no,
            version: self.owners.version(page_no),
            release: true,
        };

        let Some(index) = self.entries.alloc(entry) else {
            sys::die("twin-region: page descriptor pool exhausted\n")
        };
        self.dirty.push(index);
    }

    fn protect_read(&self, page_no: usize) {
        self.states.set(page_no, PageAccess::Read);
        // Safety: page-aligned, in-bounds of the transient view.
        unsafe { sys::protect(self.map.page_start(page_no), PAGE_SIZE, libc::PROT_READ) };
    }

    fn protect_read_write(&self, page_no: usize) {
        if self.owners.owner(page_no) == sys::pid() {
            self.states.set(page_no, PageAccess::ReadWrite);
        }

        // Safety: page-aligned, in-bounds of the transient view.
        unsafe {
            sys::protect(
                self.map.page_start(page_no),
                PAGE_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
    }

    /// Write `value` through the persistent alias, bypassing buffering.
    /// Recovery and patch paths only.
    pub fn mem_write(&self, addr: *mut u8, value: usize) {
        if !self.in_range(addr) {
            sys::die("twin-region: mem_write outside the region\n")
        }

        if addr as usize % core::mem::align_of::<usize>() != 0 {
            sys::die("twin-region: unaligned mem_write\n")
        }

        let offset = addr as usize - self.base() as usize;
        // Safety: in-bounds of the persistent view; the write is volatile
        // because other processes alias the cell.
        unsafe {
            (self.map.persistent_base().add(offset) as *mut usize).write_volatile(value);
        }
    }

    /// True iff `addr` falls inside the transient view.
    pub fn in_range(&self, addr: *const u8) -> bool {
        self.map.contains(addr)
    }

    /// Start of the transient view.
    pub fn base(&self) -> *mut u8 {
        self.map.base()
    }

    /// Capacity in bytes.
    pub fn size(&self) -> usize {
        self.map.len()
    }

    pub fn page_count(&self) -> usize {
        self.owners.pages()
    }

    /// Pair the reader's version check with the committer's publication.
    pub fn memory_barrier(&self) {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }

    // Shared-state introspection, mainly for invariant checks.

    pub fn owner(&self, page_no: usize) -> i32 {
        self.owners.owner(page_no)
    }

    pub fn is_shared_page(&self, page_no: usize) -> bool {
        self.owners.is_shared(page_no)
    }

    pub fn version(&self, page_no: usize) -> u64 {
        self.owners.version(page_no)
    }

    pub fn users(&self, page_no: usize) -> u16 {
        self.owners.users(page_no)
    }

    /// Twin slot of a page; 0 means none.
    pub fn twin_slot(&self, page_no: usize) -> u16 {
        self.owners.twin(page_no).map_or(0, |id| id.get())
    }

    pub fn access_state(&self, page_no: usize) -> PageAccess {
        self.states.get(page_no)
    }

    pub(crate) fn baseline_protection(&self) -> core::ffi::c_int {
        if self.is_heap {
            libc::PROT_NONE
        } else {
            libc::PROT_READ
        }
    }

    pub(crate) fn baseline_access(&self) -> PageAccess {
        if self.is_heap {
            PageAccess::None
        } else {
            PageAccess::Read
        }
    }
}
