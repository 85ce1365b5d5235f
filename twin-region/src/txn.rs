//! Transaction boundaries, the commit policy and the owner-recall
//! protocol.
use crate::diff;
use crate::owners::{PageAccess, SHARED_PAGE, UNOWNED};
use crate::region::Region;
use crate::{sys, PAGE_SIZE};

/// Spin iterations between recall-signal retries; recovers lost signals.
const RECALL_RETRY_SPINS: u32 = 100_000;

impl Region {
    /// True iff nothing was dirtied since the last boundary.
    pub fn nop(&self) -> bool {
        self.dirty.is_empty()
    }

    /// Start a transaction: drop every released working copy, restore the
    /// baseline protection and forget the dirty list.
    pub fn begin(&mut self) {
        let baseline_prot = self.baseline_protection();
        let baseline_access = self.baseline_access();

        for index in 0..self.dirty.len() {
            let entry = *self.entries.get(self.dirty[index]);
            self.map
                .update_page(entry.page_no, entry.release, baseline_prot);

            // Retained pages keep their state so a later write re-fault is
            // recognized as a sub-commit.
            if entry.release {
                self.states.set(entry.page_no, baseline_access);
            }
        }

        self.dirty.clear();
        self.entries.cleanup();
    }

    /// Publish every dirty page to the persistent view.
    ///
    /// The dirty list is deliberately left in place; the next [`begin`]
    /// consumes the per-entry `release` flags decided here.
    ///
    /// [`begin`]: Region::begin
    pub fn commit(&mut self) {
        if self.dirty.is_empty() {
            return;
        }

        self.trans += 1;
        let mypid = sys::pid();

        for position in 0..self.dirty.len() {
            let index = self.dirty[position];
            let entry = *self.entries.get(index);
            let page_no = entry.page_no;

            // A second concurrent writer appeared: snapshot the pre-image
            // before either of us publishes.
            if self.owners.users(page_no) > 1 && self.owners.twin(page_no).is_none() {
                self.create_twin_page(page_no);
            }

            // A page we own with no co-writers is flushed at thread exit
            // instead; begin must not discard the working copy.
            if self.owners.users(page_no) == 1 && self.owners.owner(page_no) == mypid {
                self.entries.get_mut(index).release = false;
                continue;
            }

            self.entries.get_mut(index).release = true;

            let local = self.map.page_start(page_no);
            let share = self.map.persistent_page(page_no);

            if entry.version == self.owners.version(page_no) {
                // Nobody published since our first write; take the page
                // wholesale.
                //
                // Safety: both pointers span one page of live mappings and
                // never alias (distinct views).
                unsafe { core::ptr::copy_nonoverlapping(local as *const u8, share, PAGE_SIZE) };
            } else {
                let Some(twin) = self.owners.twin(page_no) else {
                    sys::die("twin-region: diff commit without a twin snapshot\n")
                };

                self.set_shared_page(page_no);

                // Safety: one page each of the transient view, the twin
                // slot and the persistent view; pairwise disjoint.
                let (local, twin, share) = unsafe {
                    (
                        core::slice::from_raw_parts(local as *const u8, PAGE_SIZE),
                        core::slice::from_raw_parts(self.twins.page(twin) as *const u8, PAGE_SIZE),
                        core::slice::from_raw_parts_mut(share, PAGE_SIZE),
                    )
                };
                diff::write_page_diffs(local, twin, share);
            }

            // Last writer out returns the twin slot.
            if self.owners.users(page_no) == 1 {
                if let Some(id) = self.owners.take_twin(page_no) {
                    self.twins.free(id);
                }
            }

            self.owners.remove_user(page_no);
            self.owners.bump_version(page_no);
        }

        self.memory_barrier();
        tracing::trace!(trans = self.trans, entries = self.dirty.len(), "commit published");
    }

    /// Snapshot the persistent page into a fresh twin slot. Exactly one
    /// process wins the install; losers return their slot.
    fn create_twin_page(&self, page_no: usize) {
        let Some(id) = self.twins.alloc() else {
            sys::die("twin-region: twin arena exhausted\n")
        };

        // Safety: the slot is exclusively ours until installed below; the
        // persistent page is one page of a live mapping.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.map.persistent_page(page_no) as *const u8,
                self.twins.page(id),
                PAGE_SIZE,
            );
        }
        self.twins.set_version(id, self.owners.version(page_no));

        if self.owners.install_twin(page_no, id).is_err() {
            self.twins.free(id);
        }
    }

    /// Demote a page to the publicly shared state. Idempotent.
    pub fn set_shared_page(&self, page_no: usize) {
        if self.owners.owner(page_no) != SHARED_PAGE {
            self.owners.exchange_owner(page_no, SHARED_PAGE);
            self.states.set(page_no, PageAccess::Read);
        }
    }

    /// Flush one owned page to the persistent view.
    ///
    /// This runs in the owner's SIGUSR1 handler: atomics, page copies and
    /// protection flips only. With `set_shared` the page is also demoted
    /// and the private copy released.
    pub fn commit_owned_page(&self, page_no: usize, set_shared: bool) {
        let addr = self.map.page_start(page_no);
        let share = self.map.persistent_page(page_no);

        match self.states.get(page_no) {
            PageAccess::None | PageAccess::Read | PageAccess::Unused => {}
            PageAccess::ReadWrite => {
                // The working copy holds unpublished writes.
                //
                // Safety: one page of each view, disjoint; the transient
                // page is readable in the ReadWrite state.
                unsafe {
                    core::ptr::copy_nonoverlapping(addr as *const u8, share, PAGE_SIZE);
                    sys::protect(addr, PAGE_SIZE, libc::PROT_NONE);
                }
            }
        }

        if set_shared {
            self.set_shared_page(page_no);
            // Safety: page-aligned, in-bounds of the transient view.
            unsafe { sys::discard(addr, PAGE_SIZE) };
        }

        self.owners.bump_version(page_no);
    }

    /// Make the owner of `page_no` publish it, then wait until the page is
    /// shared. Unclaimed pages and dead owners degrade to self-promotion.
    pub fn notify_owner_to_commit(&self, page_no: usize) {
        let mut owner = self.owners.owner(page_no);

        loop {
            match owner {
                SHARED_PAGE => return,
                UNOWNED => {
                    self.set_shared_page(page_no);
                    return;
                }
                pid => {
                    // The owner may be gone; its in-flight bytes are lost
                    // and the page is simply reclaimed.
                    if !sys::queue_commit_request(pid, page_no) {
                        self.set_shared_page(page_no);
                        return;
                    }
                }
            }

            for _ in 0..RECALL_RETRY_SPINS {
                if self.owners.is_shared(page_no) {
                    return;
                }

                core::hint::spin_loop();
            }

            // Either the signal was lost or the owner changed; re-observe
            // and try again.
            owner = self.owners.owner(page_no);
        }
    }

    /// Request a commit of every page below `end` still owned by `pid`;
    /// the cancellation primitive.
    pub fn force_commit_owned_pages(&self, pid: i32, end: *mut u8) {
        let end_page = (end as usize).saturating_sub(self.base() as usize) / PAGE_SIZE;

        for page_no in 0..end_page.min(self.page_count()) {
            if self.owners.owner(page_no) == pid {
                self.notify_owner_to_commit(page_no);
            }
        }
    }

    /// Commit every page this process still owns; thread-exit path.
    /// `release` also drops the private copies, for processes that keep
    /// running.
    pub fn final_commit(&mut self, release: bool) {
        let mypid = sys::pid();

        for index in 0..self.owned.len() {
            let (start_page, end_page) = self.owned[index];

            for page_no in start_page as usize..end_page as usize {
                if self.owners.owner(page_no) == mypid {
                    self.commit_owned_page(page_no, release);
                }
            }
        }
    }

    /// Forget the owned-block registry.
    pub fn cleanup_owned_blocks(&mut self) {
        self.owned.clear();
    }

    /// Transactions committed since copy-on-write was (re)enabled.
    pub fn transactions(&self) -> u64 {
        self.trans
    }
}
