//! Paired shared/private mappings over one memfd.
//!
//! The persistent view is a plain shared read/write mapping of the backing
//! file and holds the committed state. The transient view aliases the same
//! file at the address the embedder dictated (or wherever the kernel chose
//! for heap regions) and is the only view user code addresses; its
//! protection is flipped around as pages move through a transaction.
use core::ffi::c_int;
use std::os::unix::io::AsRawFd;

use memfile::{CreateOptions, MemFile};
use memmap2::MmapRaw;

use crate::{sys, PAGE_SIZE};

pub(crate) struct RegionMap {
    /// The unlinked backing file; nothing survives the last descriptor.
    backing: MemFile,
    /// Committed state, always read/write shared.
    persistent: MmapRaw,
    /// Working view. Raw because protection and share semantics change
    /// under `set_protection`.
    transient: *mut u8,
    len: usize,
}

impl RegionMap {
    /// Establish both views. `start_addr` fixes the transient view for
    /// global regions; null lets the kernel place it. `start_size` bytes
    /// of pre-existing contents at `start_addr` are preserved into the
    /// persistent view before the overlay squashes them.
    pub(crate) fn create(start_addr: *mut u8, start_size: usize, len: usize) -> RegionMap {
        let backing = CreateOptions::new()
            .create("twin-backing")
            .and_then(|file| file.set_len(len as u64).map(|()| file))
            .unwrap_or_else(|err| {
                eprintln!("twin-region: cannot create a {len:#x} byte backing file: {err}");
                std::process::abort()
            });

        let persistent = MmapRaw::map_raw(&backing).unwrap_or_else(|err| {
            eprintln!("twin-region: persistent view of {len:#x} bytes failed: {err}");
            std::process::abort()
        });

        if !start_addr.is_null() {
            // Safety: the caller vouches for `start_size` readable bytes at
            // `start_addr`; the persistent mapping spans `len >= start_size`.
            unsafe {
                core::ptr::copy_nonoverlapping(start_addr, persistent.as_mut_ptr(), start_size);
            }
        }

        let fixed = if start_addr.is_null() { 0 } else { libc::MAP_FIXED };
        // Safety: for fixed placement the embedder designated this exact
        // range to be replaced by the region.
        let transient = unsafe {
            sys::map_view(
                start_addr,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | fixed,
                backing.as_raw_fd(),
                0,
            )
        };

        tracing::debug!(
            transient = ?transient,
            persistent = ?persistent.as_mut_ptr(),
            len,
            "region mapped"
        );

        RegionMap {
            backing,
            persistent,
            transient,
            len,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.transient
    }

    pub(crate) fn contains(&self, addr: *const u8) -> bool {
        let addr = addr as usize;
        let base = self.transient as usize;
        addr >= base && addr < base + self.len
    }

    /// Transient address of a page.
    pub(crate) fn page_start(&self, page_no: usize) -> *mut u8 {
        debug_assert!(page_no < self.len / PAGE_SIZE);
        // Safety: in-bounds of the transient mapping.
        unsafe { self.transient.add(page_no * PAGE_SIZE) }
    }

    /// Persistent address of a page.
    pub(crate) fn persistent_page(&self, page_no: usize) -> *mut u8 {
        debug_assert!(page_no < self.len / PAGE_SIZE);
        // Safety: in-bounds of the persistent mapping.
        unsafe { self.persistent.as_mut_ptr().add(page_no * PAGE_SIZE) }
    }

    pub(crate) fn persistent_base(&self) -> *mut u8 {
        self.persistent.as_mut_ptr()
    }

    /// Replace the transient mapping of `[start, start + size)` with a
    /// fresh one under `prot` and `flags` (`MAP_PRIVATE` buffers writes,
    /// `MAP_SHARED` writes through). Any private pages in the range are
    /// discarded.
    pub(crate) fn set_protection(&self, start: *mut u8, size: usize, prot: c_int, flags: c_int) {
        let offset = start as usize - self.transient as usize;

        // Safety: `[start, start + size)` lies inside the transient view,
        // which this map owns.
        unsafe {
            sys::map_view(
                start,
                size,
                prot,
                flags | libc::MAP_FIXED,
                self.backing.as_raw_fd(),
                offset,
            );
        }
    }

    /// Reset one dirty page at a transaction boundary. `release` drops the
    /// private copy so the next fault reloads the committed bytes;
    /// `baseline` is the protection pages rest at between transactions.
    pub(crate) fn update_page(&self, page_no: usize, release: bool, baseline: c_int) {
        let addr = self.page_start(page_no);

        // Safety: page-aligned, in-bounds of the transient view.
        unsafe {
            if release {
                sys::discard(addr, PAGE_SIZE);
            }

            sys::protect(addr, PAGE_SIZE, baseline);
        }
    }
}
