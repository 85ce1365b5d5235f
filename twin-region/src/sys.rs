//! Thin wrappers over the raw memory and signal syscalls.
//!
//! The region cannot function with a partially applied protection change,
//! so every mapping failure here is terminal. Helpers come in two flavors:
//! the construction-time ones format rich diagnostics, the fault-path ones
//! stick to `die`, which is async-signal-safe.
use core::ffi::c_int;
use std::os::unix::io::RawFd;

/// Signal appropriated for the "owner, please commit" protocol. The sigval
/// payload carries the page number.
pub const COMMIT_SIGNAL: c_int = libc::SIGUSR1;

/// Report a static message and abort without touching the heap.
///
/// Safe to call from SIGSEGV/SIGUSR1 handlers.
pub(crate) fn die(msg: &str) -> ! {
    // Safety: write(2) with a valid buffer; short writes are irrelevant on
    // the way out.
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr() as *const _, msg.len());
    }
    std::process::abort()
}

pub(crate) fn pid() -> i32 {
    // Safety: getpid has no failure mode.
    unsafe { libc::getpid() }
}

/// Map `len` bytes of `fd` at `offset`, optionally at a fixed address.
///
/// # Safety
///
/// With `MAP_FIXED` in `flags` the caller asserts that replacing any
/// existing mapping in `[addr, addr + len)` is intended.
pub(crate) unsafe fn map_view(
    addr: *mut u8,
    len: usize,
    prot: c_int,
    flags: c_int,
    fd: RawFd,
    offset: usize,
) -> *mut u8 {
    let area = libc::mmap(addr as *mut _, len, prot, flags, fd, offset as libc::off_t);

    if area == libc::MAP_FAILED {
        eprintln!(
            "twin-region: mmap(addr={addr:p}, len={len:#x}, prot={prot:#x}, flags={flags:#x}, \
             fd={fd}, offset={offset:#x}) failed for pid {}: {}",
            pid(),
            std::io::Error::last_os_error(),
        );
        std::process::abort()
    }

    area as *mut u8
}

/// Change the protection of `[addr, addr + len)`.
///
/// # Safety
///
/// `addr` must be page aligned and the range must lie inside a mapping
/// owned by the caller. Callable from signal context.
pub(crate) unsafe fn protect(addr: *mut u8, len: usize, prot: c_int) {
    if libc::mprotect(addr as *mut _, len, prot) != 0 {
        die("twin-region: mprotect failed, address space is corrupt\n")
    }
}

/// Drop the private copy of `[addr, addr + len)`; the next fault reloads
/// from the backing file. Best effort.
///
/// # Safety
///
/// `addr` must be page aligned and inside a mapping owned by the caller.
pub(crate) unsafe fn discard(addr: *mut u8, len: usize) {
    libc::madvise(addr as *mut _, len, libc::MADV_DONTNEED);
}

/// Ask `pid` to commit `page_no`. False when the target is gone.
pub(crate) fn queue_commit_request(pid: i32, page_no: usize) -> bool {
    let value = libc::sigval {
        sival_ptr: page_no as *mut _,
    };

    // Safety: plain sigqueue; the value union is fully initialized.
    unsafe { libc::sigqueue(pid, COMMIT_SIGNAL, value) == 0 }
}

/// Decode the page number from a [`COMMIT_SIGNAL`] siginfo.
///
/// # Safety
///
/// `info` must be the siginfo pointer handed to a SIGUSR1 handler whose
/// signal was raised by [`queue_commit_request`].
pub unsafe fn commit_request_page(info: *const libc::siginfo_t) -> usize {
    (*info).si_value().sival_ptr as usize
}
