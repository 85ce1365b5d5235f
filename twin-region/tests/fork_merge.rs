//! Cross-process commit semantics, driven over real fork(2).
//!
//! The region and its arenas are built before forking so parent and child
//! alias the same backing files. Faults are simulated by calling
//! `handle_access` directly — after the first touch a page is writable and
//! a real run would trap no further. Children never allocate and leave
//! through `_exit`; every child-side check turns into a distinct exit
//! code the parent asserts on.
#![cfg(target_os = "linux")]
use std::sync::Arc;

use twin_arena::{EntryArena, TwinArena};
use twin_region::{Region, RegionConfig, PAGE_SIZE, SHARED_PAGE};

const PAGES: usize = 16;

/// One-shot, one-byte pipe barrier usable on both sides of a fork.
struct Gate {
    fds: [libc::c_int; 2],
}

impl Gate {
    fn new() -> Gate {
        let mut fds = [0; 2];
        // Safety: plain pipe(2) with a valid out-array.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        Gate { fds }
    }

    fn open(&self) {
        // Safety: writing one byte from a valid buffer.
        unsafe { libc::write(self.fds[1], b"x".as_ptr() as *const _, 1) };
    }

    fn wait(&self) {
        let mut byte = 0u8;
        // Safety: reading one byte into a valid buffer; blocks until the
        // other side opens the gate.
        let got = unsafe { libc::read(self.fds[0], &mut byte as *mut u8 as *mut _, 1) };
        assert_eq!(got, 1);
    }
}

/// Child-side assertion: exit with `code` instead of panicking into the
/// test harness.
macro_rules! child_check {
    ($cond:expr, $code:expr) => {
        if !$cond {
            unsafe { libc::_exit($code) }
        }
    };
}

fn buffered_region() -> Region {
    let twins = Arc::new(TwinArena::create(32).unwrap());
    let entries = EntryArena::with_capacity(2 * PAGES);
    let mut region = Region::new(RegionConfig::heap(PAGES * PAGE_SIZE), twins, entries);

    let end = unsafe { region.base().add(PAGES * PAGE_SIZE) };
    region.set_copy_on_write(end, true);
    region
}

fn fault_write(region: &mut Region, offset: usize) {
    let addr = unsafe { region.base().add(offset) };
    region.handle_access(addr, true, 0);
}

fn fault_read(region: &mut Region, offset: usize) {
    let addr = unsafe { region.base().add(offset) };
    region.handle_access(addr, false, 0);
}

fn poke(region: &Region, offset: usize, value: u8) {
    unsafe { *region.base().add(offset) = value };
}

fn peek(region: &Region, offset: usize) -> u8 {
    unsafe { *region.base().add(offset) }
}

fn wait_for(child: libc::pid_t) -> i32 {
    let mut status = 0;
    // Safety: plain waitpid on our own child.
    assert_eq!(unsafe { libc::waitpid(child, &mut status, 0) }, child);
    assert!(libc::WIFEXITED(status), "child died: status {status:#x}");
    libc::WEXITSTATUS(status)
}

/// Two processes write disjoint byte ranges of the same page between
/// barriers; both ranges survive into the persistent view.
#[test]
fn disjoint_writes_to_one_page_merge() {
    let mut region = buffered_region();
    let parent_faulted = Gate::new();
    let child_committed = Gate::new();

    // Safety: the child touches only its own region copy and leaves via
    // _exit, never returning into the harness.
    match unsafe { libc::fork() } {
        0 => {
            parent_faulted.wait();

            fault_write(&mut region, 3000);
            for (index, value) in [5u8, 6, 7, 8].into_iter().enumerate() {
                poke(&region, 3000 + index, value);
            }

            // First committer: nobody published yet, whole-page copy.
            region.commit();
            child_check!(region.version(0) == 1, 10);
            child_check!(region.users(0) == 1, 11);
            child_check!(region.twin_slot(0) != 0, 12);

            region.begin();
            child_committed.open();
            unsafe { libc::_exit(0) }
        }
        child => {
            fault_write(&mut region, 100);
            for (index, value) in [1u8, 2, 3, 4].into_iter().enumerate() {
                poke(&region, 100 + index, value);
            }

            parent_faulted.open();
            child_committed.wait();

            // Second committer: the child published in between, so this
            // goes through the twin diff.
            region.commit();
            region.begin();

            assert_eq!(wait_for(child), 0);

            fault_read(&mut region, 0);
            assert_eq!(
                [peek(&region, 100), peek(&region, 101), peek(&region, 102), peek(&region, 103)],
                [1, 2, 3, 4],
            );
            assert_eq!(
                [peek(&region, 3000), peek(&region, 3001), peek(&region, 3002), peek(&region, 3003)],
                [5, 6, 7, 8],
            );

            assert_eq!(region.version(0), 2);
            assert_eq!(region.users(0), 0);
            // The last committer returned the twin slot.
            assert_eq!(region.twin_slot(0), 0);
            assert_eq!(region.owner(0), SHARED_PAGE);
        }
    }
}

/// Both processes write the same byte; the diff of the later committer
/// overwrites the earlier value.
#[test]
fn conflicting_writes_resolve_to_the_last_committer() {
    let mut region = buffered_region();
    let parent_faulted = Gate::new();
    let child_committed = Gate::new();

    match unsafe { libc::fork() } {
        0 => {
            parent_faulted.wait();

            fault_write(&mut region, 100);
            poke(&region, 100, 0xbb);
            region.commit();
            region.begin();

            child_committed.open();
            unsafe { libc::_exit(0) }
        }
        child => {
            fault_write(&mut region, 100);
            poke(&region, 100, 0xaa);

            parent_faulted.open();
            child_committed.wait();

            region.commit();
            region.begin();

            assert_eq!(wait_for(child), 0);

            fault_read(&mut region, 100);
            assert_eq!(peek(&region, 100), 0xaa);
            assert_eq!(region.version(0), 2);
        }
    }
}

/// A committed value is visible to a sibling after its next transaction
/// start.
#[test]
fn committed_bytes_reach_the_sibling() {
    let mut region = buffered_region();
    let parent_committed = Gate::new();
    let verdict = Gate::new();

    match unsafe { libc::fork() } {
        0 => {
            parent_committed.wait();

            region.begin();
            fault_read(&mut region, 5 * PAGE_SIZE + 17);
            child_check!(peek(&region, 5 * PAGE_SIZE + 17) == 0x5e, 20);
            child_check!(region.version(5) == 1, 21);

            verdict.open();
            unsafe { libc::_exit(0) }
        }
        child => {
            fault_write(&mut region, 5 * PAGE_SIZE + 17);
            poke(&region, 5 * PAGE_SIZE + 17, 0x5e);
            region.commit();
            region.memory_barrier();
            region.begin();

            parent_committed.open();
            verdict.wait();
            assert_eq!(wait_for(child), 0);
        }
    }
}
