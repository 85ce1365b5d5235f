//! End-to-end demonstration: two processes write disjoint ranges of the
//! same page through real page faults, commit at a barrier, and the
//! merged result lands in the persistent view.
//!
//! This binary owns the signal plumbing the library deliberately leaves
//! to the embedder: SIGSEGV is decoded into `handle_access`, SIGUSR1 into
//! `commit_owned_page`. The fault handler masks SIGUSR1 so an owner
//! recall cannot interleave with a half-taken fault.

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn main() {
    std::process::exit(demo::run())
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn main() {
    eprintln!("twin-demo decodes fault contexts for Linux/x86-64 only");
    std::process::exit(2)
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod demo {
    use core::sync::atomic::{AtomicPtr, Ordering};
    use std::sync::Arc;

    use twin_arena::{EntryArena, TwinArena};
    use twin_log::EventLog;
    use twin_region::{commit_request_page, Region, RegionConfig, COMMIT_SIGNAL, PAGE_SIZE};

    const PAGES: usize = 16;

    static REGION: AtomicPtr<Region> = AtomicPtr::new(core::ptr::null_mut());

    unsafe extern "C" fn on_fault(
        _signal: libc::c_int,
        info: *mut libc::siginfo_t,
        context: *mut libc::c_void,
    ) {
        let region = &mut *REGION.load(Ordering::Acquire);
        let addr = (*info).si_addr() as *const u8;

        if !region.in_range(addr) {
            // A genuine crash; do not loop on it.
            libc::abort()
        }

        let ucontext = &*(context as *const libc::ucontext_t);
        let error_code = ucontext.uc_mcontext.gregs[libc::REG_ERR as usize];
        let is_write = error_code & 0x2 != 0;
        let pc = ucontext.uc_mcontext.gregs[libc::REG_RIP as usize] as usize;

        region.handle_access(addr, is_write, pc);
    }

    unsafe extern "C" fn on_commit_request(
        _signal: libc::c_int,
        info: *mut libc::siginfo_t,
        _context: *mut libc::c_void,
    ) {
        let region = &*REGION.load(Ordering::Acquire);
        region.commit_owned_page(commit_request_page(info), true);
    }

    fn install_handlers() {
        // Safety: zeroed sigaction is a valid template; both handlers run
        // signal-safe region operations only.
        unsafe {
            let mut fault: libc::sigaction = core::mem::zeroed();
            fault.sa_sigaction = on_fault as usize;
            fault.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
            libc::sigemptyset(&mut fault.sa_mask);
            // Keep owner recalls out of the fault path.
            libc::sigaddset(&mut fault.sa_mask, COMMIT_SIGNAL);
            assert_eq!(
                libc::sigaction(libc::SIGSEGV, &fault, core::ptr::null_mut()),
                0,
            );

            let mut commit: libc::sigaction = core::mem::zeroed();
            commit.sa_sigaction = on_commit_request as usize;
            commit.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
            libc::sigemptyset(&mut commit.sa_mask);
            assert_eq!(
                libc::sigaction(COMMIT_SIGNAL, &commit, core::ptr::null_mut()),
                0,
            );
        }
    }

    struct Gate {
        fds: [libc::c_int; 2],
    }

    impl Gate {
        fn new() -> Gate {
            let mut fds = [0; 2];
            // Safety: pipe(2) with a valid out-array.
            assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
            Gate { fds }
        }

        fn open(&self) {
            // Safety: one byte from a valid buffer.
            unsafe { libc::write(self.fds[1], b"x".as_ptr() as *const _, 1) };
        }

        fn wait(&self) {
            let mut byte = 0u8;
            // Safety: one byte into a valid buffer.
            unsafe { libc::read(self.fds[0], &mut byte as *mut u8 as *mut _, 1) };
        }
    }

    pub fn run() -> i32 {
        let twins = Arc::new(TwinArena::create(64).expect("twin arena"));
        let log = Arc::new(EventLog::create(1 << 12).expect("event log"));
        let entries = EntryArena::with_capacity(2 * PAGES);

        let mut region = Region::new(RegionConfig::heap(PAGES * PAGE_SIZE), twins, entries);
        region.initialize(log.clone());

        let end = unsafe { region.base().add(PAGES * PAGE_SIZE) };
        region.set_copy_on_write(end, true);

        REGION.store(&mut region, Ordering::Release);
        install_handlers();

        let parent_done = Gate::new();
        let child_done = Gate::new();

        // Safety: the child works on its own copy of the region and exits
        // via _exit.
        let child = match unsafe { libc::fork() } {
            0 => {
                parent_done.wait();

                // Plain writes; the first one traps and the fault handler
                // escalates the page.
                let base = region.base();
                for offset in 2048..2112 {
                    unsafe { *base.add(offset) = 0x42 };
                }

                region.commit();
                region.begin();
                child_done.open();
                unsafe { libc::_exit(0) }
            }
            pid => pid,
        };

        let base = region.base();
        for offset in 0..64 {
            unsafe { *base.add(offset) = 0x41 };
        }

        parent_done.open();
        child_done.wait();

        region.commit();
        region.begin();

        let mut status = 0;
        // Safety: waitpid on our own child.
        unsafe { libc::waitpid(child, &mut status, 0) };
        if !libc::WIFEXITED(status) || libc::WEXITSTATUS(status) != 0 {
            eprintln!("child failed: status {status:#x}");
            return 1;
        }

        // Drop the protections and inspect the merged state directly.
        region.close_protection();

        for offset in 0..64 {
            if unsafe { *base.add(offset) } != 0x41 {
                eprintln!("parent bytes lost at {offset}");
                return 1;
            }
        }

        for offset in 2048..2112 {
            if unsafe { *base.add(offset) } != 0x42 {
                eprintln!("child bytes lost at {offset}");
                return 1;
            }
        }

        println!(
            "ok: page 0 merged across processes, version {}, {} access events",
            region.version(0),
            log.len(),
        );

        0
    }
}
