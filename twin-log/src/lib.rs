//! Append-only sink for page access events.
//!
//! Fault handlers report every trapped access here. The log lives in a
//! memfd-backed shared mapping so that all cooperating processes append to
//! the same stream through one atomic cursor. `add` is callable from a
//! signal handler: it never allocates, never locks, and drops events once
//! the preallocated capacity is exhausted.
use core::sync::atomic::{AtomicU64, Ordering};
use std::io;

use memfile::{CreateOptions, MemFile};
use memmap2::MmapRaw;

/// How the faulting instruction touched the page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AccessKind {
    Read = 1,
    Write = 2,
}

/// One recorded page access.
///
/// Fixed-size POD record so it can be written straight into the shared
/// mapping without serialization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct AccessEvent {
    kind: u8,
    _pad: [u8; 3],
    /// Process that took the fault.
    pub pid: i32,
    /// Program counter that issued the first fault on this page.
    pub issuer: u64,
    /// Page index of the faulted address (address >> page shift).
    pub page: u64,
}

impl AccessEvent {
    pub fn new(kind: AccessKind, pid: i32, issuer: u64, page: u64) -> Self {
        AccessEvent {
            kind: kind as u8,
            _pad: [0; 3],
            pid,
            issuer,
            page,
        }
    }

    pub fn kind(&self) -> AccessKind {
        match self.kind {
            1 => AccessKind::Read,
            2 => AccessKind::Write,
            raw => unreachable!("corrupt access kind {raw}"),
        }
    }
}

/// Anything that accepts access events.
///
/// The region only ever calls `add`, possibly from signal context, so
/// implementations must not allocate or block there.
pub trait EventSink {
    fn add(&self, event: AccessEvent);
}

/// Collects events into memory; test and tooling convenience.
impl EventSink for std::sync::Mutex<Vec<AccessEvent>> {
    fn add(&self, event: AccessEvent) {
        self.lock().unwrap().push(event);
    }
}

/// The shared, fixed-capacity event log.
///
/// Layout: one cache line holding the write cursor, then `capacity` event
/// slots. The cursor counts all attempted appends; slots past `capacity`
/// are dropped, and the overshoot is reported by [`EventLog::dropped`].
pub struct EventLog {
    /// Keeps the mapping alive; the slot and cursor pointers below are
    /// derived from it.
    map: MmapRaw,
    /// The memfd survives as an open descriptor only, shared across fork.
    #[allow(dead_code)]
    file: MemFile,
    capacity: u64,
}

const CURSOR_SPAN: usize = 64;
const EVENT_SIZE: usize = core::mem::size_of::<AccessEvent>();

impl EventLog {
    /// Create a log with room for `capacity` events.
    pub fn create(capacity: usize) -> io::Result<EventLog> {
        let capacity = u64::try_from(capacity)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let file = CreateOptions::new().create("twin-log")?;
        file.set_len(CURSOR_SPAN as u64 + capacity * EVENT_SIZE as u64)?;

        let map = MmapRaw::map_raw(&file)?;
        Ok(EventLog {
            map,
            file,
            capacity,
        })
    }

    fn cursor(&self) -> &AtomicU64 {
        // Safety: the mapping starts with a zero-initialized, aligned u64
        // and stays valid while `self.map` is held. The cell is shared
        // between processes, hence the atomic view.
        unsafe { &*(self.map.as_mut_ptr() as *const AtomicU64) }
    }

    fn slot(&self, index: u64) -> *mut AccessEvent {
        debug_assert!(index < self.capacity);
        // Safety: in-bounds by the capacity check at the call sites.
        unsafe {
            self.map
                .as_mut_ptr()
                .add(CURSOR_SPAN + index as usize * EVENT_SIZE) as *mut AccessEvent
        }
    }

    /// Number of events retained in the log.
    pub fn len(&self) -> usize {
        self.cursor().load(Ordering::Acquire).min(self.capacity) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.cursor().load(Ordering::Acquire) == 0
    }

    /// Appends attempted after the log filled up.
    pub fn dropped(&self) -> u64 {
        self.cursor()
            .load(Ordering::Acquire)
            .saturating_sub(self.capacity)
    }

    /// Snapshot the recorded events.
    pub fn events(&self) -> Vec<AccessEvent> {
        let len = self.len();
        let mut out = Vec::with_capacity(len);
        for index in 0..len as u64 {
            // Safety: `index < capacity`; the slot was fully written before
            // the cursor advanced past it on the writing side, and torn
            // reads of an in-flight record only affect the snapshot, not
            // the log itself.
            out.push(unsafe { core::ptr::read_volatile(self.slot(index)) });
        }
        out
    }
}

impl EventSink for EventLog {
    fn add(&self, event: AccessEvent) {
        let index = self.cursor().fetch_add(1, Ordering::AcqRel);

        if index >= self.capacity {
            return;
        }

        // Safety: `index < capacity` and every cursor value is handed out
        // once, so this slot is written by exactly one process.
        unsafe { core::ptr::write_volatile(self.slot(index), event) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_snapshot() {
        let log = EventLog::create(8).unwrap();
        assert!(log.is_empty());

        log.add(AccessEvent::new(AccessKind::Read, 7, 0x4000, 3));
        log.add(AccessEvent::new(AccessKind::Write, 7, 0x4010, 3));

        let events = log.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), AccessKind::Read);
        assert_eq!(events[0].page, 3);
        assert_eq!(events[1].kind(), AccessKind::Write);
        assert_eq!(events[1].issuer, 0x4010);
        assert_eq!(log.dropped(), 0);
    }

    #[test]
    fn drops_past_capacity() {
        let log = EventLog::create(2).unwrap();

        for page in 0..5 {
            log.add(AccessEvent::new(AccessKind::Write, 1, 0, page));
        }

        assert_eq!(log.len(), 2);
        assert_eq!(log.dropped(), 3);
        let events = log.events();
        assert_eq!(events[0].page, 0);
        assert_eq!(events[1].page, 1);
    }

    #[test]
    fn sink_into_vec() {
        let sink = std::sync::Mutex::new(Vec::new());
        sink.add(AccessEvent::new(AccessKind::Read, 2, 1, 9));
        assert_eq!(sink.lock().unwrap().len(), 1);
    }
}
