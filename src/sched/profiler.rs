//! Per-frame job timing capture.
//!
//! Every executed job appends one record to the frame's ring; the append is
//! a single fetch-add claim plus a slot write, never throws, and drops the
//! record when the ring is full. Frames are double-buffered: `frame_end`
//! flips the rings and an external reporter reads the back buffer between
//! frames through `with_frame`.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::Backoff;
use inlinable_string::InlinableString;
use serde::Serialize;

use crate::utils::time::Timestamp;

/// One executed job, as seen by the reporter.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub start: Timestamp,
    pub end: Timestamp,
    pub worker: u32,
    pub name: InlinableString,
}

struct FrameRing {
    /// Total claims this frame, may exceed capacity when records dropped.
    claims: AtomicUsize,
    /// Slots fully written; readers wait for claims (capped) to commit.
    committed: AtomicUsize,
    slots: Box<[UnsafeCell<MaybeUninit<JobRecord>>]>,
}

unsafe impl Sync for FrameRing {}

impl FrameRing {
    fn with_capacity(capacity: usize) -> FrameRing {
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();

        FrameRing {
            claims: AtomicUsize::new(0),
            committed: AtomicUsize::new(0),
            slots,
        }
    }

    fn push(&self, record: JobRecord) {
        let index = self.claims.fetch_add(1, Ordering::Relaxed);
        if index >= self.slots.len() {
            // Frame overflow; the record is dropped by design.
            return;
        }

        unsafe { (*self.slots[index].get()).write(record) };
        self.committed.fetch_add(1, Ordering::Release);
    }

    fn written(&self) -> usize {
        self.claims.load(Ordering::Acquire).min(self.slots.len())
    }

    /// Waits out in-flight writers, hands the frame's records to `f`, then
    /// resets the ring. Requires external exclusivity with other readers.
    fn drain<F>(&self, f: F)
    where
        F: FnOnce(&[JobRecord]),
    {
        let expected = self.written();
        let backoff = Backoff::new();
        while self.committed.load(Ordering::Acquire) < expected {
            backoff.snooze();
        }

        // The slot layout is exactly `JobRecord` once committed.
        let records = unsafe {
            ::std::slice::from_raw_parts(self.slots.as_ptr() as *const JobRecord, expected)
        };
        f(records);

        for slot in &self.slots[..expected] {
            unsafe { (*slot.get()).as_mut_ptr().drop_in_place() };
        }
        self.committed.store(0, Ordering::Relaxed);
        self.claims.store(0, Ordering::Release);
    }
}

impl Drop for FrameRing {
    fn drop(&mut self) {
        let expected = self.written();
        for slot in &self.slots[..expected] {
            unsafe { (*slot.get()).as_mut_ptr().drop_in_place() };
        }
    }
}

pub struct Profiler {
    rings: [FrameRing; 2],
    active: AtomicUsize,
}

impl Profiler {
    pub fn with_capacity(capacity: usize) -> Profiler {
        Profiler {
            rings: [
                FrameRing::with_capacity(capacity),
                FrameRing::with_capacity(capacity),
            ],
            active: AtomicUsize::new(0),
        }
    }

    /// Opens a frame, discarding anything the active ring still holds.
    pub fn frame_start(&self) {
        let active = self.active.load(Ordering::Acquire);
        self.rings[active].drain(|_| {});
    }

    /// Closes the frame: flips the rings so the finished frame becomes the
    /// back buffer for the reporter.
    pub fn frame_end(&self) {
        let active = self.active.load(Ordering::Acquire);
        self.active.store(active ^ 1, Ordering::Release);
    }

    /// Appends one record to the current frame. Lock-free and nothrow;
    /// silently drops on overflow.
    pub fn record(&self, record: JobRecord) {
        let active = self.active.load(Ordering::Acquire);
        self.rings[active].push(record);
    }

    /// Reads the previous frame's records. Meant to be called between
    /// `frame_end` and the next `frame_start`, from one reporter at a time.
    pub fn with_frame<F>(&self, f: F)
    where
        F: FnOnce(&[JobRecord]),
    {
        let back = self.active.load(Ordering::Acquire) ^ 1;
        self.rings[back].drain(f);
    }
}
