//! Job slots and the process-wide job table.
//!
//! Jobs live in a pre-sized slab of `JobSlot`s. A slot is named by a
//! [`JobHandle`] carrying the slot index and the slot's generation at
//! allocation time; generations are bumped on every allocation and every
//! retirement (odd while alive, even while free), so a retired-and-reused
//! slot turns every outstanding handle stale instead of aliasing the new
//! occupant. Operations on stale handles are no-ops that report the job as
//! completed.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use crossbeam_utils::CachePadded;
use inlinable_string::{InlinableString, StringExt};
use smallvec::SmallVec;

use crate::utils::handle::HandleLike;
use crate::utils::time::Timestamp;

impl_handle!(JobHandle);

/// Lifecycle of a job slot.
///
/// `Ready -> Running -> Ready` happens only on the cooperative re-enqueue
/// path; every other transition is forward-only.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Free = 0,
    Pending = 1,
    Ready = 2,
    Running = 3,
    Completed = 4,
    Cancelled = 5,
}

impl JobState {
    pub(crate) fn from_u8(v: u8) -> JobState {
        match v {
            1 => JobState::Pending,
            2 => JobState::Ready,
            3 => JobState::Running,
            4 => JobState::Completed,
            5 => JobState::Cancelled,
            _ => JobState::Free,
        }
    }

    /// Completed and Cancelled are both terminal.
    #[inline]
    pub fn is_settled(self) -> bool {
        self == JobState::Completed || self == JobState::Cancelled
    }
}

/// What a cooperative job body asks the scheduler to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Run the body again immediately.
    Continue,
    /// Re-enqueue the job as ready and let other work run first.
    Yield,
    /// Retire the job.
    Complete,
}

pub(crate) enum JobBody {
    None,
    Once(Box<dyn FnOnce() + Send + 'static>),
    Step(Box<dyn FnMut() -> JobStatus + Send + 'static>),
}

pub(crate) struct Payload {
    pub body: JobBody,
    pub name: InlinableString,
}

pub(crate) const FLAG_LARGE_STACK: u8 = 0b1;

const NIL_INDEX: u32 = ::std::u32::MAX;

/// A fixed-size record in the job table. The address is stable for the
/// slot's lifetime; cross-references between jobs are raw slot indices or
/// packed handles, never pointers.
pub(crate) struct JobSlot {
    state: AtomicU8,
    flags: AtomicU8,
    generation: AtomicU32,
    incoming: AtomicU32,
    next_free: AtomicU32,
    worker: AtomicU32,
    /// Packed `GroupHandle` bits, 0 when the job is not in a group.
    group: AtomicU64,
    /// Packed parent `JobHandle` bits for hierarchical spawn, 0 when root.
    parent: AtomicU64,
    created: AtomicU64,
    started: AtomicU64,
    completed: AtomicU64,
    payload: Mutex<Payload>,
    /// Packed handles of jobs whose fan-in counters this job holds a
    /// reference on. Drained exactly once on completion; a handle that
    /// went stale in the meantime (cancelled dependent) releases nothing.
    dependents: Mutex<SmallVec<[u64; 6]>>,
}

impl Default for JobSlot {
    fn default() -> Self {
        JobSlot {
            state: AtomicU8::new(JobState::Free as u8),
            flags: AtomicU8::new(0),
            generation: AtomicU32::new(0),
            incoming: AtomicU32::new(0),
            next_free: AtomicU32::new(NIL_INDEX),
            worker: AtomicU32::new(NIL_INDEX),
            group: AtomicU64::new(0),
            parent: AtomicU64::new(0),
            created: AtomicU64::new(0),
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            payload: Mutex::new(Payload {
                body: JobBody::None,
                name: InlinableString::new(),
            }),
            dependents: Mutex::new(SmallVec::new()),
        }
    }
}

impl JobSlot {
    #[inline]
    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn store_state(&self, state: JobState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn cas_state(&self, from: JobState, to: JobState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Whether `handle` still names this slot's current occupant.
    #[inline]
    pub fn matches(&self, handle: JobHandle) -> bool {
        handle.generation() == self.generation()
    }

    #[inline]
    pub fn add_incoming(&self) {
        self.incoming.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one unmet dependency; true when the fan-in counter reached
    /// zero and the job became runnable.
    #[inline]
    pub fn dec_incoming(&self) -> bool {
        self.incoming.fetch_sub(1, Ordering::AcqRel) == 1
    }

    #[inline]
    pub fn large_stack(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & FLAG_LARGE_STACK != 0
    }

    #[inline]
    pub fn set_group(&self, bits: u64) {
        self.group.store(bits, Ordering::Release);
    }

    #[inline]
    pub fn group_bits(&self) -> u64 {
        self.group.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_parent(&self, bits: u64) {
        self.parent.store(bits, Ordering::Release);
    }

    #[inline]
    pub fn parent_bits(&self) -> u64 {
        self.parent.load(Ordering::Acquire)
    }

    #[inline]
    pub fn mark_started(&self, worker: u32) {
        debug_assert_ne!(self.created.load(Ordering::Relaxed), 0);
        self.worker.store(worker, Ordering::Relaxed);
        if self.started.load(Ordering::Relaxed) == 0 {
            self.started
                .store(Timestamp::now().nanos().max(1), Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn mark_completed(&self) {
        self.completed
            .store(Timestamp::now().nanos().max(1), Ordering::Relaxed);
    }

    #[inline]
    pub fn started_at(&self) -> Timestamp {
        Timestamp::from_nanos(self.started.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn completed_at(&self) -> Timestamp {
        Timestamp::from_nanos(self.completed.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn payload(&self) -> &Mutex<Payload> {
        &self.payload
    }

    #[inline]
    pub fn dependents(&self) -> &Mutex<SmallVec<[u64; 6]>> {
        &self.dependents
    }
}

/// Pre-sized slab of job slots with a lock-free free list. The free-list
/// head carries a modification tag in its upper half so a pop cannot be
/// fooled by a concurrent pop/push pair recycling the same index.
pub(crate) struct JobTable {
    slots: Box<[JobSlot]>,
    free_head: CachePadded<AtomicU64>,
}

impl JobTable {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity >= 2 && capacity < NIL_INDEX as usize);

        let slots: Box<[JobSlot]> = (0..capacity).map(|_| JobSlot::default()).collect();
        for (i, slot) in slots.iter().enumerate() {
            let next = if i + 1 < capacity {
                (i + 1) as u32
            } else {
                NIL_INDEX
            };
            slot.next_free.store(next, Ordering::Relaxed);
        }

        JobTable {
            slots,
            free_head: CachePadded::new(AtomicU64::new(0)),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn slot(&self, index: u32) -> &JobSlot {
        &self.slots[index as usize]
    }

    /// Resolves `handle` to its slot if the handle is still current.
    pub fn get(&self, handle: JobHandle) -> Option<&JobSlot> {
        let index = handle.index() as usize;
        if index >= self.slots.len() || handle.generation() & 0x1 == 0 {
            return None;
        }

        let slot = &self.slots[index];
        if slot.matches(handle) {
            Some(slot)
        } else {
            None
        }
    }

    /// Claims a free slot and initializes it as Pending with a fan-in
    /// guard of one. Returns `None` when the table is exhausted.
    pub fn alloc(&self, name: &str, body: JobBody, large_stack: bool) -> Option<JobHandle> {
        let index = self.pop_free()?;
        let slot = &self.slots[index as usize];

        let generation = slot.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert_eq!(generation & 0x1, 1);

        slot.flags.store(
            if large_stack { FLAG_LARGE_STACK } else { 0 },
            Ordering::Relaxed,
        );
        slot.incoming.store(1, Ordering::Relaxed);
        slot.worker.store(NIL_INDEX, Ordering::Relaxed);
        slot.group.store(0, Ordering::Relaxed);
        slot.parent.store(0, Ordering::Relaxed);
        slot.created
            .store(Timestamp::now().nanos().max(1), Ordering::Relaxed);
        slot.started.store(0, Ordering::Relaxed);
        slot.completed.store(0, Ordering::Relaxed);

        {
            let mut payload = slot.payload.lock().unwrap();
            payload.body = body;
            payload.name = InlinableString::from(name);
        }
        slot.dependents.lock().unwrap().clear();

        slot.store_state(JobState::Pending);
        Some(JobHandle::new(index, generation))
    }

    /// Retires a settled slot: stale-ifies outstanding handles and returns
    /// the index to the free list.
    pub fn retire(&self, index: u32) {
        let slot = &self.slots[index as usize];
        debug_assert!(slot.state().is_settled());

        let generation = slot.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert_eq!(generation & 0x1, 0);

        // Payload is dropped eagerly so captured resources do not linger
        // until the slot is reused.
        {
            let mut payload = slot.payload.lock().unwrap();
            payload.body = JobBody::None;
            payload.name = InlinableString::new();
        }

        slot.store_state(JobState::Free);
        self.push_free(index);
    }

    fn pop_free(&self) -> Option<u32> {
        loop {
            let head = self.free_head.load(Ordering::Acquire);
            let index = head as u32;
            if index == NIL_INDEX {
                return None;
            }

            let next = self.slots[index as usize].next_free.load(Ordering::Relaxed);
            let tagged = ((head >> 32).wrapping_add(1) << 32) | u64::from(next);
            if self
                .free_head
                .compare_exchange_weak(head, tagged, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(index);
            }
        }
    }

    fn push_free(&self, index: u32) {
        loop {
            let head = self.free_head.load(Ordering::Acquire);
            self.slots[index as usize]
                .next_free
                .store(head as u32, Ordering::Relaxed);

            let tagged = ((head >> 32).wrapping_add(1) << 32) | u64::from(index);
            if self
                .free_head
                .compare_exchange_weak(head, tagged, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}
