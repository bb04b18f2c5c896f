//! The worker: one pinned OS thread (plus the promoted main thread as
//! worker 0) owning a deque, a fiber pool and a resume list for suspended
//! fibers.
//!
//! The scheduling loop drains work in a fixed order: pop local work,
//! resume a suspended fiber, steal through the topology policy, then fall
//! back to the global queues. When everything comes up empty the worker
//! spins on a pause hint for a while and finally parks on the pool's sleep
//! signal.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_utils::Backoff;

use super::deque::Stolen;
use super::fiber::{self, FiberId, FiberPool, FiberShared, Switch, WorkerPtr};
use super::job::{JobBody, JobHandle, JobState, JobStatus};
use super::scheduler::Scheduler;
use super::topology::XorShift32;
use super::unwind;

pub(crate) struct ResumeEntry {
    fiber: FiberId,
    shared: Arc<FiberShared>,
    job: JobHandle,
}

enum Unit {
    Fresh(JobHandle),
    Resume(ResumeEntry),
}

pub struct WorkerThread {
    sched: Arc<Scheduler>,
    index: usize,
    fibers: FiberPool,
    /// Fibers suspended in `yield_now`, resumable in arrival order. Only
    /// contexts acting on this worker's behalf touch it, so a suspended
    /// fiber never migrates to another worker.
    resume_list: Mutex<VecDeque<ResumeEntry>>,
    rng: XorShift32,
    current_job: AtomicU64,
}

// The WorkerThread is allocated on the stack of the worker on entry (or
// boxed for the promoted main thread) and stored into this thread local
// variable, so it remains valid at least until the worker is fully unwound.
// Using an unsafe pointer avoids the need for a RefCell<T> etc.
thread_local! {
    static WORKER_THREAD_STATE: Cell<*const WorkerThread> = Cell::new(0 as *const WorkerThread);
}

impl WorkerThread {
    pub(crate) fn new(sched: Arc<Scheduler>, index: usize) -> WorkerThread {
        let params = sched.params();
        let fibers = FiberPool::new(
            index,
            params.small_stack_bytes,
            params.small_fibers,
            params.large_stack_bytes,
            params.large_fibers,
        );

        WorkerThread {
            sched,
            index,
            fibers,
            resume_list: Mutex::new(VecDeque::new()),
            rng: XorShift32::new(),
            current_job: AtomicU64::new(0),
        }
    }

    /// Gets the `WorkerThread` for the current thread; returns null when
    /// this is not a worker (or fiber acting for one). The pointer is valid
    /// anywhere on the current thread.
    #[inline]
    pub fn current() -> *const WorkerThread {
        WORKER_THREAD_STATE.with(|t| t.get())
    }

    /// Sets `self` as the worker for the current thread during startup.
    pub(crate) unsafe fn set_current(thread: *const WorkerThread) {
        WORKER_THREAD_STATE.with(|t| {
            debug_assert!(t.get().is_null());
            t.set(thread);
        });
    }

    /// Re-points the current thread at `thread`, used by fibers each time
    /// they start acting on a worker's behalf.
    #[inline]
    pub(crate) fn bind_to_thread(thread: *const WorkerThread) {
        WORKER_THREAD_STATE.with(|t| t.set(thread));
    }

    pub(crate) fn unset_current() {
        WORKER_THREAD_STATE.with(|t| t.set(0 as *const WorkerThread));
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub(crate) fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    /// The job the current context is executing, nil outside job bodies.
    #[inline]
    pub(crate) fn current_job(&self) -> JobHandle {
        JobHandle::from(crate::utils::handle::Handle::from_bits(
            self.current_job.load(Ordering::Relaxed),
        ))
    }

    /// Pushes a ready job onto the local deque. Returns it back when full.
    pub(crate) fn push_local(&self, job: JobHandle) -> Result<(), JobHandle> {
        self.sched.workers()[self.index]
            .deque
            .push_bottom(job.to_bits())
            .map_err(|bits| JobHandle::from(crate::utils::handle::Handle::from_bits(bits)))
    }

    fn find_work(&self) -> Option<Unit> {
        let infos = self.sched.workers();
        if let Some(bits) = infos[self.index].deque.pop_bottom() {
            return Some(Unit::Fresh(handle_from_bits(bits)));
        }

        // A job that yielded asked for other work to run first, so
        // suspended fibers resume once the local deque has drained.
        if let Some(entry) = self.resume_list.lock().unwrap().pop_front() {
            return Some(Unit::Resume(entry));
        }

        // Steal through the victim policy, a bounded number of rounds.
        let counters = &infos[self.index].counters;
        for _ in 0..self.sched.params().steal_attempts_per_round {
            let victim = match self.sched.topology().select_victim(self.index, &self.rng) {
                Some(victim) => victim,
                None => break,
            };

            counters.steals_attempted.fetch_add(1, Ordering::Relaxed);
            match infos[victim].deque.steal_top() {
                Stolen::Data(bits) => {
                    counters.steals_succeeded.fetch_add(1, Ordering::Relaxed);
                    if self.sched.topology().node_of(victim)
                        == self.sched.topology().node_of(self.index)
                    {
                        counters.steals_local.fetch_add(1, Ordering::Relaxed);
                    }
                    return Some(Unit::Fresh(handle_from_bits(bits)));
                }
                Stolen::Abort | Stolen::Empty => continue,
            }
        }

        if let Some(bits) = self.sched.inject_high().steal() {
            return Some(Unit::Fresh(handle_from_bits(bits)));
        }
        if let Some(bits) = self.sched.inject_normal().steal() {
            return Some(Unit::Fresh(handle_from_bits(bits)));
        }

        None
    }

    /// Runs one unit of work if any can be found.
    pub(crate) fn help_once(&self) -> bool {
        match self.find_work() {
            Some(Unit::Fresh(job)) => {
                self.execute_fresh(job);
                true
            }
            Some(Unit::Resume(entry)) => {
                self.execute_resume(entry);
                true
            }
            None => false,
        }
    }

    /// Executes a job popped or stolen in Ready state: binds it to a fiber,
    /// switches in, and routes the outcome.
    fn execute_fresh(&self, job: JobHandle) {
        let slot = match self.sched.table().get(job) {
            Some(slot) => slot,
            None => return,
        };
        if !slot.cas_state(JobState::Ready, JobState::Running) {
            return;
        }

        slot.mark_started(self.index as u32);
        let previous = self.current_job.swap(job.to_bits(), Ordering::Relaxed);

        let outcome = match self.fibers.acquire(slot.large_stack()) {
            Some((id, shared)) => {
                match shared.run(job, WorkerPtr(self as *const WorkerThread)) {
                    Switch::Suspended(job) => {
                        self.note_suspended(ResumeEntry {
                            fiber: id,
                            shared,
                            job,
                        });
                        None
                    }
                    other => {
                        self.fibers.release(id);
                        Some(other)
                    }
                }
            }
            // Fiber pool exhausted; run the body inline on this context's
            // stack. Inline bodies cannot suspend.
            None => Some(execute_job_body(
                WorkerPtr(self as *const WorkerThread),
                job,
            )),
        };

        if let Some(outcome) = outcome {
            self.settle(outcome);
        }
        self.current_job.store(previous, Ordering::Relaxed);
    }

    /// Switches back into a fiber previously suspended by `yield_now`.
    fn execute_resume(&self, entry: ResumeEntry) {
        let job = entry.job;
        match self.sched.table().get(job) {
            Some(slot) => {
                if !slot.cas_state(JobState::Ready, JobState::Running) {
                    debug_assert!(false, "suspended job in unexpected state");
                    self.fibers.release(entry.fiber);
                    return;
                }
                slot.mark_started(self.index as u32);
            }
            None => {
                self.fibers.release(entry.fiber);
                return;
            }
        }

        let previous = self.current_job.swap(job.to_bits(), Ordering::Relaxed);
        match entry.shared.resume(WorkerPtr(self as *const WorkerThread)) {
            Switch::Suspended(job) => self.note_suspended(ResumeEntry { job, ..entry }),
            other => {
                self.fibers.release(entry.fiber);
                self.settle(other);
            }
        }
        self.current_job.store(previous, Ordering::Relaxed);
    }

    fn note_suspended(&self, entry: ResumeEntry) {
        let counters = &self.sched.workers()[self.index].counters;
        counters.yields.fetch_add(1, Ordering::Relaxed);
        self.resume_list.lock().unwrap().push_back(entry);
    }

    fn settle(&self, outcome: Switch) {
        let counters = &self.sched.workers()[self.index].counters;
        match outcome {
            Switch::Finished(job) => {
                counters.executed.fetch_add(1, Ordering::Relaxed);
                self.sched.complete_job(job, self.index as u32);
            }
            Switch::Requeued(job) => {
                counters.yields.fetch_add(1, Ordering::Relaxed);
                self.sched.requeue_step(job);
            }
            Switch::Suspended(_) => unreachable!("suspension handled at the switch site"),
        }
    }

    /// The scheduling loop for spawned workers. Returns once the pool is
    /// quitting and no submitted job remains anywhere.
    pub(crate) fn run(&self) {
        let mut idle: u32 = 0;
        loop {
            let token = self.sched.signal().prepare();
            if self.help_once() {
                idle = 0;
                continue;
            }

            if self.sched.quitting() && self.sched.outstanding() == 0 {
                break;
            }

            idle += 1;
            if idle >= self.sched.params().max_idle_spins {
                self.sched.workers()[self.index]
                    .counters
                    .sleeps
                    .fetch_add(1, Ordering::Relaxed);
                self.sched.signal().wait(token);
                idle = 0;
            } else {
                ::std::hint::spin_loop();
            }
        }
    }

    /// Blocks the calling context until `pred` holds, helping with other
    /// jobs instead of blocking the thread. Callable from the worker's
    /// scheduler context and from inside job bodies alike.
    pub(crate) fn wait_until<F>(&self, pred: F)
    where
        F: Fn() -> bool,
    {
        let backoff = Backoff::new();
        loop {
            if pred() {
                return;
            }

            let token = self.sched.signal().prepare();
            if self.help_once() {
                backoff.reset();
                continue;
            }
            if pred() {
                return;
            }

            if backoff.is_completed() {
                self.sched.signal().wait(token);
            } else {
                backoff.snooze();
            }
        }
    }

    /// Tears down the fiber pool; only valid once no job can reach this
    /// worker anymore.
    pub(crate) fn shutdown_fibers(&mut self) {
        self.fibers.shutdown();
    }
}

#[inline]
fn handle_from_bits(bits: u64) -> JobHandle {
    JobHandle::from(crate::utils::handle::Handle::from_bits(bits))
}

/// Runs the body of `job` to its next boundary. Executes on a fiber thread
/// normally, or inline on a scheduler context when the fiber pool is dry.
pub(crate) fn execute_job_body(worker: WorkerPtr, job: JobHandle) -> Switch {
    let worker = unsafe { &*worker.0 };
    let sched = worker.scheduler();

    let slot = match sched.table().get(job) {
        Some(slot) => slot,
        None => return Switch::Finished(job),
    };

    let body = {
        let mut payload = slot.payload().lock().unwrap();
        ::std::mem::replace(&mut payload.body, JobBody::None)
    };

    match body {
        JobBody::None => Switch::Finished(job),
        JobBody::Once(f) => {
            if let Err(err) = unwind::halt_unwinding(f) {
                sched.handle_panic(err);
            }
            Switch::Finished(job)
        }
        JobBody::Step(mut f) => loop {
            match unwind::halt_unwinding(|| f()) {
                Ok(JobStatus::Continue) => continue,
                Ok(JobStatus::Complete) => return Switch::Finished(job),
                Ok(JobStatus::Yield) => {
                    slot.payload().lock().unwrap().body = JobBody::Step(f);
                    return Switch::Requeued(job);
                }
                Err(err) => {
                    sched.handle_panic(err);
                    return Switch::Finished(job);
                }
            }
        },
    }
}

/// Suspends the current job at a cooperative yield point: marks it ready,
/// queues its fiber for resumption on the owning worker and hands the
/// remainder of the timeslice to other jobs. A no-op outside fibers.
pub(crate) fn yield_current() {
    let worker = WorkerThread::current();
    if worker.is_null() {
        debug_assert!(false, "yield called outside a job body");
        return;
    }

    let worker = unsafe { &*worker };
    let job = worker.current_job();
    if !job.is_valid() {
        debug_assert!(false, "yield called outside a job body");
        return;
    }

    if let Some(slot) = worker.scheduler().table().get(job) {
        if !fiber::on_fiber() {
            // Inline-executed body; there is no context to park.
            return;
        }
        slot.store_state(JobState::Ready);
        fiber::suspend_current(job);
    }
}
