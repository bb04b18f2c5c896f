//! The job scheduler.
//!
//! A fixed pool of workers (the calling thread is promoted to worker 0 at
//! `setup`, the rest are spawned and pinned) executes short-lived jobs
//! submitted from any thread. Jobs may declare prerequisites, join groups
//! with continuations, spawn children, and suspend cooperatively through
//! [`yield_now`]; a job waiting on another job helps execute other work
//! instead of blocking its worker.
//!
//! ```no_run
//! use fray::sched;
//!
//! sched::setup(sched::SchedParams::default()).unwrap();
//!
//! let root = sched::schedule("prepare", || {}, None).unwrap();
//! let leaf = sched::schedule("consume", || {}, Some(root)).unwrap();
//! sched::wait(leaf);
//!
//! sched::discard();
//! ```
//!
//! There is no FIFO guarantee across unrelated submissions; ordering is
//! expressed with dependencies only.

pub mod latch;

mod deque;
mod fiber;
mod group;
mod job;
mod profiler;
mod scheduler;
mod topology;
mod unwind;
mod worker;

pub use self::group::GroupHandle;
pub use self::job::{JobHandle, JobState, JobStatus};
pub use self::profiler::JobRecord;
pub use self::scheduler::{PanicHandler, SchedStats, Scheduler, WorkerStats};
pub use self::topology::{Node, Topology};
pub use self::worker::WorkerThread;

pub mod prelude {
    pub use super::{GroupHandle, JobDesc, JobHandle, JobStatus, SchedParams, SchedStats};
}

use std::sync::Arc;

use inlinable_string::InlinableString;
use serde::{Deserialize, Serialize};

use self::job::JobBody;
use crate::errors::Result;
use crate::utils::time::Timestamp;

/// Tunables of the scheduler. The defaults fit a desktop game runtime;
/// `setup` normalizes out-of-range values instead of failing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedParams {
    /// Total workers including the promoted main thread; `None` means
    /// `logical_cpus - 1`, never less than one.
    pub workers: Option<usize>,
    /// Job table slots, clamped to `4096..=65536`.
    pub job_capacity: usize,
    /// Per-worker deque slots, rounded up to a power of two.
    pub deque_capacity: usize,
    /// Slots in each of the two global queues, rounded up to a power of
    /// two.
    pub global_capacity: usize,
    /// Stack bytes of the small fiber class.
    pub small_stack_bytes: usize,
    /// Stack bytes of the large fiber class.
    pub large_stack_bytes: usize,
    /// Fibers per worker in the small class, at most 32.
    pub small_fibers: usize,
    /// Fibers per worker in the large class, at most 32.
    pub large_fibers: usize,
    /// Steal attempts per scheduling round before falling back to the
    /// global queues.
    pub steal_attempts_per_round: usize,
    /// Empty rounds a worker spins through before sleeping.
    pub max_idle_spins: u32,
    /// Profiler records kept per frame.
    pub profiler_capacity: usize,
    /// Probe NUMA topology and pin workers to their node.
    pub numa_aware: bool,
}

impl Default for SchedParams {
    fn default() -> Self {
        SchedParams {
            workers: None,
            job_capacity: 16_384,
            deque_capacity: 1_024,
            global_capacity: 4_096,
            small_stack_bytes: 16 * 1_024,
            large_stack_bytes: 256 * 1_024,
            small_fibers: 16,
            large_fibers: 4,
            steal_attempts_per_round: 4,
            max_idle_spins: 1_024,
            profiler_capacity: 4_096,
            numa_aware: true,
        }
    }
}

impl SchedParams {
    pub(crate) fn worker_count(&self) -> usize {
        self.workers
            .unwrap_or_else(|| num_cpus::get().saturating_sub(1))
            .max(1)
    }

    pub(crate) fn normalized(mut self) -> SchedParams {
        self.workers = Some(self.worker_count());
        self.job_capacity = self.job_capacity.max(4_096).min(65_536);
        self.deque_capacity = self.deque_capacity.next_power_of_two().max(64);
        self.global_capacity = self.global_capacity.next_power_of_two().max(64);
        self.small_stack_bytes = self.small_stack_bytes.max(16 * 1_024);
        self.large_stack_bytes = self.large_stack_bytes.max(self.small_stack_bytes);
        self.small_fibers = self.small_fibers.max(1).min(32);
        self.large_fibers = self.large_fibers.max(1).min(32);
        self.steal_attempts_per_round = self.steal_attempts_per_round.max(1);
        self.max_idle_spins = self.max_idle_spins.max(1);
        self.profiler_capacity = self.profiler_capacity.max(64);
        self
    }
}

/// One job of a batch submission.
pub struct JobDesc {
    pub(crate) name: InlinableString,
    pub(crate) body: JobBody,
    pub(crate) after: Option<JobHandle>,
    pub(crate) large_stack: bool,
}

impl JobDesc {
    pub fn new<F>(name: &str, func: F) -> JobDesc
    where
        F: FnOnce() + Send + 'static,
    {
        JobDesc {
            name: InlinableString::from(name),
            body: JobBody::Once(Box::new(func)),
            after: None,
            large_stack: false,
        }
    }

    /// A cooperative job: the step function runs until it reports
    /// `Complete`, re-entering the queue on every `Yield`.
    pub fn with_steps<F>(name: &str, func: F) -> JobDesc
    where
        F: FnMut() -> JobStatus + Send + 'static,
    {
        JobDesc {
            name: InlinableString::from(name),
            body: JobBody::Step(Box::new(func)),
            after: None,
            large_stack: false,
        }
    }

    /// Adds a prerequisite outside the batch.
    pub fn after(mut self, prerequisite: JobHandle) -> JobDesc {
        self.after = Some(prerequisite);
        self
    }

    /// Runs the body on a large-stack fiber.
    pub fn large_stack(mut self) -> JobDesc {
        self.large_stack = true;
        self
    }
}

struct Context {
    scheduler: Arc<Scheduler>,
    main_worker: Box<WorkerThread>,
}

static mut CTX: *const Context = 0 as *const Context;

fn ctx() -> &'static Context {
    unsafe {
        debug_assert!(
            !CTX.is_null(),
            "sched system has not been initialized properly."
        );

        &*CTX
    }
}

/// Sets up the scheduler and promotes the calling thread to worker 0. Must
/// be balanced with [`discard`], from the same thread.
pub fn setup(params: SchedParams) -> Result<()> {
    setup_with_handler(params, None)
}

/// Like [`setup`], with a handler invoked for every panic that escapes a
/// job body. Without a handler such panics abort the process.
pub fn setup_with_handler(params: SchedParams, panic_handler: Option<Box<PanicHandler>>) -> Result<()> {
    unsafe {
        assert!(CTX.is_null(), "duplicated setup of sched system.");

        let scheduler = Scheduler::new(params, panic_handler)?;
        let main_worker = Box::new(WorkerThread::new(Arc::clone(&scheduler), 0));
        WorkerThread::set_current(&*main_worker);

        CTX = Box::into_raw(Box::new(Context {
            scheduler,
            main_worker,
        }));
    }
    Ok(())
}

/// Drains outstanding work, stops and joins the workers, demotes the main
/// thread and frees the scheduler.
pub fn discard() {
    if !valid() {
        return;
    }

    unsafe {
        let mut context = Box::from_raw(CTX as *mut Context);
        CTX = 0 as *const Context;

        context.scheduler.shutdown(&mut context.main_worker);
        WorkerThread::unset_current();
    }
}

/// Checks if the sched system is enabled.
#[inline]
pub fn valid() -> bool {
    unsafe { !CTX.is_null() }
}

/// Submits a job, optionally ordered after a prerequisite. Returns an
/// error when the job table or the queues are exhausted.
pub fn schedule<F>(name: &str, func: F, after: Option<JobHandle>) -> Result<JobHandle>
where
    F: FnOnce() + Send + 'static,
{
    ctx()
        .scheduler
        .schedule_job(name, JobBody::Once(Box::new(func)), after, false)
}

/// Submits a cooperative job. The step function is re-invoked until it
/// returns [`JobStatus::Complete`]; on [`JobStatus::Yield`] the job leaves
/// its worker and re-enters the queue as ready.
pub fn schedule_step<F>(name: &str, func: F, after: Option<JobHandle>) -> Result<JobHandle>
where
    F: FnMut() -> JobStatus + Send + 'static,
{
    ctx()
        .scheduler
        .schedule_job(name, JobBody::Step(Box::new(func)), after, false)
}

/// Submits a whole batch at once. `edges` are `(prerequisite, dependent)`
/// indices into `descs`; only jobs with no unmet prerequisite are enqueued
/// immediately.
pub fn submit_batch(descs: Vec<JobDesc>, edges: &[(usize, usize)]) -> Result<Vec<JobHandle>> {
    ctx().scheduler.submit_batch(descs, edges)
}

/// Orders `dependent` after `prerequisite`. No-op when either side is
/// already done (or stale).
pub fn add_dependency(dependent: JobHandle, prerequisite: JobHandle) {
    ctx().scheduler.add_dependency(dependent, prerequisite);
}

/// Submits a child of `parent`: runs after it and inherits its group.
pub fn spawn_child<F>(parent: JobHandle, name: &str, func: F) -> Result<JobHandle>
where
    F: FnOnce() + Send + 'static,
{
    ctx()
        .scheduler
        .spawn_child(parent, name, JobBody::Once(Box::new(func)))
}

/// Blocks until the job settles. On a worker this helps execute other jobs
/// instead of blocking the thread; stale handles return immediately.
pub fn wait(handle: JobHandle) {
    ctx().scheduler.wait_job(handle);
}

/// Waits for every handle in turn.
pub fn wait_all(handles: &[JobHandle]) {
    for &handle in handles {
        wait(handle);
    }
}

/// Suspends the calling job so other work can run; it resumes later on the
/// same worker. Callable only from inside a job body.
pub fn yield_now() {
    worker::yield_current();
}

/// True when the job has completed or been cancelled. Stale handles (the
/// slot was retired, possibly reused) count as complete.
pub fn is_complete(handle: JobHandle) -> bool {
    ctx().scheduler.is_complete(handle)
}

/// Index of the worker the calling context runs on, if any.
pub fn current_worker_id() -> Option<usize> {
    let worker = WorkerThread::current();
    if worker.is_null() {
        None
    } else {
        Some(unsafe { (*worker).index() })
    }
}

/// Handle of the job the calling context is executing, if any.
pub fn current_job() -> Option<JobHandle> {
    let worker = WorkerThread::current();
    if worker.is_null() {
        return None;
    }

    let handle = unsafe { (*worker).current_job() };
    if handle.is_valid() {
        Some(handle)
    } else {
        None
    }
}

/// Parent of a hierarchically spawned job, while both handles are live.
pub fn parent_of(handle: JobHandle) -> Option<JobHandle> {
    ctx().scheduler.parent_of(handle)
}

/// Snapshot of pool and per-worker counters.
pub fn stats() -> SchedStats {
    ctx().scheduler.stats()
}

// --- groups -----------------------------------------------------------

/// Creates a group with an arena of roughly `arena_capacity` bytes for its
/// members' scratch memory.
pub fn group_create(arena_capacity: usize) -> GroupHandle {
    ctx().scheduler.group_create(arena_capacity)
}

/// Adds a job to the group barrier.
pub fn group_add(group: GroupHandle, job: JobHandle) {
    ctx().scheduler.group_add(group, job);
}

/// Seals the group; required before the barrier can close.
pub fn group_submit(group: GroupHandle) {
    ctx().scheduler.group_submit(group);
}

/// Blocks until the group barrier closes, helping on a worker context.
pub fn group_wait(group: GroupHandle) {
    ctx().scheduler.group_wait(group);
}

/// Registers a job submitted exactly once when the group's last member
/// completes.
pub fn group_set_continuation<F>(group: GroupHandle, name: &str, func: F) -> Result<JobHandle>
where
    F: FnOnce() + Send + 'static,
{
    ctx()
        .scheduler
        .group_set_continuation(group, name, JobBody::Once(Box::new(func)))
}

/// Gives `func` brief access to the group's scratch arena; `None` when the
/// group is gone. Allocations live until [`group_destroy`].
pub fn with_group_arena<F, R>(group: GroupHandle, func: F) -> Option<R>
where
    F: FnOnce(&crate::utils::arena::Arena) -> R,
{
    ctx().scheduler.with_group_arena(group, func)
}

/// Explicitly frees the group and its arena.
pub fn group_destroy(group: GroupHandle) {
    ctx().scheduler.group_destroy(group);
}

// --- profiler ---------------------------------------------------------

/// Opens a profiling frame.
pub fn frame_start() {
    ctx().scheduler.profiler().frame_start();
}

/// Closes the profiling frame; its records become readable through
/// [`with_frame`].
pub fn frame_end() {
    ctx().scheduler.profiler().frame_end();
}

/// Reads the records of the last closed frame.
pub fn with_frame<F>(func: F)
where
    F: FnOnce(&[JobRecord]),
{
    ctx().scheduler.profiler().with_frame(func);
}

/// Appends a record to the current frame on behalf of external code (the
/// scheduler records executed jobs automatically).
pub fn record_job(start: Timestamp, end: Timestamp, worker: u32, name: &str) {
    ctx().scheduler.profiler().record(JobRecord {
        start,
        end,
        worker,
        name: InlinableString::from(name),
    });
}
