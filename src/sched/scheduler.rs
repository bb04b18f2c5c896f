//! The scheduler: the process-wide pool owning the job table, the worker
//! deques, the global queues, the topology and the profiler.
//!
//! Worker 0 is the promoted main thread; workers `1..n` run on spawned,
//! pinned OS threads. Submission prefers the calling worker's deque and
//! falls back to the global queues; dependency releases go to the
//! high-priority queue so unblocked DAG nodes do not starve behind fresh
//! submissions.

use std::any::Any;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crossbeam_utils::Backoff;
use serde::Serialize;

use super::deque::{Deque, Injector};
use super::group::{Group, GroupHandle};
use super::job::{JobBody, JobHandle, JobState, JobTable};
use super::latch::LockLatch;
use super::profiler::{JobRecord, Profiler};
use super::topology::Topology;
use super::unwind::AbortIfPanic;
use super::worker::WorkerThread;
use super::{JobDesc, SchedParams};
use crate::errors::{Error, Result};
use crate::utils::handle::Handle;
use crate::utils::object_pool::ObjectPool;

/// The type for a panic handling closure. Note that this same closure may
/// be invoked multiple times in parallel.
pub type PanicHandler = dyn Fn(Box<dyn Any + Send>) + Send + Sync;

/// Sleep/wake rendezvous between idle workers and submitters. The epoch
/// counter closes the lost-wakeup window: a worker samples the epoch before
/// scanning for work and only sleeps while the epoch is unchanged.
pub(crate) struct Signal {
    epoch: Mutex<u64>,
    cvar: Condvar,
}

impl Signal {
    fn new() -> Signal {
        Signal {
            epoch: Mutex::new(0),
            cvar: Condvar::new(),
        }
    }

    #[inline]
    pub fn prepare(&self) -> u64 {
        *self.epoch.lock().unwrap()
    }

    pub fn notify_all(&self) {
        let mut epoch = self.epoch.lock().unwrap();
        *epoch += 1;
        self.cvar.notify_all();
    }

    pub fn wait(&self, token: u64) {
        let mut epoch = self.epoch.lock().unwrap();
        while *epoch == token {
            epoch = self.cvar.wait(epoch).unwrap();
        }
    }
}

#[derive(Default)]
pub(crate) struct WorkerCounters {
    pub executed: AtomicU64,
    pub steals_attempted: AtomicU64,
    pub steals_succeeded: AtomicU64,
    pub steals_local: AtomicU64,
    pub yields: AtomicU64,
    pub sleeps: AtomicU64,
}

pub(crate) struct WorkerInfo {
    pub deque: Deque,
    pub node: usize,
    pub counters: WorkerCounters,
    pub primed: LockLatch,
    pub terminated: LockLatch,
}

/// Point-in-time snapshot of one worker's counters.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub node: usize,
    pub executed: u64,
    pub steals_attempted: u64,
    pub steals_succeeded: u64,
    pub steals_local: u64,
    pub yields: u64,
    pub sleeps: u64,
}

/// Point-in-time snapshot of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct SchedStats {
    pub workers: Vec<WorkerStats>,
    pub submitted: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub failures: u64,
    pub outstanding: u64,
}

pub struct Scheduler {
    params: SchedParams,
    table: JobTable,
    workers: Vec<WorkerInfo>,
    topology: Topology,
    groups: Mutex<ObjectPool<GroupHandle, Group>>,
    inject_high: Injector,
    inject_normal: Injector,
    signal: Signal,
    profiler: Profiler,
    quit: AtomicBool,
    outstanding: AtomicU64,
    submitted: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    failures: AtomicU64,
    panic_handler: Option<Box<PanicHandler>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Scheduler {
    /// Builds the pool and spawns workers `1..n`; the calling thread
    /// becomes worker 0 (the caller registers it afterwards). Any platform
    /// failure tears the partially built pool down before returning.
    pub(crate) fn new(
        params: SchedParams,
        panic_handler: Option<Box<PanicHandler>>,
    ) -> Result<Arc<Scheduler>> {
        let params = params.normalized();
        let worker_count = params.worker_count();
        let topology = Topology::detect(worker_count, params.numa_aware);

        let workers = (0..worker_count)
            .map(|i| WorkerInfo {
                deque: Deque::with_capacity(params.deque_capacity),
                node: topology.node_of(i),
                counters: WorkerCounters::default(),
                primed: LockLatch::new(),
                terminated: LockLatch::new(),
            })
            .collect();

        let scheduler = Arc::new(Scheduler {
            table: JobTable::with_capacity(params.job_capacity),
            workers,
            topology,
            groups: Mutex::new(ObjectPool::new()),
            inject_high: Injector::with_capacity(params.global_capacity),
            inject_normal: Injector::with_capacity(params.global_capacity),
            signal: Signal::new(),
            profiler: Profiler::with_capacity(params.profiler_capacity),
            quit: AtomicBool::new(false),
            outstanding: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            panic_handler,
            threads: Mutex::new(Vec::new()),
            params,
        });

        for index in 1..worker_count {
            let sc = Arc::clone(&scheduler);
            let spawned = thread::Builder::new()
                .name(format!("fray-worker-{}", index))
                .spawn(move || Scheduler::main_loop(sc, index));

            match spawned {
                Ok(handle) => scheduler.threads.lock().unwrap().push(handle),
                Err(err) => {
                    // Partial init must be fully torn down.
                    scheduler.quit.store(true, Ordering::SeqCst);
                    scheduler.signal.notify_all();
                    for handle in scheduler.threads.lock().unwrap().drain(..) {
                        let _ = handle.join();
                    }
                    return Err(Error::WorkerSpawn(index, err));
                }
            }
        }

        for index in 1..worker_count {
            scheduler.workers[index].primed.wait();
        }

        info!(
            "scheduler up: {} workers over {} nodes, {} job slots",
            worker_count,
            scheduler.topology.nodes().len(),
            scheduler.params.job_capacity
        );
        Ok(scheduler)
    }

    fn main_loop(scheduler: Arc<Scheduler>, index: usize) {
        scheduler.topology.bind_current(index);

        let mut worker = WorkerThread::new(Arc::clone(&scheduler), index);
        unsafe { WorkerThread::set_current(&worker) };
        scheduler.workers[index].primed.set();

        worker.run();

        worker.shutdown_fibers();
        scheduler.workers[index].terminated.set();
    }

    #[inline]
    pub(crate) fn params(&self) -> &SchedParams {
        &self.params
    }

    #[inline]
    pub(crate) fn table(&self) -> &JobTable {
        &self.table
    }

    #[inline]
    pub(crate) fn workers(&self) -> &[WorkerInfo] {
        &self.workers
    }

    #[inline]
    pub(crate) fn topology(&self) -> &Topology {
        &self.topology
    }

    #[inline]
    pub(crate) fn inject_high(&self) -> &Injector {
        &self.inject_high
    }

    #[inline]
    pub(crate) fn inject_normal(&self) -> &Injector {
        &self.inject_normal
    }

    #[inline]
    pub(crate) fn signal(&self) -> &Signal {
        &self.signal
    }

    #[inline]
    pub(crate) fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    #[inline]
    pub(crate) fn quitting(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Allocates a Pending job holding its submission guard. The caller
    /// must eventually `submit` or settle it.
    fn create_job(&self, name: &str, body: JobBody, large_stack: bool) -> Result<JobHandle> {
        match self.table.alloc(name, body, large_stack) {
            Some(handle) => {
                self.submitted.fetch_add(1, Ordering::Relaxed);
                self.outstanding.fetch_add(1, Ordering::SeqCst);
                Ok(handle)
            }
            None => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(Error::TableExhausted(self.table.capacity()))
            }
        }
    }

    /// Allocates, optionally links and submits one job.
    pub(crate) fn schedule_job(
        &self,
        name: &str,
        body: JobBody,
        after: Option<JobHandle>,
        large_stack: bool,
    ) -> Result<JobHandle> {
        let handle = self.create_job(name, body, large_stack)?;
        if let Some(after) = after {
            self.add_dependency(handle, after);
        }
        self.submit(handle)?;
        Ok(handle)
    }

    /// Drops the submission guard; enqueues the job when its fan-in is
    /// already clear.
    fn submit(&self, handle: JobHandle) -> Result<()> {
        let slot = match self.table.get(handle) {
            Some(slot) => slot,
            None => return Ok(()),
        };

        if slot.dec_incoming() && slot.cas_state(JobState::Pending, JobState::Ready) {
            if let Err(err) = self.enqueue_ready(handle, false, true) {
                self.settle_job(handle, JobState::Cancelled, u32::max_value());
                self.failures.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Declares that `dependent` must not start before `prerequisite`
    /// completes. No-ops when either handle is stale or the prerequisite is
    /// already settled; linking to a dependent that already started is a
    /// precondition violation and asserts in debug builds.
    pub fn add_dependency(&self, dependent: JobHandle, prerequisite: JobHandle) {
        let dslot = match self.table.get(dependent) {
            Some(slot) => slot,
            None => return,
        };
        let pslot = match self.table.get(prerequisite) {
            Some(slot) => slot,
            None => return,
        };

        if dslot.state() != JobState::Pending {
            debug_assert!(
                false,
                "add_dependency on a dependent that is no longer pending"
            );
            return;
        }

        let dependents = pslot.dependents().lock().unwrap();
        // Re-check under the lock: the completer sets the state before it
        // drains this list, so either we see Completed here or the drain
        // sees our edge.
        if !pslot.matches(prerequisite) || pslot.state().is_settled() {
            return;
        }

        dslot.add_incoming();
        let mut dependents = dependents;
        dependents.push(dependent.to_bits());
    }

    /// Drops one fan-in reference of `handle`; moves it to Ready and
    /// enqueues it when this was the last unmet dependency.
    fn release_dependent(&self, handle: JobHandle) {
        if let Some(slot) = self.table.get(handle) {
            if slot.dec_incoming() && slot.cas_state(JobState::Pending, JobState::Ready) {
                let _ = self.enqueue_ready(handle, true, false);
            }
        }
    }

    /// Puts a Ready job where a worker will find it: the calling worker's
    /// deque when there is one, else a global queue. With `can_fail` the
    /// caller gets the overflow back as an error; otherwise the push spins
    /// until a queue drains, since a released dependency must never be
    /// dropped.
    fn enqueue_ready(&self, handle: JobHandle, high: bool, can_fail: bool) -> Result<()> {
        debug_assert_eq!(
            self.table.get(handle).map(|s| s.state()),
            Some(JobState::Ready)
        );

        let worker = WorkerThread::current();
        if !worker.is_null() {
            let worker = unsafe { &*worker };
            if worker.scheduler().as_ref() as *const Scheduler == self as *const Scheduler {
                match worker.push_local(handle) {
                    Ok(()) => {
                        self.signal.notify_all();
                        return Ok(());
                    }
                    Err(_) => {} // deque full; spill to the global queues
                }
            }
        }

        let bits = Handle::from(handle).to_bits();
        if can_fail {
            let (first, second) = if high {
                (&self.inject_high, &self.inject_normal)
            } else {
                (&self.inject_normal, &self.inject_high)
            };
            match first.push(bits).or_else(|back| second.push(back)) {
                Ok(()) => {
                    self.signal.notify_all();
                    Ok(())
                }
                Err(_) => Err(Error::QueuesFull),
            }
        } else {
            self.inject(bits, high);
            Ok(())
        }
    }

    /// Re-enqueues a cooperative job whose step body yielded. The job goes
    /// to the back of the global high queue rather than the local deque: a
    /// yielded job asked to let other work run, and re-pushing it locally
    /// would hand it straight back to the same worker.
    pub(crate) fn requeue_step(&self, handle: JobHandle) {
        if let Some(slot) = self.table.get(handle) {
            let moved = slot.cas_state(JobState::Running, JobState::Ready);
            debug_assert!(moved);
            self.inject(handle.to_bits(), true);
        }
    }

    /// Pushes onto the global queues, preferring `high`, spinning out a
    /// transient overflow. Used where dropping the job is not an option.
    fn inject(&self, mut bits: u64, high: bool) {
        let (first, second) = if high {
            (&self.inject_high, &self.inject_normal)
        } else {
            (&self.inject_normal, &self.inject_high)
        };

        match first.push(bits).or_else(|back| second.push(back)) {
            Ok(()) => self.signal.notify_all(),
            Err(back) => {
                bits = back;
                warn!("global job queues are full; spinning a release through");
                let backoff = Backoff::new();
                loop {
                    match first.push(bits) {
                        Ok(()) => {
                            self.signal.notify_all();
                            return;
                        }
                        Err(back) => bits = back,
                    }
                    backoff.snooze();
                }
            }
        }
    }

    /// The completion path: publishes the terminal state, releases
    /// dependents, counts down the group, records the profile sample and
    /// retires the slot.
    pub(crate) fn complete_job(&self, handle: JobHandle, worker: u32) {
        self.settle_job(handle, JobState::Completed, worker);
    }

    fn settle_job(&self, handle: JobHandle, state: JobState, worker: u32) {
        debug_assert!(state.is_settled());
        let slot = match self.table.get(handle) {
            Some(slot) => slot,
            None => return,
        };

        slot.mark_completed();

        // Counters settle before the terminal state is published, so any
        // observer that saw the job complete reads consistent stats.
        if state == JobState::Completed {
            let name = slot.payload().lock().unwrap().name.clone();
            self.profiler.record(JobRecord {
                start: slot.started_at(),
                end: slot.completed_at(),
                worker,
                name,
            });
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cancelled.fetch_add(1, Ordering::Relaxed);
        }
        self.outstanding.fetch_sub(1, Ordering::SeqCst);

        slot.store_state(state);

        let dependents = {
            let mut dependents = slot.dependents().lock().unwrap();
            mem::replace(&mut *dependents, Default::default())
        };
        for bits in dependents {
            self.release_dependent(JobHandle::from(Handle::from_bits(bits)));
        }

        // Group membership is read under the registry lock so it cannot
        // race a concurrent group_add.
        let fired = {
            let mut groups = self.groups.lock().unwrap();
            let bits = slot.group_bits();
            if bits != 0 {
                let group = GroupHandle::from(Handle::from_bits(bits));
                groups.get_mut(group).and_then(|g| {
                    if g.complete_one() {
                        g.continuation.take()
                    } else {
                        None
                    }
                })
            } else {
                None
            }
        };
        if let Some(continuation) = fired {
            self.release_dependent(continuation);
        }

        self.table.retire(handle.index());
        self.signal.notify_all();
    }

    /// Creates a child job of `parent`: the parent becomes a prerequisite,
    /// the child records the back-reference and inherits the parent's
    /// group (and thereby its arena) when it has none of its own.
    pub(crate) fn spawn_child(
        &self,
        parent: JobHandle,
        name: &str,
        body: JobBody,
    ) -> Result<JobHandle> {
        let handle = self.create_job(name, body, false)?;

        if let Some(pslot) = self.table.get(parent) {
            if !pslot.state().is_settled() {
                if let Some(slot) = self.table.get(handle) {
                    slot.set_parent(Handle::from(parent).to_bits());
                }

                let group_bits = {
                    let _groups = self.groups.lock().unwrap();
                    pslot.group_bits()
                };
                if group_bits != 0 {
                    self.group_add(GroupHandle::from(Handle::from_bits(group_bits)), handle);
                }
            }
        }

        self.add_dependency(handle, parent);
        self.submit(handle)?;
        Ok(handle)
    }

    /// Bulk submission: allocates every job, wires the intra-batch edges
    /// `(prerequisite, dependent)`, then ready-classifies and enqueues only
    /// the roots. On table exhaustion nothing from the batch runs.
    pub fn submit_batch(
        &self,
        descs: Vec<JobDesc>,
        edges: &[(usize, usize)],
    ) -> Result<Vec<JobHandle>> {
        let count = descs.len();
        for &(pre, dep) in edges {
            if pre >= count || dep >= count || pre == dep {
                return Err(Error::EdgeOutOfRange(pre, dep));
            }
        }

        let mut handles = Vec::with_capacity(count);
        for desc in descs {
            match self.create_job(&desc.name, desc.body, desc.large_stack) {
                Ok(handle) => {
                    if let Some(after) = desc.after {
                        self.add_dependency(handle, after);
                    }
                    handles.push(handle);
                }
                Err(err) => {
                    for &handle in &handles {
                        self.settle_job(handle, JobState::Cancelled, u32::max_value());
                    }
                    return Err(err);
                }
            }
        }

        for &(pre, dep) in edges {
            self.add_dependency(handles[dep], handles[pre]);
        }

        let mut first_err = None;
        for &handle in &handles {
            if let Err(err) = self.submit(handle) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(handles),
        }
    }

    /// The parent of a hierarchically spawned job, while both are alive.
    pub fn parent_of(&self, handle: JobHandle) -> Option<JobHandle> {
        let slot = self.table.get(handle)?;
        let bits = slot.parent_bits();
        if bits == 0 {
            return None;
        }

        let parent = JobHandle::from(Handle::from_bits(bits));
        self.table.get(parent).map(|_| parent)
    }

    /// True when the job settled; stale handles count as settled.
    pub fn is_complete(&self, handle: JobHandle) -> bool {
        match self.table.get(handle) {
            Some(slot) => slot.state().is_settled(),
            None => true,
        }
    }

    /// Blocks until `handle` settles, helping with other jobs on a worker
    /// context instead of blocking the thread.
    pub fn wait_job(&self, handle: JobHandle) {
        self.wait_condition(|| self.is_complete(handle));
    }

    /// Help-then-pause loop shared by every wait surface.
    pub(crate) fn wait_condition<F>(&self, pred: F)
    where
        F: Fn() -> bool,
    {
        let worker = WorkerThread::current();
        if !worker.is_null() {
            let worker = unsafe { &*worker };
            if worker.scheduler().as_ref() as *const Scheduler == self as *const Scheduler {
                worker.wait_until(pred);
                return;
            }
        }

        // Foreign thread: no deque to help from, so back off and park on
        // the completion signal.
        let backoff = Backoff::new();
        loop {
            if pred() {
                return;
            }
            let token = self.signal.prepare();
            if pred() {
                return;
            }
            if backoff.is_completed() {
                self.signal.wait(token);
            } else {
                backoff.snooze();
            }
        }
    }

    // --- groups ------------------------------------------------------

    pub fn group_create(&self, arena_capacity: usize) -> GroupHandle {
        self.groups.lock().unwrap().create(Group::new(arena_capacity))
    }

    /// Adds a live job to the group barrier. Stale or settled jobs and
    /// stale groups no-op.
    pub fn group_add(&self, group: GroupHandle, job: JobHandle) {
        let mut groups = self.groups.lock().unwrap();
        if let Some(g) = groups.get_mut(group) {
            if let Some(slot) = self.table.get(job) {
                if !slot.state().is_settled() {
                    slot.set_group(Handle::from(group).to_bits());
                    g.remaining += 1;
                    g.members.push(job.index());
                }
            }
        }
    }

    /// Seals the group: no completion before this can fire the
    /// continuation, so members may be added without racing the barrier.
    pub fn group_submit(&self, group: GroupHandle) {
        let fired = {
            let mut groups = self.groups.lock().unwrap();
            match groups.get_mut(group) {
                Some(g) if !g.submitted => {
                    g.submitted = true;
                    if g.complete_one() {
                        g.continuation.take()
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        if let Some(continuation) = fired {
            self.release_dependent(continuation);
        }
    }

    /// Registers the job to submit when the group closes; it is created
    /// pending and fires exactly once. When the group has already closed
    /// the continuation is submitted immediately.
    pub(crate) fn group_set_continuation(
        &self,
        group: GroupHandle,
        name: &str,
        body: JobBody,
    ) -> Result<JobHandle> {
        let handle = self.create_job(name, body, false)?;

        let verdict = {
            let mut groups = self.groups.lock().unwrap();
            match groups.get_mut(group) {
                None => Err(()),
                Some(g) if g.done => Ok(true),
                Some(g) => {
                    debug_assert!(g.continuation.is_none());
                    g.continuation = Some(handle);
                    Ok(false)
                }
            }
        };

        match verdict {
            Ok(true) => {
                self.release_dependent(handle);
                Ok(handle)
            }
            Ok(false) => Ok(handle),
            Err(()) => {
                self.settle_job(handle, JobState::Cancelled, u32::max_value());
                Err(Error::GroupDestroyed)
            }
        }
    }

    /// Runs `func` against the group's scratch arena. Member jobs use this
    /// for allocations that live until `group_destroy`. The registry lock
    /// is held while `func` runs, so `func` must not call back into group
    /// operations.
    pub fn with_group_arena<F, R>(&self, group: GroupHandle, func: F) -> Option<R>
    where
        F: FnOnce(&crate::utils::arena::Arena) -> R,
    {
        let groups = self.groups.lock().unwrap();
        groups.get(group).map(|g| func(&g.arena))
    }

    /// Blocks until every member of the group (and its submit seal) has
    /// completed. Destroyed groups count as complete.
    pub fn group_wait(&self, group: GroupHandle) {
        self.wait_condition(|| {
            let groups = self.groups.lock().unwrap();
            match groups.get(group) {
                Some(g) => g.done,
                None => true,
            }
        });
    }

    /// Frees the group and its arena. Members keep running; an unfired
    /// continuation is cancelled. Never called automatically.
    pub fn group_destroy(&self, group: GroupHandle) {
        let freed = self.groups.lock().unwrap().free(group);
        if let Some(mut g) = freed {
            debug!(
                "destroying group {} ({} members over its lifetime)",
                group,
                g.members.len()
            );
            if let Some(continuation) = g.continuation.take() {
                self.settle_job(continuation, JobState::Cancelled, u32::max_value());
            }
        }
    }

    // --- diagnostics --------------------------------------------------

    pub fn stats(&self) -> SchedStats {
        SchedStats {
            workers: self
                .workers
                .iter()
                .map(|info| WorkerStats {
                    node: info.node,
                    executed: info.counters.executed.load(Ordering::Relaxed),
                    steals_attempted: info.counters.steals_attempted.load(Ordering::Relaxed),
                    steals_succeeded: info.counters.steals_succeeded.load(Ordering::Relaxed),
                    steals_local: info.counters.steals_local.load(Ordering::Relaxed),
                    yields: info.counters.yields.load(Ordering::Relaxed),
                    sleeps: info.counters.sleeps.load(Ordering::Relaxed),
                })
                .collect(),
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            outstanding: self.outstanding.load(Ordering::SeqCst),
        }
    }

    /// Routes a panic that escaped a job body.
    pub(crate) fn handle_panic(&self, err: Box<dyn Any + Send>) {
        match self.panic_handler {
            Some(ref handler) => {
                // If the customizable panic handler itself panics, abort.
                let abort_guard = AbortIfPanic;
                handler(err);
                mem::forget(abort_guard);
            }
            None => {
                let _ = AbortIfPanic;
            }
        }
    }

    /// Drains all outstanding work (helping from the promoted main
    /// worker), stops the workers and joins them.
    pub(crate) fn shutdown(&self, main_worker: &mut WorkerThread) {
        main_worker.wait_until(|| self.outstanding() == 0);

        self.quit.store(true, Ordering::SeqCst);
        self.signal.notify_all();

        for index in 1..self.workers.len() {
            self.workers[index].terminated.wait();
        }
        for handle in self.threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }

        main_worker.shutdown_fibers();
        info!(
            "scheduler down: {} completed, {} cancelled, {} stolen",
            self.completed.load(Ordering::Relaxed),
            self.cancelled.load(Ordering::Relaxed),
            self.workers
                .iter()
                .map(|w| w.counters.steals_succeeded.load(Ordering::Relaxed))
                .sum::<u64>()
        );
    }
}
