//! Per-worker fiber pools.
//!
//! A fiber is a stackful execution context a job body runs on, so that the
//! worker's scheduling loop keeps its own stack shallow and a body that
//! suspends in `yield_now` can be parked and resumed later. The portable
//! primitive here is a lazily spawned, parked OS thread per fiber with a
//! two-way rendezvous: `switch` hands control to the fiber and blocks the
//! calling context until the fiber hands control back on completion or at a
//! suspension point. Exactly one context per worker runs at any moment.
//!
//! Each worker owns two sub-pools, a small-stack class and a large-stack
//! class. Availability is a bitmask claimed by CAS; a fiber's thread is
//! created on first acquisition and joined only at shutdown.

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use super::job::JobHandle;
use super::worker;

/// Stack size class of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StackClass {
    Small,
    Large,
}

/// Names a fiber inside its worker's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FiberId {
    pub class: StackClass,
    pub index: usize,
}

/// A `WorkerThread` pointer smuggled across the rendezvous. The pointee
/// lives on the worker thread's stack (or in the scheduler context for
/// worker 0) and outlives every fiber of that worker.
#[derive(Clone, Copy)]
pub(crate) struct WorkerPtr(pub *const worker::WorkerThread);

unsafe impl Send for WorkerPtr {}

/// How a switch into a fiber came back.
pub(crate) enum Switch {
    /// The body ran to completion (or a step body returned `Complete`).
    Finished(JobHandle),
    /// The body suspended in `yield_now`; the fiber stays bound to the job
    /// and must be resumed on the owning worker.
    Suspended(JobHandle),
    /// A step body returned `Yield`; the body was put back into the slot
    /// and the job should be re-enqueued by handle.
    Requeued(JobHandle),
}

enum Cmd {
    Run { job: JobHandle, worker: WorkerPtr },
    Resume { worker: WorkerPtr },
    Quit,
}

#[derive(Default)]
struct Mailbox {
    cmd: Option<Cmd>,
    outcome: Option<Switch>,
}

pub(crate) struct FiberShared {
    mailbox: Mutex<Mailbox>,
    cvar: Condvar,
}

impl FiberShared {
    fn new() -> Arc<FiberShared> {
        Arc::new(FiberShared {
            mailbox: Mutex::new(Mailbox::default()),
            cvar: Condvar::new(),
        })
    }

    /// Hands control to the fiber and blocks until it hands control back.
    fn switch(&self, cmd: Cmd) -> Switch {
        let mut mailbox = self.mailbox.lock().unwrap();
        debug_assert!(mailbox.cmd.is_none());
        mailbox.cmd = Some(cmd);
        self.cvar.notify_all();

        loop {
            if let Some(outcome) = mailbox.outcome.take() {
                return outcome;
            }
            mailbox = self.cvar.wait(mailbox).unwrap();
        }
    }

    pub(crate) fn run(&self, job: JobHandle, worker: WorkerPtr) -> Switch {
        self.switch(Cmd::Run { job, worker })
    }

    pub(crate) fn resume(&self, worker: WorkerPtr) -> Switch {
        self.switch(Cmd::Resume { worker })
    }

    /// Posts the quit command without waiting for an outcome; only valid
    /// when the fiber is parked in its top-level loop.
    fn post_quit(&self) {
        let mut mailbox = self.mailbox.lock().unwrap();
        mailbox.cmd = Some(Cmd::Quit);
        self.cvar.notify_all();
    }

    fn post_outcome(&self, outcome: Switch) {
        let mut mailbox = self.mailbox.lock().unwrap();
        debug_assert!(mailbox.outcome.is_none());
        mailbox.outcome = Some(outcome);
        self.cvar.notify_all();
    }
}

thread_local! {
    static CURRENT_FIBER: Cell<*const FiberShared> = Cell::new(0 as *const FiberShared);
}

/// Whether the calling context is a fiber (as opposed to a worker's
/// scheduler context or a foreign thread).
pub(crate) fn on_fiber() -> bool {
    CURRENT_FIBER.with(|c| !c.get().is_null())
}

/// Suspends the fiber the caller is running on, handing control back to the
/// context that switched into it. Returns false when the caller is not on a
/// fiber (the body is running inline on a scheduler context), in which case
/// nothing happened.
pub(crate) fn suspend_current(job: JobHandle) -> bool {
    let shared = CURRENT_FIBER.with(|c| c.get());
    if shared.is_null() {
        return false;
    }

    let shared = unsafe { &*shared };
    let mut mailbox = shared.mailbox.lock().unwrap();
    debug_assert!(mailbox.outcome.is_none());
    mailbox.outcome = Some(Switch::Suspended(job));
    shared.cvar.notify_all();

    loop {
        mailbox = shared.cvar.wait(mailbox).unwrap();
        if let Some(cmd) = mailbox.cmd.take() {
            match cmd {
                Cmd::Resume { worker } => {
                    drop(mailbox);
                    worker::WorkerThread::bind_to_thread(worker.0);
                    return true;
                }
                Cmd::Run { .. } | Cmd::Quit => {
                    unreachable!("fiber received a non-resume command while suspended in a job")
                }
            }
        }
    }
}

fn fiber_main(shared: Arc<FiberShared>) {
    CURRENT_FIBER.with(|c| c.set(&*shared as *const FiberShared));

    loop {
        let cmd = {
            let mut mailbox = shared.mailbox.lock().unwrap();
            loop {
                if let Some(cmd) = mailbox.cmd.take() {
                    break cmd;
                }
                mailbox = shared.cvar.wait(mailbox).unwrap();
            }
        };

        match cmd {
            Cmd::Quit => break,
            Cmd::Resume { .. } => {
                debug_assert!(false, "resume delivered to a fiber with no suspended job");
            }
            Cmd::Run { job, worker } => {
                worker::WorkerThread::bind_to_thread(worker.0);
                let outcome = worker::execute_job_body(worker, job);
                shared.post_outcome(outcome);
            }
        }
    }
}

struct Fiber {
    shared: Arc<FiberShared>,
    thread: Option<thread::JoinHandle<()>>,
}

struct SubPool {
    class: StackClass,
    stack_size: usize,
    capacity: usize,
    /// Bit set = slot available. Claimed with a CAS bit-scan; fibers may be
    /// acquired and released from any context acting on the worker's
    /// behalf, so the mask is atomic even though accesses never overlap in
    /// a well-formed schedule.
    free: AtomicU32,
    fibers: Mutex<Vec<Option<Fiber>>>,
}

impl SubPool {
    fn new(class: StackClass, stack_size: usize, capacity: usize) -> SubPool {
        let capacity = capacity.min(32).max(1);
        let free = if capacity == 32 {
            ::std::u32::MAX
        } else {
            (1u32 << capacity) - 1
        };

        let mut fibers = Vec::with_capacity(capacity);
        fibers.resize_with(capacity, || None);

        SubPool {
            class,
            stack_size,
            capacity,
            free: AtomicU32::new(free),
            fibers: Mutex::new(fibers),
        }
    }

    fn try_claim(&self) -> Option<usize> {
        loop {
            let mask = self.free.load(Ordering::Acquire);
            if mask == 0 {
                return None;
            }

            let bit = mask.trailing_zeros();
            if self
                .free
                .compare_exchange_weak(
                    mask,
                    mask & !(1 << bit),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Some(bit as usize);
            }
        }
    }

    fn release(&self, index: usize) {
        debug_assert!(index < self.capacity);
        let prev = self.free.fetch_or(1 << index, Ordering::AcqRel);
        debug_assert_eq!(prev & (1 << index), 0);
    }

    /// Returns the shared mailbox for slot `index`, spawning the backing
    /// thread on first use.
    fn materialize(&self, worker_index: usize, index: usize) -> Option<Arc<FiberShared>> {
        let mut fibers = self.fibers.lock().unwrap();
        if let Some(ref fiber) = fibers[index] {
            return Some(Arc::clone(&fiber.shared));
        }

        let shared = FiberShared::new();
        let entry = Arc::clone(&shared);
        let name = format!(
            "fray-fiber-{}-{}{}",
            worker_index,
            if self.class == StackClass::Large { "L" } else { "s" },
            index
        );

        match thread::Builder::new()
            .name(name)
            .stack_size(self.stack_size)
            .spawn(move || fiber_main(entry))
        {
            Ok(handle) => {
                fibers[index] = Some(Fiber {
                    shared: Arc::clone(&shared),
                    thread: Some(handle),
                });
                Some(shared)
            }
            Err(err) => {
                warn!("failed to spawn fiber thread: {}", err);
                None
            }
        }
    }

    fn shutdown(&mut self) {
        let mut fibers = self.fibers.lock().unwrap();
        for fiber in fibers.iter_mut().filter_map(|f| f.as_mut()) {
            fiber.shared.post_quit();
        }
        for fiber in fibers.iter_mut().filter_map(|f| f.take()) {
            if let Some(handle) = { fiber.thread } {
                let _ = handle.join();
            }
        }
    }
}

/// The per-worker pool of fibers: a small-stack class for ordinary jobs and
/// a large-stack class for bodies flagged as stack-hungry.
pub(crate) struct FiberPool {
    worker_index: usize,
    small: SubPool,
    large: SubPool,
}

impl FiberPool {
    pub fn new(
        worker_index: usize,
        small_stack: usize,
        small_capacity: usize,
        large_stack: usize,
        large_capacity: usize,
    ) -> FiberPool {
        FiberPool {
            worker_index,
            small: SubPool::new(StackClass::Small, small_stack, small_capacity),
            large: SubPool::new(StackClass::Large, large_stack, large_capacity),
        }
    }

    /// Claims a fiber. Small requests spill into the large class under
    /// pressure; large requests never shrink. `None` means the caller
    /// should run the body inline.
    pub fn acquire(&self, large: bool) -> Option<(FiberId, Arc<FiberShared>)> {
        let classes: [&SubPool; 2] = if large {
            [&self.large, &self.large]
        } else {
            [&self.small, &self.large]
        };

        for pool in classes.iter().take(if large { 1 } else { 2 }) {
            if let Some(index) = pool.try_claim() {
                match pool.materialize(self.worker_index, index) {
                    Some(shared) => {
                        return Some((
                            FiberId {
                                class: pool.class,
                                index,
                            },
                            shared,
                        ));
                    }
                    None => pool.release(index),
                }
            }
        }

        None
    }

    pub fn release(&self, id: FiberId) {
        match id.class {
            StackClass::Small => self.small.release(id.index),
            StackClass::Large => self.large.release(id.index),
        }
    }

    /// Joins every fiber thread. Only valid once no job is suspended or
    /// running on any of them.
    pub fn shutdown(&mut self) {
        self.small.shutdown();
        self.large.shutdown();
    }
}

impl Drop for FiberPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
