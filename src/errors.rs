//! Failures the scheduler reports to callers. Protocol races (steal CAS
//! losses) and stale handles are not errors; only capacity and platform
//! problems surface here.

#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "Job table exhausted ({} slots).", _0)]
    TableExhausted(usize),
    #[fail(display = "Global job queues are full.")]
    QueuesFull,
    #[fail(display = "Batch edge ({}, {}) is out of range.", _0, _1)]
    EdgeOutOfRange(usize, usize),
    #[fail(display = "Group no longer exists.")]
    GroupDestroyed,
    #[fail(display = "Failed to spawn worker {}: {}", _0, _1)]
    WorkerSpawn(usize, ::std::io::Error),
}

pub type Result<T> = ::std::result::Result<T, Error>;
