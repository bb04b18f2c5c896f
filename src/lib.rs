//! # What is This?
//!
//! Fray is the scheduling core of a game runtime: a fiber-based,
//! work-stealing job scheduler with DAG-style dependencies and an optional
//! NUMA-aware victim selection policy. Short-lived jobs are submitted from
//! any thread, distributed over a fixed pool of pinned workers, and may
//! suspend cooperatively so that a job waiting on another job never blocks
//! its worker.
//!
//! The crate is deliberately small. It does not render, open windows, or
//! run a frame loop; it schedules the work those systems hand it.

#[macro_use]
extern crate failure;
#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

pub mod errors;
#[macro_use]
pub mod utils;

pub mod prelude;
pub mod sched;
