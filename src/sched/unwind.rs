use std::io;
use std::io::prelude::*;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::thread;

/// Executes `f` and captures any panic, translating that panic into an
/// `Err` result. Panics escaping job bodies are routed to the scheduler's
/// panic handler, so `f` can be treated as exception safe here.
pub fn halt_unwinding<F, R>(func: F) -> thread::Result<R>
where
    F: FnOnce() -> R,
{
    panic::catch_unwind(AssertUnwindSafe(func))
}

pub struct AbortIfPanic;

impl Drop for AbortIfPanic {
    fn drop(&mut self) {
        let _ = writeln!(&mut io::stderr(), "detected unexpected panic; aborting");
        process::abort();
    }
}
