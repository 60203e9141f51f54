// src/recording/suspension.rs
//! Instrumentation suspension
//!
//! While the engine computes its own bookkeeping (display strings for event
//! payloads and the like) it may hit the database. Those statements must not
//! be captured. Suspension is counted per thread so one request's bookkeeping
//! never hides another thread's statements, and guards nest.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Keeps instrumentation suspended on this thread until dropped
#[must_use = "instrumentation resumes as soon as the guard is dropped"]
pub struct SuspensionGuard {
    // Tied to the thread that created it
    _not_send: PhantomData<*const ()>,
}

impl Drop for SuspensionGuard {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Suspend instrumentation on the calling thread
pub fn suspend() -> SuspensionGuard {
    DEPTH.with(|depth| depth.set(depth.get() + 1));
    SuspensionGuard {
        _not_send: PhantomData,
    }
}

/// Run `f` with instrumentation suspended
pub fn suspended<T>(f: impl FnOnce() -> T) -> T {
    let _guard = suspend();
    f()
}

pub fn is_suspended() -> bool {
    DEPTH.with(|depth| depth.get() > 0)
}
