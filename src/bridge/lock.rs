//! Execution lock protocol.
//!
//! Every embedded operation runs inside [`with_context`]: take the runtime's
//! execution lock, make the target context's thread state current, run, then
//! restore the previous state on every exit path. The main context uses the
//! calling thread's own state; an isolated context uses the state it was
//! created with on its owner thread, or a private state allocated for the
//! duration of the call on any other thread.

use super::context::{ContextLease, ContextRecord, ContextTag};
use super::error::BridgeError;
use super::interpreter;
use pyo3::ffi;
use pyo3::prelude::*;
use std::cell::Cell;
use std::thread;
use tracing::warn;

thread_local! {
    static HELD: Cell<bool> = const { Cell::new(false) };
}

/// Context an embedded operation runs in.
pub(crate) enum ExecutionTarget {
    Main,
    Isolated(ContextLease),
}

impl ExecutionTarget {
    pub(crate) fn tag(&self) -> ContextTag {
        match self {
            ExecutionTarget::Main => ContextTag::Main,
            ExecutionTarget::Isolated(lease) => lease.tag(),
        }
    }
}

/// Run `work` with execution rights on `target`.
///
/// Not re-entrant: a thread already inside `with_context` gets a `Lifecycle`
/// error instead of a nested acquisition. Shutdown waits for the acquisition to
/// finish before finalizing.
pub(crate) fn with_context<T>(
    target: &ExecutionTarget,
    work: impl for<'py> FnOnce(Python<'py>) -> Result<T, BridgeError>,
) -> Result<T, BridgeError> {
    let _held = HeldGuard::acquire()?;
    let _running = interpreter::enter()?;

    Python::attach(|py| {
        let entered = match target {
            ExecutionTarget::Main => None,
            ExecutionTarget::Isolated(lease) => Some(EnteredContext::enter(lease.record())?),
        };
        let result = work(py);
        discard_pending_error(py);
        drop(entered);
        result
    })
}

fn discard_pending_error(py: Python<'_>) {
    if let Some(err) = PyErr::take(py) {
        warn!(error = %err, "discarding pending embedded error at lock release");
    }
}

struct HeldGuard;

impl HeldGuard {
    fn acquire() -> Result<Self, BridgeError> {
        if HELD.with(|held| held.replace(true)) {
            return Err(BridgeError::Lifecycle(
                "execution lock is already held by this thread".to_string(),
            ));
        }
        Ok(HeldGuard)
    }
}

impl Drop for HeldGuard {
    fn drop(&mut self) {
        HELD.with(|held| held.set(false));
    }
}

/// An isolated context's thread state made current on this thread.
struct EnteredContext {
    previous: *mut ffi::PyThreadState,
    current: *mut ffi::PyThreadState,
    private: bool,
}

impl EnteredContext {
    fn enter(record: &ContextRecord) -> Result<Self, BridgeError> {
        let private = record.owner_thread() != thread::current().id();
        let current = if private {
            // SAFETY: the execution lock is held and the caller's lease keeps the
            // interpreter alive.
            let state = unsafe { ffi::PyThreadState_New(record.interpreter()) };
            if state.is_null() {
                return Err(BridgeError::Lifecycle(format!(
                    "unable to allocate a thread state for context {}",
                    record.id()
                )));
            }
            state
        } else {
            record.thread_state()
        };

        // SAFETY: `current` belongs to the leased interpreter and is never active on
        // another thread: owner states are only used by their owner thread, and
        // `HeldGuard` rules out nested entry on it.
        let previous = unsafe { ffi::PyThreadState_Swap(current) };
        Ok(Self {
            previous,
            current,
            private,
        })
    }
}

impl Drop for EnteredContext {
    fn drop(&mut self) {
        // SAFETY: `current` is this thread's active state and `previous` the state
        // that was active at entry. A private state is cleared while current and
        // deleted once detached.
        unsafe {
            if self.private {
                ffi::PyThreadState_Clear(self.current);
            }
            ffi::PyThreadState_Swap(self.previous);
            if self.private {
                ffi::PyThreadState_Delete(self.current);
            }
        }
    }
}
