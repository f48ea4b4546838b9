//! Isolated execution contexts (sub-interpreters).
//!
//! Each context owns a sub-interpreter, the thread state created with it and
//! its `__main__` namespace. Operations hold a [`ContextLease`] while they run
//! so teardown waits for in-flight work instead of pulling the interpreter out
//! from under it.

use super::config::BridgeConfig;
use super::error::BridgeError;
use super::host_value::HostValue;
use super::registry::{ForeignHandle, ForeignRef};
use super::{interpreter, Bridge};
use parking_lot::{Condvar, Mutex};
use pyo3::ffi;
use pyo3::prelude::*;
use pyo3::types::PyDict;
use std::collections::HashSet;
use std::fmt;
use std::ptr;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::SystemTime;
use tracing::{debug, error};

/// Which context an embedded object or operation belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ContextTag {
    /// The implicit default context
    Main,
    /// An isolated context, by context id
    Isolated(Arc<str>),
}

impl ContextTag {
    pub fn is_main(&self) -> bool {
        matches!(self, ContextTag::Main)
    }
}

impl fmt::Display for ContextTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextTag::Main => f.write_str("main"),
            ContextTag::Isolated(id) => write!(f, "context:{id}"),
        }
    }
}

#[derive(Clone, Copy)]
pub(crate) struct RawThreadState(*mut ffi::PyThreadState);

// SAFETY: the pointer is only handed to the embedded runtime while the execution
// lock is held, and only by the thread that owns it (see `lock::EnteredContext`).
unsafe impl Send for RawThreadState {}
// SAFETY: as above; the pointer value itself is immutable.
unsafe impl Sync for RawThreadState {}

#[derive(Clone, Copy)]
pub(crate) struct RawInterpreter(*mut ffi::PyInterpreterState);

// SAFETY: interpreter state pointers are process-global and only dereferenced by
// the embedded runtime under the execution lock.
unsafe impl Send for RawInterpreter {}
// SAFETY: as above.
unsafe impl Sync for RawInterpreter {}

#[derive(Debug)]
struct LeaseState {
    live: bool,
    active: usize,
}

pub(crate) struct ContextRecord {
    id: Arc<str>,
    namespace_id: String,
    created_at: SystemTime,
    slot_index: usize,
    owner_thread: ThreadId,
    thread_state: RawThreadState,
    interpreter: RawInterpreter,
    namespace: ForeignRef,
    lease: Mutex<LeaseState>,
    drained: Condvar,
}

impl ContextRecord {
    pub(crate) fn owner_thread(&self) -> ThreadId {
        self.owner_thread
    }

    pub(crate) fn thread_state(&self) -> *mut ffi::PyThreadState {
        self.thread_state.0
    }

    pub(crate) fn interpreter(&self) -> *mut ffi::PyInterpreterState {
        self.interpreter.0
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn namespace<'py>(&self, py: Python<'py>) -> Option<Bound<'py, PyDict>> {
        self.namespace
            .bind(py)
            .and_then(|namespace| namespace.cast_into::<PyDict>().ok())
    }

    /// Mark the context dead and wait until no lease is outstanding.
    fn retire(&self) -> Result<(), BridgeError> {
        let mut lease = self.lease.lock();
        if !lease.live {
            return Err(BridgeError::InvalidContext(format!(
                "context {} has already been destroyed",
                self.id
            )));
        }
        lease.live = false;
        while lease.active > 0 {
            self.drained.wait(&mut lease);
        }
        Ok(())
    }
}

/// Host-visible proxy for an isolated execution context.
#[derive(Clone)]
pub struct ContextHandle(Arc<ContextRecord>);

impl ContextHandle {
    pub(crate) fn from_record(record: ContextRecord) -> Self {
        ContextHandle(Arc::new(record))
    }

    /// Opaque context identity.
    pub fn id(&self) -> &str {
        &self.0.id
    }

    /// Identity of the context's `__main__` namespace.
    pub fn namespace_id(&self) -> &str {
        &self.0.namespace_id
    }

    pub fn created_at(&self) -> SystemTime {
        self.0.created_at
    }

    pub fn slot_index(&self) -> usize {
        self.0.slot_index
    }

    pub fn tag(&self) -> ContextTag {
        ContextTag::Isolated(Arc::clone(&self.0.id))
    }

    /// False once the context has been destroyed.
    pub fn is_live(&self) -> bool {
        self.0.lease.lock().live
    }

    pub fn ptr_eq(&self, other: &ContextHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn record(&self) -> &ContextRecord {
        &self.0
    }

    /// Keep the context alive for the duration of one operation.
    pub(crate) fn lease(&self) -> Result<ContextLease, BridgeError> {
        let mut lease = self.0.lease.lock();
        if !lease.live {
            return Err(BridgeError::InvalidContext(format!(
                "context {} has been destroyed",
                self.0.id
            )));
        }
        lease.active += 1;
        Ok(ContextLease {
            record: Arc::clone(&self.0),
        })
    }
}

impl PartialEq for ContextHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("id", &self.0.id)
            .field("slot_index", &self.0.slot_index)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Proof that a context stays alive while an operation uses it.
pub(crate) struct ContextLease {
    record: Arc<ContextRecord>,
}

impl ContextLease {
    pub(crate) fn record(&self) -> &ContextRecord {
        &self.record
    }

    pub(crate) fn tag(&self) -> ContextTag {
        ContextTag::Isolated(Arc::clone(&self.record.id))
    }
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        let mut lease = self.record.lease.lock();
        lease.active -= 1;
        if lease.active == 0 {
            self.record.drained.notify_all();
        }
    }
}

/// Reject `values` if any handle or context inside them belongs to a context other
/// than `target`.
///
/// Composites are walked iteratively with an identity visited-set, so cyclic host
/// graphs terminate. Buffers and primitives always pass.
pub(crate) fn check_same_context<'a>(
    target: &ContextTag,
    values: impl IntoIterator<Item = &'a HostValue>,
) -> Result<(), BridgeError> {
    let mut visited = HashSet::new();
    let mut pending: Vec<HostValue> = values.into_iter().cloned().collect();

    while let Some(value) = pending.pop() {
        match value {
            HostValue::Handle(handle) => ensure_handle_context(target, &handle)?,
            HostValue::Context(context) => {
                let tag = context.tag();
                if &tag != target {
                    return Err(BridgeError::CrossContext(format!(
                        "{tag} was passed to an operation on {target}"
                    )));
                }
            }
            HostValue::Array(array) => {
                if visited.insert(array.identity()) {
                    pending.extend(array.to_vec());
                }
            }
            HostValue::Object(object) => {
                if visited.insert(object.identity()) {
                    pending.extend(object.entries().into_iter().map(|(_, value)| value));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

pub(crate) fn ensure_handle_context(
    target: &ContextTag,
    handle: &ForeignHandle,
) -> Result<(), BridgeError> {
    if handle.context_tag() == target {
        return Ok(());
    }
    Err(BridgeError::CrossContext(format!(
        "{} object {} belongs to {} but the operation targets {target}",
        handle.type_name(),
        handle.identity(),
        handle.context_tag()
    )))
}

struct SpawnedInterpreter {
    thread_state: RawThreadState,
    interpreter: RawInterpreter,
    namespace: ForeignRef,
    namespace_id: String,
}

impl Bridge {
    /// Create an isolated context with a bootstrapped namespace.
    pub fn create_context(&self) -> Result<ContextHandle, BridgeError> {
        self.ensure_initialized()?;

        let _lifecycle = interpreter::lifecycle();
        if !interpreter::is_running() {
            return Err(BridgeError::Lifecycle(
                "embedded runtime is not running".to_string(),
            ));
        }

        let spawned = Python::attach(|py| spawn_interpreter(py, &self.config))?;
        let owner_thread = thread::current().id();
        let id: Arc<str> = Arc::from((spawned.thread_state.0 as usize).to_string());

        let context = self.state.register_context(|slot_index| ContextRecord {
            id,
            namespace_id: spawned.namespace_id,
            created_at: SystemTime::now(),
            slot_index,
            owner_thread,
            thread_state: spawned.thread_state,
            interpreter: spawned.interpreter,
            namespace: spawned.namespace,
            lease: Mutex::new(LeaseState {
                live: true,
                active: 0,
            }),
            drained: Condvar::new(),
        });

        debug!(context = %context.tag(), slot_index = context.slot_index(), "created isolated context");
        Ok(context)
    }

    /// Tear down an isolated context.
    ///
    /// Waits for in-flight operations on the context, releases every handle tagged
    /// with it, then ends the sub-interpreter. Destroying twice fails with
    /// `InvalidContext`.
    pub fn destroy_context(&self, context: &ContextHandle) -> Result<bool, BridgeError> {
        if !self.state.tracks_context(context) {
            return Err(BridgeError::InvalidContext(format!(
                "context {} is not tracked by this bridge",
                context.id()
            )));
        }

        let _lifecycle = interpreter::lifecycle();
        if !interpreter::is_running() {
            return Err(BridgeError::Lifecycle(
                "embedded runtime is not running".to_string(),
            ));
        }

        context.record().retire()?;
        let handles = self.state.detach_tagged(&context.tag());
        let released = handles.len();
        Python::attach(|py| end_interpreter(py, context.record(), handles));
        self.state.unregister_context(context);

        debug!(context = %context.tag(), released, "destroyed isolated context");
        Ok(true)
    }
}

fn spawn_interpreter(
    py: Python<'_>,
    config: &BridgeConfig,
) -> Result<SpawnedInterpreter, BridgeError> {
    // SAFETY: the lifecycle mutex and the execution lock are held. The caller's
    // state is detached so the new interpreter can become current.
    let previous = unsafe { ffi::PyThreadState_Swap(ptr::null_mut()) };
    // SAFETY: no thread state is current on this thread.
    let thread_state = unsafe { ffi::Py_NewInterpreter() };
    if thread_state.is_null() {
        // SAFETY: reattach the state detached above.
        unsafe { ffi::PyThreadState_Swap(previous) };
        return Err(BridgeError::ContextCreation(
            "the embedded runtime could not allocate an isolated interpreter".to_string(),
        ));
    }

    let prepared = interpreter::bootstrap(py, config).map(|namespace| {
        let namespace_id = super::registry::identity_of(namespace.as_any());
        (ForeignRef::retain(namespace.as_any()), namespace_id)
    });

    let outcome = match prepared {
        Ok((namespace, namespace_id)) => Ok(SpawnedInterpreter {
            thread_state: RawThreadState(thread_state),
            // SAFETY: the new interpreter's thread state is current.
            interpreter: RawInterpreter(unsafe { ffi::PyInterpreterState_Get() }),
            namespace,
            namespace_id,
        }),
        Err(err) => {
            // SAFETY: `thread_state` is current, runs no frames and is the
            // interpreter's only thread state.
            unsafe { ffi::Py_EndInterpreter(thread_state) };
            Err(BridgeError::ContextCreation(err.to_string()))
        }
    };

    // SAFETY: restore the caller's state; the sub-interpreter state (if any) is
    // left detached for later use by its owner thread.
    unsafe { ffi::PyThreadState_Swap(previous) };
    outcome
}

fn end_interpreter(py: Python<'_>, record: &ContextRecord, handles: Vec<ForeignHandle>) {
    let owned = record.owner_thread() == thread::current().id();
    let current = if owned {
        record.thread_state()
    } else {
        // SAFETY: the context is retired with no outstanding lease, so nothing else
        // is running in its interpreter.
        unsafe { ffi::PyThreadState_New(record.interpreter()) }
    };
    if current.is_null() {
        error!(context = record.id(), "unable to enter context for teardown; leaking it");
        return;
    }

    // SAFETY: `current` belongs to the retired interpreter and is not active on
    // any other thread.
    let previous = unsafe { ffi::PyThreadState_Swap(current) };

    for handle in &handles {
        handle.token().release(py);
    }
    record.namespace.release(py);

    // SAFETY: `current` is this thread's active state. The owner's state is idle
    // (no lease is outstanding) and must go before the interpreter can end, which
    // requires `current` to be the last remaining state.
    unsafe {
        if !owned {
            ffi::PyThreadState_Clear(record.thread_state());
            ffi::PyThreadState_Delete(record.thread_state());
        }
        ffi::Py_EndInterpreter(current);
        ffi::PyThreadState_Swap(previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::pipeline::{ForeignTarget, SourceMode};
    use crate::bridge::testing::test_bridge;

    #[test]
    fn test_contexts_have_separate_namespaces() {
        let bridge = test_bridge();
        let first = bridge.create_context().expect("first context");
        let second = bridge.create_context().expect("second context");
        assert_ne!(first.id(), second.id());
        assert_ne!(first.namespace_id(), second.namespace_id());

        bridge
            .run_source("marker = 10", SourceMode::Statements, Some(&first))
            .expect("exec in first");
        bridge
            .run_source("marker = 20", SourceMode::Statements, Some(&second))
            .expect("exec in second");

        let a = bridge
            .run_source("marker", SourceMode::Expression, Some(&first))
            .expect("eval in first");
        let b = bridge
            .run_source("marker", SourceMode::Expression, Some(&second))
            .expect("eval in second");
        assert_eq!(a, HostValue::Number(10.0));
        assert_eq!(b, HostValue::Number(20.0));

        assert!(bridge.destroy_context(&first).expect("destroy first"));
        assert!(bridge.destroy_context(&second).expect("destroy second"));
    }

    #[test]
    fn test_destroy_twice_is_invalid() {
        let bridge = test_bridge();
        let context = bridge.create_context().expect("context");
        assert!(context.is_live());

        assert!(bridge.destroy_context(&context).expect("destroy"));
        assert!(!context.is_live());

        let err = bridge.destroy_context(&context).expect_err("second destroy");
        assert!(matches!(err, BridgeError::InvalidContext(_)));

        let err = bridge
            .run_source("1", SourceMode::Expression, Some(&context))
            .expect_err("destroyed context");
        assert!(matches!(err, BridgeError::InvalidContext(_)));
    }

    #[test]
    fn test_destroy_recycles_tagged_handles() {
        let bridge = test_bridge();
        let context = bridge.create_context().expect("context");

        let math = bridge
            .acquire_foreign(ForeignTarget::Module("math"), Some(&context))
            .expect("import math");
        assert_eq!(math.context_tag(), &context.tag());

        let root = bridge
            .invoke(&math, "sqrt", &[HostValue::Number(16.0)], None, Some(&context))
            .expect("sqrt");
        assert_eq!(root, HostValue::Number(4.0));

        bridge.destroy_context(&context).expect("destroy");
        let err = bridge.resolve(&math).expect_err("recycled");
        assert!(matches!(err, BridgeError::HandleRecycled { .. }));
        assert_eq!(bridge.live_contexts(), 0);
    }

    #[test]
    fn test_destroy_from_another_thread() {
        let bridge = test_bridge();
        let context = bridge.create_context().expect("context");
        bridge
            .run_source("value = 'here'", SourceMode::Statements, Some(&context))
            .expect("exec");

        thread::scope(|scope| {
            scope.spawn(|| {
                let value = bridge
                    .run_source("value", SourceMode::Expression, Some(&context))
                    .expect("eval from worker thread");
                assert_eq!(value, HostValue::from("here"));
                assert!(bridge.destroy_context(&context).expect("destroy"));
            });
        });

        assert!(!context.is_live());
    }

    #[test]
    fn test_cross_context_check_walks_cycles() {
        let array = crate::bridge::HostArray::new();
        array.push(HostValue::Number(1.0));
        array.push(HostValue::Array(array.clone()));
        let value = HostValue::Array(array);

        let tag = ContextTag::Isolated(Arc::from("7"));
        assert!(check_same_context(&tag, [&value]).is_ok());
        assert!(check_same_context(&ContextTag::Main, [&value, &HostValue::Buffer(vec![1])]).is_ok());
    }
}
