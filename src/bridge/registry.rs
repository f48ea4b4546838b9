//! Handle registry and process tables.
//!
//! `BridgeState` owns the reference table (live foreign handles), the context
//! table and the identity map that deduplicates both. Every structural
//! mutation happens under one table mutex, which is never held while embedded
//! code may run (repr, decref).

use super::context::{ContextHandle, ContextRecord, ContextTag};
use super::error::BridgeError;
use super::interpreter;
use parking_lot::Mutex;
use pyo3::ffi;
use pyo3::prelude::*;
use std::collections::HashMap;
use std::ffi::CStr;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{trace, warn};

/// Longest display text kept on a handle.
const MAX_DISPLAY_CHARS: usize = 512;

/// One retain held on behalf of the host.
///
/// Construction takes exactly one reference; [`ForeignRef::release`] gives it
/// back exactly once. A token dropped while still live is leaked rather than
/// released, since dropping may happen outside the owning context.
pub(crate) struct ForeignRef {
    object: Mutex<Option<Py<PyAny>>>,
}

impl ForeignRef {
    pub(crate) fn retain(object: &Bound<'_, PyAny>) -> Self {
        Self {
            object: Mutex::new(Some(object.clone().unbind())),
        }
    }

    pub(crate) fn bind<'py>(&self, py: Python<'py>) -> Option<Bound<'py, PyAny>> {
        self.object
            .lock()
            .as_ref()
            .map(|object| object.bind(py).clone())
    }

    /// Drop the retain. Returns false if it was already released.
    ///
    /// Must run inside the context that owns the object.
    pub(crate) fn release(&self, py: Python<'_>) -> bool {
        let taken = self.object.lock().take();
        match taken {
            Some(object) => {
                object.drop_ref(py);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_live(&self) -> bool {
        self.object.lock().is_some()
    }
}

impl Drop for ForeignRef {
    fn drop(&mut self) {
        if let Some(object) = self.object.get_mut().take() {
            if interpreter::is_running() {
                warn!(
                    object = ?object.as_ptr(),
                    "foreign reference dropped without release; leaking it"
                );
            }
            std::mem::forget(object);
        }
    }
}

pub(crate) struct HandleRecord {
    identity: String,
    context_tag: ContextTag,
    display_text: Option<String>,
    type_name: String,
    created_at: SystemTime,
    slot_index: usize,
    token: ForeignRef,
}

/// Host-visible proxy for an embedded object.
///
/// Cloning is cheap and yields the same handle; at most one live handle exists
/// per embedded object identity within a bridge.
#[derive(Clone)]
pub struct ForeignHandle(Arc<HandleRecord>);

impl ForeignHandle {
    /// Memory identity of the embedded object, as a decimal string.
    pub fn identity(&self) -> &str {
        &self.0.identity
    }

    pub fn context_tag(&self) -> &ContextTag {
        &self.0.context_tag
    }

    /// `repr()` of the object at acquisition time, if it could be computed.
    pub fn display_text(&self) -> Option<&str> {
        self.0.display_text.as_deref()
    }

    pub fn type_name(&self) -> &str {
        &self.0.type_name
    }

    pub fn created_at(&self) -> SystemTime {
        self.0.created_at
    }

    pub fn slot_index(&self) -> usize {
        self.0.slot_index
    }

    /// Whether both values are the same registry entry.
    pub fn ptr_eq(&self, other: &ForeignHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn token(&self) -> &ForeignRef {
        &self.0.token
    }
}

impl PartialEq for ForeignHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for ForeignHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignHandle")
            .field("identity", &self.0.identity)
            .field("type_name", &self.0.type_name)
            .field("context", &self.0.context_tag)
            .field("slot_index", &self.0.slot_index)
            .field("display_text", &self.0.display_text)
            .finish()
    }
}

#[derive(Clone)]
enum Proxy {
    Handle(ForeignHandle),
    Context(ContextHandle),
}

#[derive(Default)]
struct Tables {
    references: Vec<Option<ForeignHandle>>,
    contexts: Vec<Option<ContextHandle>>,
    objects: HashMap<String, Proxy>,
}

impl Tables {
    fn tracks_handle(&self, handle: &ForeignHandle) -> bool {
        matches!(
            self.references.get(handle.slot_index()),
            Some(Some(current)) if current.ptr_eq(handle)
        )
    }

    fn tracks_context(&self, context: &ContextHandle) -> bool {
        matches!(
            self.contexts.get(context.slot_index()),
            Some(Some(current)) if current.ptr_eq(context)
        )
    }

    fn forget_handle(&mut self, handle: &ForeignHandle) {
        self.references[handle.slot_index()] = None;
        if matches!(
            self.objects.get(handle.identity()),
            Some(Proxy::Handle(current)) if current.ptr_eq(handle)
        ) {
            self.objects.remove(handle.identity());
        }
    }
}

/// Reference, context and identity tables for one bridge.
#[derive(Default)]
pub(crate) struct BridgeState {
    tables: Mutex<Tables>,
}

impl BridgeState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Return the handle for `object`, creating it on first sight.
    ///
    /// A new handle holds one extra retain; an existing one is returned as-is.
    pub(crate) fn acquire(
        &self,
        py: Python<'_>,
        object: &Bound<'_, PyAny>,
        tag: &ContextTag,
    ) -> ForeignHandle {
        let identity = identity_of(object);
        if let Some(existing) = self.lookup(&identity) {
            return existing;
        }

        // Runs embedded code, so the table lock must not be held yet.
        let display_text = display_text_of(object);
        let type_name = type_name_of(object);
        let token = ForeignRef::retain(object);

        let mut tables = self.tables.lock();
        if let Some(Proxy::Handle(existing)) = tables.objects.get(&identity) {
            let existing = existing.clone();
            drop(tables);
            token.release(py);
            return existing;
        }

        let slot_index = tables.references.len();
        let handle = ForeignHandle(Arc::new(HandleRecord {
            identity: identity.clone(),
            context_tag: tag.clone(),
            display_text,
            type_name,
            created_at: SystemTime::now(),
            slot_index,
            token,
        }));
        tables.references.push(Some(handle.clone()));
        tables.objects.insert(identity, Proxy::Handle(handle.clone()));
        trace!(slot_index, type_name = handle.type_name(), context = %tag, "registered foreign handle");
        handle
    }

    pub(crate) fn lookup(&self, identity: &str) -> Option<ForeignHandle> {
        match self.tables.lock().objects.get(identity) {
            Some(Proxy::Handle(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Live embedded object behind `handle`, or `HandleRecycled`.
    pub(crate) fn resolve<'py>(
        &self,
        py: Python<'py>,
        handle: &ForeignHandle,
    ) -> Result<Bound<'py, PyAny>, BridgeError> {
        let tables = self.tables.lock();
        if !tables.tracks_handle(handle) {
            return Err(BridgeError::recycled(handle.identity()));
        }
        handle
            .token()
            .bind(py)
            .ok_or_else(|| BridgeError::recycled(handle.identity()))
    }

    pub(crate) fn is_live(&self, handle: &ForeignHandle) -> bool {
        self.tables.lock().tracks_handle(handle) && handle.token().is_live()
    }

    /// Release `handle` if the table still holds it. Stale or foreign handles
    /// report `false` and touch nothing.
    pub(crate) fn release(&self, py: Python<'_>, handle: &ForeignHandle) -> bool {
        {
            let mut tables = self.tables.lock();
            if !tables.tracks_handle(handle) {
                return false;
            }
            tables.forget_handle(handle);
        }
        handle.token().release(py)
    }

    /// Remove every handle tagged with `tag` from the tables.
    ///
    /// The caller releases the returned tokens inside the matching context.
    pub(crate) fn detach_tagged(&self, tag: &ContextTag) -> Vec<ForeignHandle> {
        let mut tables = self.tables.lock();
        let doomed: Vec<ForeignHandle> = tables
            .references
            .iter()
            .flatten()
            .filter(|handle| handle.context_tag() == tag)
            .cloned()
            .collect();
        for handle in &doomed {
            tables.forget_handle(handle);
        }
        doomed
    }

    pub(crate) fn register_context(
        &self,
        build: impl FnOnce(usize) -> ContextRecord,
    ) -> ContextHandle {
        let mut tables = self.tables.lock();
        let slot_index = tables.contexts.len();
        let context = ContextHandle::from_record(build(slot_index));
        tables.contexts.push(Some(context.clone()));
        tables
            .objects
            .insert(context.id().to_string(), Proxy::Context(context.clone()));
        context
    }

    pub(crate) fn unregister_context(&self, context: &ContextHandle) -> bool {
        let mut tables = self.tables.lock();
        if !tables.tracks_context(context) {
            return false;
        }
        tables.contexts[context.slot_index()] = None;
        if matches!(
            tables.objects.get(context.id()),
            Some(Proxy::Context(current)) if current.ptr_eq(context)
        ) {
            tables.objects.remove(context.id());
        }
        true
    }

    pub(crate) fn tracks_context(&self, context: &ContextHandle) -> bool {
        self.tables.lock().tracks_context(context)
    }

    pub(crate) fn contexts(&self) -> Vec<ContextHandle> {
        self.tables
            .lock()
            .contexts
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub(crate) fn handle_count(&self) -> usize {
        self.tables.lock().references.iter().flatten().count()
    }

    pub(crate) fn context_count(&self) -> usize {
        self.tables.lock().contexts.iter().flatten().count()
    }
}

pub(crate) fn identity_of(object: &Bound<'_, PyAny>) -> String {
    (object.as_ptr() as usize).to_string()
}

fn type_name_of(object: &Bound<'_, PyAny>) -> String {
    // SAFETY: `object` is alive for the borrow, so its type and `tp_name` are too.
    let name = unsafe { CStr::from_ptr((*ffi::Py_TYPE(object.as_ptr())).tp_name) };
    name.to_string_lossy().into_owned()
}

fn display_text_of(object: &Bound<'_, PyAny>) -> Option<String> {
    let repr = object.repr().ok()?;
    let text = repr.to_string_lossy();
    if text.chars().count() <= MAX_DISPLAY_CHARS {
        return Some(text.into_owned());
    }
    let mut truncated: String = text.chars().take(MAX_DISPLAY_CHARS).collect();
    truncated.push_str("...");
    Some(truncated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::testing::start_runtime;
    use pyo3::types::PyList;

    #[test]
    fn test_acquire_deduplicates_by_identity() {
        start_runtime();
        let state = BridgeState::new();

        Python::attach(|py| {
            let list = PyList::new(py, [1, 2, 3]).expect("list").into_any();
            let before = list.get_refcnt();

            let first = state.acquire(py, &list, &ContextTag::Main);
            let second = state.acquire(py, &list, &ContextTag::Main);

            assert!(first.ptr_eq(&second));
            assert_eq!(first.identity(), second.identity());
            assert_eq!(list.get_refcnt(), before + 1);
            assert_eq!(first.type_name(), "list");
            assert_eq!(first.display_text(), Some("[1, 2, 3]"));
            assert_eq!(state.handle_count(), 1);

            assert!(state.release(py, &first));
            assert_eq!(list.get_refcnt(), before);
        });
    }

    #[test]
    fn test_release_is_idempotent() {
        start_runtime();
        let state = BridgeState::new();

        Python::attach(|py| {
            let list = PyList::empty(py).into_any();
            let before = list.get_refcnt();
            let handle = state.acquire(py, &list, &ContextTag::Main);

            assert!(state.release(py, &handle));
            assert!(!state.release(py, &handle));
            assert_eq!(list.get_refcnt(), before);

            let err = state.resolve(py, &handle).expect_err("released handle");
            assert!(matches!(err, BridgeError::HandleRecycled { .. }));
        });
    }

    #[test]
    fn test_handles_from_other_states_do_not_resolve() {
        start_runtime();
        let ours = BridgeState::new();
        let theirs = BridgeState::new();

        Python::attach(|py| {
            let list = PyList::empty(py).into_any();
            let foreign = theirs.acquire(py, &list, &ContextTag::Main);
            let local = ours.acquire(py, &list, &ContextTag::Main);

            assert!(!foreign.ptr_eq(&local));
            assert!(!ours.release(py, &foreign));
            assert!(ours.resolve(py, &local).is_ok());

            assert!(ours.release(py, &local));
            assert!(theirs.release(py, &foreign));
        });
    }

    #[test]
    fn test_detach_tagged_only_takes_matching_context() {
        start_runtime();
        let state = BridgeState::new();
        let other = ContextTag::Isolated(Arc::from("42"));

        Python::attach(|py| {
            let main_list = PyList::empty(py).into_any();
            let other_list = PyList::empty(py).into_any();
            let kept = state.acquire(py, &main_list, &ContextTag::Main);
            let _moved = state.acquire(py, &other_list, &other);

            let detached = state.detach_tagged(&other);
            assert_eq!(detached.len(), 1);
            assert_eq!(state.handle_count(), 1);
            assert!(state.is_live(&kept));
            assert!(state.lookup(detached[0].identity()).is_none());

            for handle in &detached {
                assert!(handle.token().release(py));
            }
            assert!(state.release(py, &kept));
        });
    }
}
