//! Process-wide embedded runtime lifecycle.
//!
//! CPython exists at most once per process, so startup and finalization are
//! tracked here rather than per [`Bridge`](super::Bridge). The lifecycle mutex
//! also serializes sub-interpreter creation and teardown.

use super::config::BridgeConfig;
use super::error::{capture_exception, BridgeError};
use super::pipeline::SourceMode;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use pyo3::ffi;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList};
use std::ffi::CStr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RuntimePhase {
    Uninitialized,
    Running,
    Finalized,
}

static LIFECYCLE: Lazy<Mutex<RuntimePhase>> =
    Lazy::new(|| Mutex::new(RuntimePhase::Uninitialized));

/// Fast-path mirror of `RuntimePhase::Running`.
static RUNNING: AtomicBool = AtomicBool::new(false);

/// Whether this crate started the interpreter (and so must finalize it).
static OWNS_RUNTIME: AtomicBool = AtomicBool::new(false);

/// Held shared by every execution-lock acquisition and exclusively by shutdown.
static GATE: Lazy<RwLock<()>> = Lazy::new(|| RwLock::new(()));

/// Check if the embedded runtime is initialized and not yet shut down.
pub fn is_running() -> bool {
    RUNNING.load(Ordering::Acquire)
}

/// Hold the lifecycle mutex. Lock order: lifecycle, shutdown gate, execution lock, tables.
pub(crate) fn lifecycle() -> MutexGuard<'static, RuntimePhase> {
    LIFECYCLE.lock()
}

/// Keeps the runtime from being finalized while embedded work is in flight.
pub(crate) struct RunningGuard {
    _shared: RwLockReadGuard<'static, ()>,
}

/// Enter the running runtime, or fail with `Lifecycle` once shutdown has begun.
pub(crate) fn enter() -> Result<RunningGuard, BridgeError> {
    let shared = GATE.read();
    if !is_running() {
        return Err(BridgeError::Lifecycle(
            "embedded runtime is not running".to_string(),
        ));
    }
    Ok(RunningGuard { _shared: shared })
}

/// Start the embedded runtime and bootstrap its main context.
///
/// Safe to call multiple times; returns true only for the call that started
/// and bootstrapped the runtime. Fails once the runtime has been shut down,
/// since it cannot be restarted in-process.
pub(crate) fn initialize(config: &BridgeConfig) -> Result<bool, BridgeError> {
    if is_running() {
        return Ok(false);
    }

    let mut phase = LIFECYCLE.lock();
    match *phase {
        RuntimePhase::Running => return Ok(false),
        RuntimePhase::Finalized => {
            return Err(BridgeError::Lifecycle(
                "the embedded runtime has been shut down and cannot be restarted".to_string(),
            ))
        }
        RuntimePhase::Uninitialized => {}
    }

    // SAFETY: Py_IsInitialized may be called at any time; the lifecycle mutex
    // keeps other bridges from starting the runtime concurrently.
    if unsafe { ffi::Py_IsInitialized() } == 0 {
        // SAFETY: the runtime is not running. The initial thread state is detached
        // right away so any thread can take the execution lock afterwards.
        unsafe {
            ffi::Py_InitializeEx(0);
            ffi::PyEval_SaveThread();
        }
        OWNS_RUNTIME.store(true, Ordering::Release);
        debug!("embedded runtime started");
    }

    Python::attach(|py| bootstrap(py, config).map(drop))
        .map_err(|err| BridgeError::Lifecycle(format!("main context bootstrap failed: {err}")))?;

    *phase = RuntimePhase::Running;
    RUNNING.store(true, Ordering::Release);
    Ok(true)
}

/// Finalize the embedded runtime.
///
/// Repeated calls are harmless and never finalize twice. A runtime that was
/// already running before this crate touched it is left to its owner.
/// Returns false if the runtime was not running.
pub(crate) fn shutdown() -> Result<bool, BridgeError> {
    let mut phase = LIFECYCLE.lock();
    if *phase != RuntimePhase::Running {
        return Ok(false);
    }

    // Waits for in-flight acquisitions; later ones see the runtime stopped.
    let _exclusive = GATE.write();
    RUNNING.store(false, Ordering::Release);
    *phase = RuntimePhase::Finalized;

    if !OWNS_RUNTIME.load(Ordering::Acquire) {
        debug!("embedded runtime left running for its owner");
        return Ok(true);
    }

    // SAFETY: the runtime is running and the phase change above stops every bridge
    // entry point from touching it again. Finalization needs a main-interpreter
    // thread state, which PyGILState_Ensure provides for this thread.
    let status = unsafe {
        let _state = ffi::PyGILState_Ensure();
        ffi::Py_FinalizeEx()
    };
    if status < 0 {
        return Err(BridgeError::Lifecycle(
            "the embedded runtime reported errors while finalizing".to_string(),
        ));
    }

    debug!("embedded runtime finalized");
    Ok(true)
}

/// Standard environment bootstrap for a fresh context.
///
/// Runs in whichever interpreter is current and returns its `__main__` namespace.
pub(crate) fn bootstrap<'py>(
    py: Python<'py>,
    config: &BridgeConfig,
) -> Result<Bound<'py, PyDict>, BridgeError> {
    let sys = py
        .import("sys")
        .map_err(|err| capture_exception(py, err, "unable to import `sys`"))?;
    let os = py.import("os").map_err(|err| {
        capture_exception(
            py,
            err,
            "unable to import `os`; check the embedded runtime search paths",
        )
    })?;

    extend_search_path(py, &config.search_paths)?;

    let namespace = py
        .import("__main__")
        .map(|main| main.dict())
        .map_err(|err| capture_exception(py, err, "unable to import `__main__`"))?;
    namespace
        .set_item("sys", &sys)
        .and_then(|_| namespace.set_item("os", &os))
        .map_err(|err| capture_exception(py, err, "unable to populate `__main__`"))?;

    if let Some(script) = &config.bootstrap_script {
        let source = std::ffi::CString::new(script.as_str()).map_err(|_| {
            BridgeError::ArgumentType("bootstrap script must not contain NUL bytes".to_string())
        })?;
        evaluate(py, &source, SourceMode::Statements, &namespace)
            .map_err(|err| capture_exception(py, err, "bootstrap script failed"))?;
    }

    Ok(namespace)
}

/// Prepend `dirs` to the current interpreter's `sys.path`, skipping ones already present.
pub(crate) fn extend_search_path(py: Python<'_>, dirs: &[PathBuf]) -> Result<(), BridgeError> {
    let search_path = py
        .import("sys")
        .and_then(|sys| sys.getattr("path"))
        .and_then(|path| Ok(path.cast_into::<PyList>()?))
        .map_err(|err| capture_exception(py, err, "unable to read `sys.path`"))?;
    for dir in dirs.iter().rev() {
        let dir = dir.to_string_lossy();
        let present = search_path
            .contains(dir.as_ref())
            .map_err(|err| capture_exception(py, err, "unable to update `sys.path`"))?;
        if !present {
            search_path
                .insert(0, dir.as_ref())
                .map_err(|err| capture_exception(py, err, "unable to update `sys.path`"))?;
        }
    }
    Ok(())
}

/// Compile and run `source` with `namespace` as both globals and locals.
pub(crate) fn evaluate<'py>(
    py: Python<'py>,
    source: &CStr,
    mode: SourceMode,
    namespace: &Bound<'py, PyDict>,
) -> PyResult<Bound<'py, PyAny>> {
    // SAFETY: the execution lock is held by the caller (`py`) and both strings are
    // NUL-terminated for the duration of the call.
    let code = unsafe {
        Bound::from_owned_ptr_or_err(
            py,
            ffi::Py_CompileString(source.as_ptr(), c"<pybridge>".as_ptr(), mode.start_token()),
        )
    }?;
    // SAFETY: `code` is a freshly compiled code object and `namespace` a live dict.
    unsafe {
        Bound::from_owned_ptr_or_err(
            py,
            ffi::PyEval_EvalCode(code.as_ptr(), namespace.as_ptr(), namespace.as_ptr()),
        )
    }
}
