//! Call and exec pipeline.
//!
//! Every operation follows the same order: validate arguments, reject
//! cross-context mixing, acquire the target context, marshal, run, marshal
//! the result (or capture the raised exception) and release. Asynchronous
//! variants do the validation and argument marshaling on the calling thread
//! and hand the rest to the worker pool.

use super::context::{check_same_context, ensure_handle_context, ContextHandle};
use super::conversion::Marshaler;
use super::error::{capture_exception, BridgeError};
use super::host_value::{HostObject, HostValue};
use super::interpreter;
use super::lock::{with_context, ExecutionTarget};
use super::registry::ForeignHandle;
use super::worker::PendingCall;
use super::Bridge;
use pyo3::ffi;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyTuple};
use std::ffi::CString;
use std::os::raw::c_int;
use std::sync::Arc;
use tracing::debug;

const ACQUIRE_TITLE: &str = "pybridge.acquire_foreign failed";
const INVOKE_TITLE: &str = "pybridge.invoke failed";
const MEMBERS_TITLE: &str = "pybridge.list_members failed";
const RELOAD_TITLE: &str = "pybridge.reload_module failed";

/// Names hidden from [`Bridge::list_members`].
const HIDDEN_MEMBERS: [&str; 3] = ["__builtins__", "__loader__", "__spec__"];

/// How [`Bridge::run_source`] compiles its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    /// A module body; evaluates to null
    Statements,
    /// A single expression; evaluates to its value
    Expression,
}

impl SourceMode {
    pub(crate) fn start_token(self) -> c_int {
        match self {
            SourceMode::Statements => ffi::Py_file_input,
            SourceMode::Expression => ffi::Py_eval_input,
        }
    }

    fn title(self) -> &'static str {
        match self {
            SourceMode::Statements => "pybridge.exec failed",
            SourceMode::Expression => "pybridge.eval failed",
        }
    }
}

/// What [`Bridge::acquire_foreign`] should look up.
#[derive(Debug, Clone, Copy)]
pub enum ForeignTarget<'a> {
    /// Import a module by dotted name
    Module(&'a str),
    /// An attribute of an object already held by handle
    Member(&'a ForeignHandle, &'a str),
}

/// One entry of [`Bridge::list_members`].
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub name: String,
    pub is_callable: bool,
    /// Marshaled value for non-callable members, null otherwise.
    pub value: HostValue,
}

fn validate_name(what: &str, name: &str) -> Result<(), BridgeError> {
    if name.is_empty() {
        return Err(BridgeError::ArgumentType(format!("`{what}` must not be empty")));
    }
    if name.contains('\0') {
        return Err(BridgeError::ArgumentType(format!(
            "`{what}` must not contain NUL bytes"
        )));
    }
    Ok(())
}

fn source_text(code: &str) -> Result<CString, BridgeError> {
    CString::new(code)
        .map_err(|_| BridgeError::ArgumentType("`code` must not contain NUL bytes".to_string()))
}

fn keyword_arguments(kwargs: Option<&HostValue>) -> Result<Option<&HostObject>, BridgeError> {
    match kwargs {
        None => Ok(None),
        Some(value) if value.is_nullish() => Ok(None),
        Some(HostValue::Object(object)) => Ok(Some(object)),
        Some(other) => Err(BridgeError::ArgumentType(format!(
            "`kwargs` must be an object, got {}",
            other.kind()
        ))),
    }
}

fn namespace<'py>(
    py: Python<'py>,
    target: &ExecutionTarget,
) -> Result<Bound<'py, PyDict>, BridgeError> {
    match target {
        ExecutionTarget::Main => py
            .import("__main__")
            .map(|main| main.dict())
            .map_err(|err| capture_exception(py, err, "unable to import `__main__`")),
        ExecutionTarget::Isolated(lease) => lease.record().namespace(py).ok_or_else(|| {
            BridgeError::InvalidContext(format!(
                "context {} has no namespace",
                lease.record().id()
            ))
        }),
    }
}

fn reload_or_import<'py>(py: Python<'py>, name: &str) -> PyResult<Bound<'py, PyAny>> {
    let modules = py.import("sys")?.getattr("modules")?;
    match modules.get_item(name) {
        Ok(module) => py.import("importlib")?.call_method1("reload", (module,)),
        Err(_) => Ok(py.import(name)?.into_any()),
    }
}

/// Callee and arguments marshaled on the calling thread, waiting for a worker.
struct PreparedCall {
    target: ExecutionTarget,
    callable: Py<PyAny>,
    args: Py<PyTuple>,
    kwargs: Option<Py<PyDict>>,
}

impl Bridge {
    /// Resolve an execution target, leasing isolated contexts.
    pub(crate) fn target(
        &self,
        context: Option<&ContextHandle>,
    ) -> Result<ExecutionTarget, BridgeError> {
        let Some(context) = context else {
            return Ok(ExecutionTarget::Main);
        };
        if !self.state.tracks_context(context) {
            return Err(BridgeError::InvalidContext(format!(
                "context {} is not tracked by this bridge",
                context.id()
            )));
        }
        Ok(ExecutionTarget::Isolated(context.lease()?))
    }

    /// Import a module or look up an attribute, always returning a handle.
    pub fn acquire_foreign(
        &self,
        what: ForeignTarget<'_>,
        context: Option<&ContextHandle>,
    ) -> Result<ForeignHandle, BridgeError> {
        match what {
            ForeignTarget::Module(name) => validate_name("module", name)?,
            ForeignTarget::Member(_, name) => validate_name("member", name)?,
        }
        let target = self.target(context)?;
        let tag = target.tag();
        if let ForeignTarget::Member(handle, _) = what {
            ensure_handle_context(&tag, handle)?;
        }
        self.ensure_initialized()?;

        debug!(context = %tag, ?what, "acquiring foreign object");
        with_context(&target, |py| {
            let object = match what {
                ForeignTarget::Module(name) => py
                    .import(name)
                    .map(Bound::into_any)
                    .map_err(|err| capture_exception(py, err, ACQUIRE_TITLE))?,
                ForeignTarget::Member(handle, name) => self
                    .state
                    .resolve(py, handle)?
                    .getattr(name)
                    .map_err(|err| capture_exception(py, err, ACQUIRE_TITLE))?,
            };
            Ok(self.state.acquire(py, &object, &tag))
        })
    }

    /// Re-execute an already imported module (importing it if needed).
    pub fn reload_module(
        &self,
        name: &str,
        context: Option<&ContextHandle>,
    ) -> Result<ForeignHandle, BridgeError> {
        validate_name("module", name)?;
        let target = self.target(context)?;
        let tag = target.tag();
        self.ensure_initialized()?;

        debug!(context = %tag, module = name, "reloading module");
        with_context(&target, |py| {
            let module = reload_or_import(py, name)
                .map_err(|err| capture_exception(py, err, RELOAD_TITLE))?;
            Ok(self.state.acquire(py, &module, &tag))
        })
    }

    /// Call `member` on the object behind `handle`.
    pub fn invoke(
        &self,
        handle: &ForeignHandle,
        member: &str,
        args: &[HostValue],
        kwargs: Option<&HostValue>,
        context: Option<&ContextHandle>,
    ) -> Result<HostValue, BridgeError> {
        validate_name("member", member)?;
        let kwargs = keyword_arguments(kwargs)?;
        let target = self.target(context)?;
        let tag = target.tag();
        self.check_call(&target, handle, args, kwargs)?;
        self.ensure_initialized()?;

        debug!(context = %tag, member, "invoking foreign member");
        let marshaler = Marshaler::new(&self.state, &tag, self.config.max_depth);
        with_context(&target, |py| {
            let (callable, args, kwargs) =
                self.marshal_call(py, &marshaler, handle, member, args, kwargs)?;
            let result = callable
                .call(args, kwargs.as_ref())
                .map_err(|err| capture_exception(py, err, INVOKE_TITLE))?;
            Ok(marshaler.to_host(py, &result))
        })
    }

    /// Asynchronous [`Bridge::invoke`]. Never fails directly: validation errors
    /// and raised exceptions complete the call with a failure payload.
    pub fn invoke_async(
        &self,
        handle: &ForeignHandle,
        member: &str,
        args: &[HostValue],
        kwargs: Option<&HostValue>,
        context: Option<&ContextHandle>,
    ) -> PendingCall {
        let prepared = match self.prepare_call(handle, member, args, kwargs, context) {
            Ok(prepared) => prepared,
            Err(err) => return PendingCall::ready(HostValue::failure(err.to_string())),
        };

        let state = Arc::clone(&self.state);
        let max_depth = self.config.max_depth;
        self.workers.submit(move || {
            let PreparedCall {
                target,
                callable,
                args,
                kwargs,
            } = prepared;
            let tag = target.tag();
            let marshaler = Marshaler::new(&state, &tag, max_depth);
            let outcome = with_context(&target, move |py| {
                let result = callable
                    .bind(py)
                    .call(args.bind(py), kwargs.as_ref().map(|kwargs| kwargs.bind(py)))
                    .map_err(|err| capture_exception(py, err, INVOKE_TITLE))?;
                Ok(marshaler.to_host(py, &result))
            });
            outcome.unwrap_or_else(|err| HostValue::failure(err.to_string()))
        })
    }

    fn prepare_call(
        &self,
        handle: &ForeignHandle,
        member: &str,
        args: &[HostValue],
        kwargs: Option<&HostValue>,
        context: Option<&ContextHandle>,
    ) -> Result<PreparedCall, BridgeError> {
        validate_name("member", member)?;
        let kwargs = keyword_arguments(kwargs)?;
        let target = self.target(context)?;
        let tag = target.tag();
        self.check_call(&target, handle, args, kwargs)?;
        self.ensure_initialized()?;

        debug!(context = %tag, member, "queueing foreign call");
        let marshaler = Marshaler::new(&self.state, &tag, self.config.max_depth);
        let (callable, args, kwargs) = with_context(&target, |py| {
            let (callable, args, kwargs) =
                self.marshal_call(py, &marshaler, handle, member, args, kwargs)?;
            Ok((callable.unbind(), args.unbind(), kwargs.map(Bound::unbind)))
        })?;
        Ok(PreparedCall {
            target,
            callable,
            args,
            kwargs,
        })
    }

    fn check_call(
        &self,
        target: &ExecutionTarget,
        handle: &ForeignHandle,
        args: &[HostValue],
        kwargs: Option<&HostObject>,
    ) -> Result<(), BridgeError> {
        let tag = target.tag();
        ensure_handle_context(&tag, handle)?;
        check_same_context(&tag, args)?;
        if let Some(kwargs) = kwargs {
            check_same_context(&tag, [&HostValue::Object(kwargs.clone())])?;
        }
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn marshal_call<'py>(
        &self,
        py: Python<'py>,
        marshaler: &Marshaler<'_>,
        handle: &ForeignHandle,
        member: &str,
        args: &[HostValue],
        kwargs: Option<&HostObject>,
    ) -> Result<
        (
            Bound<'py, PyAny>,
            Bound<'py, PyTuple>,
            Option<Bound<'py, PyDict>>,
        ),
        BridgeError,
    > {
        let receiver = self.state.resolve(py, handle)?;
        let callable = receiver
            .getattr(member)
            .map_err(|err| capture_exception(py, err, INVOKE_TITLE))?;
        let args = marshaler
            .args_to_foreign(py, args)
            .map_err(|err| capture_exception(py, err, INVOKE_TITLE))?;
        let kwargs = kwargs
            .map(|kwargs| marshaler.object_to_foreign(py, kwargs))
            .transpose()
            .map_err(|err| capture_exception(py, err, INVOKE_TITLE))?;
        Ok((callable, args, kwargs))
    }

    /// Introspect the attributes of the object behind `handle`.
    pub fn list_members(
        &self,
        handle: &ForeignHandle,
        context: Option<&ContextHandle>,
    ) -> Result<Vec<Member>, BridgeError> {
        let target = self.target(context)?;
        let tag = target.tag();
        ensure_handle_context(&tag, handle)?;
        self.ensure_initialized()?;

        let marshaler = Marshaler::new(&self.state, &tag, self.config.max_depth);
        with_context(&target, |py| {
            let object = self.state.resolve(py, handle)?;
            let names = object
                .dir()
                .map_err(|err| capture_exception(py, err, MEMBERS_TITLE))?;

            let mut members = Vec::with_capacity(names.len());
            for name in names.iter() {
                let Ok(name) = name.extract::<String>() else {
                    continue;
                };
                if HIDDEN_MEMBERS.contains(&name.as_str()) {
                    continue;
                }
                let member = match object.getattr(name.as_str()) {
                    Ok(value) if value.is_callable() => Member {
                        name,
                        is_callable: true,
                        value: HostValue::Null,
                    },
                    Ok(value) => Member {
                        value: marshaler.to_host(py, &value),
                        is_callable: false,
                        name,
                    },
                    // Attribute access itself raised (e.g. a failing property).
                    Err(_) => Member {
                        name,
                        is_callable: false,
                        value: HostValue::Null,
                    },
                };
                members.push(member);
            }
            Ok(members)
        })
    }

    /// Run source in the context's `__main__` namespace.
    pub fn run_source(
        &self,
        code: &str,
        mode: SourceMode,
        context: Option<&ContextHandle>,
    ) -> Result<HostValue, BridgeError> {
        let source = source_text(code)?;
        let target = self.target(context)?;
        let tag = target.tag();
        self.ensure_initialized()?;

        debug!(context = %tag, ?mode, "running source");
        let marshaler = Marshaler::new(&self.state, &tag, self.config.max_depth);
        with_context(&target, |py| {
            let namespace = namespace(py, &target)?;
            let value = interpreter::evaluate(py, &source, mode, &namespace)
                .map_err(|err| capture_exception(py, err, mode.title()))?;
            Ok(marshaler.to_host(py, &value))
        })
    }

    /// Asynchronous [`Bridge::run_source`]; failures complete the call with a
    /// failure payload.
    pub fn run_source_async(
        &self,
        code: &str,
        mode: SourceMode,
        context: Option<&ContextHandle>,
    ) -> PendingCall {
        let prepared = source_text(code).and_then(|source| {
            let target = self.target(context)?;
            self.ensure_initialized()?;
            Ok((source, target))
        });
        let (source, target) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => return PendingCall::ready(HostValue::failure(err.to_string())),
        };

        debug!(context = %target.tag(), ?mode, "queueing source");
        let state = Arc::clone(&self.state);
        let max_depth = self.config.max_depth;
        self.workers.submit(move || {
            let tag = target.tag();
            let marshaler = Marshaler::new(&state, &tag, max_depth);
            let outcome = with_context(&target, |py| {
                let namespace = namespace(py, &target)?;
                let value = interpreter::evaluate(py, &source, mode, &namespace)
                    .map_err(|err| capture_exception(py, err, mode.title()))?;
                Ok(marshaler.to_host(py, &value))
            });
            outcome.unwrap_or_else(|err| HostValue::failure(err.to_string()))
        })
    }

    /// Drop the host's retain on the object behind `handle`.
    ///
    /// Returns false (without touching anything) for handles that are already
    /// released or were never issued by this bridge.
    pub fn release_foreign(
        &self,
        handle: &ForeignHandle,
        context: Option<&ContextHandle>,
    ) -> Result<bool, BridgeError> {
        let target = self.target(context)?;
        ensure_handle_context(&target.tag(), handle)?;
        if !self.state.is_live(handle) {
            return Ok(false);
        }
        with_context(&target, |py| Ok(self.state.release(py, handle)))
    }

    /// Release every handle belonging to `context`. Returns how many were released.
    pub fn clear(&self, context: Option<&ContextHandle>) -> Result<usize, BridgeError> {
        let target = self.target(context)?;
        if !interpreter::is_running() {
            return Ok(0);
        }
        let tag = target.tag();
        with_context(&target, |py| {
            let released = self
                .state
                .detach_tagged(&tag)
                .iter()
                .filter(|handle| handle.token().release(py))
                .count();
            debug!(context = %tag, released, "cleared foreign handles");
            Ok(released)
        })
    }

    /// Check that `handle` still refers to a live object.
    pub fn resolve(&self, handle: &ForeignHandle) -> Result<ForeignHandle, BridgeError> {
        if self.state.is_live(handle) {
            Ok(handle.clone())
        } else {
            Err(BridgeError::recycled(handle.identity()))
        }
    }
}
