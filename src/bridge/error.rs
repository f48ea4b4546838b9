//! Error kinds surfaced by bridge operations.

use pyo3::prelude::*;
use pyo3::types::PyString;
use thiserror::Error;

/// Errors returned by every fallible bridge operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// Malformed or wrongly-typed operation arguments. Raised before any embedded work.
    #[error("invalid argument: {0}")]
    ArgumentType(String),

    /// A handle, context or argument belongs to a different context than the target.
    #[error("cannot use objects from a different context: {0}")]
    CrossContext(String),

    /// The handle no longer resolves to a live embedded object.
    #[error("foreign object {identity} has been recycled")]
    HandleRecycled { identity: String },

    /// The embedded runtime raised. Carries the operation title and the formatted traceback.
    #[error("{0}")]
    Embedded(String),

    /// The embedded runtime refused to allocate or bootstrap a new context.
    #[error("failed to create execution context: {0}")]
    ContextCreation(String),

    /// The context is not live or not tracked by this bridge.
    #[error("invalid execution context: {0}")]
    InvalidContext(String),

    /// Misuse of the process-wide runtime lifecycle or of the execution lock.
    #[error("embedded runtime lifecycle error: {0}")]
    Lifecycle(String),
}

impl BridgeError {
    pub(crate) fn recycled(identity: impl Into<String>) -> Self {
        BridgeError::HandleRecycled {
            identity: identity.into(),
        }
    }
}

/// Turn a raised embedded exception into [`BridgeError::Embedded`].
///
/// Must run while the raising context is still held so the exception objects are
/// released inside it.
pub(crate) fn capture_exception(py: Python<'_>, err: PyErr, title: &str) -> BridgeError {
    let details = format_exception(py, &err).unwrap_or_else(|_| err.to_string());
    BridgeError::Embedded(format!("{title}\n{details}"))
}

fn format_exception(py: Python<'_>, err: &PyErr) -> PyResult<String> {
    let traceback = py.import("traceback")?;
    let lines = traceback.call_method1(
        "format_exception",
        (err.get_type(py), err.value(py), err.traceback(py)),
    )?;
    let text: String = PyString::new(py, "")
        .call_method1("join", (lines,))?
        .extract()?;
    Ok(text.trim_end().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = BridgeError::recycled("140234");
        assert_eq!(err.to_string(), "foreign object 140234 has been recycled");

        let err = BridgeError::ArgumentType("`code` must not contain NUL bytes".into());
        assert!(err.to_string().starts_with("invalid argument:"));
    }
}
