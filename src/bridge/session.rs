//! Host-facing convenience wrapper over [`Bridge`].
//!
//! A [`Session`] pins every operation to one context: a private isolated
//! context, or the shared main context. Closing a main-context session
//! releases every main-context handle of the bridge, including ones acquired
//! through other main-context sessions.

use super::context::ContextHandle;
use super::error::BridgeError;
use super::host_value::HostValue;
use super::pipeline::{ForeignTarget, Member, SourceMode};
use super::registry::ForeignHandle;
use super::worker::PendingCall;
use super::Bridge;
use std::future::Future;
use std::path::Path;
use tracing::{debug, warn};

pub struct Session<'b> {
    bridge: &'b Bridge,
    context: Option<ContextHandle>,
    closed: bool,
}

impl<'b> Session<'b> {
    /// Open a session on the main context.
    pub fn new(bridge: &'b Bridge) -> Result<Self, BridgeError> {
        bridge.initialize()?;
        Ok(Self {
            bridge,
            context: None,
            closed: false,
        })
    }

    /// Open a session with its own isolated context.
    pub fn isolated(bridge: &'b Bridge) -> Result<Self, BridgeError> {
        let context = bridge.create_context()?;
        Ok(Self {
            bridge,
            context: Some(context),
            closed: false,
        })
    }

    /// The session's isolated context, if it has one.
    pub fn context(&self) -> Option<&ContextHandle> {
        self.context.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn check_open(&self) -> Result<(), BridgeError> {
        if self.closed {
            return Err(BridgeError::InvalidContext(
                "session has been closed".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether `value` is a foreign handle (or context) belonging to this session.
    pub fn same_context(&self, value: &HostValue) -> bool {
        match (value, &self.context) {
            (HostValue::Handle(handle), Some(context)) => handle.context_tag() == &context.tag(),
            (HostValue::Handle(handle), None) => handle.context_tag().is_main(),
            (HostValue::Context(other), Some(context)) => other.ptr_eq(context),
            _ => false,
        }
    }

    pub fn import(&self, module: &str) -> Result<ForeignHandle, BridgeError> {
        self.check_open()?;
        self.bridge
            .acquire_foreign(ForeignTarget::Module(module), self.context.as_ref())
    }

    /// Handle for attribute `name` of `object`.
    pub fn attribute(&self, object: &ForeignHandle, name: &str) -> Result<ForeignHandle, BridgeError> {
        self.check_open()?;
        self.bridge
            .acquire_foreign(ForeignTarget::Member(object, name), self.context.as_ref())
    }

    pub fn reload(&self, module: &str) -> Result<ForeignHandle, BridgeError> {
        self.check_open()?;
        self.bridge.reload_module(module, self.context.as_ref())
    }

    pub fn call(
        &self,
        object: &ForeignHandle,
        member: &str,
        args: &[HostValue],
        kwargs: Option<&HostValue>,
    ) -> Result<HostValue, BridgeError> {
        self.check_open()?;
        self.bridge
            .invoke(object, member, args, kwargs, self.context.as_ref())
    }

    /// Asynchronous [`Session::call`]. A failure payload becomes `Err(Embedded)`.
    pub fn call_async(
        &self,
        object: &ForeignHandle,
        member: &str,
        args: &[HostValue],
        kwargs: Option<&HostValue>,
    ) -> impl Future<Output = Result<HostValue, BridgeError>> + Send + 'static {
        let pending = match self.check_open() {
            Ok(()) => self
                .bridge
                .invoke_async(object, member, args, kwargs, self.context.as_ref()),
            Err(err) => PendingCall::ready(HostValue::failure(err.to_string())),
        };
        settle(pending)
    }

    /// Run statements; evaluates to null.
    pub fn exec(&self, code: &str) -> Result<HostValue, BridgeError> {
        self.check_open()?;
        self.bridge
            .run_source(code, SourceMode::Statements, self.context.as_ref())
    }

    pub fn exec_async(
        &self,
        code: &str,
    ) -> impl Future<Output = Result<HostValue, BridgeError>> + Send + 'static {
        self.source_async(code, SourceMode::Statements)
    }

    /// Evaluate a single expression.
    pub fn eval(&self, code: &str) -> Result<HostValue, BridgeError> {
        self.check_open()?;
        self.bridge
            .run_source(code, SourceMode::Expression, self.context.as_ref())
    }

    pub fn eval_async(
        &self,
        code: &str,
    ) -> impl Future<Output = Result<HostValue, BridgeError>> + Send + 'static {
        self.source_async(code, SourceMode::Expression)
    }

    fn source_async(
        &self,
        code: &str,
        mode: SourceMode,
    ) -> impl Future<Output = Result<HostValue, BridgeError>> + Send + 'static {
        let pending = match self.check_open() {
            Ok(()) => self
                .bridge
                .run_source_async(code, mode, self.context.as_ref()),
            Err(err) => PendingCall::ready(HostValue::failure(err.to_string())),
        };
        settle(pending)
    }

    pub fn members(&self, object: &ForeignHandle) -> Result<Vec<Member>, BridgeError> {
        self.check_open()?;
        self.bridge.list_members(object, self.context.as_ref())
    }

    /// Prepend `dir` (made absolute) to the context's `sys.path` unless present.
    pub fn add_search_path(&self, dir: impl AsRef<Path>) -> Result<(), BridgeError> {
        self.check_open()?;
        let dir = std::path::absolute(dir.as_ref()).map_err(|err| {
            BridgeError::ArgumentType(format!("invalid search path: {err}"))
        })?;
        let dir = dir.to_str().ok_or_else(|| {
            BridgeError::ArgumentType(format!("search path is not valid UTF-8: {}", dir.display()))
        })?;
        // A JSON string literal is also a valid Python string literal.
        let literal = serde_json::to_string(dir)
            .map_err(|err| BridgeError::ArgumentType(format!("invalid search path: {err}")))?;
        self.exec(&format!(
            "if {literal} not in __import__('sys').path: __import__('sys').path.insert(0, {literal})"
        ))?;
        Ok(())
    }

    /// Release one handle.
    pub fn gc(&self, object: &ForeignHandle) -> Result<bool, BridgeError> {
        self.check_open()?;
        self.bridge.release_foreign(object, self.context.as_ref())
    }

    /// Release every handle belonging to the session's context.
    pub fn clear(&self) -> Result<usize, BridgeError> {
        self.check_open()?;
        self.bridge.clear(self.context.as_ref())
    }

    /// Release the session's handles and destroy its isolated context.
    ///
    /// Returns false if the session was already closed.
    pub fn close(&mut self) -> Result<bool, BridgeError> {
        if self.closed {
            return Ok(false);
        }
        self.closed = true;
        let released = self.bridge.clear(self.context.as_ref())?;
        if let Some(context) = self.context.take() {
            self.bridge.destroy_context(&context)?;
        }
        debug!(released, "session closed");
        Ok(true)
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "session close failed");
        }
    }
}

async fn settle(pending: PendingCall) -> Result<HostValue, BridgeError> {
    pending.await.into_outcome().map_err(BridgeError::Embedded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::testing::test_bridge;
    use crate::bridge::ContextTag;

    #[test]
    fn test_isolated_session_round_trip() {
        let bridge = test_bridge();
        let mut session = Session::isolated(&bridge).expect("session");
        let context = session.context().cloned().expect("context");

        session.exec("def add(a, b):\n    return a + b").expect("exec");
        let main = session.import("__main__").expect("main");
        assert!(session.same_context(&HostValue::Handle(main.clone())));

        let sum = session
            .call(&main, "add", &[HostValue::from(2), HostValue::from(3)], None)
            .expect("add");
        assert_eq!(sum, HostValue::Number(5.0));

        let add = session.attribute(&main, "add").expect("attribute");
        assert_eq!(add.type_name(), "function");

        assert!(session.gc(&add).expect("gc"));
        assert!(!session.gc(&add).expect("gc again"));

        assert!(session.close().expect("close"));
        assert!(!session.close().expect("close again"));
        assert!(!context.is_live());
        assert!(matches!(
            session.eval("1"),
            Err(BridgeError::InvalidContext(_))
        ));
    }

    #[test]
    fn test_same_context_distinguishes_sessions() {
        let bridge = test_bridge();
        let first = Session::isolated(&bridge).expect("first");
        let second = Session::isolated(&bridge).expect("second");
        let main = Session::new(&bridge).expect("main");

        let math = first.import("math").expect("math");
        let value = HostValue::Handle(math);
        assert!(first.same_context(&value));
        assert!(!second.same_context(&value));
        assert!(!main.same_context(&value));
        assert!(!first.same_context(&HostValue::Number(1.0)));

        let context = HostValue::Context(first.context().cloned().expect("context"));
        assert!(first.same_context(&context));
        assert!(!second.same_context(&context));
    }

    #[test]
    fn test_add_search_path_is_deduplicated() {
        let bridge = test_bridge();
        let session = Session::isolated(&bridge).expect("session");
        let dir = std::env::temp_dir().join("pybridge 'quoted'");

        session.add_search_path(&dir).expect("first");
        session.add_search_path(&dir).expect("second");

        let literal = serde_json::to_string(dir.to_str().expect("utf-8")).expect("literal");
        let count = session
            .eval(&format!("sys.path.count({literal})"))
            .expect("count");
        assert_eq!(count, HostValue::Number(1.0));
        let first = session.eval("sys.path[0]").expect("first entry");
        assert_eq!(first.as_str(), dir.to_str());
    }

    #[test]
    fn test_members_and_reload() {
        let bridge = test_bridge();
        let session = Session::isolated(&bridge).expect("session");
        let json_module = session.import("json").expect("json");

        let members = session.members(&json_module).expect("members");
        assert!(members.iter().any(|m| m.name == "dumps" && m.is_callable));
        assert!(members
            .iter()
            .any(|m| m.name == "__name__" && m.value == HostValue::from("json")));

        let reloaded = session.reload("json").expect("reload");
        assert!(reloaded.ptr_eq(&json_module));
    }

    #[test]
    fn test_clear_leaves_other_contexts_alone() {
        let bridge = test_bridge();
        let isolated = Session::isolated(&bridge).expect("isolated");
        let main = Session::new(&bridge).expect("main");

        let kept = main.import("math").expect("main math");
        isolated.import("math").expect("isolated math");
        isolated.import("json").expect("isolated json");

        assert_eq!(isolated.clear().expect("clear"), 2);
        assert!(bridge.resolve(&kept).is_ok());
        assert_eq!(kept.context_tag(), &ContextTag::Main);
    }

    #[tokio::test]
    async fn test_async_results_split_by_shape() {
        let bridge = test_bridge();
        let session = Session::isolated(&bridge).expect("session");
        let math = session.import("math").expect("math");

        let value = session
            .call_async(&math, "floor", &[HostValue::Number(2.7)], None)
            .await
            .expect("floor");
        assert_eq!(value, HostValue::Number(2.0));

        session.exec_async("ready = True").await.expect("exec");
        assert_eq!(
            session.eval_async("ready").await.expect("eval"),
            HostValue::Bool(true)
        );

        let err = session.eval_async("undefined_name").await.expect_err("name error");
        assert!(matches!(err, BridgeError::Embedded(ref m) if m.contains("NameError")));
    }
}
